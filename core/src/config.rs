use crate::error::{EngineError, Result};

/// Layout of the character and marker frequencies.
///
/// Characters of the printable ASCII range `' '..='~'` are placed at
/// `base_hz + index * spacing_hz`. The INIT and STOP markers sit outside
/// that range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableConfig {
    pub base_hz: f32,
    pub spacing_hz: f32,
    pub init_hz: f32,
    pub stop_hz: f32,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            base_hz: 1500.0,
            spacing_hz: 20.0,
            init_hz: 1420.0,
            stop_hz: 1460.0,
        }
    }
}

/// Engine configuration, fixed once a session is created.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Negotiated hardware sample rate in Hz
    pub sample_rate: u32,
    /// Frames delivered per hardware callback
    pub block_size: usize,
    /// FFT size of the foreground (Full) profile
    pub full_fft_size: usize,
    /// FFT size of the background (Light) profile
    pub light_fft_size: usize,
    /// Minimum normalized bin magnitude for a dominant frequency
    pub noise_floor: f32,
    /// Samples per emitted symbol repeat
    pub symbol_samples: usize,
    /// Length of the linear attack/release envelope
    pub ramp_samples: usize,
    /// Target synthesis amplitude in (0, 1]
    pub amplitude: f32,
    pub table: TableConfig,
    pub init_repeat: usize,
    pub char_repeat: usize,
    pub stop_repeat: usize,
    /// Longest message, in characters, the buffers are sized for
    pub max_message_len: usize,
    /// Initial minimum volume threshold in [0, 1]
    pub minimum_volume: f32,
    pub reception_timeout_ticks: u32,
    pub payment_step_timeout_ticks: u32,
    pub payment_max_retries: u32,
    pub geo_tolerance_hz: f32,
    pub geo_confirmations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100,
            block_size: 1024,
            full_fft_size: 32_768,
            light_fft_size: 4096,
            noise_floor: 0.01,
            symbol_samples: 32_768,
            ramp_samples: 256,
            amplitude: 0.8,
            table: TableConfig::default(),
            init_repeat: 3,
            char_repeat: 3,
            stop_repeat: 3,
            max_message_len: 140,
            minimum_volume: 0.1,
            reception_timeout_ticks: 20,
            payment_step_timeout_ticks: 30,
            payment_max_retries: 3,
            geo_tolerance_hz: 15.0,
            geo_confirmations: 2,
        }
    }
}

impl EngineConfig {
    /// Check every structural constraint. Called once at session creation;
    /// nothing downstream re-validates.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(invalid("sample rate must be positive"));
        }
        for (name, size) in [
            ("full FFT size", self.full_fft_size),
            ("light FFT size", self.light_fft_size),
        ] {
            if size < 2 || !size.is_power_of_two() {
                return Err(invalid(format!("{} {} is not a power of two", name, size)));
            }
        }
        if self.light_fft_size > self.full_fft_size {
            return Err(invalid("light FFT size exceeds full FFT size"));
        }
        if self.block_size == 0 || self.block_size > self.light_fft_size {
            return Err(invalid(format!(
                "block size {} must be within 1..={}",
                self.block_size, self.light_fft_size
            )));
        }
        if self.symbol_samples < self.full_fft_size || self.symbol_samples % self.full_fft_size != 0
        {
            return Err(invalid(format!(
                "symbol length {} must be a multiple of the full FFT size {}",
                self.symbol_samples, self.full_fft_size
            )));
        }
        if self.ramp_samples * 2 > self.symbol_samples {
            return Err(invalid("ramp longer than half a symbol"));
        }
        if !(self.amplitude > 0.0 && self.amplitude <= 1.0) {
            return Err(invalid("amplitude must be within (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.minimum_volume) {
            return Err(EngineError::InvalidVolume(self.minimum_volume));
        }
        if self.init_repeat == 0 || self.char_repeat == 0 || self.stop_repeat == 0 {
            return Err(invalid("repeat counts must be at least 1"));
        }
        if self.max_message_len == 0 {
            return Err(invalid("maximum message length must be positive"));
        }
        if self.reception_timeout_ticks == 0 || self.payment_step_timeout_ticks == 0 {
            return Err(invalid("timeouts must be at least one tick"));
        }
        if self.payment_max_retries == 0 {
            return Err(invalid("payment retries must be at least 1"));
        }
        if self.geo_confirmations == 0 {
            return Err(invalid("geolocation confirmations must be at least 1"));
        }
        self.validate_table()
    }

    /// Width of one analysis bin for the given FFT size
    pub fn bin_width(&self, fft_size: usize) -> f32 {
        self.sample_rate as f32 / fft_size as f32
    }

    fn validate_table(&self) -> Result<()> {
        let table = &self.table;
        let nyquist = self.sample_rate as f32 / 2.0;
        // The coarsest profile must still land every tone in its own bin.
        let coarse_bin = self.bin_width(self.light_fft_size);

        if table.spacing_hz <= coarse_bin {
            return Err(invalid(format!(
                "spacing {} Hz is not wider than a {} Hz analysis bin",
                table.spacing_hz, coarse_bin
            )));
        }

        let highest = table.base_hz + table.spacing_hz * (crate::codec::CHARSET_LEN - 1) as f32;
        if highest >= nyquist || table.init_hz >= nyquist || table.stop_hz >= nyquist {
            return Err(invalid(format!("table exceeds Nyquist ({} Hz)", nyquist)));
        }

        let min_gap = table.spacing_hz;
        for marker in [table.init_hz, table.stop_hz] {
            if marker <= 0.0 {
                return Err(invalid("marker frequencies must be positive"));
            }
            let inside = marker > table.base_hz - min_gap && marker < highest + min_gap;
            if inside {
                return Err(invalid(format!("marker {} Hz overlaps the character table", marker)));
            }
        }
        if (table.init_hz - table.stop_hz).abs() < min_gap {
            return Err(invalid("INIT and STOP markers are too close"));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> EngineError {
    EngineError::InvalidConfig(reason.into())
}
