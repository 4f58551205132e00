//! Dominant-frequency detection over a continuous PCM stream
//!
//! Samples arrive in hardware-sized blocks and are accumulated into a
//! window of N samples. Whenever a window fills, it is Hann-windowed,
//! transformed with a real-input FFT, and the strongest bin above the
//! noise floor becomes the dominant frequency.
//!
//! Two resolutions exist. `Full` uses a large N (close to 1 Hz per bin at
//! 44.1 kHz) and runs while the host application is in the foreground.
//! `Light` uses a small N and keeps CPU use low in the background. Only
//! [`SpectralAnalyzer::set_resolution`] may reallocate buffers.

use std::f32::consts::PI;
use std::sync::Arc;

use log::{debug, trace};
use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

/// Scale factor from `i16` PCM to [-1, 1)
const PCM_SCALE: f32 = 1.0 / 32768.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Small FFT, used in the background
    Light,
    /// Large FFT, used in the foreground
    Full,
}

/// Strongest bin of one analysis window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DominantFrequency {
    /// Frequency of the bin center in Hz (`bin * sample_rate / N`)
    pub hz: f32,
    pub bin: usize,
    /// Normalized magnitude (a full-scale sinusoid reads about 1.0)
    pub magnitude: f32,
    /// Peak absolute sample of the window, in [0, 1]
    pub level: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Detection {
    /// No complete window yet, or nothing above the noise floor
    NoSignal,
    Dominant(DominantFrequency),
}

impl Detection {
    pub fn dominant(&self) -> Option<&DominantFrequency> {
        match self {
            Detection::Dominant(dominant) => Some(dominant),
            Detection::NoSignal => None,
        }
    }
}

/// Buffers sized for one FFT length
///
/// `accumulator` is filled in FIFO order at `read_index`; `spectrum` is
/// the persistent frequency-domain buffer (real and imaginary parts).
struct SpectralContext {
    fft_size: usize,
    log2n: u32,
    half_size: usize,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    window_gain: f32,
    accumulator: Vec<f32>,
    read_index: usize,
    window_peak: f32,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl SpectralContext {
    fn new(planner: &mut RealFftPlanner<f32>, fft_size: usize) -> Self {
        let fft = planner.plan_fft_forward(fft_size);
        let window = hann_window(fft_size);
        let window_gain = window.iter().sum::<f32>();

        Self {
            fft_size,
            log2n: fft_size.trailing_zeros(),
            half_size: fft_size / 2,
            input: fft.make_input_vec(),
            spectrum: fft.make_output_vec(),
            scratch: fft.make_scratch_vec(),
            fft,
            window,
            window_gain,
            accumulator: vec![0.0; fft_size],
            read_index: 0,
            window_peak: 0.0,
        }
    }

    /// Copy as much of `samples` as fits; returns how many were consumed.
    fn fill(&mut self, samples: &[i16]) -> usize {
        let space = self.fft_size - self.read_index;
        let count = space.min(samples.len());
        let target = &mut self.accumulator[self.read_index..self.read_index + count];

        for (slot, &sample) in target.iter_mut().zip(samples) {
            let value = sample as f32 * PCM_SCALE;
            self.window_peak = self.window_peak.max(value.abs());
            *slot = value;
        }
        self.read_index += count;
        count
    }

    fn is_full(&self) -> bool {
        self.read_index == self.fft_size
    }

    fn reset_window(&mut self) {
        self.read_index = 0;
        self.window_peak = 0.0;
    }
}

/// Real-time spectral analysis engine
pub struct SpectralAnalyzer {
    planner: RealFftPlanner<f32>,
    context: SpectralContext,
    resolution: Resolution,
    sample_rate: f32,
    noise_floor: f32,
    full_fft_size: usize,
    light_fft_size: usize,
}

impl SpectralAnalyzer {
    pub fn new(config: &EngineConfig, resolution: Resolution) -> Result<Self> {
        for size in [config.full_fft_size, config.light_fft_size] {
            if size < 2 || !size.is_power_of_two() {
                return Err(EngineError::InvalidConfig(format!(
                    "FFT size {} is not a power of two",
                    size
                )));
            }
        }

        let mut planner = RealFftPlanner::new();
        let fft_size = match resolution {
            Resolution::Full => config.full_fft_size,
            Resolution::Light => config.light_fft_size,
        };
        let context = SpectralContext::new(&mut planner, fft_size);

        Ok(Self {
            planner,
            context,
            resolution,
            sample_rate: config.sample_rate as f32,
            noise_floor: config.noise_floor,
            full_fft_size: config.full_fft_size,
            light_fft_size: config.light_fft_size,
        })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn fft_size(&self) -> usize {
        self.context.fft_size
    }

    pub fn log2n(&self) -> u32 {
        self.context.log2n
    }

    /// Number of usable bins (N/2)
    pub fn usable_bins(&self) -> usize {
        self.context.half_size
    }

    /// Samples accumulated toward the current window
    pub fn pending_samples(&self) -> usize {
        self.context.read_index
    }

    pub fn bin_width(&self) -> f32 {
        self.sample_rate / self.context.fft_size as f32
    }

    /// Switch profile, rebuilding every analysis buffer.
    ///
    /// Any partially accumulated window is discarded. Does nothing when the
    /// requested resolution is already active.
    pub fn set_resolution(&mut self, resolution: Resolution) {
        if resolution == self.resolution {
            return;
        }
        let fft_size = match resolution {
            Resolution::Full => self.full_fft_size,
            Resolution::Light => self.light_fft_size,
        };
        debug!("spectral profile {:?} -> {:?} (N = {})", self.resolution, resolution, fft_size);
        self.context = SpectralContext::new(&mut self.planner, fft_size);
        self.resolution = resolution;
    }

    /// Drop any partial window
    pub fn reset(&mut self) {
        self.context.reset_window();
    }

    /// Feed one block of PCM samples.
    ///
    /// Returns `NoSignal` until a full window has been accumulated. Samples
    /// beyond the end of a completed window start the next one. A block
    /// longer than N completes at most the last window it fills.
    pub fn analyze(&mut self, block: &[i16]) -> Result<Detection> {
        let mut detection = Detection::NoSignal;
        let mut offset = 0;

        while offset < block.len() {
            offset += self.context.fill(&block[offset..]);
            if self.context.is_full() {
                detection = self.transform()?;
                self.context.reset_window();
            }
        }
        Ok(detection)
    }

    /// Same as [`analyze`](Self::analyze) for already-normalized samples
    pub fn analyze_f32(&mut self, block: &[f32]) -> Result<Detection> {
        let mut detection = Detection::NoSignal;
        let mut pcm = [0i16; 256];
        for piece in block.chunks(pcm.len()) {
            for (dst, &src) in pcm.iter_mut().zip(piece) {
                *dst = to_pcm(src);
            }
            if let Detection::Dominant(found) = self.analyze(&pcm[..piece.len()])? {
                detection = Detection::Dominant(found);
            }
        }
        Ok(detection)
    }

    fn transform(&mut self) -> Result<Detection> {
        let ctx = &mut self.context;

        for ((dst, &sample), &weight) in ctx.input.iter_mut().zip(&ctx.accumulator).zip(&ctx.window)
        {
            *dst = sample * weight;
        }

        ctx.fft
            .process_with_scratch(&mut ctx.input, &mut ctx.spectrum, &mut ctx.scratch)
            .map_err(|e| EngineError::Fft(e.to_string()))?;

        let scale = 2.0 / ctx.window_gain;
        let mut best_bin = 0;
        let mut best_magnitude = 0.0f32;

        // DC is excluded; bins 1..N/2 are candidates.
        for (bin, value) in ctx.spectrum.iter().enumerate().take(ctx.half_size).skip(1) {
            let magnitude = value.norm() * scale;
            if magnitude > best_magnitude {
                best_magnitude = magnitude;
                best_bin = bin;
            }
        }

        if best_bin == 0 || best_magnitude < self.noise_floor {
            return Ok(Detection::NoSignal);
        }

        let dominant = DominantFrequency {
            hz: best_bin as f32 * self.sample_rate / ctx.fft_size as f32,
            bin: best_bin,
            magnitude: best_magnitude,
            level: ctx.window_peak,
        };
        trace!(
            "dominant {:.1} Hz (bin {}, magnitude {:.3}, level {:.3})",
            dominant.hz,
            dominant.bin,
            dominant.magnitude,
            dominant.level
        );
        Ok(Detection::Dominant(dominant))
    }
}

/// Symmetric Hann window of length `len`
fn hann_window(len: usize) -> Vec<f32> {
    if len < 2 {
        return vec![1.0; len];
    }
    (0..len)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / (len - 1) as f32).cos())
        .collect()
}

/// Convert a normalized sample to 16-bit PCM, clamping to full scale
pub fn to_pcm(sample: f32) -> i16 {
    let clamped = sample.max(-1.0).min(1.0);
    (clamped * 32767.0) as i16
}
