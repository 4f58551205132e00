use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use log::{debug, error, info, warn};
use serde::Deserialize;
use thiserror::Error;
use tonelink_core::codec::Symbol;
use tonelink_core::spectrum::to_pcm;
use tonelink_core::{
    Direction, Engine, EngineConfig, EngineError, EngineEvent, EnginePhase, OfflineHardware,
};

#[derive(Parser)]
#[command(name = "tonelink")]
#[command(about = "Send and receive short text messages as sequences of tones")]
struct Cli {
    /// JSON file overriding engine defaults
    #[arg(long, global = true, value_name = "FILE.json")]
    config: Option<PathBuf>,

    /// Analyze with the light (background) profile
    #[arg(long, global = true)]
    light: bool,

    /// Minimum detected volume for a tone to count, in [0, 1]
    #[arg(long, global = true, value_name = "VOLUME")]
    min_volume: Option<f32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a message to a WAV file
    Encode {
        /// Text to send (printable ASCII)
        #[arg(value_name = "MESSAGE")]
        message: String,

        /// Output WAV file
        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,
    },

    /// Decode every message found in a WAV file
    Decode {
        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,
    },

    /// Print the character and marker frequencies
    Tables,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Invalid config file {path}: {source}")]
    Config {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Unsupported WAV format: {0}")]
    UnsupportedFormat(String),

    #[error("No complete message found (partial text: {0:?})")]
    NothingDecoded(String),
}

/// Table overrides; every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TableFile {
    base_hz: Option<f32>,
    spacing_hz: Option<f32>,
    init_hz: Option<f32>,
    stop_hz: Option<f32>,
}

/// Engine overrides loaded from `--config`; every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    sample_rate: Option<u32>,
    block_size: Option<usize>,
    full_fft_size: Option<usize>,
    light_fft_size: Option<usize>,
    noise_floor: Option<f32>,
    symbol_samples: Option<usize>,
    ramp_samples: Option<usize>,
    amplitude: Option<f32>,
    table: Option<TableFile>,
    init_repeat: Option<usize>,
    char_repeat: Option<usize>,
    stop_repeat: Option<usize>,
    max_message_len: Option<usize>,
    minimum_volume: Option<f32>,
    reception_timeout_ticks: Option<u32>,
    payment_step_timeout_ticks: Option<u32>,
    payment_max_retries: Option<u32>,
    geo_tolerance_hz: Option<f32>,
    geo_confirmations: Option<usize>,
}

macro_rules! override_fields {
    ($src:expr, $dst:expr, $($field:ident),+ $(,)?) => {
        $(if let Some(value) = $src.$field { $dst.$field = value; })+
    };
}

impl ConfigFile {
    fn load(path: &Path) -> Result<Self, CliError> {
        let reader = BufReader::new(File::open(path)?);
        serde_json::from_reader(reader).map_err(|source| CliError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply(self, config: &mut EngineConfig) {
        override_fields!(
            self,
            config,
            sample_rate,
            block_size,
            full_fft_size,
            light_fft_size,
            noise_floor,
            symbol_samples,
            ramp_samples,
            amplitude,
            init_repeat,
            char_repeat,
            stop_repeat,
            max_message_len,
            minimum_volume,
            reception_timeout_ticks,
            payment_step_timeout_ticks,
            payment_max_retries,
            geo_tolerance_hz,
            geo_confirmations,
        );
        if let Some(table) = self.table {
            override_fields!(table, config.table, base_hz, spacing_hz, init_hz, stop_hz);
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = EngineConfig::default();
    if let Some(path) = &cli.config {
        ConfigFile::load(path)?.apply(&mut config);
        debug!("configuration loaded from {}", path.display());
    }
    if let Some(volume) = cli.min_volume {
        config.minimum_volume = volume;
    }

    match cli.command {
        Commands::Encode { message, output } => encode_command(config, &message, &output)?,
        Commands::Decode { input } => decode_command(config, &input, cli.light)?,
        Commands::Tables => tables_command(config)?,
    }

    Ok(())
}

fn encode_command(config: EngineConfig, message: &str, output_path: &Path) -> Result<(), CliError> {
    let sample_rate = config.sample_rate;
    let block_size = config.block_size;
    let symbol_samples = config.symbol_samples;
    let symbol_count = config.init_repeat
        + config.char_repeat * message.chars().count()
        + config.stop_repeat
        + 1;

    let mut engine = Engine::new(config, Box::new(OfflineHardware::default()))?;
    let mut path = engine.audio_path()?;
    engine.start(Direction::Send, Some(message))?;

    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(output_path, spec)?;

    // Enough blocks for the whole sequence plus the release tail.
    let max_blocks = (symbol_count + 1) * symbol_samples / block_size + 1;
    let mut block = vec![0i16; block_size];
    let mut written = 0usize;
    for _ in 0..max_blocks {
        if engine.phase() == EnginePhase::Idle {
            break;
        }
        path.render_pcm(&mut block);
        for &sample in &block {
            writer.write_sample(sample)?;
        }
        written += block.len();
    }
    // Let the envelope ramp down before the file ends.
    path.render_pcm(&mut block);
    for &sample in &block {
        writer.write_sample(sample)?;
    }
    written += block.len();
    writer.finalize()?;
    engine.tick();

    info!(
        "encoded {} characters into {} samples ({:.2} s)",
        message.chars().count(),
        written,
        written as f32 / sample_rate as f32
    );
    println!("Wrote {}", output_path.display());
    Ok(())
}

fn read_wav(input_path: &Path) -> Result<(WavSpec, Vec<i16>), CliError> {
    let mut reader = WavReader::open(input_path)?;
    let spec = reader.spec();
    debug!(
        "read WAV: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );

    let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader.samples::<i16>().collect::<Result<_, _>>()?,
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .map(|s| s.map(to_pcm))
            .collect::<Result<_, _>>()?,
        (format, bits) => {
            return Err(CliError::UnsupportedFormat(format!("{:?} {}-bit", format, bits)));
        }
    };

    // First channel only.
    let channels = spec.channels.max(1) as usize;
    let samples = interleaved.into_iter().step_by(channels).collect();
    Ok((spec, samples))
}

fn decode_command(
    mut config: EngineConfig,
    input_path: &Path,
    light: bool,
) -> Result<(), CliError> {
    let (spec, samples) = read_wav(input_path)?;
    if spec.sample_rate != config.sample_rate {
        warn!(
            "input is {} Hz, configuration says {} Hz; using the input rate",
            spec.sample_rate, config.sample_rate
        );
        config.sample_rate = spec.sample_rate;
    }
    let block_size = config.block_size;

    let mut engine = Engine::new(config, Box::new(OfflineHardware::default()))?;
    if light {
        engine.enable_background();
        engine.set_foreground(false);
    }
    let mut path = engine.audio_path()?;
    let events = engine.subscribe();
    engine.start(Direction::Receive, None)?;

    let mut decoded = 0;
    let mut print_messages = || {
        for event in events.try_iter() {
            if let EngineEvent::MessageReceived(text) = event {
                println!("{}", text);
                decoded += 1;
            }
        }
    };
    for block in samples.chunks(block_size) {
        path.process_input(block)?;
        print_messages();
    }
    engine.stop();
    print_messages();
    info!("decoded {} message(s) from {} samples", decoded, samples.len());

    if decoded == 0 {
        return Err(CliError::NothingDecoded(engine.received_text()));
    }
    Ok(())
}

fn tables_command(config: EngineConfig) -> Result<(), CliError> {
    let engine = Engine::new(config, Box::new(OfflineHardware::default()))?;
    let table = engine.codec().table();
    println!("tolerance ±{:.1} Hz", table.tolerance_hz());
    for (symbol, hz) in table.entries() {
        let label = match symbol {
            Symbol::Init => "INIT".to_owned(),
            Symbol::Stop => "STOP".to_owned(),
            Symbol::Char(c) => format!("{:?}", c),
        };
        println!("{:>6} {:>9.1} Hz", label, hz);
    }
    Ok(())
}
