use thiserror::Error;

use crate::session::AppMode;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Audio hardware error: {0}")]
    Hardware(String),

    #[error("Output volume too low ({measured:.2} < {minimum:.2})")]
    VolumeTooLow { measured: f32, minimum: f32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{active:?} mode is already active")]
    ModeConflict { active: AppMode },

    #[error("Message is empty")]
    EmptyMessage,

    #[error("Message too long ({len} > {max} characters)")]
    MessageTooLong { len: usize, max: usize },

    #[error("Character {0:?} has no frequency")]
    UnsupportedCharacter(char),

    #[error("Minimum volume must be within [0, 1], got {0}")]
    InvalidVolume(f32),

    #[error("Real-time audio path already taken")]
    AudioPathTaken,

    #[error("Payment credentials are not set")]
    MissingCredentials,

    #[error("Credential cipher error: {0}")]
    Cipher(String),

    #[error("FFT error: {0}")]
    Fft(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
