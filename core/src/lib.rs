//! Acoustic data-transport engine
//!
//! Encodes short text messages as sequences of tones (one frequency per
//! printable character, framed by INIT/STOP markers with repeat
//! redundancy) and recovers them from captured audio through real-time
//! spectral analysis. Beacon-based geolocation and a multi-step payment
//! protocol run over the same acoustic channel.

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod geo;
pub mod hardware;
pub mod payment;
pub mod reception;
pub mod session;
pub mod spectrum;
pub mod supervisor;
pub mod synth;
pub mod transmission;

pub use codec::{FrequencyCodec, FrequencyTable, Symbol};
pub use config::{EngineConfig, TableConfig};
pub use error::{EngineError, Result};
pub use events::{EngineEvent, Subscription};
pub use geo::{LocationFix, LocationListener, LocationProvider, Spot, Zone};
pub use hardware::{AudioHardware, OfflineHardware};
pub use payment::{CredentialCipher, PaymentOutcome, PaymentStep, PlainCipher};
pub use session::{AppMode, AudioPath, Direction, Engine, EnginePhase, TickOutcome};
pub use spectrum::{Resolution, SpectralAnalyzer};
pub use synth::Synthesizer;
