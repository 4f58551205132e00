//! Character ↔ frequency codec
//!
//! Sequence on the air:
//!
//! ```text
//! INIT × init_repeat | c0 × char_repeat | ... | STOP × stop_repeat | silence
//! ```
//!
//! Each repeat lasts one symbol period. The receiver counts consecutive
//! analysis windows that agree on a symbol and only accepts it once the
//! run covers the full repeat count.

use log::debug;

use crate::config::{EngineConfig, TableConfig};
use crate::error::{EngineError, Result};
use crate::reception::ReceptionState;
use crate::transmission::{TransmissionState, TxStage};

/// First character of the table
pub const CHARSET_FIRST: char = ' ';

/// Last character of the table
pub const CHARSET_LAST: char = '~';

/// Number of encodable characters (printable ASCII)
pub const CHARSET_LEN: usize = (CHARSET_LAST as usize) - (CHARSET_FIRST as usize) + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    Init,
    Stop,
    Char(char),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedEvent {
    None,
    StartOfMessage,
    Char(char),
    EndOfMessage,
}

/// Something that completed while advancing the emission cursor
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Milestone {
    /// A character finished its repeat cycle; carries the new progress
    CharacterDone(f32),
    /// STOP finished its repeat cycle
    MessageDone,
}

/// Result of one [`FrequencyCodec::next_emission_frequency`] call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Emission {
    /// Tone for the next symbol period, `None` for silence
    pub frequency: Option<f32>,
    pub milestone: Option<Milestone>,
}

/// Frequency layout of characters and markers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyTable {
    layout: TableConfig,
    tolerance_hz: f32,
}

impl FrequencyTable {
    pub fn new(layout: TableConfig) -> Self {
        Self {
            layout,
            tolerance_hz: layout.spacing_hz / 2.0,
        }
    }

    pub fn tolerance_hz(&self) -> f32 {
        self.tolerance_hz
    }

    pub fn init_hz(&self) -> f32 {
        self.layout.init_hz
    }

    pub fn stop_hz(&self) -> f32 {
        self.layout.stop_hz
    }

    pub fn char_frequency(&self, c: char) -> Option<f32> {
        if !(CHARSET_FIRST..=CHARSET_LAST).contains(&c) {
            return None;
        }
        let index = c as usize - CHARSET_FIRST as usize;
        Some(self.layout.base_hz + index as f32 * self.layout.spacing_hz)
    }

    pub fn frequency_of(&self, symbol: Symbol) -> Option<f32> {
        match symbol {
            Symbol::Init => Some(self.layout.init_hz),
            Symbol::Stop => Some(self.layout.stop_hz),
            Symbol::Char(c) => self.char_frequency(c),
        }
    }

    /// Map a detected frequency to the nearest symbol within tolerance
    pub fn classify(&self, hz: f32) -> Option<Symbol> {
        if (hz - self.layout.init_hz).abs() <= self.tolerance_hz {
            return Some(Symbol::Init);
        }
        if (hz - self.layout.stop_hz).abs() <= self.tolerance_hz {
            return Some(Symbol::Stop);
        }

        let offset = ((hz - self.layout.base_hz) / self.layout.spacing_hz).round();
        if offset < 0.0 || offset >= CHARSET_LEN as f32 {
            return None;
        }
        let index = offset as usize;
        let center = self.layout.base_hz + index as f32 * self.layout.spacing_hz;
        if (hz - center).abs() > self.tolerance_hz {
            return None;
        }
        char::from_u32(CHARSET_FIRST as u32 + index as u32).map(Symbol::Char)
    }

    /// Every (symbol, frequency) pair, markers first
    pub fn entries(&self) -> Vec<(Symbol, f32)> {
        let mut entries = vec![
            (Symbol::Init, self.layout.init_hz),
            (Symbol::Stop, self.layout.stop_hz),
        ];
        for c in CHARSET_FIRST..=CHARSET_LAST {
            if let Some(hz) = self.char_frequency(c) {
                entries.push((Symbol::Char(c), hz));
            }
        }
        entries
    }
}

/// Encoder/decoder shared by messaging and payment
#[derive(Debug, Clone)]
pub struct FrequencyCodec {
    table: FrequencyTable,
    init_repeat: usize,
    char_repeat: usize,
    stop_repeat: usize,
    max_message_len: usize,
}

impl FrequencyCodec {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            table: FrequencyTable::new(config.table),
            init_repeat: config.init_repeat,
            char_repeat: config.char_repeat,
            stop_repeat: config.stop_repeat,
            max_message_len: config.max_message_len,
        }
    }

    pub fn table(&self) -> &FrequencyTable {
        &self.table
    }

    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    /// Reject messages the table cannot carry
    pub fn validate_message(&self, message: &str) -> Result<()> {
        if message.is_empty() {
            return Err(EngineError::EmptyMessage);
        }
        let len = message.chars().count();
        if len > self.max_message_len {
            return Err(EngineError::MessageTooLong {
                len,
                max: self.max_message_len,
            });
        }
        match message.chars().find(|&c| self.table.char_frequency(c).is_none()) {
            Some(c) => Err(EngineError::UnsupportedCharacter(c)),
            None => Ok(()),
        }
    }

    /// Frequency for the next symbol period.
    ///
    /// Advances the cursor one repeat at a time. The character index moves
    /// forward only after a full repeat cycle; once STOP has been repeated
    /// the state is "may stop" and only silence follows.
    pub fn next_emission_frequency(&self, tx: &mut TransmissionState) -> Emission {
        let mut milestone = None;

        loop {
            match tx.stage {
                TxStage::Init => {
                    if tx.repeat < self.init_repeat {
                        tx.repeat += 1;
                        return self.emit(Symbol::Init, milestone);
                    }
                    tx.stage = TxStage::Characters;
                    tx.repeat = 0;
                }
                TxStage::Characters => {
                    let len = tx.message.len();
                    if tx.cursor >= len {
                        tx.stage = TxStage::Stop;
                        tx.repeat = 0;
                        continue;
                    }
                    if tx.repeat < self.char_repeat {
                        tx.repeat += 1;
                        return self.emit(Symbol::Char(tx.message[tx.cursor]), milestone);
                    }
                    tx.cursor += 1;
                    tx.repeat = 0;
                    // The last character's completion is reported with STOP.
                    if tx.cursor < len {
                        milestone = Some(Milestone::CharacterDone(tx.cursor as f32 / len as f32));
                    }
                }
                TxStage::Stop => {
                    if tx.repeat < self.stop_repeat {
                        tx.repeat += 1;
                        return self.emit(Symbol::Stop, milestone);
                    }
                    tx.stage = TxStage::Done;
                    tx.repeat = 0;
                    return Emission {
                        frequency: None,
                        milestone: Some(Milestone::MessageDone),
                    };
                }
                TxStage::Done => {
                    return Emission {
                        frequency: None,
                        milestone,
                    };
                }
            }
        }
    }

    /// Feed one detected frequency into the vote.
    ///
    /// `level` is the detected volume of the window; anything below
    /// `minimum_volume` is noise and leaves the vote untouched. A frequency
    /// outside the table breaks the current run.
    pub fn accept_frequency(
        &self,
        rx: &mut ReceptionState,
        hz: f32,
        level: f32,
        minimum_volume: f32,
    ) -> DecodedEvent {
        if level < minimum_volume {
            return DecodedEvent::None;
        }

        let symbol = match self.table.classify(hz) {
            Some(symbol) => symbol,
            None => {
                rx.clear_vote();
                return DecodedEvent::None;
            }
        };

        if rx.vote == Some(symbol) {
            if rx.vote_consumed {
                return DecodedEvent::None;
            }
        } else {
            rx.vote = Some(symbol);
            rx.vote_count = 0;
            rx.vote_consumed = false;
        }

        rx.vote_count += 1;
        if rx.vote_count < self.repeat_for(symbol) * rx.votes_per_symbol {
            return DecodedEvent::None;
        }

        match symbol {
            Symbol::Init => {
                rx.vote_consumed = true;
                rx.begin_message();
                rx.mark_progress();
                debug!("start of message");
                DecodedEvent::StartOfMessage
            }
            Symbol::Char(c) => {
                // A continuing run of the same tone is a doubled character.
                rx.vote_count = 0;
                if !rx.in_message || !rx.push_char(c) {
                    return DecodedEvent::None;
                }
                rx.mark_progress();
                debug!("decoded {:?}", c);
                DecodedEvent::Char(c)
            }
            Symbol::Stop => {
                rx.vote_consumed = true;
                if !rx.in_message {
                    return DecodedEvent::None;
                }
                rx.in_message = false;
                rx.mark_progress();
                debug!("end of message");
                DecodedEvent::EndOfMessage
            }
        }
    }

    fn repeat_for(&self, symbol: Symbol) -> usize {
        match symbol {
            Symbol::Init => self.init_repeat,
            Symbol::Stop => self.stop_repeat,
            Symbol::Char(_) => self.char_repeat,
        }
    }

    fn emit(&self, symbol: Symbol, milestone: Option<Milestone>) -> Emission {
        Emission {
            frequency: self.table.frequency_of(symbol),
            milestone,
        }
    }
}
