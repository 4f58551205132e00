/// Stage of the outgoing sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStage {
    Init,
    Characters,
    Stop,
    Done,
}

/// Outgoing message and its emission cursor
///
/// Advanced by the codec from the real-time render path and read by the
/// control path (progress queries, stop requests). Callers keep it behind
/// a lock held only for the duration of a field update.
#[derive(Debug, Clone)]
pub struct TransmissionState {
    pub(crate) message: Vec<char>,
    pub(crate) stage: TxStage,
    /// Index of the character being emitted; equals the number of
    /// characters fully emitted
    pub(crate) cursor: usize,
    /// Repeats already emitted for the current symbol
    pub(crate) repeat: usize,
}

impl TransmissionState {
    /// Idle state with room for `max_len` characters
    pub fn with_capacity(max_len: usize) -> Self {
        Self {
            message: Vec::with_capacity(max_len),
            stage: TxStage::Done,
            cursor: 0,
            repeat: 0,
        }
    }

    /// Load a new message and rewind to the start of the INIT sequence.
    ///
    /// The message must already have been validated against the table.
    pub fn arm(&mut self, message: &str) {
        self.message.clear();
        self.message.extend(message.chars());
        self.stage = TxStage::Init;
        self.cursor = 0;
        self.repeat = 0;
    }

    /// Stop emitting; the next request yields silence.
    pub fn cancel(&mut self) {
        self.stage = TxStage::Done;
    }

    pub fn message(&self) -> &[char] {
        &self.message
    }

    pub fn stage(&self) -> TxStage {
        self.stage
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Repeats already emitted for the current symbol
    pub fn repeat_count(&self) -> usize {
        self.repeat
    }

    /// True while the INIT marker is being repeated
    pub fn in_init_sequence(&self) -> bool {
        self.stage == TxStage::Init
    }

    /// True once STOP has been fully emitted (or the emission was cancelled)
    pub fn may_stop(&self) -> bool {
        self.stage == TxStage::Done
    }

    /// Fraction of characters fully emitted
    pub fn progress(&self) -> f32 {
        if self.message.is_empty() {
            return 0.0;
        }
        if self.stage == TxStage::Done {
            return 1.0;
        }
        self.cursor as f32 / self.message.len() as f32
    }
}
