use crate::codec::Symbol;

/// Decoded text and the vote/stall bookkeeping of one receive activation
///
/// The accumulated text is append-only for the life of the activation;
/// each new message starts where the previous one ended. After the engine
/// returns to Idle the state is frozen, not cleared, so partial content
/// stays inspectable.
#[derive(Debug, Clone)]
pub struct ReceptionState {
    pub(crate) text: String,
    pub(crate) message_start: usize,
    pub(crate) message_chars: usize,
    pub(crate) max_message_len: usize,
    pub(crate) in_message: bool,
    pub(crate) vote: Option<Symbol>,
    pub(crate) vote_count: usize,
    /// Marker runs yield a single event; the rest of the run is ignored.
    pub(crate) vote_consumed: bool,
    pub(crate) votes_per_symbol: usize,
    pub(crate) stall_ticks: u32,
    pub(crate) progressed: bool,
    pub(crate) timed_out: bool,
}

impl ReceptionState {
    pub fn with_capacity(max_message_len: usize) -> Self {
        Self {
            // Room for a few complete messages before the buffer must grow.
            text: String::with_capacity(max_message_len * 4),
            message_start: 0,
            message_chars: 0,
            max_message_len,
            in_message: false,
            vote: None,
            vote_count: 0,
            vote_consumed: false,
            votes_per_symbol: 1,
            stall_ticks: 0,
            progressed: false,
            timed_out: false,
        }
    }

    /// Reset for a new activation. `votes_per_symbol` is the number of
    /// analysis windows covering one emitted symbol repeat.
    pub fn arm(&mut self, votes_per_symbol: usize) {
        self.text.clear();
        self.message_start = 0;
        self.message_chars = 0;
        self.in_message = false;
        self.votes_per_symbol = votes_per_symbol.max(1);
        self.stall_ticks = 0;
        self.progressed = false;
        self.timed_out = false;
        self.clear_vote();
    }

    /// Rescale votes after an analysis profile change; the pending run is
    /// discarded since its windows had a different length.
    pub fn set_votes_per_symbol(&mut self, votes_per_symbol: usize) {
        self.votes_per_symbol = votes_per_symbol.max(1);
        self.clear_vote();
    }

    /// Everything decoded during this activation
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Text of the message currently (or most recently) being received
    pub fn current_message(&self) -> &str {
        &self.text[self.message_start..]
    }

    pub fn in_message(&self) -> bool {
        self.in_message
    }

    pub fn stall_ticks(&self) -> u32 {
        self.stall_ticks
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn votes_per_symbol(&self) -> usize {
        self.votes_per_symbol
    }

    pub(crate) fn clear_vote(&mut self) {
        self.vote = None;
        self.vote_count = 0;
        self.vote_consumed = false;
    }

    pub(crate) fn begin_message(&mut self) {
        self.message_start = self.text.len();
        self.message_chars = 0;
        self.in_message = true;
    }

    /// Append a character unless the message is already at its bound.
    pub(crate) fn push_char(&mut self, c: char) -> bool {
        if self.message_chars >= self.max_message_len {
            return false;
        }
        self.text.push(c);
        self.message_chars += 1;
        true
    }

    /// A decode event happened: the stall counter restarts at zero.
    pub(crate) fn mark_progress(&mut self) {
        self.stall_ticks = 0;
        self.progressed = true;
    }
}
