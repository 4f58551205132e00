//! Payment transaction protocol
//!
//! A transaction walks a fixed table of steps. Send steps emit a token
//! through the message codec; receive steps wait for a complete message.
//!
//! | Ord | Step             | Direction | Completes when                     |
//! |-----|------------------|-----------|------------------------------------|
//! | 0   | `AwaitRequest`   | receive   | any message from the terminal      |
//! | 1   | `SendIdentity`   | send      | user identifier emitted            |
//! | 2   | `SendCredential` | send      | encrypted credential emitted       |
//! | 3   | `AwaitDetails`   | receive   | amount/identifier string received  |
//! | 4   | `SendApproval`   | send      | approval token emitted             |
//! | 5   | `AwaitVerdict`   | receive   | `1` (accepted) or `0` (rejected)   |
//! | 6   | `Completed`      | terminal  |                                    |

use log::{debug, info};

use crate::codec::FrequencyCodec;
use crate::error::{EngineError, Result};

/// Token emitted at [`PaymentStep::SendApproval`]
pub const APPROVAL_TOKEN: &str = "OK";

const VERDICT_ACCEPTED: &str = "1";
const VERDICT_REJECTED: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PaymentStep {
    AwaitRequest,
    SendIdentity,
    SendCredential,
    AwaitDetails,
    SendApproval,
    AwaitVerdict,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Send,
    Receive,
    Terminal,
}

impl PaymentStep {
    pub const ALL: [PaymentStep; 7] = [
        PaymentStep::AwaitRequest,
        PaymentStep::SendIdentity,
        PaymentStep::SendCredential,
        PaymentStep::AwaitDetails,
        PaymentStep::SendApproval,
        PaymentStep::AwaitVerdict,
        PaymentStep::Completed,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    pub fn direction(self) -> StepDirection {
        match self {
            PaymentStep::SendIdentity | PaymentStep::SendCredential | PaymentStep::SendApproval => {
                StepDirection::Send
            }
            PaymentStep::AwaitRequest | PaymentStep::AwaitDetails | PaymentStep::AwaitVerdict => {
                StepDirection::Receive
            }
            PaymentStep::Completed => StepDirection::Terminal,
        }
    }

    fn next(self) -> Self {
        Self::from_ordinal(self.ordinal() + 1).unwrap_or(PaymentStep::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentOutcome {
    Accepted,
    Rejected,
}

impl PaymentOutcome {
    /// Encoded value carried by the final-state notification
    pub fn wire(self) -> &'static str {
        match self {
            PaymentOutcome::Accepted => "{valid:\"1\"}",
            PaymentOutcome::Rejected => "{valid:\"0\"}",
        }
    }
}

/// Opaque transform applied to the credential before it is emitted
pub trait CredentialCipher: Send {
    fn encrypt(&self, secret: &str) -> Result<String>;
}

/// Passthrough cipher. Provides no confidentiality whatsoever; it exists
/// so the protocol can run before a product cipher is plugged in.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainCipher;

impl CredentialCipher for PlainCipher {
    fn encrypt(&self, secret: &str) -> Result<String> {
        Ok(secret.to_owned())
    }
}

/// Progress of one transaction
#[derive(Debug, Clone)]
pub struct PaymentState {
    pub(crate) step: PaymentStep,
    pub(crate) attempts: u32,
    pub(crate) stall_ticks: u32,
    pub(crate) user_id: String,
    pub(crate) encrypted_credential: String,
    pub(crate) details: Option<String>,
    pub(crate) outcome: Option<PaymentOutcome>,
    pub(crate) active: bool,
}

impl Default for PaymentState {
    fn default() -> Self {
        Self::new()
    }
}

impl PaymentState {
    pub fn new() -> Self {
        Self {
            step: PaymentStep::AwaitRequest,
            attempts: 0,
            stall_ticks: 0,
            user_id: String::new(),
            encrypted_credential: String::new(),
            details: None,
            outcome: None,
            active: false,
        }
    }

    pub fn step(&self) -> PaymentStep {
        self.step
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn stall_ticks(&self) -> u32 {
        self.stall_ticks
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn encrypted_credential(&self) -> &str {
        &self.encrypted_credential
    }

    /// Amount/identifier string received at `AwaitDetails`
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    pub fn outcome(&self) -> Option<PaymentOutcome> {
        self.outcome
    }

    /// True between `begin` and the terminal outcome
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Token to emit for the current step, if it is a send step
    pub fn outgoing_token(&self) -> Option<&str> {
        match self.step {
            PaymentStep::SendIdentity => Some(&self.user_id),
            PaymentStep::SendCredential => Some(&self.encrypted_credential),
            PaymentStep::SendApproval => Some(APPROVAL_TOKEN),
            _ => None,
        }
    }

    /// Activity on the channel during the current step
    pub(crate) fn note_progress(&mut self) {
        self.stall_ticks = 0;
    }

    /// Move to `step` with a fresh retry budget
    pub(crate) fn enter(&mut self, step: PaymentStep) {
        self.step = step;
        self.attempts = 0;
        self.stall_ticks = 0;
    }
}

/// What the session must do after a payment transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentAction {
    /// Emit [`PaymentState::outgoing_token`]
    Transmit,
    /// Arm reception and wait for a message
    Listen,
    /// Raise the terminal notification and release the hardware
    Finish(PaymentOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentUpdate {
    /// Step entered (or re-entered on retry)
    pub step: PaymentStep,
    /// Details received during this transition
    pub details: Option<String>,
    pub action: PaymentAction,
}

impl PaymentUpdate {
    fn enter(step: PaymentStep) -> Self {
        let action = match step.direction() {
            StepDirection::Send => PaymentAction::Transmit,
            StepDirection::Receive => PaymentAction::Listen,
            StepDirection::Terminal => PaymentAction::Finish(PaymentOutcome::Accepted),
        };
        Self {
            step,
            details: None,
            action,
        }
    }
}

/// Drives [`PaymentState`] through the step table
pub struct PaymentController {
    state: PaymentState,
    cipher: Box<dyn CredentialCipher>,
    user_id: Option<String>,
    secret: Option<String>,
}

impl Default for PaymentController {
    fn default() -> Self {
        Self::new(Box::new(PlainCipher))
    }
}

impl PaymentController {
    pub fn new(cipher: Box<dyn CredentialCipher>) -> Self {
        Self {
            state: PaymentState::new(),
            cipher,
            user_id: None,
            secret: None,
        }
    }

    pub fn state(&self) -> &PaymentState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut PaymentState {
        &mut self.state
    }

    pub fn set_cipher(&mut self, cipher: Box<dyn CredentialCipher>) {
        self.cipher = cipher;
    }

    pub fn set_credentials(&mut self, user_id: &str, secret: &str) {
        self.user_id = Some(user_id.to_owned());
        self.secret = Some(secret.to_owned());
    }

    pub fn has_credentials(&self) -> bool {
        self.user_id.is_some() && self.secret.is_some()
    }

    /// Start a transaction at `AwaitRequest`.
    ///
    /// Both tokens are prepared up front and checked against the codec so
    /// that no step can fail to encode later on.
    pub fn begin(&mut self, codec: &FrequencyCodec) -> Result<PaymentUpdate> {
        let (user_id, secret) = match (&self.user_id, &self.secret) {
            (Some(user_id), Some(secret)) => (user_id, secret),
            _ => return Err(EngineError::MissingCredentials),
        };

        codec.validate_message(user_id)?;
        let encrypted = self.cipher.encrypt(secret)?;
        codec
            .validate_message(&encrypted)
            .map_err(|e| EngineError::Cipher(format!("credential cannot be emitted: {}", e)))?;

        self.state = PaymentState {
            user_id: user_id.clone(),
            encrypted_credential: encrypted,
            active: true,
            ..PaymentState::new()
        };
        info!("payment transaction started");
        Ok(PaymentUpdate::enter(PaymentStep::AwaitRequest))
    }

    /// A complete message was decoded during a receive step
    pub fn on_message(&mut self, text: &str) -> Option<PaymentUpdate> {
        if !self.state.active {
            return None;
        }
        match self.state.step {
            PaymentStep::AwaitRequest => {
                debug!("payment request received");
                Some(self.advance())
            }
            PaymentStep::AwaitDetails => {
                self.state.details = Some(text.to_owned());
                let mut update = self.advance();
                update.details = Some(text.to_owned());
                Some(update)
            }
            PaymentStep::AwaitVerdict => match text {
                VERDICT_ACCEPTED => Some(self.conclude(PaymentOutcome::Accepted)),
                VERDICT_REJECTED => Some(self.conclude(PaymentOutcome::Rejected)),
                _ => {
                    debug!("ignoring {:?} while awaiting verdict", text);
                    None
                }
            },
            _ => None,
        }
    }

    /// The token of the current send step finished emitting
    pub fn on_transmitted(&mut self) -> Option<PaymentUpdate> {
        if !self.state.active || self.state.step.direction() != StepDirection::Send {
            return None;
        }
        Some(self.advance())
    }

    /// Re-request the current step after a timeout
    pub fn retry(&self) -> Option<PaymentUpdate> {
        if !self.state.active {
            return None;
        }
        Some(PaymentUpdate::enter(self.state.step))
    }

    /// End the transaction as rejected; `None` when it already concluded
    pub fn fail(&mut self) -> Option<PaymentUpdate> {
        if !self.state.active {
            return None;
        }
        Some(self.conclude(PaymentOutcome::Rejected))
    }

    /// Drop a transaction that never got its audio started; nothing is
    /// reported since no step was ever announced.
    pub(crate) fn abandon(&mut self) {
        self.state.active = false;
    }

    fn advance(&mut self) -> PaymentUpdate {
        let next = self.state.step.next();
        self.state.enter(next);
        debug!("payment step -> {:?}", next);
        PaymentUpdate::enter(next)
    }

    fn conclude(&mut self, outcome: PaymentOutcome) -> PaymentUpdate {
        self.state.enter(PaymentStep::Completed);
        self.state.outcome = Some(outcome);
        self.state.active = false;
        info!("payment transaction concluded: {:?}", outcome);
        PaymentUpdate {
            step: PaymentStep::Completed,
            details: None,
            action: PaymentAction::Finish(outcome),
        }
    }
}
