//! Stall detection for reception and payment steps
//!
//! Both checks are driven by the control path's periodic tick. Neither
//! surfaces an error: the outcome tells the session which transition to
//! perform.

use log::{debug, warn};

use crate::config::EngineConfig;
use crate::payment::{PaymentState, PaymentStep};
use crate::reception::ReceptionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceptionTick {
    /// A decode event happened since the previous tick
    Progressed,
    /// No decode event; carries the stall counter
    Stalled(u32),
    /// The stall counter just crossed the threshold. Reported once.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTick {
    /// Nothing to supervise (no transaction or already concluded)
    Inactive,
    /// Step still within its timeout; carries the stall counter
    Waiting(u32),
    /// Step timed out and must be requested again
    Retry { step: PaymentStep, attempt: u32 },
    /// Step timed out with no attempts left; the transaction fails
    Exhausted { step: PaymentStep },
}

#[derive(Debug, Clone, Copy)]
pub struct Supervisor {
    reception_timeout: u32,
    step_timeout: u32,
    max_retries: u32,
}

impl Supervisor {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            reception_timeout: config.reception_timeout_ticks,
            step_timeout: config.payment_step_timeout_ticks,
            max_retries: config.payment_max_retries,
        }
    }

    pub fn tick_reception(&self, rx: &mut ReceptionState) -> ReceptionTick {
        if rx.progressed {
            rx.progressed = false;
            return ReceptionTick::Progressed;
        }

        rx.stall_ticks = rx.stall_ticks.saturating_add(1);
        if rx.stall_ticks > self.reception_timeout && !rx.timed_out {
            rx.timed_out = true;
            warn!(
                "reception stalled for {} ticks, giving up ({} characters kept)",
                rx.stall_ticks,
                rx.text.chars().count()
            );
            return ReceptionTick::TimedOut;
        }
        ReceptionTick::Stalled(rx.stall_ticks)
    }

    pub fn tick_payment_step(&self, payment: &mut PaymentState) -> StepTick {
        if !payment.is_active() || payment.step == PaymentStep::Completed {
            return StepTick::Inactive;
        }

        payment.stall_ticks += 1;
        if payment.stall_ticks <= self.step_timeout {
            return StepTick::Waiting(payment.stall_ticks);
        }

        payment.stall_ticks = 0;
        payment.attempts += 1;
        let step = payment.step;
        if payment.attempts >= self.max_retries {
            warn!(
                "payment step {:?} timed out {} times, abandoning transaction",
                step, payment.attempts
            );
            return StepTick::Exhausted { step };
        }

        debug!("payment step {:?} timed out, attempt {}", step, payment.attempts);
        StepTick::Retry {
            step,
            attempt: payment.attempts,
        }
    }
}
