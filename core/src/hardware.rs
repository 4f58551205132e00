use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use crate::error::{EngineError, Result};

/// Audio device collaborator.
///
/// While started, the implementation delivers input blocks to
/// [`AudioPath::process_input`](crate::AudioPath::process_input) and pulls
/// output blocks from
/// [`AudioPath::render_output`](crate::AudioPath::render_output), never
/// running two callbacks of the same direction concurrently.
pub trait AudioHardware: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
    /// Current output volume in [0, 1]
    fn output_volume(&self) -> f32;
}

#[derive(Debug)]
struct OfflineInner {
    volume: AtomicU32,
    running: AtomicBool,
    starts: AtomicUsize,
    fail_next_start: Mutex<Option<String>>,
}

/// Hardware stand-in for file processing and tests.
///
/// Starting and stopping is bookkeeping only; the owner drives the audio
/// path by hand. Clones share state, so a test can keep a handle after
/// giving one to the engine.
#[derive(Debug, Clone)]
pub struct OfflineHardware {
    inner: Arc<OfflineInner>,
}

impl Default for OfflineHardware {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl OfflineHardware {
    pub fn new(volume: f32) -> Self {
        Self {
            inner: Arc::new(OfflineInner {
                volume: AtomicU32::new(volume.to_bits()),
                running: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
                fail_next_start: Mutex::new(None),
            }),
        }
    }

    pub fn set_output_volume(&self, volume: f32) {
        self.inner.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    /// Make the next `start` call fail with `reason`
    pub fn fail_next_start(&self, reason: &str) {
        *self
            .inner
            .fail_next_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.to_owned());
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of successful starts
    pub fn start_count(&self) -> usize {
        self.inner.starts.load(Ordering::Relaxed)
    }
}

impl AudioHardware for OfflineHardware {
    fn start(&mut self) -> Result<()> {
        let failure = self
            .inner
            .fail_next_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reason) = failure {
            return Err(EngineError::Hardware(reason));
        }
        self.inner.running.store(true, Ordering::Release);
        self.inner.starts.fetch_add(1, Ordering::Relaxed);
        debug!("offline audio graph started");
        Ok(())
    }

    fn stop(&mut self) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            debug!("offline audio graph stopped");
        }
    }

    fn output_volume(&self) -> f32 {
        f32::from_bits(self.inner.volume.load(Ordering::Relaxed))
    }
}
