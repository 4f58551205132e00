use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryIter, TryRecvError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use log::warn;

use crate::payment::PaymentOutcome;

/// Events the queue holds between two dispatches before dropping
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Notifications raised by the engine, in the order they occur
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A complete message was decoded
    MessageReceived(String),
    /// An INIT marker was decoded
    ReceptionStarted,
    /// Fraction of characters emitted, non-decreasing during one send
    EmissionProgress(f32),
    EmissionFinished,
    /// The send pre-flight measured an output volume below the minimum
    VolumeTooLow,
    LocationData {
        place: String,
        promotion: Option<String>,
    },
    /// Ordinal of the payment step entered (0..=6)
    PaymentStepChanged(u8),
    /// Amount/identifier string received from the terminal
    PaymentData(String),
    PaymentFinalState(PaymentOutcome),
}

pub type EventHandler = Box<dyn Fn(&EngineEvent) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Queue between whoever raises events and whoever delivers them.
///
/// [`raise`](Self::raise) only moves the event into a pre-sized queue, so
/// the audio callbacks can call it. [`dispatch`](Self::dispatch) runs on
/// the control side and fans every queued event out to the optional
/// callback and the channel subscribers. With nobody listening, events
/// are discarded at dispatch.
pub struct Notifier {
    queue: Mutex<VecDeque<EngineEvent>>,
    capacity: usize,
    dropped: AtomicUsize,
    /// Held for a whole dispatch so deliveries never interleave
    delivering: Mutex<()>,
    handler: Mutex<Option<EventHandler>>,
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicUsize::new(0),
            delivering: Mutex::new(()),
            handler: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_handler(&self, handler: EventHandler) {
        *lock(&self.handler) = Some(handler);
    }

    pub fn clear_handler(&self) {
        *lock(&self.handler) = None;
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        Subscription {
            events: rx,
            notifier: Arc::clone(self),
        }
    }

    /// Queue `event` for the next dispatch. Never grows the queue: a full
    /// queue drops the event and counts it.
    pub fn raise(&self, event: EngineEvent) {
        let mut queue = lock(&self.queue);
        if queue.len() < self.capacity {
            queue.push_back(event);
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Deliver everything queued so far; returns how many events went out.
    ///
    /// A dispatch already running on another thread (or further up this
    /// one, from inside a handler) delivers the queue instead.
    pub fn dispatch(&self) -> usize {
        let _delivering = match self.delivering.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return 0,
        };

        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            warn!("event queue full, {} events dropped", dropped);
        }

        let mut delivered = 0;
        loop {
            let event = match lock(&self.queue).pop_front() {
                Some(event) => event,
                None => return delivered,
            };
            self.deliver(event);
            delivered += 1;
        }
    }

    fn deliver(&self, event: EngineEvent) {
        if let Some(handler) = lock(&self.handler).as_ref() {
            handler(&event);
        }

        let mut subscribers = lock(&self.subscribers);
        // Dropped receivers are pruned on the next event.
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Channel end of [`Notifier::subscribe`]. Reading delivers whatever the
/// engine queued since the last dispatch first.
pub struct Subscription {
    events: Receiver<EngineEvent>,
    notifier: Arc<Notifier>,
}

impl Subscription {
    pub fn try_recv(&self) -> Result<EngineEvent, TryRecvError> {
        self.notifier.dispatch();
        self.events.try_recv()
    }

    pub fn try_iter(&self) -> TryIter<'_, EngineEvent> {
        self.notifier.dispatch();
        self.events.try_iter()
    }
}
