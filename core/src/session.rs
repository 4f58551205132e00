//! Session aggregate, mode state machine and control surface
//!
//! An [`Engine`] is the control-path handle: it owns the hardware and the
//! location provider and performs every transition that acquires or
//! releases them. The [`AudioPath`] is the real-time handle given to the
//! hardware callbacks; it owns the analyzer and the synthesizer and only
//! touches shared state through short critical sections.
//!
//! Transitions detected on the real-time path (end of emission, payment
//! conclusion) only flip the phase to Idle and flag a pending release. The
//! next [`Engine::tick`] (or control call) stops the hardware.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, info, warn};

use crate::codec::{DecodedEvent, FrequencyCodec, Milestone};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, Notifier, Subscription};
use crate::geo::{
    GeoState, LocationFix, LocationListener, LocationProvider, Spot, ValidatedLocation, Zone,
    ZoneMatcher,
};
use crate::hardware::AudioHardware;
use crate::payment::{
    CredentialCipher, PaymentAction, PaymentController, PaymentOutcome, PaymentStep, PaymentUpdate,
};
use crate::reception::ReceptionState;
use crate::spectrum::{Detection, DominantFrequency, Resolution, SpectralAnalyzer};
use crate::supervisor::{ReceptionTick, StepTick, Supervisor};
use crate::synth::Synthesizer;
use crate::transmission::TransmissionState;

/// Application mode paired with a running engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    None,
    Messaging,
    Geolocation,
    Payment,
}

impl AppMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AppMode::Messaging,
            2 => AppMode::Geolocation,
            3 => AppMode::Payment,
            _ => AppMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    Sending,
    Receiving,
}

impl EnginePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EnginePhase::Sending,
            2 => EnginePhase::Receiving,
            _ => EnginePhase::Idle,
        }
    }
}

/// What a control-path tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No mode active
    Idle,
    /// Activity continues
    Running,
    /// A finished activity released the hardware
    Released,
    /// Reception stalled; the engine is back to Idle with its text kept
    ReceptionTimedOut,
    /// A payment step timed out and was requested again
    PaymentRetried(PaymentStep),
    /// A payment step exhausted its retries; the transaction was rejected
    PaymentFailed,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State reachable from both execution contexts
struct Shared {
    config: EngineConfig,
    codec: FrequencyCodec,
    matcher: ZoneMatcher,
    supervisor: Supervisor,
    phase: AtomicU8,
    mode: AtomicU8,
    running: AtomicBool,
    release_pending: AtomicBool,
    background_enabled: AtomicBool,
    foreground: AtomicBool,
    /// f32 bits
    minimum_volume: AtomicU32,
    /// f32 bits, last reported emission progress
    progress: AtomicU32,
    /// Bumped whenever a phase is (re)armed so the real-time path restarts
    /// its symbol clock and analysis window
    generation: AtomicU64,
    tx: Mutex<TransmissionState>,
    rx: Mutex<ReceptionState>,
    geo: Mutex<GeoState>,
    payment: Mutex<PaymentController>,
    notifier: Arc<Notifier>,
}

impl Shared {
    fn phase(&self) -> EnginePhase {
        EnginePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: EnginePhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn mode(&self) -> AppMode {
        AppMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    fn set_mode(&self, mode: AppMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    fn minimum_volume(&self) -> f32 {
        f32::from_bits(self.minimum_volume.load(Ordering::Relaxed))
    }

    /// Queue `event`; delivery happens on the control path
    fn notify(&self, event: EngineEvent) {
        self.notifier.raise(event);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::Acquire) == generation
    }

    /// Go Idle only if still in `from`; false when a control call already
    /// moved the phase.
    fn finish_phase(&self, from: EnginePhase) -> bool {
        self.phase
            .compare_exchange(
                from as u8,
                EnginePhase::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Payment activity that proves the current step is not stalled
    fn note_payment_progress(&self) {
        lock(&self.payment).state_mut().note_progress();
    }

    /// Analysis profile for the current app state; `None` means input
    /// must be ignored (background without background processing).
    fn resolution(&self) -> Option<Resolution> {
        if self.foreground.load(Ordering::Relaxed) {
            Some(Resolution::Full)
        } else if self.background_enabled.load(Ordering::Relaxed) {
            Some(Resolution::Light)
        } else {
            None
        }
    }

    fn votes_per_symbol(&self, resolution: Resolution) -> usize {
        let fft_size = match resolution {
            Resolution::Full => self.config.full_fft_size,
            Resolution::Light => self.config.light_fft_size,
        };
        (self.config.symbol_samples / fft_size).max(1)
    }

    /// Enter `phase` with freshly armed state
    fn begin_phase(&self, phase: EnginePhase) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.set_phase(phase);
    }

    fn arm_transmission(&self, message: &str) {
        lock(&self.tx).arm(message);
        self.progress.store(0f32.to_bits(), Ordering::Relaxed);
    }

    fn arm_reception(&self) {
        let votes = self.votes_per_symbol(self.resolution().unwrap_or(Resolution::Full));
        lock(&self.rx).arm(votes);
    }

    /// Carry out a payment transition; the controller lock is held by the
    /// caller so transitions from both paths stay ordered.
    fn apply_payment(&self, controller: &mut PaymentController, update: PaymentUpdate) {
        self.notify(EngineEvent::PaymentStepChanged(update.step.ordinal()));
        if let Some(details) = update.details {
            self.notify(EngineEvent::PaymentData(details));
        }

        match update.action {
            PaymentAction::Transmit => {
                if let Some(token) = controller.state().outgoing_token() {
                    self.arm_transmission(token);
                }
                self.begin_phase(EnginePhase::Sending);
            }
            PaymentAction::Listen => {
                self.arm_reception();
                self.begin_phase(EnginePhase::Receiving);
            }
            PaymentAction::Finish(outcome) => {
                self.notify(EngineEvent::PaymentFinalState(outcome));
                lock(&self.tx).cancel();
                self.set_phase(EnginePhase::Idle);
                self.release_pending.store(true, Ordering::Release);
            }
        }
    }

    /// Act on a milestone of the emission armed at `generation`. A
    /// milestone outlived by a stop or a new activation is dropped.
    fn on_milestone(&self, milestone: Milestone, generation: u64) {
        if !self.is_current(generation) {
            debug!("dropping {:?} from a finished emission", milestone);
            return;
        }

        match milestone {
            Milestone::CharacterDone(progress) => {
                self.progress.store(progress.to_bits(), Ordering::Relaxed);
                self.notify(EngineEvent::EmissionProgress(progress));
                if self.mode() == AppMode::Payment {
                    self.note_payment_progress();
                }
            }
            Milestone::MessageDone => {
                if self.mode() == AppMode::Payment {
                    // Steps are re-armed under this lock, so the check is exact.
                    let mut controller = lock(&self.payment);
                    if !self.is_current(generation) || !controller.state().is_active() {
                        return;
                    }
                    self.finish_emission();
                    if let Some(update) = controller.on_transmitted() {
                        self.apply_payment(&mut controller, update);
                    }
                } else if self.finish_phase(EnginePhase::Sending) {
                    self.finish_emission();
                    debug!("emission complete");
                    self.release_pending.store(true, Ordering::Release);
                }
            }
        }
    }

    fn finish_emission(&self) {
        self.progress.store(1f32.to_bits(), Ordering::Relaxed);
        self.notify(EngineEvent::EmissionProgress(1.0));
        self.notify(EngineEvent::EmissionFinished);
    }

    fn decode_window(&self, dominant: &DominantFrequency, minimum_volume: f32) {
        let (event, message) = {
            let mut rx = lock(&self.rx);
            let event =
                self.codec.accept_frequency(&mut rx, dominant.hz, dominant.level, minimum_volume);
            let message = match event {
                DecodedEvent::EndOfMessage => Some(rx.current_message().to_owned()),
                _ => None,
            };
            (event, message)
        };

        let mode = self.mode();
        let decoded_symbol = matches!(event, DecodedEvent::StartOfMessage | DecodedEvent::Char(_));
        if mode == AppMode::Payment && decoded_symbol {
            self.note_payment_progress();
        }
        match (event, message) {
            (DecodedEvent::StartOfMessage, _) if mode == AppMode::Messaging => {
                self.notify(EngineEvent::ReceptionStarted);
            }
            (DecodedEvent::EndOfMessage, Some(text)) => match mode {
                AppMode::Payment => {
                    debug!("payment token received: {:?}", text);
                    let mut controller = lock(&self.payment);
                    if let Some(update) = controller.on_message(&text) {
                        self.apply_payment(&mut controller, update);
                    }
                }
                _ => {
                    info!("message received: {:?}", text);
                    self.notify(EngineEvent::MessageReceived(text));
                }
            },
            _ => {}
        }
    }

    fn match_beacon(&self, dominant: &DominantFrequency, minimum_volume: f32) {
        let validated = {
            let mut geo = lock(&self.geo);
            self.matcher
                .accept_frequency(&mut geo, dominant.hz, dominant.level, minimum_volume)
        };
        if let Some(location) = validated {
            self.notify_location(location);
        }
    }

    fn handle_fix(&self, fix: LocationFix) {
        let validated = {
            let mut geo = lock(&self.geo);
            self.matcher.update_fix(&mut geo, fix)
        };
        if let Some(location) = validated {
            self.notify_location(location);
        }
        self.notifier.dispatch();
    }

    fn notify_location(&self, location: ValidatedLocation) {
        self.notify(EngineEvent::LocationData {
            place: location.place,
            promotion: location.promotion,
        });
    }
}

/// Forwards location-service fixes into the session
struct FixForwarder {
    shared: Weak<Shared>,
}

impl LocationListener for FixForwarder {
    fn on_fix(&self, fix: LocationFix) {
        if let Some(shared) = self.shared.upgrade() {
            shared.handle_fix(fix);
        }
    }
}

/// Control-path handle of one engine session
pub struct Engine {
    shared: Arc<Shared>,
    hardware: Box<dyn AudioHardware>,
    location: Option<Box<dyn LocationProvider>>,
    audio_path_taken: bool,
}

impl Engine {
    pub fn new(config: EngineConfig, hardware: Box<dyn AudioHardware>) -> Result<Self> {
        config.validate()?;

        let shared = Shared {
            codec: FrequencyCodec::new(&config),
            matcher: ZoneMatcher::new(config.geo_tolerance_hz, config.geo_confirmations),
            supervisor: Supervisor::new(&config),
            phase: AtomicU8::new(EnginePhase::Idle as u8),
            mode: AtomicU8::new(AppMode::None as u8),
            running: AtomicBool::new(false),
            release_pending: AtomicBool::new(false),
            background_enabled: AtomicBool::new(false),
            foreground: AtomicBool::new(true),
            minimum_volume: AtomicU32::new(config.minimum_volume.to_bits()),
            progress: AtomicU32::new(0f32.to_bits()),
            generation: AtomicU64::new(0),
            tx: Mutex::new(TransmissionState::with_capacity(config.max_message_len)),
            rx: Mutex::new(ReceptionState::with_capacity(config.max_message_len)),
            geo: Mutex::new(GeoState::new()),
            payment: Mutex::new(PaymentController::default()),
            notifier: Arc::new(Notifier::new()),
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            hardware,
            location: None,
            audio_path_taken: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub fn codec(&self) -> &FrequencyCodec {
        &self.shared.codec
    }

    /// Real-time handle for the hardware callbacks. Available once.
    pub fn audio_path(&mut self) -> Result<AudioPath> {
        if self.audio_path_taken {
            return Err(EngineError::AudioPathTaken);
        }
        let resolution = self.shared.resolution().unwrap_or(Resolution::Full);
        let analyzer = SpectralAnalyzer::new(&self.shared.config, resolution)?;
        let synth = Synthesizer::new(&self.shared.config);
        self.audio_path_taken = true;

        Ok(AudioPath {
            shared: Arc::clone(&self.shared),
            analyzer,
            synth,
            symbol_samples: self.shared.config.symbol_samples,
            symbol_remaining: 0,
            current_hz: None,
            input_generation: 0,
            output_generation: 0,
        })
    }

    pub fn set_event_handler<F>(&self, handler: F)
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.shared.notifier.set_handler(Box::new(handler));
    }

    pub fn clear_event_handler(&self) {
        self.shared.notifier.clear_handler();
    }

    /// Channel receiving every event raised from now on
    pub fn subscribe(&self) -> Subscription {
        self.shared.notifier.subscribe()
    }

    /// Deliver events queued by the audio path. Every control call and
    /// every subscription read does this too.
    pub fn dispatch_events(&self) -> usize {
        self.shared.notifier.dispatch()
    }

    /// Activate messaging in the given direction.
    ///
    /// Sending requires a non-empty message the table can encode and an
    /// output volume at or above the minimum. Nothing changes on failure.
    pub fn start(&mut self, direction: Direction, message: Option<&str>) -> Result<()> {
        let result = self.start_messaging(direction, message);
        self.dispatch_events();
        result
    }

    fn start_messaging(&mut self, direction: Direction, message: Option<&str>) -> Result<()> {
        self.release_if_pending();
        self.ensure_idle()?;

        match direction {
            Direction::Send => {
                let message = message.unwrap_or("");
                self.shared.codec.validate_message(message)?;
                self.check_output_volume()?;
                self.start_hardware()?;

                self.shared.arm_transmission(message);
                self.shared.set_mode(AppMode::Messaging);
                self.shared.begin_phase(EnginePhase::Sending);
                info!("sending {} characters", message.chars().count());
            }
            Direction::Receive => {
                self.start_hardware()?;

                self.shared.arm_reception();
                self.shared.set_mode(AppMode::Messaging);
                self.shared.begin_phase(EnginePhase::Receiving);
                info!("listening for messages");
            }
        }
        Ok(())
    }

    /// Stop whatever is active. Reception state is frozen, not cleared.
    pub fn stop(&mut self) {
        let mode = self.shared.mode();
        if mode == AppMode::None {
            self.release_if_pending();
            return;
        }

        let phase = self.shared.phase();
        self.shared.set_phase(EnginePhase::Idle);
        lock(&self.shared.tx).cancel();

        match mode {
            AppMode::Geolocation => {
                lock(&self.shared.geo).deactivate();
                if let Some(provider) = self.location.as_mut() {
                    provider.stop_updates();
                }
            }
            AppMode::Payment => {
                let mut controller = lock(&self.shared.payment);
                if let Some(update) = controller.fail() {
                    self.shared.apply_payment(&mut controller, update);
                }
            }
            _ => {}
        }

        self.release();
        self.dispatch_events();
        info!("{:?} stopped ({:?} -> Idle)", mode, phase);
    }

    /// Periodic control-path step: releases finished activities and runs
    /// the timeout supervisor.
    pub fn tick(&mut self) -> TickOutcome {
        let outcome = self.supervise();
        self.dispatch_events();
        outcome
    }

    fn supervise(&mut self) -> TickOutcome {
        if self.release_if_pending() {
            return TickOutcome::Released;
        }

        match (self.shared.mode(), self.shared.phase()) {
            (AppMode::None, _) => TickOutcome::Idle,
            (AppMode::Messaging, EnginePhase::Receiving) => {
                let tick = {
                    let mut rx = lock(&self.shared.rx);
                    self.shared.supervisor.tick_reception(&mut rx)
                };
                if tick != ReceptionTick::TimedOut {
                    return TickOutcome::Running;
                }
                self.shared.set_phase(EnginePhase::Idle);
                self.release();
                info!("reception timed out, back to Idle");
                TickOutcome::ReceptionTimedOut
            }
            (AppMode::Payment, _) => self.tick_payment(),
            _ => TickOutcome::Running,
        }
    }

    fn tick_payment(&mut self) -> TickOutcome {
        let outcome = {
            let mut controller = lock(&self.shared.payment);
            let tick = self.shared.supervisor.tick_payment_step(controller.state_mut());
            match tick {
                StepTick::Retry { step, .. } => {
                    if let Some(update) = controller.retry() {
                        self.shared.apply_payment(&mut controller, update);
                    }
                    TickOutcome::PaymentRetried(step)
                }
                StepTick::Exhausted { .. } => {
                    if let Some(update) = controller.fail() {
                        self.shared.apply_payment(&mut controller, update);
                    }
                    TickOutcome::PaymentFailed
                }
                StepTick::Waiting(_) | StepTick::Inactive => TickOutcome::Running,
            }
        };

        if outcome == TickOutcome::PaymentFailed {
            self.release();
        }
        outcome
    }

    pub fn change_minimum_volume(&self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(EngineError::InvalidVolume(volume));
        }
        self.shared
            .minimum_volume
            .store(volume.to_bits(), Ordering::Relaxed);
        debug!("minimum volume set to {:.2}", volume);
        Ok(())
    }

    pub fn minimum_volume(&self) -> f32 {
        self.shared.minimum_volume()
    }

    /// Keep listening with the light profile while in the background
    pub fn enable_background(&self) {
        self.shared.background_enabled.store(true, Ordering::Relaxed);
        debug!("background processing enabled");
    }

    pub fn disable_background(&self) {
        self.shared.background_enabled.store(false, Ordering::Relaxed);
        debug!("background processing disabled");
    }

    /// Host application visibility; picked up by the next input block
    pub fn set_foreground(&self, foreground: bool) {
        self.shared.foreground.store(foreground, Ordering::Relaxed);
    }

    pub fn is_foreground(&self) -> bool {
        self.shared.foreground.load(Ordering::Relaxed)
    }

    pub fn is_background_enabled(&self) -> bool {
        self.shared.background_enabled.load(Ordering::Relaxed)
    }

    pub fn is_messaging_enabled(&self) -> bool {
        self.shared.mode() == AppMode::Messaging
    }

    pub fn is_localisation_enabled(&self) -> bool {
        self.shared.mode() == AppMode::Geolocation
    }

    pub fn is_payment_enabled(&self) -> bool {
        self.shared.mode() == AppMode::Payment
    }

    /// True while the audio hardware is held
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn set_location_provider(&mut self, provider: Box<dyn LocationProvider>) {
        self.location = Some(provider);
    }

    /// Listen for the beacons of `zone`. Location updates are started when
    /// a provider is set; their absence is not fatal.
    pub fn activate_localisation(&mut self, zone: Zone) -> Result<()> {
        let result = self.start_localisation(zone);
        self.dispatch_events();
        result
    }

    fn start_localisation(&mut self, zone: Zone) -> Result<()> {
        self.release_if_pending();
        self.ensure_idle()?;

        let name = zone.name.clone();
        lock(&self.shared.geo).activate(zone);
        if let Err(e) = self.start_hardware() {
            lock(&self.shared.geo).deactivate();
            return Err(e);
        }

        if let Some(provider) = self.location.as_mut() {
            let listener = Arc::new(FixForwarder {
                shared: Arc::downgrade(&self.shared),
            });
            if let Err(e) = provider.start_updates(listener) {
                warn!("location updates unavailable: {}", e);
            }
        }

        self.shared.set_mode(AppMode::Geolocation);
        self.shared.begin_phase(EnginePhase::Receiving);
        info!("localisation active in zone {:?}", name);
        Ok(())
    }

    pub fn deactivate_localisation(&mut self) {
        if self.shared.mode() == AppMode::Geolocation {
            self.stop();
        }
    }

    /// Allow acoustic-only validation of spots
    pub fn set_high_accuracy(&self, enabled: bool) {
        let validated = {
            let mut geo = lock(&self.shared.geo);
            self.shared.matcher.set_high_accuracy(&mut geo, enabled)
        };
        if let Some(location) = validated {
            self.shared.notify_location(location);
        }
        self.dispatch_events();
    }

    /// Feed a fix directly, bypassing any provider
    pub fn update_location(&self, fix: LocationFix) {
        self.shared.handle_fix(fix);
    }

    pub fn set_payment_credentials(&self, user_id: &str, secret: &str) {
        lock(&self.shared.payment).set_credentials(user_id, secret);
    }

    pub fn set_credential_cipher(&self, cipher: Box<dyn CredentialCipher>) {
        lock(&self.shared.payment).set_cipher(cipher);
    }

    /// Begin a payment transaction at its first step
    pub fn start_payment_processing(&mut self) -> Result<()> {
        let result = self.start_payment();
        self.dispatch_events();
        result
    }

    fn start_payment(&mut self) -> Result<()> {
        self.release_if_pending();
        self.ensure_idle()?;

        let update = lock(&self.shared.payment).begin(&self.shared.codec)?;
        if let Err(e) = self.start_hardware() {
            lock(&self.shared.payment).abandon();
            return Err(e);
        }

        self.shared.set_mode(AppMode::Payment);
        let mut controller = lock(&self.shared.payment);
        self.shared.apply_payment(&mut controller, update);
        Ok(())
    }

    pub fn phase(&self) -> EnginePhase {
        self.shared.phase()
    }

    pub fn active_mode(&self) -> AppMode {
        self.shared.mode()
    }

    /// Everything decoded during the last receive activation
    pub fn received_text(&self) -> String {
        lock(&self.shared.rx).text().to_owned()
    }

    pub fn reception_timed_out(&self) -> bool {
        lock(&self.shared.rx).timed_out()
    }

    /// Last reported emission progress in [0, 1]
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.shared.progress.load(Ordering::Relaxed))
    }

    pub fn payment_step(&self) -> PaymentStep {
        lock(&self.shared.payment).state().step()
    }

    pub fn payment_outcome(&self) -> Option<PaymentOutcome> {
        lock(&self.shared.payment).state().outcome()
    }

    pub fn payment_details(&self) -> Option<String> {
        lock(&self.shared.payment).state().details().map(str::to_owned)
    }

    pub fn last_validated_spot(&self) -> Option<Spot> {
        lock(&self.shared.geo).last_validated().cloned()
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.shared.mode() {
            AppMode::None => Ok(()),
            active => Err(EngineError::ModeConflict { active }),
        }
    }

    fn check_output_volume(&self) -> Result<()> {
        let measured = self.hardware.output_volume();
        let minimum = self.shared.minimum_volume();
        if measured < minimum {
            warn!("output volume {:.2} below minimum {:.2}", measured, minimum);
            self.shared.notify(EngineEvent::VolumeTooLow);
            return Err(EngineError::VolumeTooLow { measured, minimum });
        }
        Ok(())
    }

    fn start_hardware(&mut self) -> Result<()> {
        if let Err(e) = self.hardware.start() {
            warn!("audio hardware failed to start: {}", e);
            return Err(e);
        }
        self.shared.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Release the hardware after the real-time path went Idle
    fn release_if_pending(&mut self) -> bool {
        if !self.shared.release_pending.swap(false, Ordering::AcqRel) {
            return false;
        }
        let mode = self.shared.mode();
        self.release();
        info!("{:?} finished, audio released", mode);
        true
    }

    fn release(&mut self) {
        self.hardware.stop();
        self.shared.running.store(false, Ordering::Release);
        self.shared.release_pending.store(false, Ordering::Release);
        self.shared.set_mode(AppMode::None);
        self.shared.set_phase(EnginePhase::Idle);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_running() {
            self.hardware.stop();
        }
    }
}

/// Real-time handle: feed captured blocks in, pull synthesized blocks out.
///
/// Neither entry point allocates outside of profile switches and event
/// payloads, and neither blocks beyond short field updates. Events are
/// queued here and delivered by the control path.
pub struct AudioPath {
    shared: Arc<Shared>,
    analyzer: SpectralAnalyzer,
    synth: Synthesizer,
    symbol_samples: usize,
    symbol_remaining: usize,
    current_hz: Option<f32>,
    input_generation: u64,
    output_generation: u64,
}

impl AudioPath {
    /// Analysis profile currently in use
    pub fn resolution(&self) -> Resolution {
        self.analyzer.resolution()
    }

    /// Consume one captured PCM block
    pub fn process_input(&mut self, block: &[i16]) -> Result<()> {
        let shared = &self.shared;
        if shared.phase() != EnginePhase::Receiving {
            return Ok(());
        }

        let generation = shared.generation.load(Ordering::Acquire);
        if generation != self.input_generation {
            self.input_generation = generation;
            self.analyzer.reset();
        }

        let resolution = match shared.resolution() {
            Some(resolution) => resolution,
            None => return Ok(()),
        };
        if self.analyzer.resolution() != resolution {
            self.analyzer.set_resolution(resolution);
            lock(&shared.rx).set_votes_per_symbol(shared.votes_per_symbol(resolution));
        }

        let dominant = match self.analyzer.analyze(block)? {
            Detection::Dominant(dominant) => dominant,
            Detection::NoSignal => return Ok(()),
        };

        let minimum_volume = shared.minimum_volume();
        match shared.mode() {
            AppMode::Messaging | AppMode::Payment => {
                shared.decode_window(&dominant, minimum_volume)
            }
            AppMode::Geolocation => shared.match_beacon(&dominant, minimum_volume),
            AppMode::None => {}
        }
        Ok(())
    }

    /// Fill one output block
    pub fn render_output(&mut self, out: &mut [f32]) {
        let mut offset = 0;

        while offset < out.len() {
            if self.shared.phase() != EnginePhase::Sending {
                self.symbol_remaining = 0;
                self.current_hz = None;
                self.synth.render(None, &mut out[offset..]);
                return;
            }

            let generation = self.shared.generation.load(Ordering::Acquire);
            if generation != self.output_generation {
                self.output_generation = generation;
                self.symbol_remaining = 0;
            }

            if self.symbol_remaining == 0 {
                let emission = {
                    let mut tx = lock(&self.shared.tx);
                    self.shared.codec.next_emission_frequency(&mut tx)
                };
                self.current_hz = emission.frequency;
                self.symbol_remaining = self.symbol_samples;
                if let Some(milestone) = emission.milestone {
                    self.shared.on_milestone(milestone, generation);
                }
            }

            let count = self.symbol_remaining.min(out.len() - offset);
            self.synth.render(self.current_hz, &mut out[offset..offset + count]);
            self.symbol_remaining -= count;
            offset += count;
        }
    }

    /// [`render_output`](Self::render_output) into 16-bit PCM
    pub fn render_pcm(&mut self, out: &mut [i16]) {
        let mut block = [0f32; 256];
        for piece in out.chunks_mut(block.len()) {
            let len = piece.len();
            self.render_output(&mut block[..len]);
            for (dst, &src) in piece.iter_mut().zip(&block[..len]) {
                *dst = crate::spectrum::to_pcm(src);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;
    use crate::hardware::OfflineHardware;

    fn test_config() -> EngineConfig {
        EngineConfig {
            sample_rate: 16_000,
            block_size: 256,
            full_fft_size: 2048,
            light_fft_size: 512,
            symbol_samples: 2048,
            ramp_samples: 64,
            table: TableConfig {
                base_hz: 1000.0,
                spacing_hz: 40.0,
                init_hz: 880.0,
                stop_hz: 920.0,
            },
            reception_timeout_ticks: 3,
            payment_step_timeout_ticks: 2,
            payment_max_retries: 2,
            ..EngineConfig::default()
        }
    }

    fn engine() -> (Engine, OfflineHardware) {
        let hardware = OfflineHardware::default();
        let engine = Engine::new(test_config(), Box::new(hardware.clone())).unwrap();
        (engine, hardware)
    }

    #[test]
    fn test_starts_idle() {
        let (engine, hardware) = engine();
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert_eq!(engine.active_mode(), AppMode::None);
        assert!(!engine.is_running());
        assert!(!hardware.is_running());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = EngineConfig {
            full_fft_size: 3000,
            ..test_config()
        };
        assert!(Engine::new(config, Box::new(OfflineHardware::default())).is_err());
    }

    #[test]
    fn test_audio_path_taken_once() {
        let (mut engine, _) = engine();
        assert!(engine.audio_path().is_ok());
        assert!(matches!(engine.audio_path(), Err(EngineError::AudioPathTaken)));
    }

    #[test]
    fn test_send_requires_message() {
        let (mut engine, hardware) = engine();
        assert!(matches!(
            engine.start(Direction::Send, None),
            Err(EngineError::EmptyMessage)
        ));
        assert!(!hardware.is_running());
        assert_eq!(engine.phase(), EnginePhase::Idle);
    }

    #[test]
    fn test_hardware_failure_leaves_idle() {
        let (mut engine, hardware) = engine();
        hardware.fail_next_start("no device");
        assert!(matches!(
            engine.start(Direction::Receive, None),
            Err(EngineError::Hardware(_))
        ));
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert_eq!(engine.active_mode(), AppMode::None);
        assert!(!engine.is_running());
    }

    #[test]
    fn test_minimum_volume_range() {
        let (engine, _) = engine();
        assert!(engine.change_minimum_volume(0.75).is_ok());
        assert_eq!(engine.minimum_volume(), 0.75);
        assert!(matches!(
            engine.change_minimum_volume(1.2),
            Err(EngineError::InvalidVolume(_))
        ));
        assert!(engine.change_minimum_volume(f32::NAN).is_err());
        assert_eq!(engine.minimum_volume(), 0.75);
    }

    #[test]
    fn test_stop_freezes_reception() {
        let (mut engine, hardware) = engine();
        engine.start(Direction::Receive, None).unwrap();
        assert!(engine.is_messaging_enabled());
        assert!(hardware.is_running());

        engine.stop();
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert!(!engine.is_messaging_enabled());
        assert!(!hardware.is_running());
    }

    #[test]
    fn test_background_selects_light_profile() {
        let (mut engine, _) = engine();
        let mut path = engine.audio_path().unwrap();
        engine.start(Direction::Receive, None).unwrap();

        path.process_input(&[0; 256]).unwrap();
        assert_eq!(path.resolution(), Resolution::Full);

        engine.enable_background();
        engine.set_foreground(false);
        path.process_input(&[0; 256]).unwrap();
        assert_eq!(path.resolution(), Resolution::Light);
        assert_eq!(lock(&engine.shared.rx).votes_per_symbol(), 4);
    }

    #[test]
    fn test_background_disabled_ignores_input() {
        let (mut engine, _) = engine();
        let mut path = engine.audio_path().unwrap();
        engine.start(Direction::Receive, None).unwrap();
        engine.set_foreground(false);

        path.process_input(&[1000; 256]).unwrap();
        assert_eq!(path.analyzer.pending_samples(), 0);
        assert_eq!(path.resolution(), Resolution::Full);
    }

    #[test]
    fn test_idle_output_is_silent() {
        let (mut engine, _) = engine();
        let mut path = engine.audio_path().unwrap();
        let mut out = [1.0f32; 512];
        path.render_output(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_stale_completion_leaves_new_activation_alone() {
        let (mut engine, hardware) = engine();
        let events = engine.subscribe();
        engine.start(Direction::Send, Some("hi")).unwrap();
        let generation = engine.shared.generation.load(Ordering::Acquire);

        // Completion picked up by the audio path just before stop + restart.
        engine.stop();
        engine.start(Direction::Receive, None).unwrap();
        engine.shared.on_milestone(Milestone::MessageDone, generation);

        assert_eq!(engine.phase(), EnginePhase::Receiving);
        assert!(!engine.shared.release_pending.load(Ordering::Acquire));
        assert_eq!(engine.tick(), TickOutcome::Running);
        assert!(hardware.is_running());
        assert!(!events.try_iter().any(|e| e == EngineEvent::EmissionFinished));
    }

    #[test]
    fn test_completion_after_stop_is_ignored() {
        let (mut engine, hardware) = engine();
        engine.start(Direction::Send, Some("hi")).unwrap();
        let generation = engine.shared.generation.load(Ordering::Acquire);

        engine.stop();
        engine.shared.on_milestone(Milestone::MessageDone, generation);

        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert!(!engine.shared.release_pending.load(Ordering::Acquire));
        assert_eq!(engine.tick(), TickOutcome::Idle);
        assert_eq!(hardware.start_count(), 1);
    }

    #[test]
    fn test_events_wait_for_control_path() {
        let (mut engine, _) = engine();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        engine.set_event_handler(move |event| sink.lock().unwrap().push(event.clone()));
        engine.start(Direction::Send, Some("hi")).unwrap();
        let generation = engine.shared.generation.load(Ordering::Acquire);

        engine.shared.on_milestone(Milestone::MessageDone, generation);
        assert!(seen.lock().unwrap().is_empty());

        assert_eq!(engine.tick(), TickOutcome::Released);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EngineEvent::EmissionProgress(1.0), EngineEvent::EmissionFinished]
        );
    }
}
