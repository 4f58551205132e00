use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use tonelink_core::spectrum::to_pcm;
use tonelink_core::{
    AppMode, AudioPath, Direction, Engine, EngineConfig, EngineError, EngineEvent, EnginePhase,
    OfflineHardware, Subscription, TableConfig, TickOutcome, Zone,
};

const BLOCK: usize = 256;

fn test_config() -> EngineConfig {
    EngineConfig {
        sample_rate: 16_000,
        block_size: BLOCK,
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
        ..EngineConfig::default()
    }
}

struct Station {
    engine: Engine,
    path: AudioPath,
    hardware: OfflineHardware,
    events: Subscription,
}

fn station() -> Station {
    let _ = env_logger::builder().is_test(true).try_init();
    let hardware = OfflineHardware::default();
    let mut engine = Engine::new(test_config(), Box::new(hardware.clone())).unwrap();
    let path = engine.audio_path().unwrap();
    let events = engine.subscribe();
    Station {
        engine,
        path,
        hardware,
        events,
    }
}

/// Render `blocks` output blocks from `tx` and feed each into `rx`
fn pump(tx: &mut Station, rx: &mut Station, blocks: usize, noise: Option<(&mut StdRng, f32)>) {
    let (mut rng, normal) = match noise {
        Some((rng, sigma)) => (Some(rng), Some(Normal::new(0.0f32, sigma).unwrap())),
        None => (None, None),
    };
    let mut out = [0f32; BLOCK];
    let mut pcm = [0i16; BLOCK];
    for _ in 0..blocks {
        tx.path.render_output(&mut out);
        if let (Some(rng), Some(normal)) = (rng.as_deref_mut(), normal.as_ref()) {
            for sample in out.iter_mut() {
                *sample += normal.sample(rng);
            }
        }
        for (dst, &src) in pcm.iter_mut().zip(&out) {
            *dst = to_pcm(src);
        }
        rx.path.process_input(&pcm).unwrap();
    }
}

/// Symbols needed to emit `message` (markers, characters, trailing silence)
fn symbols_for(message: &str) -> usize {
    3 + 3 * message.chars().count() + 3 + 1
}

fn blocks_for(message: &str) -> usize {
    symbols_for(message) * 2048 / BLOCK
}

#[test]
fn test_message_round_trip_through_audio() {
    let mut sender = station();
    let mut receiver = station();
    let message = "Hello, tone world!";

    receiver.engine.start(Direction::Receive, None).unwrap();
    sender.engine.start(Direction::Send, Some(message)).unwrap();
    assert_eq!(sender.engine.phase(), EnginePhase::Sending);

    pump(&mut sender, &mut receiver, blocks_for(message), None);

    let received: Vec<_> = receiver.events.try_iter().collect();
    assert_eq!(
        received,
        vec![
            EngineEvent::ReceptionStarted,
            EngineEvent::MessageReceived(message.to_owned()),
        ]
    );
    assert_eq!(receiver.engine.received_text(), message);
    assert_eq!(receiver.engine.phase(), EnginePhase::Receiving);

    assert_eq!(sender.engine.phase(), EnginePhase::Idle);
    assert_eq!(sender.engine.tick(), TickOutcome::Released);
    assert!(!sender.hardware.is_running());
    assert_eq!(sender.engine.active_mode(), AppMode::None);
}

#[test]
fn test_progress_is_monotonic_and_ends_at_one() {
    let mut sender = station();
    let mut receiver = station();
    let message = "abcde";

    sender.engine.start(Direction::Send, Some(message)).unwrap();
    pump(&mut sender, &mut receiver, blocks_for(message), None);

    let events: Vec<_> = sender.events.try_iter().collect();
    let progress: Vec<f32> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::EmissionProgress(p) => Some(*p),
            _ => None,
        })
        .collect();

    assert_eq!(progress, vec![0.2, 0.4, 0.6, 0.8, 1.0]);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(events.last(), Some(&EngineEvent::EmissionFinished));
    assert_eq!(sender.engine.progress(), 1.0);
}

#[test]
fn test_consecutive_messages_in_one_activation() {
    let mut sender = station();
    let mut receiver = station();

    receiver.engine.start(Direction::Receive, None).unwrap();
    for message in ["first", "second"] {
        sender.engine.start(Direction::Send, Some(message)).unwrap();
        pump(&mut sender, &mut receiver, blocks_for(message), None);
    }

    let messages: Vec<_> = receiver
        .events
        .try_iter()
        .filter_map(|e| match e {
            EngineEvent::MessageReceived(text) => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(messages, vec!["first".to_owned(), "second".to_owned()]);
    assert_eq!(receiver.engine.received_text(), "firstsecond");
}

#[test]
fn test_round_trip_with_gaussian_noise() {
    let mut sender = station();
    let mut receiver = station();
    let mut rng = StdRng::seed_from_u64(7);
    let message = "Noise {tolerant} ~ 42";

    receiver.engine.start(Direction::Receive, None).unwrap();
    sender.engine.start(Direction::Send, Some(message)).unwrap();
    pump(&mut sender, &mut receiver, blocks_for(message), Some((&mut rng, 0.05)));

    assert_eq!(receiver.engine.received_text(), message);
}

#[test]
fn test_background_light_profile_round_trip() {
    let mut sender = station();
    let mut receiver = station();
    let message = "low power";

    receiver.engine.enable_background();
    receiver.engine.set_foreground(false);
    receiver.engine.start(Direction::Receive, None).unwrap();
    sender.engine.start(Direction::Send, Some(message)).unwrap();
    pump(&mut sender, &mut receiver, blocks_for(message), None);

    assert_eq!(receiver.path.resolution(), tonelink_core::Resolution::Light);
    assert_eq!(receiver.engine.received_text(), message);
}

#[test]
fn test_signal_below_minimum_volume_is_ignored() {
    let mut sender = station();
    let mut receiver = station();
    let message = "quiet";

    receiver.engine.change_minimum_volume(0.95).unwrap();
    receiver.engine.start(Direction::Receive, None).unwrap();
    sender.engine.start(Direction::Send, Some(message)).unwrap();
    pump(&mut sender, &mut receiver, blocks_for(message), None);

    assert_eq!(receiver.events.try_iter().count(), 0);
    assert_eq!(receiver.engine.received_text(), "");
}

#[test]
fn test_volume_too_low_never_starts_hardware() {
    let mut sender = station();
    sender.hardware.set_output_volume(0.05);

    let result = sender.engine.start(Direction::Send, Some("hello"));
    assert!(matches!(result, Err(EngineError::VolumeTooLow { .. })));
    assert_eq!(sender.hardware.start_count(), 0);
    assert_eq!(sender.engine.phase(), EnginePhase::Idle);
    assert_eq!(
        sender.events.try_iter().collect::<Vec<_>>(),
        vec![EngineEvent::VolumeTooLow]
    );
}

#[test]
fn test_second_mode_is_rejected() {
    let mut station = station();
    station.engine.start(Direction::Receive, None).unwrap();

    let zone = Zone {
        name: "Lobby".to_owned(),
        latitude: 0.0,
        longitude: 0.0,
        radius_m: 50.0,
        spots: Vec::new(),
    };
    assert!(matches!(
        station.engine.start(Direction::Send, Some("x")),
        Err(EngineError::ModeConflict { active: AppMode::Messaging })
    ));
    assert!(matches!(
        station.engine.activate_localisation(zone),
        Err(EngineError::ModeConflict { .. })
    ));
    assert!(matches!(
        station.engine.start_payment_processing(),
        Err(EngineError::ModeConflict { .. })
    ));

    assert_eq!(station.engine.phase(), EnginePhase::Receiving);
    assert!(station.engine.is_messaging_enabled());
    assert!(!station.engine.is_localisation_enabled());
    assert!(!station.engine.is_payment_enabled());
    assert_eq!(station.hardware.start_count(), 1);
}

#[test]
fn test_stall_timeout_keeps_partial_text() {
    let mut sender = station();
    let mut receiver = station();
    let message = "interrupted";

    receiver.engine.start(Direction::Receive, None).unwrap();
    sender.engine.start(Direction::Send, Some(message)).unwrap();
    // INIT plus the first four characters.
    pump(&mut sender, &mut receiver, (3 + 4 * 3) * 2048 / BLOCK, None);
    sender.engine.stop();
    assert_eq!(receiver.engine.received_text(), "inte");

    let outcomes: Vec<_> = (0..10).map(|_| receiver.engine.tick()).collect();
    let timeouts = outcomes
        .iter()
        .filter(|&&o| o == TickOutcome::ReceptionTimedOut)
        .count();
    assert_eq!(timeouts, 1);
    // One tick consumes the progress, three stall, the next exceeds.
    assert_eq!(outcomes[4], TickOutcome::ReceptionTimedOut);

    assert!(receiver.engine.reception_timed_out());
    assert_eq!(receiver.engine.phase(), EnginePhase::Idle);
    assert!(!receiver.hardware.is_running());
    assert_eq!(receiver.engine.received_text(), "inte");
}

#[test]
fn test_stop_mid_emission_falls_silent() {
    let mut sender = station();
    let mut receiver = station();

    sender.engine.start(Direction::Send, Some("never finished")).unwrap();
    pump(&mut sender, &mut receiver, 40, None);
    sender.engine.stop();

    assert!(!sender.hardware.is_running());
    assert!(sender.engine.progress() < 1.0);

    let mut out = [0f32; BLOCK];
    sender.path.render_output(&mut out);
    sender.path.render_output(&mut out);
    assert!(out.iter().all(|&s| s == 0.0));
    assert!(!sender
        .events
        .try_iter()
        .any(|e| e == EngineEvent::EmissionFinished));
}
