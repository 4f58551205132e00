use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

const SMALL_CONFIG: &str = r#"{
    "sample_rate": 16000,
    "block_size": 256,
    "full_fft_size": 2048,
    "light_fft_size": 512,
    "symbol_samples": 2048,
    "ramp_samples": 64,
    "table": { "base_hz": 1000.0, "spacing_hz": 40.0, "init_hz": 880.0, "stop_hz": 920.0 }
}"#;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("tonelink-{}-{}", name, std::process::id()));
    fs::create_dir_all(&dir).expect("Failed to create scratch directory");
    dir
}

fn write_config(dir: &PathBuf, content: &str) -> PathBuf {
    let path = dir.join("config.json");
    fs::write(&path, content).expect("Failed to write config");
    path
}

fn run_tonelink(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tonelink"))
        .args(args)
        .output()
        .expect("Failed to execute tonelink")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn test_encode_then_decode() {
    let dir = scratch_dir("roundtrip");
    let config = write_config(&dir, SMALL_CONFIG);
    let wav = dir.join("hello.wav");

    let encoded = run_tonelink(&[
        "--config",
        config.to_str().unwrap(),
        "encode",
        "Hello CLI!",
        wav.to_str().unwrap(),
    ]);
    assert!(encoded.status.success(), "encode failed: {:?}", encoded);
    assert!(wav.exists(), "Output file was not created");

    let reader = hound::WavReader::open(&wav).expect("Output is not a WAV file");
    assert_eq!(reader.spec().sample_rate, 16_000);
    assert_eq!(reader.spec().bits_per_sample, 16);
    // 3 + 30 + 3 symbols of 2048 samples at least.
    assert!(reader.len() >= 36 * 2048, "File too short: {} samples", reader.len());

    let decoded = run_tonelink(&[
        "--config",
        config.to_str().unwrap(),
        "decode",
        wav.to_str().unwrap(),
    ]);
    assert!(decoded.status.success(), "decode failed: {:?}", decoded);
    assert_eq!(stdout(&decoded).trim(), "Hello CLI!");
}

#[test]
fn test_decode_with_light_profile() {
    let dir = scratch_dir("light");
    let config = write_config(&dir, SMALL_CONFIG);
    let wav = dir.join("light.wav");

    let cfg = config.to_str().unwrap();
    let encoded = run_tonelink(&["--config", cfg, "encode", "background", wav.to_str().unwrap()]);
    assert!(encoded.status.success());

    let decoded = run_tonelink(&["--config", cfg, "--light", "decode", wav.to_str().unwrap()]);
    assert!(decoded.status.success(), "decode failed: {:?}", decoded);
    assert_eq!(stdout(&decoded).trim(), "background");
}

#[test]
fn test_high_minimum_volume_decodes_nothing() {
    let dir = scratch_dir("quiet");
    let config = write_config(&dir, SMALL_CONFIG);
    let wav = dir.join("quiet.wav");

    let cfg = config.to_str().unwrap();
    run_tonelink(&["--config", cfg, "encode", "shh", wav.to_str().unwrap()]);

    let decoded = run_tonelink(&[
        "--config",
        cfg,
        "--min-volume",
        "0.99",
        "decode",
        wav.to_str().unwrap(),
    ]);
    assert!(!decoded.status.success());
    assert!(stdout(&decoded).is_empty());
}

#[test]
fn test_unsupported_character_is_rejected() {
    let dir = scratch_dir("unsupported");
    let config = write_config(&dir, SMALL_CONFIG);
    let wav = dir.join("bad.wav");

    let output = run_tonelink(&[
        "--config",
        config.to_str().unwrap(),
        "encode",
        "caf\u{e9}",
        wav.to_str().unwrap(),
    ]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("has no frequency"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = scratch_dir("invalid");
    let config = write_config(&dir, r#"{ "full_fft_size": 3000 }"#);
    let output = run_tonelink(&["--config", config.to_str().unwrap(), "tables"]);
    assert!(!output.status.success());

    let unknown = write_config(&dir, r#"{ "fft": 1024 }"#);
    let output = run_tonelink(&["--config", unknown.to_str().unwrap(), "tables"]);
    assert!(!output.status.success());
}

#[test]
fn test_tables_lists_markers_and_characters() {
    let output = run_tonelink(&["tables"]);
    assert!(output.status.success());

    let text = stdout(&output);
    assert!(text.contains("INIT"));
    assert!(text.contains("1420.0 Hz"));
    assert!(text.contains("STOP"));
    assert!(text.contains("'~'"));
    // Tolerance line, two markers and 95 characters.
    assert_eq!(text.lines().count(), 1 + 2 + 95);
}
