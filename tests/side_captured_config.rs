use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use side_capture::config::DaemonConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SIDE_CAPTURE_CONFIG",
        "SIDE_CAPTURE_CAMERA",
        "SIDE_CAPTURE_IMAGES_DIR",
        "SIDE_CAPTURE_DISPLAY_ADDR",
        "SIDE_CAPTURE_DISPLAY_URL",
        "SIDE_CAPTURE_MOVEMENT_THRESHOLD",
        "SIDE_CAPTURE_SIMILARITY_THRESHOLD",
        "SIDE_CAPTURE_IMAGES_PER_OBJECT",
        "SIDE_CAPTURE_SIDE_TIMEOUT_SECS",
        "SIDE_CAPTURE_INACTIVITY_TIMEOUT_SECS",
        "SIDE_CAPTURE_RECONNECT_INTERVAL_MS",
        "SIDE_CAPTURE_CLEAR_OUTPUT_DIR",
        "SIDE_CAPTURE_AUTOSTART",
        "SIDE_CAPTURE_RETAKE_KEY",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "camera": "dir:///srv/recordings/bench",
            "movement_threshold": 800,
            "similarity_threshold": 0.5,
            "images_per_object": 4,
            "side_timeout_secs": 20,
            "settle_delay_ms": 750,
            "images_dir": "/srv/images",
            "display_url": "ws://display.local:5000/ws",
            "reconnect_interval_ms": 2000,
            "retake_key": "r",
            "jpeg_quality": 90
        }"#,
    );

    std::env::set_var("SIDE_CAPTURE_CONFIG", file.path());
    std::env::set_var("SIDE_CAPTURE_IMAGES_PER_OBJECT", "3");
    std::env::set_var("SIDE_CAPTURE_AUTOSTART", "true");

    let cfg = DaemonConfig::load().expect("load config");
    assert_eq!(cfg.camera.url, "dir:///srv/recordings/bench");
    assert_eq!(cfg.capture.detector.movement_threshold, 800);
    assert_eq!(cfg.capture.detector.similarity_threshold, 0.5);
    assert_eq!(cfg.capture.images_per_object, 3);
    assert_eq!(cfg.capture.side_timeout, Duration::from_secs(20));
    assert_eq!(cfg.capture.settle_delay, Duration::from_millis(750));
    assert_eq!(cfg.capture.inactivity_timeout, Duration::from_secs(10));
    assert_eq!(cfg.output.images_dir.to_str(), Some("/srv/images"));
    assert_eq!(cfg.output.jpeg_quality, 90);
    assert_eq!(cfg.display.url, "ws://display.local:5000/ws");
    assert_eq!(cfg.display.addr, "127.0.0.1:5000");
    assert_eq!(cfg.display.reconnect_interval, Some(Duration::from_secs(2)));
    assert_eq!(cfg.retake_key, 'r');
    assert!(cfg.autostart);

    clear_env();
}

#[test]
fn invalid_values_are_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{"images_per_object": 0}"#);
    std::env::set_var("SIDE_CAPTURE_CONFIG", file.path());
    assert!(DaemonConfig::load().is_err());

    let file = write_config(r#"{"similarity_threshold": 1.2}"#);
    std::env::set_var("SIDE_CAPTURE_CONFIG", file.path());
    assert!(DaemonConfig::load().is_err());

    clear_env();
    std::env::set_var("SIDE_CAPTURE_SIDE_TIMEOUT_SECS", "soon");
    assert!(DaemonConfig::load().is_err());

    clear_env();
    std::env::set_var("SIDE_CAPTURE_CONFIG", "/nonexistent/side_capture.json");
    assert!(DaemonConfig::load().is_err());

    clear_env();
}

#[test]
fn defaults_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = DaemonConfig::load().expect("defaults load");
    assert_eq!(cfg.camera.url, "stub://staging");
    assert_eq!(cfg.capture.poll_interval, Duration::from_millis(200));
    assert_eq!(cfg.capture.next_side_delay, Duration::from_millis(1000));
    assert_eq!(cfg.display.url, "ws://127.0.0.1:5000/ws");
    assert!(!cfg.output.clear);
}
