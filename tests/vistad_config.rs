use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use vista_sentinel::config::{BackendChoice, VistaConfig};
use vista_sentinel::ModelKind;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VISTA_CONFIG",
        "VISTA_DB_PATH",
        "VISTA_API_ADDR",
        "VISTA_SOURCE_URL",
        "VISTA_SUBJECT",
        "VISTA_ALERT_SOUND",
        "VISTA_COOLDOWN_SECS",
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
fn defaults_match_reference_deployment() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = VistaConfig::load().expect("load defaults");

    assert_eq!(cfg.capture.width, 320);
    assert_eq!(cfg.capture.height, 240);
    assert_eq!(cfg.capture.target_fps, 30);
    assert_eq!(cfg.capture.buffer_frames, 1);
    assert_eq!(cfg.channel_capacity, 10);
    assert!((cfg.confidence_threshold - 0.40).abs() < f32::EPSILON);
    assert_eq!(cfg.cooldown, Duration::from_secs(600));
    assert_eq!(cfg.jpeg_quality, 80);
    let names: Vec<&str> = cfg.models.iter().map(|m| m.kind.name()).collect();
    assert_eq!(names, vec!["fire", "weapon"]);

    let registry = cfg.build_registry().expect("default registry");
    assert_eq!(registry.names(), vec!["fire", "weapon"]);

    clear_env();
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "db_path": "vista_prod.db",
            "api": { "addr": "0.0.0.0:9000", "default_subject": "night_shift" },
            "source": {
                "url": "http://192.168.1.20:4747/video",
                "width": 640,
                "height": 480,
                "target_fps": 15,
                "buffer_frames": 2
            },
            "pipeline": { "channel_capacity": 4, "confidence_threshold": 0.6, "jpeg_quality": 90 },
            "alert": { "cooldown_secs": 120, "player": ["aplay", "-q"] },
            "models": [
                { "name": "weapon", "backend": "stub", "color": [0, 0, 255] },
                { "name": "fire", "backend": "color" },
                { "name": "smoke", "backend": "tract", "path": "models/smoke.onnx", "classes": ["smoke"] }
            ]
        }"#,
    );

    std::env::set_var("VISTA_CONFIG", file.path());
    std::env::set_var("VISTA_SOURCE_URL", "stub://lobby");
    std::env::set_var("VISTA_SUBJECT", "alice");
    std::env::set_var("VISTA_COOLDOWN_SECS", "30");

    let cfg = VistaConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "vista_prod.db");
    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!(cfg.default_subject, "alice");
    assert_eq!(cfg.capture.url, "stub://lobby");
    assert_eq!(cfg.capture.width, 640);
    assert_eq!(cfg.capture.target_fps, 15);
    assert_eq!(cfg.capture.buffer_frames, 2);
    assert_eq!(cfg.channel_capacity, 4);
    assert_eq!(cfg.jpeg_quality, 90);
    assert_eq!(cfg.cooldown, Duration::from_secs(30));
    assert_eq!(cfg.alert_player, vec!["aplay", "-q"]);

    assert_eq!(cfg.models.len(), 3);
    assert_eq!(cfg.models[0].kind, ModelKind::Weapon);
    assert_eq!(cfg.models[0].color, Some([0, 0, 255]));
    assert_eq!(cfg.models[1].backend, BackendChoice::Color);
    assert_eq!(cfg.models[2].kind, ModelKind::Custom("smoke".to_string()));
    match &cfg.models[2].backend {
        BackendChoice::Tract {
            input_width,
            classes,
            ..
        } => {
            assert_eq!(*input_width, 640);
            assert_eq!(classes, &vec!["smoke".to_string()]);
        }
        other => panic!("expected tract backend, got {other:?}"),
    }

    clear_env();
}

#[test]
fn rejects_invalid_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    for json in [
        r#"{ "pipeline": { "confidence_threshold": 1.5 } }"#,
        r#"{ "pipeline": { "channel_capacity": 0 } }"#,
        r#"{ "models": [] }"#,
        r#"{ "models": [ { "name": "fire" }, { "name": "FIRE" } ] }"#,
        r#"{ "models": [ { "name": "fire", "backend": "magic" } ] }"#,
        r#"{ "api": { "addr": "not-an-addr" } }"#,
    ] {
        let file = write_config(json);
        std::env::set_var("VISTA_CONFIG", file.path());
        assert!(VistaConfig::load().is_err(), "accepted {json}");
    }

    clear_env();
    std::env::set_var("VISTA_COOLDOWN_SECS", "ten minutes");
    assert!(VistaConfig::load().is_err());

    clear_env();
}

#[test]
fn missing_alert_asset_falls_back_to_silence() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VISTA_ALERT_SOUND", "/nonexistent/alert.mp3");
    let cfg = VistaConfig::load().expect("load config");
    let sound = cfg.build_sound();
    sound.play().expect("silent play");
    sound.stop().expect("silent stop");

    clear_env();
}
