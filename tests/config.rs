use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use vidheat::config::PipelineConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VIDHEAT_CONFIG",
        "VIDHEAT_VIDEOS_DIR",
        "VIDHEAT_OUTPUT_DIR",
        "VIDHEAT_METADATA_DIR",
        "VIDHEAT_DB_PATH",
        "VIDHEAT_MODEL_PATH",
        "VIDHEAT_FFMPEG",
        "VIDHEAT_FFPROBE",
        "VIDHEAT_API_ADDR",
        "VIDHEAT_MIN_CONFIDENCE",
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
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = PipelineConfig::load().expect("load defaults");
    assert_eq!(cfg.videos_dir, PathBuf::from("videos_original"));
    assert_eq!(cfg.output_dir, PathBuf::from("output_videos"));
    assert_eq!(cfg.metadata_dir, PathBuf::from("metadata"));
    assert_eq!(cfg.db_path, PathBuf::from("metadata.db"));
    assert_eq!(cfg.api_addr, "127.0.0.1:8000");
    assert_eq!(cfg.pipeline.min_confidence, 0.3);
    assert_eq!(cfg.store_retry.max_attempts, 3);
    assert_eq!(cfg.store_retry.delay, Duration::from_secs(1));
    assert_eq!(cfg.tools.decoder, "ffprobe");
    assert_eq!(cfg.encoder.codec, "libx264");
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "paths": {
                "videos_dir": "/data/videos",
                "output_dir": "/data/out",
                "metadata_dir": "/data/meta",
                "db_path": "/data/records.db",
                "list_file": "/data/list.txt"
            },
            "api": { "addr": "0.0.0.0:9000" },
            "detector": { "backend": "stub", "input_size": 320, "min_confidence": 0.5 },
            "tools": { "ffmpeg": "/opt/ffmpeg/bin/ffmpeg" },
            "encoder": { "preset": "veryfast", "crf": 23 },
            "heatmap": { "floor": 40 },
            "render": { "thickness": 3 },
            "store": { "retry_attempts": 5, "retry_delay_ms": 250 }
        }"#,
    );

    std::env::set_var("VIDHEAT_CONFIG", file.path());
    std::env::set_var("VIDHEAT_OUTPUT_DIR", "/srv/out");
    std::env::set_var("VIDHEAT_MIN_CONFIDENCE", "0.6");

    let cfg = PipelineConfig::load().expect("load config");

    assert_eq!(cfg.videos_dir, PathBuf::from("/data/videos"));
    assert_eq!(cfg.output_dir, PathBuf::from("/srv/out"));
    assert_eq!(cfg.metadata_dir, PathBuf::from("/data/meta"));
    assert_eq!(cfg.db_path, PathBuf::from("/data/records.db"));
    assert_eq!(cfg.list_file, PathBuf::from("/data/list.txt"));
    assert_eq!(cfg.api_addr, "0.0.0.0:9000");
    assert_eq!(cfg.detector.backend.as_deref(), Some("stub"));
    assert_eq!(cfg.detector.input_size, 320);
    assert_eq!(cfg.pipeline.min_confidence, 0.6);
    assert_eq!(cfg.tools.ffmpeg, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
    assert_eq!(cfg.tools.ffprobe, PathBuf::from("ffprobe"));
    assert_eq!(cfg.encoder.preset, "veryfast");
    assert_eq!(cfg.encoder.crf, 23);
    assert_eq!(cfg.encoder.codec, "libx264");
    assert_eq!(cfg.pipeline.heatmap.floor, 40);
    assert_eq!(cfg.pipeline.heatmap.darken, 0.3);
    assert_eq!(cfg.pipeline.render.thickness, 3);
    assert_eq!(cfg.store_retry.max_attempts, 5);
    assert_eq!(cfg.store_retry.delay, Duration::from_millis(250));

    let layout = cfg.layout();
    assert_eq!(layout.metadata_path("clip.mp4"), PathBuf::from("/data/meta/clip.json"));

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIDHEAT_MIN_CONFIDENCE", "high");
    assert!(PipelineConfig::load().is_err());
    std::env::set_var("VIDHEAT_MIN_CONFIDENCE", "1.5");
    assert!(PipelineConfig::load().is_err());
    clear_env();

    let file = write_config(r#"{ "store": { "retry_attempts": 0 } }"#);
    std::env::set_var("VIDHEAT_CONFIG", file.path());
    assert!(PipelineConfig::load().is_err());

    let file = write_config(r#"{ "tools": { "decoder": "gstreamer" } }"#);
    std::env::set_var("VIDHEAT_CONFIG", file.path());
    assert!(PipelineConfig::load().is_err());

    let file = write_config("not json");
    std::env::set_var("VIDHEAT_CONFIG", file.path());
    assert!(PipelineConfig::load().is_err());

    clear_env();
}
