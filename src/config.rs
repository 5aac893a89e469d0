use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::artifacts::ArtifactLayout;
use crate::heatmap::HeatmapSettings;
use crate::pipeline::PipelineSettings;
use crate::render::RenderSettings;
use crate::retry::RetryPolicy;
use crate::transcode::EncoderSettings;

const DEFAULT_VIDEOS_DIR: &str = "videos_original";
const DEFAULT_OUTPUT_DIR: &str = "output_videos";
const DEFAULT_METADATA_DIR: &str = "metadata";
const DEFAULT_DB_PATH: &str = "metadata.db";
const DEFAULT_LIST_FILE: &str = "list_release2.0.txt";
const DEFAULT_API_ADDR: &str = "127.0.0.1:8000";
const DEFAULT_MODEL_PATH: &str = "models/yolov8n.onnx";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_MIN_CONFIDENCE: f32 = 0.3;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    paths: Option<PathsConfigFile>,
    api: Option<ApiConfigFile>,
    detector: Option<DetectorConfigFile>,
    tools: Option<ToolsConfigFile>,
    encoder: Option<EncoderSettings>,
    heatmap: Option<HeatmapConfigFile>,
    render: Option<RenderSettings>,
    store: Option<StoreConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct PathsConfigFile {
    videos_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    metadata_dir: Option<PathBuf>,
    db_path: Option<PathBuf>,
    list_file: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    min_confidence: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct ToolsConfigFile {
    ffmpeg: Option<PathBuf>,
    ffprobe: Option<PathBuf>,
    decoder: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct HeatmapConfigFile {
    darken: Option<f32>,
    floor: Option<u8>,
    overlay_weight: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct StoreConfigFile {
    retry_attempts: Option<u32>,
    retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub videos_dir: PathBuf,
    pub output_dir: PathBuf,
    pub metadata_dir: PathBuf,
    pub db_path: PathBuf,
    pub list_file: PathBuf,
    pub api_addr: String,
    pub detector: DetectorSettings,
    pub tools: ToolSettings,
    pub encoder: EncoderSettings,
    pub pipeline: PipelineSettings,
    pub store_retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Registered backend name; the registry default when unset.
    pub backend: Option<String>,
    pub model_path: PathBuf,
    pub input_size: u32,
}

#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// `ffprobe` (external binaries) or `ffmpeg-lib` (in-process).
    pub decoder: String,
}

impl PipelineConfig {
    /// Load from the file named by `VIDHEAT_CONFIG`, if any.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("VIDHEAT_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Load from an explicit file (or defaults), then apply env overrides.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn layout(&self) -> ArtifactLayout {
        ArtifactLayout::new(&self.videos_dir, &self.metadata_dir, &self.output_dir)
    }

    fn from_file(file: PipelineConfigFile) -> Self {
        let paths = file.paths.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let tools = file.tools.unwrap_or_default();
        let heatmap_file = file.heatmap.unwrap_or_default();
        let store = file.store.unwrap_or_default();

        let defaults = HeatmapSettings::default();
        let heatmap = HeatmapSettings {
            darken: heatmap_file.darken.unwrap_or(defaults.darken),
            floor: heatmap_file.floor.unwrap_or(defaults.floor),
            overlay_weight: heatmap_file.overlay_weight.unwrap_or(defaults.overlay_weight),
        };

        Self {
            videos_dir: paths
                .videos_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_VIDEOS_DIR)),
            output_dir: paths
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            metadata_dir: paths
                .metadata_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_METADATA_DIR)),
            db_path: paths
                .db_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            list_file: paths
                .list_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LIST_FILE)),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            detector: DetectorSettings {
                backend: detector.backend,
                model_path: detector
                    .model_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                input_size: detector.input_size.unwrap_or(DEFAULT_MODEL_INPUT),
            },
            tools: ToolSettings {
                ffmpeg: tools.ffmpeg.unwrap_or_else(|| PathBuf::from("ffmpeg")),
                ffprobe: tools.ffprobe.unwrap_or_else(|| PathBuf::from("ffprobe")),
                decoder: tools.decoder.unwrap_or_else(|| "ffprobe".to_string()),
            },
            encoder: file.encoder.unwrap_or_default(),
            pipeline: PipelineSettings {
                min_confidence: detector.min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE),
                heatmap,
                render: file.render.unwrap_or_default(),
            },
            store_retry: RetryPolicy {
                max_attempts: store.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS),
                delay: Duration::from_millis(store.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS)),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        for (key, target) in [
            ("VIDHEAT_VIDEOS_DIR", &mut self.videos_dir),
            ("VIDHEAT_OUTPUT_DIR", &mut self.output_dir),
            ("VIDHEAT_METADATA_DIR", &mut self.metadata_dir),
            ("VIDHEAT_DB_PATH", &mut self.db_path),
            ("VIDHEAT_MODEL_PATH", &mut self.detector.model_path),
            ("VIDHEAT_FFMPEG", &mut self.tools.ffmpeg),
            ("VIDHEAT_FFPROBE", &mut self.tools.ffprobe),
        ] {
            if let Ok(value) = std::env::var(key) {
                if !value.trim().is_empty() {
                    *target = PathBuf::from(value);
                }
            }
        }
        if let Ok(addr) = std::env::var("VIDHEAT_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api_addr = addr;
            }
        }
        if let Ok(confidence) = std::env::var("VIDHEAT_MIN_CONFIDENCE") {
            self.pipeline.min_confidence = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("VIDHEAT_MIN_CONFIDENCE must be a number"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for (name, dir) in [
            ("videos_dir", &self.videos_dir),
            ("output_dir", &self.output_dir),
            ("metadata_dir", &self.metadata_dir),
        ] {
            if dir.as_os_str().is_empty() {
                return Err(anyhow!("{} must not be empty", name));
            }
        }
        let confidence = self.pipeline.min_confidence;
        if !(0.0..1.0).contains(&confidence) {
            return Err(anyhow!("min_confidence must be in [0, 1), got {}", confidence));
        }
        let heatmap = &self.pipeline.heatmap;
        if !(heatmap.darken > 0.0 && heatmap.darken <= 1.0) {
            return Err(anyhow!("heatmap darken must be in (0, 1]"));
        }
        if !(heatmap.overlay_weight > 0.0 && heatmap.overlay_weight <= 1.0) {
            return Err(anyhow!("heatmap overlay_weight must be in (0, 1]"));
        }
        if self.store_retry.max_attempts == 0 {
            return Err(anyhow!("store retry_attempts must be at least 1"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector input_size must be greater than zero"));
        }
        match self.tools.decoder.as_str() {
            "ffprobe" | "ffmpeg-lib" => {}
            other => return Err(anyhow!("unknown decoder '{}'", other)),
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<PipelineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
