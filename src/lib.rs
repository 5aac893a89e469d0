//! vidheat
//!
//! Detection pipeline for local video files. For every source video the
//! pipeline produces three artifacts:
//!
//! 1. **Metadata**: per-frame object detections as a JSON document.
//! 2. **Annotated video**: the source re-encoded with boxes and captions.
//! 3. **Heatmap**: detection density over the video's midpoint frame.
//!
//! Stages are skipped when their artifact already exists, so re-running a
//! video resumes where the last run stopped. Each finished stage is recorded
//! in a SQLite store keyed by video name, and progress is published through
//! an in-memory tracker polled over the HTTP API.
//!
//! # Module Structure
//!
//! - `pipeline`: stage planning and orchestration
//! - `detect`: detector backends and the detection data model
//! - `ingest`: frame decoding for local files
//! - `render` / `transcode`: annotated video production
//! - `heatmap`: density accumulation and colour mapping
//! - `progress`: per-video status tracking with single-flight admission
//! - `storage`: record store with retried upserts
//! - `catalog`: read-only queries over metadata artifacts
//! - `api`: blocking HTTP surface

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod artifacts;
pub mod catalog;
pub mod config;
pub mod detect;
pub mod error;
pub mod heatmap;
pub mod ingest;
pub mod pipeline;
pub mod progress;
pub mod render;
pub mod retry;
pub mod storage;
pub mod transcode;

pub use artifacts::{ArtifactLayout, ArtifactPresence};
pub use catalog::Catalog;
pub use config::{DetectorSettings, PipelineConfig, ToolSettings};
pub use detect::{
    BackendRegistry, BoundingBox, DetectionRecord, DetectorBackend, ObjectDetection, SharedDetector,
    StubBackend,
};
pub use error::{PipelineError, PipelineResult, StoreError};
pub use ingest::{FfprobeDecoder, FrameSource, VideoDecoder, VideoInfo};
pub use pipeline::{Pipeline, PipelineSettings, Stage, StatusReport};
pub use progress::{PipelineState, ProgressTracker, Status};
pub use retry::RetryPolicy;
pub use storage::{InMemoryVideoStore, SqliteVideoStore, VideoRecord, VideoRecordStore};
pub use transcode::{FfmpegTranscoder, Transcoder};

/// Register the detector backends available in this build.
///
/// The ONNX backend is registered first, and so becomes the default, when
/// the crate is built with `backend-tract` and the model file exists. The
/// stub backend is always available.
pub fn build_registry(settings: &DetectorSettings) -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();

    #[cfg(feature = "backend-tract")]
    {
        if settings.model_path.is_file() {
            let backend = detect::TractBackend::new(&settings.model_path, settings.input_size)?;
            registry.register(backend);
        } else {
            log::warn!(
                "model {} not found, onnx backend unavailable",
                settings.model_path.display()
            );
        }
    }

    registry.register(StubBackend::new());
    if let Some(name) = settings.backend.as_deref() {
        registry.set_default(name)?;
    }
    Ok(registry)
}

/// Decoder selected by `tools.decoder`.
pub fn build_decoder(tools: &ToolSettings) -> Result<Arc<dyn VideoDecoder>> {
    match tools.decoder.as_str() {
        "ffprobe" => Ok(Arc::new(FfprobeDecoder::new(&tools.ffprobe, &tools.ffmpeg))),
        #[cfg(feature = "ingest-file-ffmpeg")]
        "ffmpeg-lib" => Ok(Arc::new(ingest::FfmpegLibDecoder::new())),
        #[cfg(not(feature = "ingest-file-ffmpeg"))]
        "ffmpeg-lib" => Err(anyhow!(
            "decoder 'ffmpeg-lib' requires the ingest-file-ffmpeg feature"
        )),
        other => Err(anyhow!("unknown decoder '{}'", other)),
    }
}

/// Wire a pipeline from configuration: record store, detector, decoder and
/// encoder.
pub fn build_pipeline(cfg: &PipelineConfig) -> Result<Arc<Pipeline>> {
    let layout = cfg.layout();
    layout.ensure_dirs()?;

    let store = SqliteVideoStore::open(&cfg.db_path, cfg.store_retry.clone())?;
    storage::sync_with_artifacts(&store, &layout)?;

    let registry = build_registry(&cfg.detector)?;
    log::info!("detector backends: {}", registry.list().join(", "));
    let detector = registry.select(cfg.detector.backend.as_deref())?;

    let pipeline = Pipeline::new(
        Arc::new(ProgressTracker::new(layout)),
        Arc::new(store),
        detector,
        build_decoder(&cfg.tools)?,
        Arc::new(FfmpegTranscoder::new(&cfg.tools.ffmpeg, cfg.encoder.clone())),
        cfg.pipeline.clone(),
    )?;
    Ok(Arc::new(pipeline))
}

/// Seconds since the Unix epoch.
pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| anyhow!("system clock before unix epoch"))?
        .as_secs())
}
