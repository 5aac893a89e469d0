//! Artifact naming and readiness checks.
//!
//! Every artifact path is derived from the video name, so readiness can be
//! recomputed from disk at any time. Presence means "exists and is non-empty";
//! stat errors count as absent.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

const PUBLIC_OUTPUT_PREFIX: &str = "/output_videos";

/// Directory layout for sources and derived artifacts.
#[derive(Clone, Debug)]
pub struct ArtifactLayout {
    pub videos_dir: PathBuf,
    pub metadata_dir: PathBuf,
    pub output_dir: PathBuf,
}

/// Readiness of the three derived artifacts of one video.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPresence {
    #[serde(rename = "metadata_ready")]
    pub metadata: bool,
    #[serde(rename = "video_ready")]
    pub render: bool,
    #[serde(rename = "heatmap_ready")]
    pub heatmap: bool,
}

impl ArtifactPresence {
    pub fn all_ready(&self) -> bool {
        self.metadata && self.render && self.heatmap
    }

    /// Names of the artifacts that are still missing.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.metadata {
            missing.push("metadata");
        }
        if !self.render {
            missing.push("video");
        }
        if !self.heatmap {
            missing.push("heatmap");
        }
        missing
    }
}

impl ArtifactLayout {
    pub fn new(
        videos_dir: impl Into<PathBuf>,
        metadata_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            videos_dir: videos_dir.into(),
            metadata_dir: metadata_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    /// Create the artifact directories if they do not exist yet.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.videos_dir, &self.metadata_dir, &self.output_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn source_path(&self, video: &str) -> PathBuf {
        self.videos_dir.join(video)
    }

    pub fn metadata_path(&self, video: &str) -> PathBuf {
        self.metadata_dir.join(format!("{}.json", stem(video)))
    }

    pub fn rendered_path(&self, video: &str) -> PathBuf {
        self.output_dir.join(format!("processed_{}", video))
    }

    /// Uncompressed frames written before the transcoder runs.
    pub fn intermediate_path(&self, video: &str) -> PathBuf {
        self.output_dir
            .join(format!("processed_{}_temp.rgb", stem(video)))
    }

    pub fn heatmap_path(&self, video: &str) -> PathBuf {
        self.output_dir.join(format!("heatmap_{}.png", stem(video)))
    }

    /// Public URL of the annotated video, as stored in the record store.
    pub fn rendered_url(&self, video: &str) -> String {
        format!("{}/processed_{}", PUBLIC_OUTPUT_PREFIX, video)
    }

    /// Public URL of the heatmap, as stored in the record store.
    pub fn heatmap_url(&self, video: &str) -> String {
        format!("{}/heatmap_{}.png", PUBLIC_OUTPUT_PREFIX, stem(video))
    }

    /// Stat-check all three artifacts. Never fails.
    pub fn presence(&self, video: &str) -> ArtifactPresence {
        ArtifactPresence {
            metadata: is_ready(&self.metadata_path(video)),
            render: is_ready(&self.rendered_path(video)),
            heatmap: is_ready(&self.heatmap_path(video)),
        }
    }
}

/// File name without its last extension (`clip.mp4` -> `clip`).
pub fn stem(video: &str) -> &str {
    match video.rsplit_once('.') {
        Some((base, _)) if !base.is_empty() => base,
        _ => video,
    }
}

/// Exists and has non-zero size.
pub fn is_ready(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Reject names that could escape the videos directory.
pub fn validate_video_name(video: &str) -> Result<()> {
    // Compile once for hot paths.
    static NAME_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = NAME_RE.get_or_init(|| {
        regex::Regex::new(r"^[A-Za-z0-9._-]{1,255}$").expect("video name pattern compiles")
    });
    if video == "." || video == ".." || !re.is_match(video) {
        return Err(anyhow!("video name must match ^[A-Za-z0-9._-]{{1,255}}$"));
    }
    Ok(())
}

/// Write `bytes` next to `path` and rename into place, so readers never see
/// a partially written artifact.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = partial_path(path);
    let result = (|| -> Result<()> {
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to move artifact into {}", path.display()))?;
        Ok(())
    })();
    if result.is_err() {
        remove_if_exists(&tmp);
    }
    result
}

/// Sibling path used while an artifact is being written.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

/// Best-effort removal; missing files are fine.
pub fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => log::debug!("removed {}", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => log::warn!("failed to remove {}: {}", path.display(), err),
    }
}
