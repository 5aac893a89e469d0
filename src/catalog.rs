//! Read-only queries over source videos and metadata artifacts.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::artifacts::ArtifactLayout;
use crate::detect::{parse_records, BoundingBox, DetectionRecord};

/// Frame rate assumed when converting frame indices to timestamps.
pub const DEFAULT_TIMESTAMP_FPS: f64 = 30.0;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LabelHit {
    pub coordinates: BoundingBox,
    pub confidence: f32,
}

/// Frame of one video holding at least one object with the searched label.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LabelMatch {
    pub video: String,
    pub frame: u64,
    pub objects: Vec<LabelHit>,
}

impl LabelMatch {
    fn best_confidence(&self) -> f32 {
        self.objects
            .iter()
            .map(|o| o.confidence)
            .fold(f32::MIN, f32::max)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Occurrence {
    pub frame: u64,
    pub confidence: f32,
    /// Seconds from the start of the video.
    pub timestamp: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ObjectSummary {
    pub label: String,
    pub occurrences: Vec<Occurrence>,
}

pub struct Catalog {
    layout: ArtifactLayout,
    list_file: PathBuf,
    timestamp_fps: f64,
}

impl Catalog {
    pub fn new(layout: ArtifactLayout, list_file: impl Into<PathBuf>) -> Self {
        Self {
            layout,
            list_file: list_file.into(),
            timestamp_fps: DEFAULT_TIMESTAMP_FPS,
        }
    }

    /// Entries of the list file whose `<entry>.mp4` exists in the videos
    /// directory. A missing list file yields no videos.
    pub fn available_videos(&self) -> Result<Vec<String>> {
        let raw = match fs::read_to_string(&self.list_file) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("video list {} not found", self.list_file.display());
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", self.list_file.display()))
            }
        };
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| format!("{}.mp4", entry))
            .filter(|name| self.layout.source_path(name).is_file())
            .collect())
    }

    /// Detection records of `video`, or `None` when no metadata exists.
    pub fn metadata(&self, video: &str) -> Result<Option<Vec<DetectionRecord>>> {
        let path = self.layout.metadata_path(video);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
        };
        let records =
            parse_records(&raw).with_context(|| format!("corrupt metadata in {}", path.display()))?;
        Ok(Some(records))
    }

    /// Case-insensitive label search across every metadata file, best
    /// confidence first.
    pub fn search_label(&self, label: &str) -> Result<Vec<LabelMatch>> {
        let wanted = label.to_lowercase();
        let mut files: Vec<PathBuf> = match fs::read_dir(&self.layout.metadata_dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
                .collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("failed to list {}", self.layout.metadata_dir.display())
                })
            }
        };
        files.sort();

        let mut results = Vec::new();
        for path in files {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let records = parse_records(&raw)
                .with_context(|| format!("corrupt metadata in {}", path.display()))?;
            let video = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            for record in records {
                let objects: Vec<LabelHit> = record
                    .objects
                    .iter()
                    .filter(|o| o.label.to_lowercase() == wanted)
                    .map(|o| LabelHit {
                        coordinates: o.bbox,
                        confidence: o.confidence,
                    })
                    .collect();
                if !objects.is_empty() {
                    results.push(LabelMatch {
                        video: video.clone(),
                        frame: record.frame_index,
                        objects,
                    });
                }
            }
        }
        results.sort_by(|a, b| b.best_confidence().total_cmp(&a.best_confidence()));
        Ok(results)
    }

    /// Distinct labels in `video` in order of first appearance, each with
    /// its occurrences by frame. `None` when no metadata exists.
    pub fn unique_objects(&self, video: &str) -> Result<Option<Vec<ObjectSummary>>> {
        let Some(records) = self.metadata(video)? else {
            return Ok(None);
        };
        let mut summaries: Vec<ObjectSummary> = Vec::new();
        for record in &records {
            for object in &record.objects {
                let occurrence = Occurrence {
                    frame: record.frame_index,
                    confidence: object.confidence,
                    timestamp: record.frame_index as f64 / self.timestamp_fps,
                };
                match summaries.iter_mut().find(|s| s.label == object.label) {
                    Some(summary) => summary.occurrences.push(occurrence),
                    None => summaries.push(ObjectSummary {
                        label: object.label.clone(),
                        occurrences: vec![occurrence],
                    }),
                }
            }
        }
        for summary in &mut summaries {
            summary.occurrences.sort_by_key(|o| o.frame);
        }
        Ok(Some(summaries))
    }
}
