//! Pipeline orchestrator: detect -> render -> heatmap for one video.
//!
//! Which stages run is decided up front from the artifacts on disk, so a
//! re-run resumes at the first missing artifact and a completed video is a
//! no-op. Progress is reported through the shared [`ProgressTracker`]:
//!
//! | step                  | percent  |
//! |-----------------------|----------|
//! | `generating_metadata` | 0..33    |
//! | `metadata_complete`   | 33       |
//! | `processing_video`    | 33..66   |
//! | `video_complete`      | 66       |
//! | `generating_heatmap`  | 66       |
//! | `completed`           | 100      |
//!
//! A failed run leaves `error: <message>` as its step.

use std::any::Any;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde::Serialize;

use crate::artifacts::{
    is_ready, partial_path, remove_if_exists, validate_video_name, write_atomic, ArtifactLayout,
    ArtifactPresence,
};
use crate::detect::{encode_records, parse_records, DetectionRecord, SharedDetector};
use crate::error::{PipelineError, PipelineResult};
use crate::heatmap::{build_heatmap, write_png, HeatmapSettings};
use crate::ingest::{midpoint_frame, VideoDecoder};
use crate::progress::{Admission, PipelineState, ProgressTracker};
use crate::render::{render_frames, Annotator, RenderSettings};
use crate::storage::{RecordUpdate, VideoRecord, VideoRecordStore};
use crate::transcode::{check_output, RawVideoFormat, Transcoder};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Detect,
    Render,
    Heatmap,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Detect, Stage::Render, Stage::Heatmap];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Detect => "detect",
            Stage::Render => "render",
            Stage::Heatmap => "heatmap",
        }
    }

    /// Percent reported when the stage starts and when it is done.
    pub fn progress_range(self) -> (u8, u8) {
        match self {
            Stage::Detect => (0, 33),
            Stage::Render => (33, 66),
            Stage::Heatmap => (66, 100),
        }
    }

    pub fn running_step(self) -> &'static str {
        match self {
            Stage::Detect => "generating_metadata",
            Stage::Render => "processing_video",
            Stage::Heatmap => "generating_heatmap",
        }
    }

    pub fn done_step(self) -> &'static str {
        match self {
            Stage::Detect => "metadata_complete",
            Stage::Render => "video_complete",
            Stage::Heatmap => "completed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageDecision {
    Skip,
    Run,
}

/// Per-stage decisions for one run, derived from artifact presence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagePlan {
    pub detect: StageDecision,
    pub render: StageDecision,
    pub heatmap: StageDecision,
}

impl StagePlan {
    pub fn from_presence(presence: &ArtifactPresence) -> Self {
        let decide = |ready: bool| {
            if ready {
                StageDecision::Skip
            } else {
                StageDecision::Run
            }
        };
        Self {
            detect: decide(presence.metadata),
            render: decide(presence.render),
            heatmap: decide(presence.heatmap),
        }
    }

    pub fn decision(&self, stage: Stage) -> StageDecision {
        match stage {
            Stage::Detect => self.detect,
            Stage::Render => self.render,
            Stage::Heatmap => self.heatmap,
        }
    }

    pub fn is_noop(&self) -> bool {
        Stage::ALL
            .iter()
            .all(|stage| self.decision(*stage) == StageDecision::Skip)
    }
}

/// Tunables that shape the artifacts.
#[derive(Clone, Debug, PartialEq)]
pub struct PipelineSettings {
    /// Detections at or below this confidence are not recorded.
    pub min_confidence: f32,
    pub heatmap: HeatmapSettings,
    pub render: RenderSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            min_confidence: 0.3,
            heatmap: HeatmapSettings::default(),
            render: RenderSettings::default(),
        }
    }
}

/// Status as served to pollers: tracker state, reported as completed
/// whenever every artifact is on disk, plus the public artifact paths once
/// complete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub state: PipelineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_video_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heatmap_path: Option<String>,
}

impl From<PipelineState> for StatusReport {
    fn from(state: PipelineState) -> Self {
        Self {
            state,
            processed_video_path: None,
            heatmap_path: None,
        }
    }
}

pub struct Pipeline {
    layout: ArtifactLayout,
    tracker: Arc<ProgressTracker>,
    store: Arc<dyn VideoRecordStore>,
    detector: SharedDetector,
    decoder: Arc<dyn VideoDecoder>,
    transcoder: Arc<dyn Transcoder>,
    annotator: Annotator,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        tracker: Arc<ProgressTracker>,
        store: Arc<dyn VideoRecordStore>,
        detector: SharedDetector,
        decoder: Arc<dyn VideoDecoder>,
        transcoder: Arc<dyn Transcoder>,
        settings: PipelineSettings,
    ) -> anyhow::Result<Self> {
        let annotator = Annotator::new(&settings.render)?;
        Ok(Self {
            layout: tracker.layout().clone(),
            tracker,
            store,
            detector,
            decoder,
            transcoder,
            annotator,
            settings,
        })
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn store(&self) -> &Arc<dyn VideoRecordStore> {
        &self.store
    }

    /// Status for pollers. Never fails.
    pub fn status(&self, video: &str) -> StatusReport {
        let state = self.tracker.get_progress(video);
        if state.artifacts.all_ready() {
            return StatusReport {
                state: PipelineState::completed(state.artifacts),
                processed_video_path: Some(self.layout.rendered_url(video)),
                heatmap_path: Some(self.layout.heatmap_url(video)),
            };
        }
        StatusReport::from(state)
    }

    /// Fire-and-poll entry point. Starts a background run unless the video
    /// is already complete or a run is in flight, and returns the state the
    /// caller should report. A completed video reports its artifact paths.
    pub fn trigger(self: &Arc<Self>, video: &str) -> PipelineResult<StatusReport> {
        self.check_input(video)?;
        if self.layout.presence(video).all_ready() {
            self.tracker.set_progress(video, 100, Stage::Heatmap.done_step());
            return Ok(self.status(video));
        }
        match self.tracker.try_begin(video) {
            Admission::InFlight(state) => {
                log::info!("{}: pipeline already running ({}%)", video, state.progress_percent);
                Ok(state.into())
            }
            Admission::Started(state) => {
                let pipeline = Arc::clone(self);
                let name = video.to_string();
                std::thread::spawn(move || match pipeline.run_pipeline(&name) {
                    Ok(_) => {}
                    Err(err @ PipelineError::Input { .. }) => {
                        log::error!("{}: {}", name, err);
                        pipeline.tracker.clear(&name);
                    }
                    Err(err) => log::error!("{}: pipeline failed: {}", name, err),
                });
                Ok(state.into())
            }
        }
    }

    /// Claim the video and run in the calling thread. Fails with
    /// `AlreadyRunning` when another run holds the claim.
    pub fn run_exclusive(&self, video: &str) -> PipelineResult<PipelineState> {
        self.check_input(video)?;
        match self.tracker.try_begin(video) {
            Admission::InFlight(_) => Err(PipelineError::AlreadyRunning(video.to_string())),
            Admission::Started(_) => self.run_pipeline(video),
        }
    }

    /// Drive `video` to completion, skipping stages whose artifact exists.
    ///
    /// Single-flight is the caller's job; see [`Pipeline::trigger`]. A panic
    /// in any stage is caught and reported as a failed run.
    pub fn run_pipeline(&self, video: &str) -> PipelineResult<PipelineState> {
        self.check_input(video)?;

        let plan = StagePlan::from_presence(&self.layout.presence(video));
        if plan.is_noop() {
            log::info!("{}: all artifacts present, nothing to do", video);
            return Ok(self.tracker.set_progress(video, 100, Stage::Heatmap.done_step()));
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.execute(video, plan)))
            .unwrap_or_else(|payload| Err(PipelineError::Panicked(panic_message(payload.as_ref()))));
        match outcome {
            Ok(state) => {
                log::info!("{}: pipeline completed", video);
                Ok(state)
            }
            Err(err) => {
                log::error!("{}: pipeline failed: {}", video, err);
                self.tracker.set_failed(video, &format!("error: {}", err));
                Err(err)
            }
        }
    }

    fn check_input(&self, video: &str) -> PipelineResult<()> {
        validate_video_name(video).map_err(|err| PipelineError::input(video, err.to_string()))?;
        let source = self.layout.source_path(video);
        if !is_ready(&source) {
            return Err(PipelineError::input(
                video,
                format!("source video {} is missing or empty", source.display()),
            ));
        }
        Ok(())
    }

    fn execute(&self, video: &str, plan: StagePlan) -> PipelineResult<PipelineState> {
        log::info!(
            "{}: plan detect={:?} render={:?} heatmap={:?}",
            video,
            plan.detect,
            plan.render,
            plan.heatmap
        );
        let record = self.existing_record(video);

        let records = match plan.detect {
            StageDecision::Run => self.run_detect(video)?,
            StageDecision::Skip => {
                log::info!("{}: metadata present, skipping detect", video);
                let (records, blob) = self.load_metadata(video)?;
                if record.as_ref().and_then(|r| r.metadata.as_ref()).is_none() {
                    self.persist(Stage::Detect, RecordUpdate::new(video).metadata(blob))?;
                }
                self.report_done(video, Stage::Detect);
                records
            }
        };

        match plan.render {
            StageDecision::Run => self.run_render(video, &records)?,
            StageDecision::Skip => {
                log::info!("{}: annotated video present, skipping render", video);
                if record.as_ref().and_then(|r| r.rendered_video_path.as_ref()).is_none() {
                    let update = RecordUpdate::new(video).rendered_video_path(self.layout.rendered_url(video));
                    self.persist(Stage::Render, update)?;
                }
                self.report_done(video, Stage::Render);
            }
        }

        match plan.heatmap {
            StageDecision::Run => self.run_heatmap(video, &records)?,
            StageDecision::Skip => {
                log::info!("{}: heatmap present, skipping heatmap", video);
                if record.as_ref().and_then(|r| r.heatmap_path.as_ref()).is_none() {
                    let update = RecordUpdate::new(video).heatmap_path(self.layout.heatmap_url(video));
                    self.persist(Stage::Heatmap, update)?;
                }
            }
        }

        let presence = self.layout.presence(video);
        if !presence.all_ready() {
            return Err(PipelineError::Incomplete {
                missing: presence.missing(),
            });
        }
        Ok(self.tracker.set_progress(video, 100, Stage::Heatmap.done_step()))
    }

    fn existing_record(&self, video: &str) -> Option<VideoRecord> {
        match self.store.get(video) {
            Ok(record) => record,
            Err(err) => {
                log::warn!("{}: could not read record, will rewrite: {:#}", video, err);
                None
            }
        }
    }

    fn run_detect(&self, video: &str) -> PipelineResult<Vec<DetectionRecord>> {
        let stage = Stage::Detect;
        self.report_start(video, stage);
        let path = self.layout.metadata_path(video);
        let result = self.detect_records(video).and_then(|records| {
            let blob = encode_records(&records).context("failed to encode detection records")?;
            write_atomic(&path, blob.as_bytes())?;
            Ok((records, blob))
        });
        let (records, blob) = result.map_err(|err| {
            remove_if_exists(&path);
            PipelineError::stage(stage, err)
        })?;
        log::info!("{}: {} frame(s) with detections", video, records.len());

        self.persist(stage, RecordUpdate::new(video).metadata(blob))?;
        self.report_done(video, stage);
        Ok(records)
    }

    fn detect_records(&self, video: &str) -> anyhow::Result<Vec<DetectionRecord>> {
        let mut source = self.decoder.open(&self.layout.source_path(video))?;
        let mut progress = StageProgress::new(&self.tracker, video, Stage::Detect, source.info().frame_count);
        let mut records = Vec::new();
        let mut index = 0u64;

        while let Some(frame) = source.next_frame()? {
            let raw = {
                // recover the lock from a backend that panicked on an earlier frame
                let mut detector = self
                    .detector
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                detector
                    .detect(&frame)
                    .with_context(|| format!("detection failed on frame {}", index))?
            };
            let objects: Vec<_> = raw
                .into_iter()
                .filter_map(|object| object.sanitized(frame.width(), frame.height()))
                .filter(|object| object.confidence > self.settings.min_confidence)
                .collect();
            if !objects.is_empty() {
                records.push(DetectionRecord::new(index, objects));
            }
            index += 1;
            progress.advance(index);
        }

        if index == 0 {
            return Err(anyhow!("no frames could be decoded"));
        }
        Ok(records)
    }

    fn load_metadata(&self, video: &str) -> PipelineResult<(Vec<DetectionRecord>, String)> {
        let path = self.layout.metadata_path(video);
        let blob = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))
            .map_err(|err| PipelineError::stage(Stage::Detect, err))?;
        let records = parse_records(&blob)
            .with_context(|| format!("corrupt metadata in {}", path.display()))
            .map_err(|err| PipelineError::stage(Stage::Detect, err))?;
        Ok((records, blob))
    }

    fn run_render(&self, video: &str, records: &[DetectionRecord]) -> PipelineResult<()> {
        let stage = Stage::Render;
        self.report_start(video, stage);
        let intermediate = self.layout.intermediate_path(video);
        let output = self.layout.rendered_path(video);
        // The final name only appears once the encoder has finished.
        let partial = partial_path(&output);

        let result = (|| -> anyhow::Result<()> {
            let mut source = self.decoder.open(&self.layout.source_path(video))?;
            let info = source.info().clone();
            let mut progress = StageProgress::new(&self.tracker, video, stage, info.frame_count);
            let summary = render_frames(
                source.as_mut(),
                records,
                &self.annotator,
                &intermediate,
                |done| progress.advance(done),
            )?;
            log::info!(
                "{}: rendered {} frame(s), {} annotated",
                video,
                summary.frames,
                summary.annotated_frames
            );
            let format = RawVideoFormat {
                width: info.width,
                height: info.height,
                fps: info.fps,
            };
            self.transcoder.transcode(&intermediate, format, &partial)?;
            check_output(&partial)?;
            fs::rename(&partial, &output)
                .with_context(|| format!("failed to move rendered video into {}", output.display()))
        })();

        remove_if_exists(&intermediate);
        if let Err(err) = result {
            remove_if_exists(&partial);
            remove_if_exists(&output);
            return Err(PipelineError::stage(stage, err));
        }

        let update = RecordUpdate::new(video).rendered_video_path(self.layout.rendered_url(video));
        self.persist(stage, update)?;
        self.report_done(video, stage);
        Ok(())
    }

    fn run_heatmap(&self, video: &str, records: &[DetectionRecord]) -> PipelineResult<()> {
        let stage = Stage::Heatmap;
        self.report_start(video, stage);
        let path = self.layout.heatmap_path(video);

        let background = midpoint_frame(self.decoder.as_ref(), &self.layout.source_path(video))
            .context("failed to read background frame")
            .map_err(|err| {
                remove_if_exists(&path);
                PipelineError::stage(stage, err)
            })?;
        let image = build_heatmap(video, records, &background, &self.settings.heatmap).map_err(|err| {
            remove_if_exists(&path);
            err
        })?;
        write_png(&image, &path).map_err(|err| PipelineError::stage(stage, err))?;

        let update = RecordUpdate::new(video).heatmap_path(self.layout.heatmap_url(video));
        self.persist(stage, update)
    }

    fn persist(&self, stage: Stage, update: RecordUpdate) -> PipelineResult<()> {
        self.store
            .upsert(&update)
            .map_err(|source| PipelineError::Store { stage, source })
    }

    fn report_start(&self, video: &str, stage: Stage) {
        log::info!("{}: {} stage started", video, stage);
        self.tracker
            .set_progress(video, stage.progress_range().0, stage.running_step());
    }

    fn report_done(&self, video: &str, stage: Stage) {
        self.tracker
            .set_progress(video, stage.progress_range().1, stage.done_step());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Per-frame progress within a stage's range. Only changes in the integer
/// percentage reach the tracker.
struct StageProgress<'a> {
    tracker: &'a ProgressTracker,
    video: &'a str,
    stage: Stage,
    total: Option<u64>,
    last: u8,
}

impl<'a> StageProgress<'a> {
    fn new(tracker: &'a ProgressTracker, video: &'a str, stage: Stage, total: Option<u64>) -> Self {
        Self {
            tracker,
            video,
            stage,
            total,
            last: stage.progress_range().0,
        }
    }

    fn advance(&mut self, done: u64) {
        let Some(total) = self.total.filter(|t| *t > 0) else {
            return;
        };
        let (lo, hi) = self.stage.progress_range();
        // the stage's upper bound is reported by its done step
        let span = u64::from(hi - lo);
        let percent = lo + (span * done.min(total) / total) as u8;
        let percent = percent.min(hi - 1);
        if percent > self.last {
            self.last = percent;
            self.tracker
                .set_progress(self.video, percent, self.stage.running_step());
        }
    }
}
