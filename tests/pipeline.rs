use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use tempfile::{tempdir, TempDir};

use vidheat::artifacts::partial_path;
use vidheat::detect::{encode_records, parse_records};
use vidheat::storage::RecordUpdate;
use vidheat::transcode::RawVideoFormat;
use vidheat::{
    ArtifactLayout, BoundingBox, DetectionRecord, DetectorBackend, FrameSource, InMemoryVideoStore, ObjectDetection,
    Pipeline, PipelineError, PipelineSettings, ProgressTracker, Stage, Status, StoreError,
    StubBackend, Transcoder, VideoDecoder, VideoInfo, VideoRecord, VideoRecordStore,
};

const WIDTH: u32 = 100;
const HEIGHT: u32 = 100;
const BACKGROUND: Rgb<u8> = Rgb([120, 120, 120]);
const GREEN: Rgb<u8> = Rgb([0, 255, 0]);

/// Blocks every `open` until released. Starts released unless built closed.
#[derive(Default)]
struct Gate {
    closed: Mutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn closed() -> Arc<Self> {
        Arc::new(Self {
            closed: Mutex::new(true),
            cv: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut closed = self.closed.lock().unwrap();
        while *closed {
            closed = self.cv.wait(closed).unwrap();
        }
    }

    fn release(&self) {
        *self.closed.lock().unwrap() = false;
        self.cv.notify_all();
    }
}

/// Observes tracker progress every time the fakes are touched.
#[derive(Clone)]
struct ProgressSampler {
    tracker: Arc<ProgressTracker>,
    video: String,
    seen: Arc<Mutex<Vec<u8>>>,
}

impl ProgressSampler {
    fn sample(&self) {
        let state = self.tracker.get_progress(&self.video);
        self.seen.lock().unwrap().push(state.progress_percent);
    }
}

/// Decodes `frames` uniform frames without touching the file.
struct FakeDecoder {
    frames: u64,
    report_count: bool,
    gate: Option<Arc<Gate>>,
    sampler: Mutex<Option<ProgressSampler>>,
    opens: AtomicUsize,
}

impl FakeDecoder {
    fn new(frames: u64) -> Self {
        Self {
            frames,
            report_count: true,
            gate: None,
            sampler: Mutex::new(None),
            opens: AtomicUsize::new(0),
        }
    }
}

struct FakeSource {
    info: VideoInfo,
    remaining: u64,
    sampler: Option<ProgressSampler>,
}

impl FrameSource for FakeSource {
    fn info(&self) -> &VideoInfo {
        &self.info
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if let Some(sampler) = &self.sampler {
            sampler.sample();
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(RgbImage::from_pixel(WIDTH, HEIGHT, BACKGROUND)))
    }
}

impl VideoDecoder for FakeDecoder {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn open(&self, _path: &Path) -> Result<Box<dyn FrameSource>> {
        if let Some(gate) = &self.gate {
            gate.wait();
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSource {
            info: VideoInfo {
                width: WIDTH,
                height: HEIGHT,
                fps: 30.0,
                frame_count: self.report_count.then_some(self.frames),
            },
            remaining: self.frames,
            sampler: self.sampler.lock().unwrap().clone(),
        }))
    }
}

/// Copies the raw intermediate to the output path.
#[derive(Default)]
struct CopyTranscoder {
    calls: AtomicUsize,
    fail: bool,
    crash: bool,
}

impl Transcoder for CopyTranscoder {
    fn transcode(&self, input: &Path, format: RawVideoFormat, output: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!((format.width, format.height), (WIDTH, HEIGHT));
        if self.fail {
            fs::write(output, b"partial")?;
            return Err(anyhow!("encoder exited with status 1"));
        }
        if self.crash {
            fs::write(output, b"truncated mp4 header")?;
            panic!("encoder crashed");
        }
        fs::copy(input, output)?;
        Ok(())
    }
}

/// Panics on the first frame it sees, then reports a car on every frame.
#[derive(Default)]
struct PanicOnceBackend {
    panicked: bool,
}

impl DetectorBackend for PanicOnceBackend {
    fn name(&self) -> &'static str {
        "panic-once"
    }

    fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<ObjectDetection>> {
        if !self.panicked {
            self.panicked = true;
            panic!("detector crashed");
        }
        Ok(vec![car()])
    }
}

/// Rejects every write.
struct FailingStore;

impl VideoRecordStore for FailingStore {
    fn upsert(&self, _update: &RecordUpdate) -> Result<(), StoreError> {
        Err(StoreError::Fatal(anyhow!("database is read-only")))
    }

    fn get(&self, _video_name: &str) -> Result<Option<VideoRecord>> {
        Ok(None)
    }

    fn list(&self) -> Result<Vec<VideoRecord>> {
        Ok(Vec::new())
    }
}

/// Deletes `victim` once the heatmap path is recorded, as if another
/// process cleaned the output directory mid-run.
struct VanishingStore {
    inner: InMemoryVideoStore,
    victim: std::path::PathBuf,
}

impl VideoRecordStore for VanishingStore {
    fn upsert(&self, update: &RecordUpdate) -> Result<(), StoreError> {
        self.inner.upsert(update)?;
        if update.heatmap_path.is_some() {
            let _ = fs::remove_file(&self.victim);
        }
        Ok(())
    }

    fn get(&self, video_name: &str) -> Result<Option<VideoRecord>> {
        self.inner.get(video_name)
    }

    fn list(&self) -> Result<Vec<VideoRecord>> {
        self.inner.list()
    }
}

struct Harness {
    _dir: TempDir,
    layout: ArtifactLayout,
    tracker: Arc<ProgressTracker>,
    store: Arc<InMemoryVideoStore>,
    decoder: Arc<FakeDecoder>,
    transcoder: Arc<CopyTranscoder>,
    detect_calls: Arc<AtomicU64>,
    pipeline: Arc<Pipeline>,
}

fn car() -> ObjectDetection {
    ObjectDetection::new("car", 0.9, BoundingBox::new(10, 10, 50, 50))
}

fn car_on_first_frame() -> HashMap<u64, Vec<ObjectDetection>> {
    HashMap::from([(0, vec![car()])])
}

fn harness_with(
    script: HashMap<u64, Vec<ObjectDetection>>,
    decoder: FakeDecoder,
    transcoder: CopyTranscoder,
    store: Option<Arc<dyn VideoRecordStore>>,
) -> Harness {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let layout = ArtifactLayout::new(root.join("videos"), root.join("metadata"), root.join("output"));
    layout.ensure_dirs().unwrap();
    fs::write(layout.source_path("sample.mp4"), b"not really an mp4").unwrap();

    let tracker = Arc::new(ProgressTracker::new(layout.clone()));
    let memory_store = Arc::new(InMemoryVideoStore::new());
    let store: Arc<dyn VideoRecordStore> = match store {
        Some(store) => store,
        None => memory_store.clone(),
    };
    let backend = StubBackend::with_script(script);
    let detect_calls = backend.call_counter();
    let decoder = Arc::new(decoder);
    let transcoder = Arc::new(transcoder);

    let pipeline = Pipeline::new(
        tracker.clone(),
        store,
        Arc::new(Mutex::new(backend)),
        decoder.clone(),
        transcoder.clone(),
        PipelineSettings::default(),
    )
    .unwrap();

    Harness {
        _dir: dir,
        layout,
        tracker,
        store: memory_store,
        decoder,
        transcoder,
        detect_calls,
        pipeline: Arc::new(pipeline),
    }
}

fn harness(script: HashMap<u64, Vec<ObjectDetection>>) -> Harness {
    harness_with(script, FakeDecoder::new(2), CopyTranscoder::default(), None)
}

fn pixel(raw: &[u8], frame: u64, x: u32, y: u32) -> Rgb<u8> {
    let offset = (frame as usize * (WIDTH * HEIGHT) as usize + (y * WIDTH + x) as usize) * 3;
    Rgb([raw[offset], raw[offset + 1], raw[offset + 2]])
}

fn wait_for_terminal(h: &Harness, video: &str) -> Status {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let state = h.tracker.get_progress(video);
        if state.is_terminal() {
            return state.status;
        }
        assert!(Instant::now() < deadline, "pipeline did not finish: {:?}", state);
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn sample_video_produces_all_artifacts() {
    let h = harness(car_on_first_frame());
    let state = h.pipeline.run_pipeline("sample.mp4").unwrap();

    assert_eq!(state.status, Status::Completed);
    assert_eq!(state.progress_percent, 100);
    assert_eq!(state.current_step, "completed");
    assert!(state.artifacts.all_ready());

    let blob = fs::read_to_string(h.layout.metadata_path("sample.mp4")).unwrap();
    let records = parse_records(&blob).unwrap();
    assert_eq!(records, vec![DetectionRecord::new(0, vec![car()])]);

    let rendered = fs::read(h.layout.rendered_path("sample.mp4")).unwrap();
    assert_eq!(rendered.len(), 2 * (WIDTH * HEIGHT * 3) as usize);
    assert_eq!(pixel(&rendered, 0, 10, 30), GREEN);
    assert_eq!(pixel(&rendered, 0, 30, 30), BACKGROUND);
    assert_eq!(pixel(&rendered, 1, 10, 30), BACKGROUND);
    assert!(!h.layout.intermediate_path("sample.mp4").exists());

    let heatmap = image::open(h.layout.heatmap_path("sample.mp4")).unwrap().to_rgb8();
    assert_eq!(heatmap.dimensions(), (WIDTH, HEIGHT));
    // Density peaks on the box center and is red-dominant there.
    let hot = heatmap.get_pixel(30, 30);
    assert!(hot[0] > hot[2], "center pixel {:?}", hot);
    // Far from the box: darkened background plus the palette's zero level.
    assert_eq!(heatmap.get_pixel(95, 95), &Rgb([36, 36, 126]));

    let record = h.store.get("sample.mp4").unwrap().unwrap();
    assert_eq!(record.metadata.as_deref(), Some(blob.as_str()));
    assert_eq!(
        record.rendered_video_path.as_deref(),
        Some(h.layout.rendered_url("sample.mp4").as_str())
    );
    assert_eq!(
        record.heatmap_path.as_deref(),
        Some(h.layout.heatmap_url("sample.mp4").as_str())
    );

    let report = h.pipeline.status("sample.mp4");
    assert_eq!(report.state.status, Status::Completed);
    assert_eq!(report.processed_video_path, Some(h.layout.rendered_url("sample.mp4")));
    assert_eq!(report.heatmap_path, Some(h.layout.heatmap_url("sample.mp4")));
}

#[test]
fn second_run_is_a_noop() {
    let h = harness(car_on_first_frame());
    h.pipeline.run_pipeline("sample.mp4").unwrap();
    let rendered = fs::read(h.layout.rendered_path("sample.mp4")).unwrap();
    let detect_calls = h.detect_calls.load(Ordering::SeqCst);
    let opens = h.decoder.opens.load(Ordering::SeqCst);

    let state = h.pipeline.run_pipeline("sample.mp4").unwrap();
    assert_eq!(state.status, Status::Completed);
    assert_eq!(state.progress_percent, 100);
    assert_eq!(h.detect_calls.load(Ordering::SeqCst), detect_calls);
    assert_eq!(h.decoder.opens.load(Ordering::SeqCst), opens);
    assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fs::read(h.layout.rendered_path("sample.mp4")).unwrap(), rendered);
}

#[test]
fn resumes_from_existing_metadata() {
    let h = harness(HashMap::new());
    let records = vec![DetectionRecord::new(1, vec![car()])];
    fs::write(
        h.layout.metadata_path("sample.mp4"),
        encode_records(&records).unwrap(),
    )
    .unwrap();

    let state = h.pipeline.run_pipeline("sample.mp4").unwrap();
    assert_eq!(state.status, Status::Completed);
    assert_eq!(h.detect_calls.load(Ordering::SeqCst), 0);

    // The existing records drive rendering: frame 1 is annotated, frame 0 is not.
    let rendered = fs::read(h.layout.rendered_path("sample.mp4")).unwrap();
    assert_eq!(pixel(&rendered, 0, 10, 30), BACKGROUND);
    assert_eq!(pixel(&rendered, 1, 10, 30), GREEN);

    // Skipped detect still lands its metadata in the store.
    let record = h.store.get("sample.mp4").unwrap().unwrap();
    assert!(record.metadata.is_some());
}

#[test]
fn only_missing_heatmap_is_regenerated() {
    let h = harness(car_on_first_frame());
    h.pipeline.run_pipeline("sample.mp4").unwrap();
    fs::remove_file(h.layout.heatmap_path("sample.mp4")).unwrap();
    let detect_calls = h.detect_calls.load(Ordering::SeqCst);

    let state = h.pipeline.run_pipeline("sample.mp4").unwrap();
    assert_eq!(state.status, Status::Completed);
    assert!(h.layout.heatmap_path("sample.mp4").is_file());
    assert_eq!(h.detect_calls.load(Ordering::SeqCst), detect_calls);
    assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn low_confidence_detections_are_dropped() {
    let script = HashMap::from([
        (
            0,
            vec![
                ObjectDetection::new("person", 0.3, BoundingBox::new(5, 5, 20, 20)),
                ObjectDetection::new("dog", 0.2, BoundingBox::new(5, 5, 20, 20)),
            ],
        ),
        (
            1,
            vec![
                ObjectDetection::new("bus", 0.31, BoundingBox::new(60, 60, 150, 150)),
                ObjectDetection::new("cat", 0.8, BoundingBox::new(10, 10, 10, 40)),
            ],
        ),
    ]);
    let h = harness(script);
    h.pipeline.run_pipeline("sample.mp4").unwrap();

    let blob = fs::read_to_string(h.layout.metadata_path("sample.mp4")).unwrap();
    let records = parse_records(&blob).unwrap();
    // Frame 0 keeps nothing and is not recorded; the bus box is clipped and
    // the zero-width cat is discarded.
    assert_eq!(
        records,
        vec![DetectionRecord::new(
            1,
            vec![ObjectDetection::new("bus", 0.31, BoundingBox::new(60, 60, 99, 99))]
        )]
    );
}

#[test]
fn progress_never_moves_backwards() {
    let h = harness(car_on_first_frame());
    let seen = Arc::new(Mutex::new(Vec::new()));
    *h.decoder.sampler.lock().unwrap() = Some(ProgressSampler {
        tracker: h.tracker.clone(),
        video: "sample.mp4".to_string(),
        seen: seen.clone(),
    });

    let state = h.pipeline.run_pipeline("sample.mp4").unwrap();
    let mut seen = seen.lock().unwrap().clone();
    seen.push(state.progress_percent);

    assert!(seen.len() > 3);
    assert!(
        seen.windows(2).all(|pair| pair[0] <= pair[1]),
        "progress went backwards: {:?}",
        seen
    );
    assert!(seen.iter().any(|p| (33..66).contains(p)));
    assert_eq!(seen.last(), Some(&100));
}

#[test]
fn no_detections_fail_at_heatmap() {
    let h = harness(HashMap::new());
    let err = h.pipeline.run_pipeline("sample.mp4").unwrap_err();
    assert!(matches!(err, PipelineError::NoData), "{:?}", err);

    assert!(h.layout.metadata_path("sample.mp4").is_file());
    assert!(h.layout.rendered_path("sample.mp4").is_file());
    assert!(!h.layout.heatmap_path("sample.mp4").exists());

    let state = h.tracker.get_progress("sample.mp4");
    assert_eq!(state.status, Status::Failed);
    assert!(state.current_step.starts_with("error: "), "{}", state.current_step);
    assert!(state.progress_percent >= 66);
    assert!(!state.artifacts.heatmap);
}

#[test]
fn transcoder_failure_removes_partial_output() {
    let transcoder = CopyTranscoder {
        fail: true,
        ..CopyTranscoder::default()
    };
    let h = harness_with(car_on_first_frame(), FakeDecoder::new(2), transcoder, None);

    let err = h.pipeline.run_pipeline("sample.mp4").unwrap_err();
    assert!(
        matches!(err, PipelineError::Stage { stage: Stage::Render, .. }),
        "{:?}",
        err
    );
    assert!(h.layout.metadata_path("sample.mp4").is_file());
    assert!(!h.layout.rendered_path("sample.mp4").exists());
    assert!(!partial_path(&h.layout.rendered_path("sample.mp4")).exists());
    assert!(!h.layout.intermediate_path("sample.mp4").exists());
    assert!(!h.layout.heatmap_path("sample.mp4").exists());
    assert_eq!(h.tracker.get_progress("sample.mp4").status, Status::Failed);
}

#[test]
fn crashed_transcode_is_rerendered_after_restart() {
    let transcoder = CopyTranscoder {
        crash: true,
        ..CopyTranscoder::default()
    };
    let h = harness_with(car_on_first_frame(), FakeDecoder::new(2), transcoder, None);

    let err = h.pipeline.run_pipeline("sample.mp4").unwrap_err();
    assert!(matches!(err, PipelineError::Panicked(_)), "{:?}", err);
    let rendered = h.layout.rendered_path("sample.mp4");
    assert!(!rendered.exists());
    assert!(!h.layout.presence("sample.mp4").render);
    assert_eq!(h.tracker.get_progress("sample.mp4").status, Status::Failed);

    // A fresh process over the same directories renders again.
    let transcoder = Arc::new(CopyTranscoder::default());
    let pipeline = Pipeline::new(
        Arc::new(ProgressTracker::new(h.layout.clone())),
        h.store.clone(),
        Arc::new(Mutex::new(StubBackend::with_script(car_on_first_frame()))),
        h.decoder.clone(),
        transcoder.clone(),
        PipelineSettings::default(),
    )
    .unwrap();
    let state = pipeline.run_pipeline("sample.mp4").unwrap();
    assert_eq!(state.status, Status::Completed);
    assert_eq!(transcoder.calls.load(Ordering::SeqCst), 1);
    let raw = fs::read(&rendered).unwrap();
    assert_eq!(raw.len(), 2 * (WIDTH * HEIGHT * 3) as usize);
    assert_eq!(pixel(&raw, 0, 10, 30), GREEN);
}

#[test]
fn panicking_detector_fails_the_run_and_allows_retry() {
    let h = harness(HashMap::new());
    let pipeline = Arc::new(
        Pipeline::new(
            h.tracker.clone(),
            h.store.clone(),
            Arc::new(Mutex::new(PanicOnceBackend::default())),
            h.decoder.clone(),
            h.transcoder.clone(),
            PipelineSettings::default(),
        )
        .unwrap(),
    );

    let report = pipeline.trigger("sample.mp4").unwrap();
    assert_eq!(report.state.status, Status::Processing);
    assert_eq!(wait_for_terminal(&h, "sample.mp4"), Status::Failed);
    let state = h.tracker.get_progress("sample.mp4");
    assert!(state.current_step.contains("detector crashed"), "{}", state.current_step);
    assert!(!h.layout.metadata_path("sample.mp4").exists());

    // The detector lock poisoned by the panic is recovered on retry.
    let report = pipeline.trigger("sample.mp4").unwrap();
    assert_eq!(report.state.status, Status::Processing);
    assert_eq!(wait_for_terminal(&h, "sample.mp4"), Status::Completed);
    assert!(h.layout.presence("sample.mp4").all_ready());
}

#[test]
fn store_failure_keeps_artifact_on_disk() {
    let h = harness_with(
        car_on_first_frame(),
        FakeDecoder::new(2),
        CopyTranscoder::default(),
        Some(Arc::new(FailingStore)),
    );

    let err = h.pipeline.run_pipeline("sample.mp4").unwrap_err();
    assert!(
        matches!(err, PipelineError::Store { stage: Stage::Detect, .. }),
        "{:?}",
        err
    );
    assert!(h.layout.metadata_path("sample.mp4").is_file());
    assert!(!h.layout.rendered_path("sample.mp4").exists());
    assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.tracker.get_progress("sample.mp4").status, Status::Failed);
}

#[test]
fn input_errors_leave_tracker_untouched() {
    let h = harness(car_on_first_frame());

    let err = h.pipeline.run_pipeline("missing.mp4").unwrap_err();
    assert!(matches!(err, PipelineError::Input { .. }), "{:?}", err);
    assert_eq!(h.tracker.get_progress("missing.mp4").status, Status::NotStarted);

    let err = h.pipeline.run_pipeline("../sample.mp4").unwrap_err();
    assert!(matches!(err, PipelineError::Input { .. }), "{:?}", err);

    fs::write(h.layout.source_path("empty.mp4"), b"").unwrap();
    let err = h.pipeline.trigger("empty.mp4").unwrap_err();
    assert!(matches!(err, PipelineError::Input { .. }), "{:?}", err);
    assert_eq!(h.tracker.get_progress("empty.mp4").status, Status::NotStarted);
    assert_eq!(h.detect_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn midpoint_is_found_without_frame_count() {
    let decoder = FakeDecoder {
        report_count: false,
        ..FakeDecoder::new(3)
    };
    let h = harness_with(car_on_first_frame(), decoder, CopyTranscoder::default(), None);
    let state = h.pipeline.run_pipeline("sample.mp4").unwrap();
    assert_eq!(state.status, Status::Completed);
}

#[test]
fn concurrent_triggers_start_one_run() {
    let gate = Gate::closed();
    let decoder = FakeDecoder {
        gate: Some(gate.clone()),
        ..FakeDecoder::new(2)
    };
    let h = harness_with(car_on_first_frame(), decoder, CopyTranscoder::default(), None);

    let states: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| h.pipeline.trigger("sample.mp4").unwrap()))
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });
    assert!(states.iter().all(|s| s.state.status == Status::Processing));

    // While the run is blocked, foreground runs are refused too.
    let err = h.pipeline.run_exclusive("sample.mp4").unwrap_err();
    assert!(matches!(err, PipelineError::AlreadyRunning(_)), "{:?}", err);

    gate.release();
    assert_eq!(wait_for_terminal(&h, "sample.mp4"), Status::Completed);
    assert_eq!(h.detect_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 1);

    // Triggering a completed video reports completion without a new run.
    let report = h.pipeline.trigger("sample.mp4").unwrap();
    assert_eq!(report.state.status, Status::Completed);
    assert_eq!(report.processed_video_path, Some(h.layout.rendered_url("sample.mp4")));
    assert_eq!(report.heatmap_path, Some(h.layout.heatmap_url("sample.mp4")));
    assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_run_can_be_retriggered() {
    let h = harness(HashMap::new());
    h.pipeline.run_pipeline("sample.mp4").unwrap_err();
    assert_eq!(h.tracker.get_progress("sample.mp4").status, Status::Failed);

    // The detections were genuinely empty, so the retry fails the same way,
    // but it is admitted and only the heatmap stage reruns.
    let report = h.pipeline.trigger("sample.mp4").unwrap();
    assert_eq!(report.state.status, Status::Processing);
    assert!(report.processed_video_path.is_none());
    assert_eq!(wait_for_terminal(&h, "sample.mp4"), Status::Failed);
    assert_eq!(h.transcoder.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn vanished_artifact_is_reported_incomplete() {
    let h = harness(HashMap::new());
    let store = Arc::new(VanishingStore {
        inner: InMemoryVideoStore::new(),
        victim: h.layout.rendered_path("sample.mp4"),
    });
    let pipeline = Pipeline::new(
        h.tracker.clone(),
        store,
        Arc::new(Mutex::new(StubBackend::with_script(car_on_first_frame()))),
        h.decoder.clone(),
        h.transcoder.clone(),
        PipelineSettings::default(),
    )
    .unwrap();

    match pipeline.run_pipeline("sample.mp4").unwrap_err() {
        PipelineError::Incomplete { missing } => assert_eq!(missing, vec!["video"]),
        other => panic!("unexpected {:?}", other),
    }
    let state = h.tracker.get_progress("sample.mp4");
    assert_eq!(state.status, Status::Failed);
    assert!(state.current_step.contains("missing artifacts: video"), "{}", state.current_step);
}
