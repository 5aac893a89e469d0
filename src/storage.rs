use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;

use crate::artifacts::{is_ready, ArtifactLayout};
use crate::error::StoreError;
use crate::now_s;
use crate::retry::{RetryError, RetryPolicy};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One persisted row per video.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VideoRecord {
    pub video_name: String,
    pub metadata: Option<String>,
    pub rendered_video_path: Option<String>,
    pub heatmap_path: Option<String>,
    pub created_at: i64,
}

/// Partial write: `Some` fields overwrite, `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordUpdate {
    pub video_name: String,
    pub metadata: Option<String>,
    pub rendered_video_path: Option<String>,
    pub heatmap_path: Option<String>,
}

impl RecordUpdate {
    pub fn new(video_name: impl Into<String>) -> Self {
        Self {
            video_name: video_name.into(),
            ..Self::default()
        }
    }

    pub fn metadata(mut self, blob: impl Into<String>) -> Self {
        self.metadata = Some(blob.into());
        self
    }

    pub fn rendered_video_path(mut self, path: impl Into<String>) -> Self {
        self.rendered_video_path = Some(path.into());
        self
    }

    pub fn heatmap_path(mut self, path: impl Into<String>) -> Self {
        self.heatmap_path = Some(path.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_none() && self.rendered_video_path.is_none() && self.heatmap_path.is_none()
    }
}

/// Persistent key-value record store, one row per video.
///
/// Implementations own their retry discipline; callers see success or a
/// `StoreError` once the budget is spent.
pub trait VideoRecordStore: Send + Sync {
    fn upsert(&self, update: &RecordUpdate) -> Result<(), StoreError>;

    fn get(&self, video_name: &str) -> Result<Option<VideoRecord>>;

    fn list(&self) -> Result<Vec<VideoRecord>>;
}

/// SQLite-backed store. A connection is opened per call so several
/// processes can share the database file; contention surfaces as
/// `SQLITE_BUSY`/`SQLITE_LOCKED` and is retried.
pub struct SqliteVideoStore {
    db_path: PathBuf,
    retry: RetryPolicy,
    busy_timeout: Duration,
}

impl SqliteVideoStore {
    pub fn open(db_path: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self> {
        let store = Self {
            db_path: db_path.into(),
            retry,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        };
        let conn = store.connect()?;
        ensure_schema(&conn)?;
        Ok(store)
    }

    /// How long sqlite itself waits on a lock before reporting busy.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection> {
        Connection::open(&self.db_path)
            .with_context(|| format!("failed to open record store {}", self.db_path.display()))
    }

    fn upsert_once(&self, update: &RecordUpdate, created_at: i64) -> rusqlite::Result<()> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy_timeout)?;
        conn.execute(
            r#"
            INSERT INTO metadata(video_name, metadata, processed_video_path, heatmap_path, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(video_name) DO UPDATE SET
              metadata = COALESCE(excluded.metadata, metadata),
              processed_video_path = COALESCE(excluded.processed_video_path, processed_video_path),
              heatmap_path = COALESCE(excluded.heatmap_path, heatmap_path)
            "#,
            params![
                update.video_name,
                update.metadata,
                update.rendered_video_path,
                update.heatmap_path,
                created_at
            ],
        )?;
        Ok(())
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS metadata (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          video_name TEXT NOT NULL UNIQUE,
          metadata TEXT,
          processed_video_path TEXT,
          heatmap_path TEXT,
          created_at INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<VideoRecord> {
    Ok(VideoRecord {
        video_name: row.get(0)?,
        metadata: row.get(1)?,
        rendered_video_path: row.get(2)?,
        heatmap_path: row.get(3)?,
        created_at: row.get(4)?,
    })
}

const SELECT_COLUMNS: &str =
    "SELECT video_name, metadata, processed_video_path, heatmap_path, created_at FROM metadata";

impl VideoRecordStore for SqliteVideoStore {
    fn upsert(&self, update: &RecordUpdate) -> Result<(), StoreError> {
        let created_at = now_s().map_err(StoreError::Fatal)? as i64;
        let operation = format!("upsert of '{}'", update.video_name);
        self.retry
            .run(&operation, is_transient, || self.upsert_once(update, created_at))
            .map_err(|err| match err {
                RetryError::Exhausted { attempts, last } => StoreError::Exhausted {
                    attempts,
                    source: last,
                },
                RetryError::Aborted(err) => StoreError::Fatal(
                    anyhow::Error::new(err).context(format!("{} rejected", operation)),
                ),
            })
    }

    fn get(&self, video_name: &str) -> Result<Option<VideoRecord>> {
        let conn = self.connect()?;
        let record = conn
            .query_row(
                &format!("{} WHERE video_name = ?1", SELECT_COLUMNS),
                params![video_name],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    fn list(&self) -> Result<Vec<VideoRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY video_name ASC", SELECT_COLUMNS))?;
        let rows = stmt.query_map([], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// Process-local store for tests and dry runs.
pub struct InMemoryVideoStore {
    rows: Mutex<BTreeMap<String, VideoRecord>>,
}

impl InMemoryVideoStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryVideoStore {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoRecordStore for InMemoryVideoStore {
    fn upsert(&self, update: &RecordUpdate) -> Result<(), StoreError> {
        let created_at = now_s().map_err(StoreError::Fatal)? as i64;
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| StoreError::Fatal(anyhow!("record store lock poisoned")))?;
        let row = rows
            .entry(update.video_name.clone())
            .or_insert_with(|| VideoRecord {
                video_name: update.video_name.clone(),
                metadata: None,
                rendered_video_path: None,
                heatmap_path: None,
                created_at,
            });
        if let Some(metadata) = &update.metadata {
            row.metadata = Some(metadata.clone());
        }
        if let Some(path) = &update.rendered_video_path {
            row.rendered_video_path = Some(path.clone());
        }
        if let Some(path) = &update.heatmap_path {
            row.heatmap_path = Some(path.clone());
        }
        Ok(())
    }

    fn get(&self, video_name: &str) -> Result<Option<VideoRecord>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| anyhow!("record store lock poisoned"))?;
        Ok(rows.get(video_name).cloned())
    }

    fn list(&self) -> Result<Vec<VideoRecord>> {
        let rows = self
            .rows
            .lock()
            .map_err(|_| anyhow!("record store lock poisoned"))?;
        Ok(rows.values().cloned().collect())
    }
}

/// Record update describing whatever artifacts of `video` exist on disk.
/// Returns `None` when there is nothing to persist.
pub fn update_from_disk(layout: &ArtifactLayout, video: &str) -> Result<Option<RecordUpdate>> {
    let mut update = RecordUpdate::new(video);
    let metadata_path = layout.metadata_path(video);
    if is_ready(&metadata_path) {
        let blob = fs::read_to_string(&metadata_path)
            .with_context(|| format!("failed to read {}", metadata_path.display()))?;
        update = update.metadata(blob);
    }
    if is_ready(&layout.rendered_path(video)) {
        update = update.rendered_video_path(layout.rendered_url(video));
    }
    if is_ready(&layout.heatmap_path(video)) {
        update = update.heatmap_path(layout.heatmap_url(video));
    }
    Ok(if update.is_empty() { None } else { Some(update) })
}

/// Bring the store in line with artifacts already on disk, for every `.mp4`
/// in the videos directory that has a rendered video or a heatmap. Returns
/// the number of rows written.
pub fn sync_with_artifacts(store: &dyn VideoRecordStore, layout: &ArtifactLayout) -> Result<usize> {
    let entries = match fs::read_dir(&layout.videos_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to list {}", layout.videos_dir.display()))
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".mp4"))
        .collect();
    names.sort();

    let mut synced = 0;
    for name in names {
        let presence = layout.presence(&name);
        if !presence.render && !presence.heatmap {
            continue;
        }
        if let Some(update) = update_from_disk(layout, &name)? {
            store
                .upsert(&update)
                .with_context(|| format!("failed to sync record for {}", name))?;
            synced += 1;
        }
    }
    if synced > 0 {
        log::info!("synchronised {} record(s) with artifacts on disk", synced);
    }
    Ok(synced)
}
