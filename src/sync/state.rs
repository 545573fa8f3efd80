//! Durable watermark store for per-stream sync positions.
//!
//! Each change stream (genres and persons driving the movies index, plus the
//! standalone genre and person document streams) tracks the `updated_at`
//! boundary below which all changes are considered delivered. The store is a
//! flat JSON map of stream name → RFC 3339 timestamp, written atomically by
//! a single process.
//!
//! # Commit Discipline
//!
//! Watermarks discovered during detection are held as [`PendingWatermarks`]
//! and committed only after the corresponding index delivery succeeded. A
//! crash between delivery and commit causes the same rows to be redetected
//! and redelivered on the next run; delivery is a keyed upsert, so this
//! converges to the same index state instead of losing data.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// An independently tracked change feed with its own watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    /// Genre changes cascading into the movies index.
    Genres,
    /// Person changes cascading into the movies index.
    Persons,
    /// Genre changes feeding the dedicated genres index.
    GenreDocs,
    /// Person changes feeding the dedicated persons index.
    PersonDocs,
}

impl Stream {
    /// Key under which this stream's position is persisted.
    pub fn key(self) -> &'static str {
        match self {
            Stream::Genres => "genres",
            Stream::Persons => "persons",
            Stream::GenreDocs => "genre_docs",
            Stream::PersonDocs => "person_docs",
        }
    }
}

/// The position every stream starts from when no watermark exists yet.
///
/// An absent watermark means "process from the epoch", i.e. a full backfill.
/// The value is bound as a SQL timestamp parameter on the first pass, so it
/// must be representable server-side; the Unix epoch predates every catalog
/// modification time and sits comfortably inside the accepted range.
pub fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Watermark positions discovered during a detection cycle, not yet durable.
///
/// Returned by the change detector and passed explicitly to the commit step,
/// making the pending/commit relationship a data dependency rather than
/// hidden shared state.
#[derive(Debug, Clone, Default)]
pub struct PendingWatermarks(Vec<(Stream, DateTime<Utc>)>);

impl PendingWatermarks {
    /// Create an empty pending set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a candidate position for a stream.
    pub fn push(&mut self, stream: Stream, position: DateTime<Utc>) {
        self.0.push((stream, position));
    }

    /// Whether any positions are pending.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the pending `(stream, position)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = &(Stream, DateTime<Utc>)> {
        self.0.iter()
    }
}

/// Durable key/value store of per-stream watermark positions.
///
/// Writes go through a temp file in the same directory followed by a rename,
/// so a crash mid-write never leaves a partially visible state file. This
/// assumes a single active writer; multi-process coordination is out of
/// scope.
pub struct WatermarkStore {
    path: Option<PathBuf>,
    positions: HashMap<String, DateTime<Utc>>,
}

impl WatermarkStore {
    /// Open the store at `path`, loading existing positions if the file
    /// exists. A missing file is an empty store (full backfill).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let positions = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let map: HashMap<String, String> = serde_json::from_str(&raw)?;
            let mut positions = HashMap::with_capacity(map.len());
            for (stream, value) in map {
                let parsed = DateTime::parse_from_rfc3339(&value).map_err(|e| {
                    Error::State(format!("bad watermark for stream {stream}: {e}"))
                })?;
                positions.insert(stream, parsed.with_timezone(&Utc));
            }
            positions
        } else {
            HashMap::new()
        };

        tracing::info!(
            "Watermark store opened at {} ({} streams tracked)",
            path.display(),
            positions.len()
        );

        Ok(Self {
            path: Some(path),
            positions,
        })
    }

    /// Create a store with no backing file. Used in tests.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            positions: HashMap::new(),
        }
    }

    /// The committed position for a stream, if any.
    pub fn get(&self, stream: Stream) -> Option<DateTime<Utc>> {
        self.positions.get(stream.key()).copied()
    }

    /// The committed position for a stream, falling back to the epoch.
    pub fn position(&self, stream: Stream) -> DateTime<Utc> {
        self.get(stream).unwrap_or_else(epoch)
    }

    /// Commit pending positions and persist the whole mapping.
    ///
    /// Positions are monotonically non-decreasing per stream: a pending value
    /// older than the committed one is ignored. Call this only after the
    /// delivery that produced `pending` has been acknowledged.
    pub fn commit(&mut self, pending: &PendingWatermarks) -> Result<()> {
        let mut changed = false;
        for (stream, position) in pending.iter() {
            let entry = self
                .positions
                .entry(stream.key().to_string())
                .or_insert(*position);
            if *position >= *entry {
                *entry = *position;
                changed = true;
            } else {
                tracing::warn!(
                    "Ignoring non-monotonic watermark for {}: {} < {}",
                    stream.key(),
                    position,
                    entry
                );
            }
        }

        if changed {
            self.persist()?;
        }
        Ok(())
    }

    /// Write the current mapping to disk atomically.
    fn persist(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let map: HashMap<&str, String> = self
            .positions
            .iter()
            .map(|(stream, position)| (stream.as_str(), position.to_rfc3339()))
            .collect();
        let raw = serde_json::to_string_pretty(&map)?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(raw.as_bytes())?;
        tmp.persist(path)
            .map_err(|e| Error::State(format!("failed to persist watermark file: {e}")))?;
        Ok(())
    }
}
