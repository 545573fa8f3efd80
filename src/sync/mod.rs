//! Sync orchestration: the per-stream detect → transform → deliver → advance
//! loop.
//!
//! Each entity stream is driven to exhaustion before the next one starts;
//! there is no interleaving within a run. Stream order: filmworks (driven by
//! the genre and person watermarks), then genres, then persons.
//!
//! ```text
//! Detecting ──(non-empty)──► Transforming ──► Delivering ──► Advancing ─┐
//!     ▲                                                                 │
//!     └─────────────────────────────────────────────────────────────────┘
//!     └──(empty page)──► Exhausted (next stream)
//! ```
//!
//! # Crash Safety
//!
//! The watermark commit happens strictly after the delivery that produced
//! the pending positions succeeded. A crash in between causes the next run
//! to redetect and redeliver the same rows; delivery is a keyed upsert, so
//! the index converges instead of losing data.

pub mod state;

pub use state::{epoch, PendingWatermarks, Stream, WatermarkStore};

use crate::pipeline::transform::{
    build_filmwork_documents, build_genre_documents, build_person_documents,
};
use crate::pipeline::{DirectorPrecedence, DocumentSink};
use crate::retry::RetryPolicy;
use crate::source::{CatalogSource, ChangeDetector, DEFAULT_PAGE_SIZE};
use crate::Result;
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Attempts per index before [`SyncOrchestrator::ensure_indices`] gives up.
const INDEX_CREATION_ATTEMPTS: u32 = 5;

/// Configuration for the sync orchestrator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum primary-table rows detected per cycle.
    pub page_size: i64,

    /// Target index names.
    pub movies_index: String,
    pub genres_index: String,
    pub persons_index: String,

    /// Which credit wins when a film has several director credits.
    pub director_precedence: DirectorPrecedence,

    /// Pause between polling passes in [`SyncOrchestrator::run_periodic`].
    pub interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            movies_index: "movies".to_string(),
            genres_index: "genres".to_string(),
            persons_index: "persons".to_string(),
            director_precedence: DirectorPrecedence::default(),
            interval: Duration::from_secs(60),
        }
    }
}

/// Statistics from a single polling pass.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    /// Movie documents delivered.
    pub filmwork_documents: usize,

    /// Genre documents delivered.
    pub genre_documents: usize,

    /// Person documents delivered.
    pub person_documents: usize,

    /// Detection cycles that produced work (across all streams).
    pub cycles: usize,

    /// Duration of the pass.
    pub duration: Duration,
}

/// Drives the sync loop over a catalog source and a document sink.
pub struct SyncOrchestrator<S, K> {
    source: S,
    sink: K,
    store: WatermarkStore,
    config: SyncConfig,
    retry: RetryPolicy,
    running: Arc<AtomicBool>,
}

impl<S: CatalogSource, K: DocumentSink> SyncOrchestrator<S, K> {
    /// Create a new orchestrator with the default retry policy.
    pub fn new(source: S, sink: K, store: WatermarkStore, config: SyncConfig) -> Self {
        Self {
            source,
            sink,
            store,
            config,
            retry: RetryPolicy::default(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Committed watermark positions.
    pub fn store(&self) -> &WatermarkStore {
        &self.store
    }

    /// Handle that stops a running [`SyncOrchestrator::run_periodic`] loop.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Signal the periodic loop to stop after the current pass.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Create all target indices, retrying transient failures.
    ///
    /// Runs once at startup, so retries are bounded: a search cluster that
    /// stays broken through every attempt surfaces as an error instead of
    /// blocking the daemon forever before its first pass.
    pub async fn ensure_indices(&self) -> Result<()> {
        let indices = [
            (self.config.movies_index.as_str(), crate::pipeline::movies_mapping()),
            (self.config.genres_index.as_str(), crate::pipeline::genres_mapping()),
            (self.config.persons_index.as_str(), crate::pipeline::persons_mapping()),
        ];
        for (index, mapping) in &indices {
            self.retry
                .run_bounded("index creation", INDEX_CREATION_ATTEMPTS, || {
                    self.sink.ensure_index(index, mapping)
                })
                .await?;
        }
        Ok(())
    }

    /// Run one full polling pass: every stream to exhaustion, in order.
    pub async fn run_once(&mut self) -> Result<RunStats> {
        let start = Instant::now();
        let mut stats = RunStats::default();

        self.sync_filmworks(&mut stats).await?;
        self.sync_genres(&mut stats).await?;
        self.sync_persons(&mut stats).await?;

        stats.duration = start.elapsed();

        counter!("sync_passes_total").increment(1);
        counter!("documents_delivered_total").increment(
            (stats.filmwork_documents + stats.genre_documents + stats.person_documents) as u64,
        );
        histogram!("sync_pass_duration_seconds").record(stats.duration.as_secs_f64());

        Ok(stats)
    }

    /// Run polling passes until stopped.
    ///
    /// Waits `config.interval` between passes, checking the stop flag at
    /// one-second granularity so shutdown is prompt.
    pub async fn run_periodic(&mut self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            "Starting periodic sync (interval: {}s, page size: {})",
            self.config.interval.as_secs(),
            self.config.page_size
        );

        while self.running.load(Ordering::SeqCst) {
            match self.run_once().await {
                Ok(stats) => {
                    if stats.cycles > 0 {
                        tracing::info!(
                            "Sync pass complete: {} movies, {} genres, {} persons in {:?}",
                            stats.filmwork_documents,
                            stats.genre_documents,
                            stats.person_documents,
                            stats.duration
                        );
                    } else {
                        tracing::debug!("Sync pass complete: no changes");
                    }
                    gauge!("last_sync_unix").set(chrono::Utc::now().timestamp() as f64);
                }
                Err(e) => {
                    tracing::error!("Sync pass failed: {}", e);
                    counter!("sync_errors_total").increment(1);
                }
            }

            let interval = self.config.interval;
            let waited = Instant::now();
            while waited.elapsed() < interval && self.running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }

        tracing::info!("Periodic sync stopped");
        Ok(())
    }

    /// Drive the filmwork stream to exhaustion.
    async fn sync_filmworks(&mut self, stats: &mut RunStats) -> Result<()> {
        loop {
            let detector = ChangeDetector::new(&self.source, self.config.page_size);
            let genres_since = self.store.position(Stream::Genres);
            let persons_since = self.store.position(Stream::Persons);

            let Some(changes) = detector.detect_filmworks(genres_since, persons_since).await?
            else {
                break;
            };

            let documents = build_filmwork_documents(
                &changes.filmworks,
                &changes.credits,
                self.config.director_precedence,
            );
            stats.filmwork_documents += self
                .deliver(&self.config.movies_index, &documents)
                .await?;

            // Delivery acknowledged; only now may the watermarks advance.
            self.store.commit(&changes.pending)?;
            stats.cycles += 1;
        }
        Ok(())
    }

    /// Drive the standalone genre stream to exhaustion.
    async fn sync_genres(&mut self, stats: &mut RunStats) -> Result<()> {
        loop {
            let detector = ChangeDetector::new(&self.source, self.config.page_size);
            let since = self.store.position(Stream::GenreDocs);

            let Some(changes) = detector.detect_genres(since).await? else {
                break;
            };

            let documents = build_genre_documents(&changes.rows);
            stats.genre_documents += self
                .deliver(&self.config.genres_index, &documents)
                .await?;

            self.store.commit(&changes.pending)?;
            stats.cycles += 1;
        }
        Ok(())
    }

    /// Drive the standalone person stream to exhaustion.
    async fn sync_persons(&mut self, stats: &mut RunStats) -> Result<()> {
        loop {
            let detector = ChangeDetector::new(&self.source, self.config.page_size);
            let since = self.store.position(Stream::PersonDocs);

            let Some(changes) = detector.detect_persons(since).await? else {
                break;
            };

            let documents = build_person_documents(&changes.rows);
            stats.person_documents += self
                .deliver(&self.config.persons_index, &documents)
                .await?;

            self.store.commit(&changes.pending)?;
            stats.cycles += 1;
        }
        Ok(())
    }

    /// Serialize and deliver a batch, retrying transient failures.
    ///
    /// A batch may legitimately be empty (a primary page whose cascade
    /// produced nothing); delivery is skipped but the caller still commits.
    async fn deliver<T: Serialize>(&self, index: &str, documents: &[T]) -> Result<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        let payload = documents
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<Value>, _>>()?;

        let delivered = self
            .retry
            .run("batch delivery", || self.sink.deliver(index, &payload))
            .await;
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::testing::{FilmworkRecord, GenreRecord, MemoryCatalog, PersonRecord};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    /// In-memory sink: keyed upsert semantics, optional injected failures.
    #[derive(Default)]
    struct MemorySink {
        documents: Mutex<HashMap<(String, String), Value>>,
        deliveries: AtomicU32,
        fail_next: AtomicU32,
        fail_index: AtomicU32,
    }

    impl MemorySink {
        fn fail_next_deliveries(&self, n: u32) {
            self.fail_next.store(n, Ordering::SeqCst);
        }

        fn fail_index_creations(&self, n: u32) {
            self.fail_index.store(n, Ordering::SeqCst);
        }

        fn snapshot(&self) -> HashMap<(String, String), Value> {
            self.documents.lock().unwrap().clone()
        }

        fn ids_in(&self, index: &str) -> Vec<String> {
            let mut ids: Vec<String> = self
                .documents
                .lock()
                .unwrap()
                .keys()
                .filter(|(idx, _)| idx == index)
                .map(|(_, id)| id.clone())
                .collect();
            ids.sort();
            ids
        }
    }

    #[async_trait]
    impl DocumentSink for MemorySink {
        async fn ensure_index(&self, _index: &str, _mapping: &Value) -> Result<()> {
            if self.fail_index.load(Ordering::SeqCst) > 0 {
                self.fail_index.fetch_sub(1, Ordering::SeqCst);
                return Err(crate::Error::Index("injected failure".to_string()));
            }
            Ok(())
        }

        async fn deliver(&self, index: &str, documents: &[Value]) -> Result<usize> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(crate::Error::Index("injected failure".to_string()));
            }
            let mut store = self.documents.lock().unwrap();
            for document in documents {
                let id = document["id"].as_str().expect("document id").to_string();
                store.insert((index.to_string(), id), document.clone());
            }
            self.deliveries.fetch_add(1, Ordering::SeqCst);
            Ok(documents.len())
        }
    }

    /// Catalog with one genre on film F, one person credited on film G.
    fn cascade_catalog() -> (MemoryCatalog, Uuid, Uuid) {
        let genre = Uuid::new_v4();
        let person = Uuid::new_v4();
        let film_f = Uuid::new_v4();
        let film_g = Uuid::new_v4();

        let catalog = MemoryCatalog {
            genres: vec![GenreRecord {
                id: genre,
                name: "Drama".to_string(),
                description: None,
                updated_at: ts(100),
            }],
            persons: vec![PersonRecord {
                id: person,
                full_name: "Ada Writer".to_string(),
                updated_at: ts(200),
            }],
            filmworks: vec![
                FilmworkRecord {
                    id: film_f,
                    title: "Film F".to_string(),
                    description: None,
                    rating: Some(8.0),
                    updated_at: ts(50),
                },
                FilmworkRecord {
                    id: film_g,
                    title: "Film G".to_string(),
                    description: None,
                    rating: None,
                    updated_at: ts(60),
                },
            ],
            film_genres: vec![(film_f, genre)],
            film_credits: vec![(film_g, person, "writer".to_string())],
        };
        (catalog, film_f, film_g)
    }

    fn orchestrator(
        catalog: MemoryCatalog,
        sink: &MemorySink,
    ) -> SyncOrchestrator<MemoryCatalog, &MemorySink> {
        SyncOrchestrator::new(
            catalog,
            sink,
            WatermarkStore::in_memory(),
            SyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_empty_catalog_terminates_without_delivery() {
        let sink = MemorySink::default();
        let mut orchestrator = orchestrator(MemoryCatalog::default(), &sink);

        let stats = orchestrator.run_once().await.unwrap();

        assert_eq!(stats.cycles, 0);
        assert_eq!(sink.deliveries.load(Ordering::SeqCst), 0);
        assert_eq!(orchestrator.store().get(Stream::Genres), None);
        assert_eq!(orchestrator.store().get(Stream::GenreDocs), None);
    }

    #[tokio::test]
    async fn test_cascade_delivers_exactly_affected_films() {
        let (catalog, film_f, film_g) = cascade_catalog();
        let sink = MemorySink::default();
        let mut orchestrator = orchestrator(catalog, &sink);

        orchestrator.run_once().await.unwrap();

        let mut expected = vec![film_f.to_string(), film_g.to_string()];
        expected.sort();
        assert_eq!(sink.ids_in("movies"), expected);
    }

    #[tokio::test]
    async fn test_watermarks_commit_after_delivery() {
        let (catalog, _, _) = cascade_catalog();
        let sink = MemorySink::default();
        let mut orchestrator = orchestrator(catalog, &sink);

        orchestrator.run_once().await.unwrap();

        assert_eq!(orchestrator.store().get(Stream::Genres), Some(ts(100)));
        assert_eq!(orchestrator.store().get(Stream::Persons), Some(ts(200)));
        assert_eq!(orchestrator.store().get(Stream::GenreDocs), Some(ts(100)));
        assert_eq!(orchestrator.store().get(Stream::PersonDocs), Some(ts(200)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_failure_is_retried_before_commit() {
        let (catalog, _, _) = cascade_catalog();
        let sink = MemorySink::default();
        sink.fail_next_deliveries(2);
        let mut orchestrator = orchestrator(catalog, &sink).with_retry(RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..Default::default()
        });

        orchestrator.run_once().await.unwrap();

        // The batch eventually landed and the watermark advanced exactly once.
        assert_eq!(sink.ids_in("movies").len(), 2);
        assert_eq!(orchestrator.store().get(Stream::Genres), Some(ts(100)));
    }

    #[tokio::test]
    async fn test_crash_before_commit_redelivers_and_converges() {
        let (catalog, _, _) = cascade_catalog();
        let sink = MemorySink::default();

        // First run delivers but "crashes" before commit: simulate by running
        // with a throwaway store.
        let mut first = orchestrator(catalog.clone(), &sink);
        first.run_once().await.unwrap();
        let state_after_first = sink.snapshot();

        // Restart from the old (empty) watermarks against the same index.
        let mut second = orchestrator(catalog, &sink);
        second.run_once().await.unwrap();

        // Redelivery is an upsert: identical final index state.
        assert_eq!(sink.snapshot(), state_after_first);
    }

    #[tokio::test]
    async fn test_second_pass_is_a_no_op() {
        let (catalog, _, _) = cascade_catalog();
        let sink = MemorySink::default();
        let mut orchestrator = orchestrator(catalog, &sink);

        orchestrator.run_once().await.unwrap();
        let deliveries_after_first = sink.deliveries.load(Ordering::SeqCst);

        let stats = orchestrator.run_once().await.unwrap();
        assert_eq!(stats.cycles, 0);
        assert_eq!(sink.deliveries.load(Ordering::SeqCst), deliveries_after_first);
    }

    #[tokio::test]
    async fn test_watermark_is_monotonic_across_passes() {
        let (mut catalog, _, _) = cascade_catalog();
        let sink = MemorySink::default();

        let mut orchestrator = orchestrator(catalog.clone(), &sink);
        orchestrator.run_once().await.unwrap();
        let first = orchestrator.store().get(Stream::GenreDocs).unwrap();

        // A later update arrives; the next pass must move forward, never back.
        catalog.genres.push(GenreRecord {
            id: Uuid::new_v4(),
            name: "Comedy".to_string(),
            description: None,
            updated_at: ts(500),
        });
        // Swap in the updated catalog, keeping the committed store.
        orchestrator.source = catalog;
        orchestrator.run_once().await.unwrap();
        let second = orchestrator.store().get(Stream::GenreDocs).unwrap();

        assert!(second > first);
        assert_eq!(second, ts(500));
    }

    #[tokio::test]
    async fn test_backfill_pages_through_large_table() {
        let mut catalog = MemoryCatalog::default();
        for i in 0..250 {
            catalog.genres.push(GenreRecord {
                id: Uuid::new_v4(),
                name: format!("Genre {i}"),
                description: None,
                updated_at: ts(1000 + i),
            });
        }
        let sink = MemorySink::default();
        let mut orchestrator = orchestrator(catalog, &sink);

        let stats = orchestrator.run_once().await.unwrap();

        // 250 rows in pages of 100: three genre-stream cycles, all delivered,
        // final watermark at the last row.
        assert_eq!(stats.genre_documents, 250);
        assert_eq!(sink.ids_in("genres").len(), 250);
        assert_eq!(orchestrator.store().get(Stream::GenreDocs), Some(ts(1249)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_indices_recovers_from_transient_failure() {
        let sink = MemorySink::default();
        sink.fail_index_creations(2);
        let orchestrator = orchestrator(MemoryCatalog::default(), &sink);

        orchestrator.ensure_indices().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_indices_surfaces_persistent_failure() {
        let sink = MemorySink::default();
        sink.fail_index_creations(u32::MAX);
        let orchestrator = orchestrator(MemoryCatalog::default(), &sink);

        let result = orchestrator.ensure_indices().await;
        assert!(matches!(
            result,
            Err(crate::Error::RetriesExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn test_person_roles_survive_a_small_page_size() {
        let person = Uuid::new_v4();
        let film = Uuid::new_v4();
        let catalog = MemoryCatalog {
            persons: vec![PersonRecord {
                id: person,
                full_name: "Busy Person".to_string(),
                updated_at: ts(10),
            }],
            filmworks: vec![FilmworkRecord {
                id: film,
                title: "Solo Project".to_string(),
                description: None,
                rating: None,
                updated_at: ts(5),
            }],
            film_credits: vec![
                (film, person, "actor".to_string()),
                (film, person, "writer".to_string()),
                (film, person, "director".to_string()),
            ],
            ..Default::default()
        };
        let sink = MemorySink::default();
        let mut orchestrator = SyncOrchestrator::new(
            catalog,
            &sink,
            WatermarkStore::in_memory(),
            SyncConfig {
                page_size: 2,
                ..Default::default()
            },
        );

        // A page smaller than one person's credit count must not strand any
        // of their roles behind the advanced watermark.
        orchestrator.run_once().await.unwrap();

        let documents = sink.snapshot();
        let doc = documents
            .get(&("persons".to_string(), person.to_string()))
            .expect("person document delivered");
        let mut roles: Vec<&str> = doc["role"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_str().unwrap())
            .collect();
        roles.sort();
        assert_eq!(roles, vec!["actor", "director", "writer"]);

        // Everything was picked up in the first pass; the next is a no-op.
        let stats = orchestrator.run_once().await.unwrap();
        assert_eq!(stats.cycles, 0);
    }

    #[tokio::test]
    async fn test_person_documents_hold_distinct_roles() {
        let person = Uuid::new_v4();
        let film = Uuid::new_v4();
        let catalog = MemoryCatalog {
            persons: vec![PersonRecord {
                id: person,
                full_name: "Busy Person".to_string(),
                updated_at: ts(10),
            }],
            filmworks: vec![FilmworkRecord {
                id: film,
                title: "Solo Project".to_string(),
                description: None,
                rating: None,
                updated_at: ts(5),
            }],
            film_credits: vec![
                (film, person, "director".to_string()),
                (film, person, "writer".to_string()),
            ],
            ..Default::default()
        };
        let sink = MemorySink::default();
        let mut orchestrator = orchestrator(catalog, &sink);

        orchestrator.run_once().await.unwrap();

        let documents = sink.snapshot();
        let doc = documents
            .get(&("persons".to_string(), person.to_string()))
            .expect("person document delivered");
        let mut roles: Vec<&str> = doc["role"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_str().unwrap())
            .collect();
        roles.sort();
        assert_eq!(roles, vec!["director", "writer"]);
    }
}
