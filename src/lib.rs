//! Incremental Postgres → Elasticsearch sync for a movie catalog.
//!
//! This crate keeps a full-text search index in step with a relational
//! catalog of movies, genres and persons without ever re-indexing from
//! scratch: each run detects only the rows changed since the last committed
//! watermark, cascades them through the join tables to the aggregate
//! documents they affect, and upserts those documents in batches.
//!
//! # Modules
//!
//! - [`source`] - catalog read contract, change detection, cascade resolution
//! - [`pipeline`] - document assembly, validation, and Elasticsearch delivery
//! - [`sync`] - per-stream orchestration and the durable watermark store
//! - [`retry`] - the shared exponential-backoff policy for remote calls
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  ChangeDetector  │  watermark-bounded polls + join cascades (Postgres)
//! └────────┬─────────┘
//!          │ rows + pending watermarks
//!          ▼
//! ┌──────────────────┐
//! │    transform     │  pure row → document assembly, schema validation
//! └────────┬─────────┘
//!          │ documents
//!          ▼
//! ┌──────────────────┐
//! │  ElasticIndexer  │  idempotent _bulk upserts keyed by document id
//! └────────┬─────────┘
//!          │ delivery acknowledged
//!          ▼
//! ┌──────────────────┐
//! │  WatermarkStore  │  commit happens strictly after delivery
//! └──────────────────┘
//! ```
//!
//! The watermark file is the only durable state this crate owns. Everything
//! else is rebuilt from the catalog every cycle, and a crash at any point is
//! recovered by redetecting from the last committed watermark - delivery is
//! an upsert, so redelivery converges.

pub mod error;
pub mod pipeline;
pub mod retry;
pub mod source;
pub mod sync;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use pipeline::{
    DirectorPrecedence, DocumentSink, ElasticConfig, ElasticIndexer, FilmworkDocument,
    GenreDocument, PersonDocument, PersonRef,
};
pub use retry::RetryPolicy;
pub use source::{
    CatalogSource, ChangeDetector, CreditRow, FilmworkRow, GenreRow, KeyedUpdate, PersonRoleRow,
    PostgresCatalog,
};
pub use sync::{
    epoch, PendingWatermarks, RunStats, Stream, SyncConfig, SyncOrchestrator, WatermarkStore,
};
