//! Document assembly and index delivery.
//!
//! This module holds everything between raw catalog rows and the search
//! index:
//!
//! - [`transform`] - pure row→document assembly
//! - [`documents`] - the index document types and their validation
//! - [`ElasticIndexer`] - batched `_bulk` upserts over HTTP
//!
//! # Architecture
//!
//! ```text
//! [ChangeDetector] → [transform] → [DocumentSink (_bulk upsert)] → [watermark commit]
//! ```
//!
//! Delivery is keyed by document id, so redelivering a batch after a crash
//! converges to the same index state.

pub mod documents;
mod elastic;
pub mod transform;

pub use documents::{FilmworkDocument, GenreDocument, PersonDocument, PersonRef};
pub use elastic::{genres_mapping, movies_mapping, persons_mapping, ElasticConfig, ElasticIndexer};
pub use transform::DirectorPrecedence;

use crate::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Destination for assembled documents.
///
/// Implemented by [`ElasticIndexer`] in production and by an in-memory sink
/// in tests. `deliver` must be an idempotent upsert keyed by each document's
/// `id` field: delivering the same batch twice leaves the index in the same
/// state as delivering it once.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Create the index if absent; an existing index is success.
    async fn ensure_index(&self, index: &str, mapping: &Value) -> Result<()>;

    /// Upsert a batch of documents, returning how many were written.
    async fn deliver(&self, index: &str, documents: &[Value]) -> Result<usize>;
}

#[async_trait]
impl<T: DocumentSink + ?Sized> DocumentSink for &T {
    async fn ensure_index(&self, index: &str, mapping: &Value) -> Result<()> {
        (**self).ensure_index(index, mapping).await
    }

    async fn deliver(&self, index: &str, documents: &[Value]) -> Result<usize> {
        (**self).deliver(index, documents).await
    }
}
