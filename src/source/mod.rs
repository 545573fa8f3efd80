//! Change detection against the source catalog.
//!
//! This module defines the read contract against the relational catalog and
//! the change detector that drives each sync cycle:
//!
//! - [`CatalogSource`] - the queries the pipeline needs from the catalog
//! - [`ChangeDetector`] - watermark-bounded polling plus cascade resolution
//! - [`PostgresCatalog`] - the sqlx-backed production implementation
//!
//! # Cascade Resolution
//!
//! A changed genre or person does not map one-to-one onto an index document:
//! the movies index holds aggregate filmwork documents, so every change must
//! be followed through its join table to the filmworks it affects.
//!
//! ```text
//! genres changed since W₁ ──► genre_film_work ──┐
//!                                               ├─► filmwork id union ─► aggregates
//! persons changed since W₂ ─► person_film_work ─┘
//! ```
//!
//! Pages are bounded (default 100 rows) and ordered ascending by
//! `updated_at`; the candidate watermark for a page is the timestamp of its
//! last (maximal) row, returned to the caller as pending state and committed
//! only after delivery.

mod postgres;

pub use postgres::PostgresCatalog;

use crate::sync::state::{PendingWatermarks, Stream};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

/// Default page size for change polls.
pub const DEFAULT_PAGE_SIZE: i64 = 100;

/// A changed primary-table row: its key and when it was updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct KeyedUpdate {
    pub id: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate filmwork projection: the film plus its deduplicated genre names.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct FilmworkRow {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub rating: Option<f64>,
    pub genres: Vec<String>,
}

/// One (filmwork, person, role) credit.
///
/// Multiple rows may share `(film_id, person_id)` with different roles.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CreditRow {
    pub film_id: Uuid,
    pub person_id: Uuid,
    pub role: String,
    pub full_name: String,
    pub updated_at: DateTime<Utc>,
}

/// Raw genre row for the dedicated genres index.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct GenreRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One credit row of a changed person, for the dedicated persons index.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct PersonRoleRow {
    pub person_id: Uuid,
    pub full_name: String,
    pub role: String,
    pub updated_at: DateTime<Utc>,
}

/// Read contract against the source catalog.
///
/// All "since" predicates are strict greater-than; all id-set predicates use
/// inclusion over exactly the given set. Implemented by [`PostgresCatalog`]
/// in production and by an in-memory catalog in tests.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Genres updated strictly after `since`, ascending, limited.
    async fn changed_genres(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<KeyedUpdate>>;

    /// Persons updated strictly after `since`, ascending, limited.
    async fn changed_persons(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<KeyedUpdate>>;

    /// Ids of filmworks carrying any of the given genres.
    async fn filmworks_by_genres(&self, genre_ids: &[Uuid]) -> Result<Vec<Uuid>>;

    /// Credits of the given persons.
    async fn credits_by_persons(&self, person_ids: &[Uuid]) -> Result<Vec<CreditRow>>;

    /// Credits where the person is in `person_ids` **or** the filmwork is in
    /// `filmwork_ids` (inclusive union).
    async fn credits_by_persons_or_filmworks(
        &self,
        person_ids: &[Uuid],
        filmwork_ids: &[Uuid],
    ) -> Result<Vec<CreditRow>>;

    /// Aggregate rows for exactly the given filmwork ids.
    async fn filmwork_aggregates(&self, filmwork_ids: &[Uuid]) -> Result<Vec<FilmworkRow>>;

    /// Full genre rows updated strictly after `since`, ascending, limited.
    async fn genre_rows(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<GenreRow>>;

    /// Credit rows of exactly the given persons.
    async fn person_role_rows(&self, person_ids: &[Uuid]) -> Result<Vec<PersonRoleRow>>;
}

/// Result of one filmwork-stream detection cycle.
#[derive(Debug, Clone)]
pub struct FilmworkChanges {
    /// Aggregate rows for every filmwork affected this cycle.
    pub filmworks: Vec<FilmworkRow>,
    /// Credit rows for the affected filmworks (empty when only genres
    /// changed; see [`ChangeDetector::detect_filmworks`]).
    pub credits: Vec<CreditRow>,
    /// Watermarks to commit once this batch is delivered.
    pub pending: PendingWatermarks,
}

/// Result of one genre-stream detection cycle.
#[derive(Debug, Clone)]
pub struct GenreChanges {
    pub rows: Vec<GenreRow>,
    pub pending: PendingWatermarks,
}

/// Result of one person-stream detection cycle.
#[derive(Debug, Clone)]
pub struct PersonChanges {
    pub rows: Vec<PersonRoleRow>,
    pub pending: PendingWatermarks,
}

/// Watermark-bounded change detection over a [`CatalogSource`].
///
/// The detector performs no watermark writes itself: each detection returns
/// the pending positions alongside the discovered rows, and the orchestrator
/// commits them after delivery.
pub struct ChangeDetector<'a, S: CatalogSource + ?Sized> {
    source: &'a S,
    page_size: i64,
}

impl<'a, S: CatalogSource + ?Sized> ChangeDetector<'a, S> {
    pub fn new(source: &'a S, page_size: i64) -> Self {
        Self { source, page_size }
    }

    /// Detect filmworks affected by genre and person changes.
    ///
    /// Returns `None` when both primary pages are empty: the stream is
    /// exhausted for this run and no watermark advances. A non-empty primary
    /// page whose cascade yields no filmworks still returns a batch, because
    /// it tracked real updates and its watermark must advance.
    ///
    /// Credits are fetched only when the changed-persons page is non-empty:
    /// with the union query when genre-impacted filmworks also exist, or
    /// restricted to the changed persons otherwise. This keeps the credit
    /// query bounded by the discovered id sets instead of scanning the whole
    /// join table.
    pub async fn detect_filmworks(
        &self,
        genres_since: DateTime<Utc>,
        persons_since: DateTime<Utc>,
    ) -> Result<Option<FilmworkChanges>> {
        let mut pending = PendingWatermarks::new();

        let genres = self.source.changed_genres(genres_since, self.page_size).await?;
        let mut by_genre: Vec<Uuid> = Vec::new();
        if let Some(last) = genres.last() {
            pending.push(Stream::Genres, last.updated_at);
            let genre_ids: Vec<Uuid> = genres.iter().map(|g| g.id).collect();
            by_genre = self.source.filmworks_by_genres(&genre_ids).await?;
        }

        let persons = self.source.changed_persons(persons_since, self.page_size).await?;
        let mut credits: Vec<CreditRow> = Vec::new();
        if let Some(last) = persons.last() {
            pending.push(Stream::Persons, last.updated_at);
            let person_ids: Vec<Uuid> = persons.iter().map(|p| p.id).collect();
            credits = if by_genre.is_empty() {
                self.source.credits_by_persons(&person_ids).await?
            } else {
                self.source
                    .credits_by_persons_or_filmworks(&person_ids, &by_genre)
                    .await?
            };
        }

        if genres.is_empty() && persons.is_empty() {
            return Ok(None);
        }

        // Union of genre-impacted and credit-impacted filmwork ids,
        // deduplicated, preserving detection order.
        let mut seen = HashSet::new();
        let mut affected: Vec<Uuid> = Vec::new();
        for id in by_genre
            .iter()
            .copied()
            .chain(credits.iter().map(|c| c.film_id))
        {
            if seen.insert(id) {
                affected.push(id);
            }
        }

        let filmworks = if affected.is_empty() {
            Vec::new()
        } else {
            self.source.filmwork_aggregates(&affected).await?
        };

        tracing::debug!(
            "Filmwork detection: {} genres, {} persons changed → {} filmworks affected",
            genres.len(),
            persons.len(),
            filmworks.len()
        );

        Ok(Some(FilmworkChanges {
            filmworks,
            credits,
            pending,
        }))
    }

    /// Poll the standalone genre stream. `None` means exhausted.
    pub async fn detect_genres(&self, since: DateTime<Utc>) -> Result<Option<GenreChanges>> {
        let rows = self.source.genre_rows(since, self.page_size).await?;
        let Some(last) = rows.last() else {
            return Ok(None);
        };
        let mut pending = PendingWatermarks::new();
        pending.push(Stream::GenreDocs, last.updated_at);
        Ok(Some(GenreChanges { rows, pending }))
    }

    /// Poll the standalone person stream. `None` means exhausted.
    ///
    /// Pages on the person table and then fetches every credit of the paged
    /// persons, so a page boundary never splits one person's credit set. A
    /// changed person with no credits still advances the watermark.
    pub async fn detect_persons(&self, since: DateTime<Utc>) -> Result<Option<PersonChanges>> {
        let persons = self.source.changed_persons(since, self.page_size).await?;
        let Some(last) = persons.last() else {
            return Ok(None);
        };
        let mut pending = PendingWatermarks::new();
        pending.push(Stream::PersonDocs, last.updated_at);
        let person_ids: Vec<Uuid> = persons.iter().map(|p| p.id).collect();
        let rows = self.source.person_role_rows(&person_ids).await?;
        Ok(Some(PersonChanges { rows, pending }))
    }
}
