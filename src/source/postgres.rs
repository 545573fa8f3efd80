//! Postgres implementation of the catalog read contract.
//!
//! All queries are typed: positional rows are decoded into the row structs
//! in [`crate::source`] at the database boundary, so a schema/shape mismatch
//! surfaces as a loud decode error instead of silently coerced data. Id-set
//! predicates use `= ANY($n)` binds over the exact discovered sets.

use super::{CatalogSource, CreditRow, FilmworkRow, GenreRow, KeyedUpdate, PersonRoleRow};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use uuid::Uuid;

/// Catalog reader backed by a Postgres connection pool.
pub struct PostgresCatalog {
    pool: PgPool,
}

impl PostgresCatalog {
    /// Connect to the catalog database.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        tracing::info!("Connected to Postgres catalog");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Cheap connectivity check, used by the startup retry loop.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CatalogSource for PostgresCatalog {
    async fn changed_genres(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<KeyedUpdate>> {
        let rows = sqlx::query_as::<_, KeyedUpdate>(
            "SELECT id, updated_at
             FROM content.genre
             WHERE updated_at > $1
             ORDER BY updated_at
             LIMIT $2",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn changed_persons(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<KeyedUpdate>> {
        let rows = sqlx::query_as::<_, KeyedUpdate>(
            "SELECT id, updated_at
             FROM content.person
             WHERE updated_at > $1
             ORDER BY updated_at
             LIMIT $2",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn filmworks_by_genres(&self, genre_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT gfw.film_work_id
             FROM content.genre_film_work gfw
             INNER JOIN content.film_work fw ON gfw.film_work_id = fw.id
             WHERE gfw.genre_id = ANY($1)
             ORDER BY fw.updated_at",
        )
        .bind(genre_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn credits_by_persons(&self, person_ids: &[Uuid]) -> Result<Vec<CreditRow>> {
        let rows = sqlx::query_as::<_, CreditRow>(
            "SELECT pfw.film_work_id AS film_id,
                    pfw.person_id,
                    pfw.role,
                    prs.full_name,
                    fw.updated_at
             FROM content.person_film_work pfw
             INNER JOIN content.person prs ON pfw.person_id = prs.id
             INNER JOIN content.film_work fw ON pfw.film_work_id = fw.id
             WHERE pfw.person_id = ANY($1)
             ORDER BY fw.updated_at",
        )
        .bind(person_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn credits_by_persons_or_filmworks(
        &self,
        person_ids: &[Uuid],
        filmwork_ids: &[Uuid],
    ) -> Result<Vec<CreditRow>> {
        let rows = sqlx::query_as::<_, CreditRow>(
            "SELECT pfw.film_work_id AS film_id,
                    pfw.person_id,
                    pfw.role,
                    prs.full_name,
                    fw.updated_at
             FROM content.person_film_work pfw
             INNER JOIN content.person prs ON pfw.person_id = prs.id
             INNER JOIN content.film_work fw ON pfw.film_work_id = fw.id
             WHERE pfw.person_id = ANY($1) OR fw.id = ANY($2)
             ORDER BY fw.updated_at",
        )
        .bind(person_ids)
        .bind(filmwork_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn filmwork_aggregates(&self, filmwork_ids: &[Uuid]) -> Result<Vec<FilmworkRow>> {
        let rows = sqlx::query_as::<_, FilmworkRow>(
            "SELECT fw.id,
                    fw.title,
                    fw.description,
                    fw.rating::float8 AS rating,
                    COALESCE(
                        ARRAY_AGG(DISTINCT g.name) FILTER (WHERE g.name IS NOT NULL),
                        '{}'
                    ) AS genres
             FROM content.film_work fw
             LEFT OUTER JOIN content.genre_film_work gfw ON fw.id = gfw.film_work_id
             LEFT OUTER JOIN content.genre g ON gfw.genre_id = g.id
             WHERE fw.id = ANY($1)
             GROUP BY fw.id",
        )
        .bind(filmwork_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn genre_rows(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<GenreRow>> {
        let rows = sqlx::query_as::<_, GenreRow>(
            "SELECT id, name, description, updated_at
             FROM content.genre
             WHERE updated_at > $1
             ORDER BY updated_at
             LIMIT $2",
        )
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn person_role_rows(&self, person_ids: &[Uuid]) -> Result<Vec<PersonRoleRow>> {
        let rows = sqlx::query_as::<_, PersonRoleRow>(
            "SELECT pfw.person_id,
                    p.full_name,
                    pfw.role,
                    p.updated_at
             FROM content.person_film_work pfw
             INNER JOIN content.person p ON pfw.person_id = p.id
             WHERE pfw.person_id = ANY($1)
             ORDER BY p.updated_at",
        )
        .bind(person_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// Query behavior is covered by the detector tests over the in-memory
// catalog; exercising these statements requires a running Postgres with the
// content schema loaded.
