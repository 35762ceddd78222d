use crate::config::DatabaseConfig;
use crate::models::{Image, ImageStatus};
use chrono::Utc;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Errors surfaced by the metadata repository.
///
/// The repository never retries internally; callers decide whether a failure
/// is worth retrying. `Unavailable` covers transport and serialization
/// problems and is the only transient kind.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("image not found")]
    NotFound,

    #[error("image already exists")]
    Conflict,

    #[error("database unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

impl RepositoryError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RepositoryError::Unavailable(_))
    }
}

const IMAGE_COLUMNS: &str = "id, original_name, original_size, original_width, original_height, \
     original_format, original_path, optimized_path, optimized_size, \
     optimized_width, optimized_height, status, error, created_at, updated_at";

/// CRUD and status transitions for image records.
#[derive(Clone)]
pub struct ImageRepository {
    pool: PgPool,
}

impl ImageRepository {
    /// Connect a pool sized per configuration and verify connectivity.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.connection_string())
            .await?;

        sqlx::query("SELECT 1").execute(&pool).await?;

        info!(
            host = %config.host,
            database = %config.name,
            "Connected to PostgreSQL"
        );

        Ok(Self { pool })
    }

    /// Apply pending schema migrations.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Insert a fresh record in `pending` state.
    #[instrument(skip(self, image), fields(image_id = %image.id))]
    pub async fn create(&self, image: &Image) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO images (
                id, original_name, original_size, original_width, original_height,
                original_format, original_path, status, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(image.id)
        .bind(&image.original_name)
        .bind(image.original_size)
        .bind(image.original_width)
        .bind(image.original_height)
        .bind(&image.original_format)
        .bind(&image.original_path)
        .bind(image.status)
        .bind(image.created_at)
        .bind(image.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict,
            _ => RepositoryError::Unavailable(e),
        })?;

        debug!(image_id = %image.id, "Image record created");
        Ok(())
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Image, RepositoryError> {
        let query = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = $1");
        sqlx::query_as::<_, Image>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(RepositoryError::NotFound)
    }

    /// Page through records ordered by creation time, newest first. Returns
    /// the page and the total row count. The caller clamps `limit`; the
    /// repository trusts its inputs.
    #[instrument(skip(self))]
    pub async fn list(&self, limit: i64, offset: i64) -> Result<(Vec<Image>, i64), RepositoryError> {
        let (total,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM images")
            .fetch_one(&self.pool)
            .await?;

        let query = format!(
            "SELECT {IMAGE_COLUMNS} FROM images ORDER BY created_at DESC LIMIT $1 OFFSET $2"
        );
        let images = sqlx::query_as::<_, Image>(&query)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok((images, total))
    }

    /// Overwrite status and error, advancing `updated_at`. No precondition
    /// check: a redelivered task may legally re-enter `processing`.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        id: Uuid,
        status: ImageStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE images SET status = $2, error = $3, updated_at = $4 WHERE id = $1")
            .bind(id)
            .bind(status)
            .bind(error)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Write the optimized fields and mark the record completed in a single
    /// statement, so a crash cannot leave a completed row without its variant
    /// data. Idempotent: replaying the same values yields the same row.
    #[instrument(skip(self))]
    pub async fn update_optimized(
        &self,
        id: Uuid,
        path: &str,
        size: i64,
        width: i32,
        height: i32,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            UPDATE images
            SET optimized_path = $2, optimized_size = $3, optimized_width = $4,
                optimized_height = $5, status = $6, error = NULL, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(path)
        .bind(size)
        .bind(width)
        .bind(height)
        .bind(ImageStatus::Completed)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Hard delete. `NotFound` when no row was affected.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM images WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }

        Ok(())
    }

    /// Liveness probe for health checks.
    pub async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_permanent() {
        assert!(!RepositoryError::NotFound.is_transient());
        assert!(!RepositoryError::Conflict.is_transient());
    }

    #[test]
    fn io_errors_are_transient() {
        let err = RepositoryError::Unavailable(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
    }
}
