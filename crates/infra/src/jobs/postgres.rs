//! Postgres-backed job store.
//!
//! The [`JobStore`] trait is synchronous, so every call drives the query to
//! completion on the captured runtime handle. Call it from worker threads or
//! `spawn_blocking`, never from inside an async task.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Row, types::Json};
use tokio::runtime::Handle;
use tracing::info;
use uuid::Uuid;

use locate_core::JobId;
use locate_inference::LocationPrediction;

use super::store::{JobFilter, JobStats, JobStore, JobStoreError, validate_update};
use super::types::{Job, JobStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS locate_jobs (
    id UUID PRIMARY KEY,
    filename TEXT NOT NULL,
    file_path TEXT NOT NULL,
    top_k INTEGER NOT NULL CHECK (top_k > 0),
    status TEXT NOT NULL,
    error TEXT,
    results JSONB,
    device TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS locate_jobs_status_created_idx ON locate_jobs (status, created_at);
"#;

const COLUMNS: &str =
    "id, filename, file_path, top_k, status, error, results, device, created_at, started_at, completed_at";

pub struct PostgresJobStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresJobStore {
    /// Connect and make sure the table exists. Must be called inside a Tokio runtime.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .map_err(storage)?;
        let store = Self::new(pool, Handle::current());
        store.ensure_schema().await?;
        info!("postgres job store ready");
        Ok(store)
    }

    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await.map_err(storage)?;
        Ok(())
    }

    async fn fetch(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM locate_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.map(|r| job_from_row(&r)).transpose()
    }
}

fn storage(e: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(e.to_string())
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let status: String = row.try_get("status").map_err(storage)?;
    let top_k: i32 = row.try_get("top_k").map_err(storage)?;
    let file_path: String = row.try_get("file_path").map_err(storage)?;
    let results: Option<Json<Vec<LocationPrediction>>> = row.try_get("results").map_err(storage)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get::<Uuid, _>("id").map_err(storage)?),
        filename: row.try_get("filename").map_err(storage)?,
        file_path: PathBuf::from(file_path),
        top_k: u32::try_from(top_k).map_err(|_| JobStoreError::Storage(format!("invalid top_k {top_k}")))?,
        status: status.parse()?,
        error: row.try_get("error").map_err(storage)?,
        results: results.map(|Json(r)| r),
        device: row.try_get("device").map_err(storage)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(storage)?,
        started_at: row.try_get("started_at").map_err(storage)?,
        completed_at: row.try_get("completed_at").map_err(storage)?,
    })
}

impl JobStore for PostgresJobStore {
    fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        job.check_invariants()?;
        self.handle.block_on(async {
            let inserted = sqlx::query(&format!(
                "INSERT INTO locate_jobs ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                 ON CONFLICT (id) DO NOTHING"
            ))
            .bind(job.id.as_uuid())
            .bind(&job.filename)
            .bind(job.file_path.to_string_lossy().as_ref())
            .bind(job.top_k as i32)
            .bind(job.status.as_str())
            .bind(&job.error)
            .bind(job.results.as_ref().map(Json))
            .bind(&job.device)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
            if inserted.rows_affected() == 0 {
                return Err(JobStoreError::AlreadyExists(job.id));
            }
            Ok(job.id)
        })
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.handle.block_on(self.fetch(job_id))
    }

    fn start(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.handle.block_on(async {
            let row = sqlx::query(&format!(
                "UPDATE locate_jobs SET status = 'processing', started_at = GREATEST($2, created_at) \
                 WHERE id = $1 AND status = 'pending' RETURNING {COLUMNS}"
            ))
            .bind(job_id.as_uuid())
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;

            match row {
                Some(row) => job_from_row(&row).map(Some),
                None => match self.fetch(job_id).await? {
                    Some(job) => Err(JobStoreError::NotPending {
                        id: job_id,
                        status: job.status,
                    }),
                    None => Ok(None),
                },
            }
        })
    }

    fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        self.handle.block_on(async {
            let mut tx = self.pool.begin().await.map_err(storage)?;
            let row = sqlx::query(&format!("SELECT {COLUMNS} FROM locate_jobs WHERE id = $1 FOR UPDATE"))
                .bind(job.id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(storage)?
                .ok_or(JobStoreError::NotFound(job.id))?;
            validate_update(&job_from_row(&row)?, job)?;

            sqlx::query(
                "UPDATE locate_jobs SET status = $2, error = $3, results = $4, device = $5, \
                 started_at = $6, completed_at = $7 WHERE id = $1",
            )
            .bind(job.id.as_uuid())
            .bind(job.status.as_str())
            .bind(&job.error)
            .bind(job.results.as_ref().map(Json))
            .bind(&job.device)
            .bind(job.started_at)
            .bind(job.completed_at)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
            tx.commit().await.map_err(storage)
        })
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let limit = filter.limit.clamp(1, super::store::MAX_LIST_LIMIT) as i64;
        self.handle.block_on(async {
            let rows = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM locate_jobs WHERE ($1::TEXT IS NULL OR status = $1) \
                 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
            ))
            .bind(filter.status.map(|s| s.as_str()))
            .bind(limit)
            .bind(filter.offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
            rows.iter().map(job_from_row).collect()
        })
    }

    fn delete(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.handle.block_on(async {
            let mut tx = self.pool.begin().await.map_err(storage)?;
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM locate_jobs WHERE id = $1 FOR UPDATE")
                    .bind(job_id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage)?;
            match status.as_deref() {
                None => return Ok(None),
                Some("processing") => return Err(JobStoreError::Busy(job_id)),
                Some(_) => {}
            }

            let row = sqlx::query(&format!("DELETE FROM locate_jobs WHERE id = $1 RETURNING {COLUMNS}"))
                .bind(job_id.as_uuid())
                .fetch_one(&mut *tx)
                .await
                .map_err(storage)?;
            let job = job_from_row(&row)?;
            tx.commit().await.map_err(storage)?;
            Ok(Some(job))
        })
    }

    fn pending_ids(&self) -> Result<Vec<JobId>, JobStoreError> {
        self.handle.block_on(async {
            let ids: Vec<Uuid> =
                sqlx::query_scalar("SELECT id FROM locate_jobs WHERE status = 'pending' ORDER BY created_at, id")
                    .fetch_all(&self.pool)
                    .await
                    .map_err(storage)?;
            Ok(ids.into_iter().map(JobId::from_uuid).collect())
        })
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.handle.block_on(async {
            let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM locate_jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
            let mut stats = JobStats::default();
            for row in rows {
                let status: JobStatus = row.try_get::<String, _>("status").map_err(storage)?.parse()?;
                let n: i64 = row.try_get("n").map_err(storage)?;
                match status {
                    JobStatus::Pending => stats.pending = n as usize,
                    JobStatus::Processing => stats.processing = n as usize,
                    JobStatus::Completed => stats.completed = n as usize,
                    JobStatus::Failed => stats.failed = n as usize,
                }
            }
            Ok(stats)
        })
    }
}
