//! Postgres-backed job store.
//!
//! One row per job in `asset_jobs`. Queue positions come from the
//! `asset_job_queue_seq` sequence, so they are strictly increasing and a
//! position is never handed out twice, even across rolled-back transactions.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (insert) / `Conflict` |
//! | Database (serialization failure) | `40001` | `Conflict` |
//! | Database (deadlock detected) | `40P01` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use assetflow_core::{JobId, OwnerId};
use assetflow_lifecycle::{
    ActiveCounts, AdmissionPlan, ConcurrencyGate, Job, LifecycleStatus, MAX_MIGRATION_ATTEMPTS,
    MigrationRecord, MigrationState, QueueRecord, StageGuard, ThumbnailRecord, ThumbnailState,
};

use super::{
    AdmissionOutcome, CasOutcome, JobStats, JobStore, LifecycleChange, StatusCounts, StoreError,
};

const SCHEMA: &[&str] = &[
    "CREATE SEQUENCE IF NOT EXISTS asset_job_queue_seq START WITH 1 INCREMENT BY 1",
    r#"
    CREATE TABLE IF NOT EXISTS asset_jobs (
        id                          UUID PRIMARY KEY,
        owner_id                    UUID NOT NULL,
        owner_tier                  TEXT NOT NULL,
        lifecycle_status            TEXT NOT NULL,
        transient_asset_url         TEXT,
        migration_state             TEXT NOT NULL DEFAULT 'none',
        migration_attempts          INTEGER NOT NULL DEFAULT 0,
        migration_claim_seq         INTEGER NOT NULL DEFAULT 0,
        migration_last_attempt_at   TIMESTAMPTZ,
        durable_asset_url           TEXT,
        migration_completed_at      TIMESTAMPTZ,
        migration_error             TEXT,
        thumbnail_state             TEXT NOT NULL DEFAULT 'none',
        thumbnail_attempts          INTEGER NOT NULL DEFAULT 0,
        thumbnail_claim_seq         INTEGER NOT NULL DEFAULT 0,
        thumbnail_last_attempt_at   TIMESTAMPTZ,
        thumbnail_url               TEXT,
        thumbnail_generated_at      TIMESTAMPTZ,
        thumbnail_error             TEXT,
        queue_position              BIGINT,
        queue_entered_at            TIMESTAMPTZ,
        queue_started_at            TIMESTAMPTZ,
        dispatch_error              TEXT,
        created_at                  TIMESTAMPTZ NOT NULL,
        updated_at                  TIMESTAMPTZ NOT NULL,
        CONSTRAINT durable_url_iff_migrated
            CHECK ((migration_state = 'completed') = (durable_asset_url IS NOT NULL)),
        CONSTRAINT attempts_non_negative
            CHECK (migration_attempts >= 0 AND thumbnail_attempts >= 0)
    )
    "#,
    "ALTER TABLE asset_jobs ADD COLUMN IF NOT EXISTS migration_claim_seq INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE asset_jobs ADD COLUMN IF NOT EXISTS thumbnail_claim_seq INTEGER NOT NULL DEFAULT 0",
    "CREATE INDEX IF NOT EXISTS asset_jobs_active_idx ON asset_jobs (lifecycle_status, owner_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS asset_jobs_queue_idx ON asset_jobs (queue_position) WHERE queue_position IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS asset_jobs_migration_idx ON asset_jobs (migration_state, migration_last_attempt_at)",
    "CREATE INDEX IF NOT EXISTS asset_jobs_thumbnail_idx ON asset_jobs (thumbnail_state, thumbnail_last_attempt_at)",
];

const JOB_COLUMNS: &str = "id, owner_id, owner_tier, lifecycle_status, transient_asset_url, \
     migration_state, migration_attempts, migration_last_attempt_at, durable_asset_url, \
     migration_completed_at, migration_error, thumbnail_state, thumbnail_attempts, \
     thumbnail_last_attempt_at, thumbnail_url, thumbnail_generated_at, thumbnail_error, \
     queue_position, queue_entered_at, queue_started_at, dispatch_error, created_at, updated_at, \
     migration_claim_seq, thumbnail_claim_seq";

/// Postgres-backed job store.
///
/// Sub-lifecycle writes are single conditional `UPDATE`s keyed on the expected
/// state and attempt count; zero affected rows means the caller lost the race.
/// Admission runs in a `SERIALIZABLE` transaction so the active-job counts it
/// reads cannot change underneath the decision it writes.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the table, sequence and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    async fn fetch_for_update(
        tx: &mut Transaction<'_, Postgres>,
        id: JobId,
    ) -> Result<Job, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM asset_jobs WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("fetch_for_update", e))?
            .ok_or(StoreError::NotFound(id))?;
        job_from_row(&row)
    }

    /// Write back the producer-owned and queue columns of `job`.
    async fn write_lifecycle(
        tx: &mut Transaction<'_, Postgres>,
        job: &Job,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE asset_jobs
            SET lifecycle_status = $2,
                transient_asset_url = $3,
                queue_position = $4,
                queue_entered_at = $5,
                queue_started_at = $6,
                updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.lifecycle_status.as_str())
        .bind(job.transient_asset_url.as_deref())
        .bind(job.queue.position)
        .bind(job.queue.entered_at)
        .bind(job.queue.started_at)
        .bind(job.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("write_lifecycle", e))?;
        Ok(())
    }

    async fn list(
        &self,
        operation: &str,
        predicate: &str,
        order: &str,
        cutoff: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let limit_param = if cutoff.is_some() { "$2" } else { "$1" };
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM asset_jobs WHERE {predicate} ORDER BY {order} LIMIT {limit_param}"
        );

        let mut query = sqlx::query(&sql);
        if let Some(cutoff) = cutoff {
            query = query.bind(cutoff);
        }
        let rows = query
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(job_from_row).collect()
    }

    async fn exists(&self, id: JobId) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM asset_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("exists", e))?;
        Ok(row.is_some())
    }

    async fn cas_result(&self, id: JobId, row: Option<PgRow>) -> Result<CasOutcome, StoreError> {
        match row {
            Some(row) => Ok(CasOutcome::Applied(job_from_row(&row)?)),
            None if self.exists(id).await? => Ok(CasOutcome::LostRace),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: Job) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            "INSERT INTO asset_jobs ({JOB_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25)"
        ))
        .bind(job.id.as_uuid())
        .bind(job.owner_id.as_uuid())
        .bind(job.owner_tier.as_str())
        .bind(job.lifecycle_status.as_str())
        .bind(job.transient_asset_url.as_deref())
        .bind(job.migration.state.as_str())
        .bind(job.migration.attempts as i32)
        .bind(job.migration.last_attempt_at)
        .bind(job.migration.durable_asset_url.as_deref())
        .bind(job.migration.completed_at)
        .bind(job.migration.error.as_deref())
        .bind(job.thumbnail.state.as_str())
        .bind(job.thumbnail.attempts as i32)
        .bind(job.thumbnail.last_attempt_at)
        .bind(job.thumbnail.url.as_deref())
        .bind(job.thumbnail.generated_at)
        .bind(job.thumbnail.error.as_deref())
        .bind(job.queue.position)
        .bind(job.queue.entered_at)
        .bind(job.queue.started_at)
        .bind(job.dispatch_error.as_deref())
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.migration.claim_seq as i32)
        .bind(job.thumbnail.claim_seq as i32)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists(job.id)),
            Err(e) => Err(map_sqlx_error("insert", e)),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM asset_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, transient_asset_url), fields(job_id = %id, status = %status), err)]
    async fn set_lifecycle_status(
        &self,
        id: JobId,
        status: LifecycleStatus,
        transient_asset_url: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<LifecycleChange, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;

        let mut job = Self::fetch_for_update(&mut tx, id).await?;
        let previous = job.lifecycle_status;
        let mut dirty = false;
        if let Some(url) = transient_asset_url {
            dirty |= job.set_transient_asset_url(url)?;
        }
        dirty |= job.apply_lifecycle_status(status, now)?;
        if dirty {
            job.updated_at = now;
            Self::write_lifecycle(&mut tx, &job).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(LifecycleChange {
            previous,
            job,
            changed: previous != status,
        })
    }

    #[instrument(skip(self, gate), fields(job_id = %id), err)]
    async fn admit(
        &self,
        id: JobId,
        gate: &ConcurrencyGate,
        now: DateTime<Utc>,
    ) -> Result<AdmissionOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("admit", e))?;

        let mut job = Self::fetch_for_update(&mut tx, id).await?;
        let counts = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE owner_id = $1) AS owner_active,
                COUNT(*) AS system_active
            FROM asset_jobs
            WHERE lifecycle_status = 'processing'
            "#,
        )
        .bind(job.owner_id.as_uuid())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("admit", e))?;
        let counts = ActiveCounts {
            owner: count_column(&counts, "owner_active")? as u32,
            system: count_column(&counts, "system_active")? as u32,
        };

        let outcome = match gate.plan(&job, counts) {
            AdmissionPlan::NoOp => AdmissionOutcome::Unchanged(job),
            AdmissionPlan::StayQueued => AdmissionOutcome::Queued(job),
            AdmissionPlan::Admit => {
                job.admit(now);
                Self::write_lifecycle(&mut tx, &job).await?;
                AdmissionOutcome::Admitted(job)
            }
            AdmissionPlan::Enqueue => {
                let position: i64 = sqlx::query_scalar("SELECT nextval('asset_job_queue_seq')")
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("admit", e))?;
                job.enqueue(position, now);
                Self::write_lifecycle(&mut tx, &job).await?;
                AdmissionOutcome::Queued(job)
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(outcome)
    }

    async fn queued(&self, after_position: i64, limit: usize) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM asset_jobs \
             WHERE lifecycle_status = 'pending' AND queue_position > $1 \
             ORDER BY queue_position ASC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(after_position)
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("queued", e))?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, next), fields(job_id = %id, from = %expected.state, to = %next.state), err)]
    async fn swap_migration(
        &self,
        id: JobId,
        expected: StageGuard<MigrationState>,
        next: MigrationRecord,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE asset_jobs
            SET migration_state = $4,
                migration_attempts = $5,
                migration_last_attempt_at = $6,
                durable_asset_url = $7,
                migration_completed_at = $8,
                migration_error = $9,
                updated_at = $10,
                migration_claim_seq = $12
            WHERE id = $1 AND migration_state = $2 AND migration_attempts = $3
              AND migration_claim_seq = $11
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(expected.state.as_str())
        .bind(expected.attempts as i32)
        .bind(next.state.as_str())
        .bind(next.attempts as i32)
        .bind(next.last_attempt_at)
        .bind(next.durable_asset_url.as_deref())
        .bind(next.completed_at)
        .bind(next.error.as_deref())
        .bind(now)
        .bind(expected.claim_seq as i32)
        .bind(next.claim_seq as i32)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("swap_migration", e))?;

        self.cas_result(id, row).await
    }

    #[instrument(skip(self, next), fields(job_id = %id, from = %expected.state, to = %next.state), err)]
    async fn swap_thumbnail(
        &self,
        id: JobId,
        expected: StageGuard<ThumbnailState>,
        next: ThumbnailRecord,
        now: DateTime<Utc>,
    ) -> Result<CasOutcome, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE asset_jobs
            SET thumbnail_state = $4,
                thumbnail_attempts = $5,
                thumbnail_last_attempt_at = $6,
                thumbnail_url = $7,
                thumbnail_generated_at = $8,
                thumbnail_error = $9,
                updated_at = $10,
                thumbnail_claim_seq = $12
            WHERE id = $1 AND thumbnail_state = $2 AND thumbnail_attempts = $3
              AND thumbnail_claim_seq = $11
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(expected.state.as_str())
        .bind(expected.attempts as i32)
        .bind(next.state.as_str())
        .bind(next.attempts as i32)
        .bind(next.last_attempt_at)
        .bind(next.url.as_deref())
        .bind(next.generated_at)
        .bind(next.error.as_deref())
        .bind(now)
        .bind(expected.claim_seq as i32)
        .bind(next.claim_seq as i32)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("swap_thumbnail", e))?;

        self.cas_result(id, row).await
    }

    #[instrument(skip(self, error), fields(job_id = %id), err)]
    async fn set_dispatch_error(
        &self,
        id: JobId,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE asset_jobs
            SET dispatch_error = $2,
                updated_at = CASE WHEN dispatch_error IS DISTINCT FROM $2 THEN $3 ELSE updated_at END
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(error.as_deref())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_dispatch_error", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn stale_migrations(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.list(
            "stale_migrations",
            "migration_state IN ('pending', 'downloading', 'uploading') \
             AND (migration_last_attempt_at IS NULL OR migration_last_attempt_at < $1)",
            "created_at ASC",
            Some(cutoff),
            limit,
        )
        .await
    }

    async fn stale_thumbnails(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        self.list(
            "stale_thumbnails",
            "thumbnail_state IN ('pending', 'processing') \
             AND (thumbnail_last_attempt_at IS NULL OR thumbnail_last_attempt_at < $1)",
            "created_at ASC",
            Some(cutoff),
            limit,
        )
        .await
    }

    async fn failed_migrations(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.list(
            "failed_migrations",
            "migration_state = 'failed'",
            "migration_attempts ASC, created_at ASC, id ASC",
            None,
            limit,
        )
        .await
    }

    async fn failed_thumbnails(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.list(
            "failed_thumbnails",
            "thumbnail_state = 'failed'",
            "created_at ASC",
            None,
            limit,
        )
        .await
    }

    async fn undispatched(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        self.list(
            "undispatched",
            "dispatch_error IS NOT NULL",
            "created_at ASC",
            None,
            limit,
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COUNT(*) FILTER (WHERE queue_position IS NOT NULL) AS queued,
                COUNT(*) FILTER (WHERE lifecycle_status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE lifecycle_status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE lifecycle_status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE lifecycle_status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE migration_state IN ('pending', 'downloading', 'uploading')) AS migrations_active,
                COUNT(*) FILTER (WHERE migration_state = 'completed') AS migrations_completed,
                COUNT(*) FILTER (WHERE migration_state = 'failed') AS migrations_failed,
                COUNT(*) FILTER (WHERE migration_state = 'failed' AND migration_attempts >= $1) AS migrations_exhausted,
                COUNT(*) FILTER (WHERE thumbnail_state IN ('pending', 'processing')) AS thumbnails_active,
                COUNT(*) FILTER (WHERE thumbnail_state = 'completed') AS thumbnails_completed,
                COUNT(*) FILTER (WHERE thumbnail_state = 'failed') AS thumbnails_failed,
                COUNT(*) FILTER (WHERE dispatch_error IS NOT NULL) AS undispatched
            FROM asset_jobs
            "#,
        )
        .bind(MAX_MIGRATION_ATTEMPTS as i32)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        Ok(JobStats {
            total: count_column(&row, "total")?,
            queued: count_column(&row, "queued")?,
            lifecycle: StatusCounts {
                pending: count_column(&row, "pending")?,
                processing: count_column(&row, "processing")?,
                completed: count_column(&row, "completed")?,
                failed: count_column(&row, "failed")?,
            },
            migrations_active: count_column(&row, "migrations_active")?,
            migrations_completed: count_column(&row, "migrations_completed")?,
            migrations_failed: count_column(&row, "migrations_failed")?,
            migrations_exhausted: count_column(&row, "migrations_exhausted")?,
            thumbnails_active: count_column(&row, "thumbnails_active")?,
            thumbnails_completed: count_column(&row, "thumbnails_completed")?,
            thumbnails_failed: count_column(&row, "thumbnails_failed")?,
            undispatched: count_column(&row, "undispatched")?,
        })
    }
}

fn count_column(row: &PgRow, column: &str) -> Result<u64, StoreError> {
    let count: i64 = row
        .try_get(column)
        .map_err(|e| map_sqlx_error("count_column", e))?;
    Ok(count.max(0) as u64)
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let get_err = |e| map_sqlx_error("job_from_row", e);

    let id: Uuid = row.try_get("id").map_err(get_err)?;
    let owner_id: Uuid = row.try_get("owner_id").map_err(get_err)?;
    let owner_tier: String = row.try_get("owner_tier").map_err(get_err)?;
    let lifecycle_status: String = row.try_get("lifecycle_status").map_err(get_err)?;
    let migration_state: String = row.try_get("migration_state").map_err(get_err)?;
    let migration_attempts: i32 = row.try_get("migration_attempts").map_err(get_err)?;
    let thumbnail_state: String = row.try_get("thumbnail_state").map_err(get_err)?;
    let thumbnail_attempts: i32 = row.try_get("thumbnail_attempts").map_err(get_err)?;
    let migration_claim_seq: i32 = row.try_get("migration_claim_seq").map_err(get_err)?;
    let thumbnail_claim_seq: i32 = row.try_get("thumbnail_claim_seq").map_err(get_err)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        owner_id: OwnerId::from_uuid(owner_id),
        owner_tier: owner_tier.parse()?,
        lifecycle_status: lifecycle_status.parse()?,
        transient_asset_url: row.try_get("transient_asset_url").map_err(get_err)?,
        migration: MigrationRecord {
            state: migration_state.parse()?,
            attempts: migration_attempts.max(0) as u32,
            claim_seq: migration_claim_seq as u32,
            last_attempt_at: row.try_get("migration_last_attempt_at").map_err(get_err)?,
            durable_asset_url: row.try_get("durable_asset_url").map_err(get_err)?,
            completed_at: row.try_get("migration_completed_at").map_err(get_err)?,
            error: row.try_get("migration_error").map_err(get_err)?,
        },
        thumbnail: ThumbnailRecord {
            state: thumbnail_state.parse()?,
            attempts: thumbnail_attempts.max(0) as u32,
            claim_seq: thumbnail_claim_seq as u32,
            last_attempt_at: row.try_get("thumbnail_last_attempt_at").map_err(get_err)?,
            url: row.try_get("thumbnail_url").map_err(get_err)?,
            generated_at: row.try_get("thumbnail_generated_at").map_err(get_err)?,
            error: row.try_get("thumbnail_error").map_err(get_err)?,
        },
        queue: QueueRecord {
            position: row.try_get("queue_position").map_err(get_err)?,
            entered_at: row.try_get("queue_entered_at").map_err(get_err)?,
            started_at: row.try_get("queue_started_at").map_err(get_err)?,
        },
        dispatch_error: row.try_get("dispatch_error").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
    })
}

/// Map SQLx errors to [`StoreError`].
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("40001") | Some("40P01") | Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}
