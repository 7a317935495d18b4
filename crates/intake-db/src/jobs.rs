//! Job queue and lease repository implementation.
//!
//! Every lease transition is a single conditional `UPDATE`; Postgres
//! re-evaluates the `WHERE` clause for a row that a concurrent transaction
//! changed, so two workers racing for the same job cannot both win.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use intake_core::{
    new_v7, Error, ItemEffect, JobQueue, JobStatus, JobType, LeaseManager, QueueStats, Release,
    ReleaseReceipt, Result, WorkerJob,
};

use crate::items::apply_effect;

const JOB_COLUMNS: &str = "id, job_type, item_id, status, attempts, lease_owner, \
     lease_expires_at, available_at, last_error, last_error_at, created_at, updated_at";

/// PostgreSQL implementation of JobQueue and LeaseManager.
#[derive(Clone)]
pub struct PgJobRepository {
    pool: Pool<Postgres>,
}

impl PgJobRepository {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a job row into a WorkerJob.
    fn parse_job_row(row: &PgRow) -> Result<WorkerJob> {
        let job_type: String = row.get("job_type");
        let status: String = row.get("status");
        Ok(WorkerJob {
            id: row.get("id"),
            job_type: job_type.parse()?,
            item_id: row.get("item_id"),
            status: status.parse()?,
            attempts: row.get("attempts"),
            lease_owner: row.get("lease_owner"),
            lease_expires_at: row.get("lease_expires_at"),
            available_at: row.get("available_at"),
            last_error: row.get("last_error"),
            last_error_at: row.get("last_error_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn parse_rows(rows: &[PgRow]) -> Result<Vec<WorkerJob>> {
        rows.iter().map(Self::parse_job_row).collect()
    }
}

/// Seconds as a float for `make_interval`.
fn interval_secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

#[async_trait]
impl JobQueue for PgJobRepository {
    async fn enqueue(&self, job_type: JobType, item_id: Uuid) -> Result<WorkerJob> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        insert_job(&mut *conn, job_type, item_id).await
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<WorkerJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM worker_jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn list_due(&self, job_type: Option<JobType>, limit: i64) -> Result<Vec<WorkerJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM worker_jobs
             WHERE status = 'queued'
               AND available_at <= now()
               AND ($1::text IS NULL OR job_type = $1)
             ORDER BY available_at ASC, created_at ASC
             LIMIT $2"
        ))
        .bind(job_type.map(|jt| jt.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_rows(&rows)
    }

    async fn list_for_item(&self, item_id: Uuid) -> Result<Vec<WorkerJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM worker_jobs
             WHERE item_id = $1
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(item_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_rows(&rows)
    }

    async fn requeue_stale_leases(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE worker_jobs
             SET status = 'queued',
                 lease_owner = NULL,
                 lease_expires_at = NULL,
                 updated_at = now()
             WHERE status = 'leased' AND lease_expires_at < now()",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let count = result.rows_affected();
        if count > 0 {
            info!(
                subsystem = "db",
                component = "jobs",
                op = "requeue_stale",
                result_count = count,
                "Requeued expired leases"
            );
        }
        Ok(count)
    }

    async fn list_failed(&self, job_type: Option<JobType>, limit: i64) -> Result<Vec<WorkerJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM worker_jobs
             WHERE status = 'failed'
               AND ($1::text IS NULL OR job_type = $1)
             ORDER BY updated_at DESC
             LIMIT $2"
        ))
        .bind(job_type.map(|jt| jt.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_rows(&rows)
    }

    async fn reset_failed(&self, job_type: JobType, error: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE worker_jobs
             SET status = 'queued',
                 attempts = 0,
                 available_at = now(),
                 updated_at = now()
             WHERE status = 'failed' AND job_type = $1 AND last_error = $2",
        )
        .bind(job_type.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn requeue_failed(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE worker_jobs
             SET status = 'queued',
                 available_at = now(),
                 updated_at = now()
             WHERE id = $1 AND status = 'failed'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn queue_stats(&self) -> Result<Vec<QueueStats>> {
        let rows = sqlx::query(
            "SELECT job_type, status, COUNT(*) AS count
             FROM worker_jobs
             GROUP BY job_type, status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut by_type: HashMap<JobType, QueueStats> = JobType::ALL
            .into_iter()
            .map(|jt| (jt, QueueStats::empty(jt)))
            .collect();

        for row in &rows {
            let job_type: JobType = row.get::<String, _>("job_type").parse()?;
            let status: JobStatus = row.get::<String, _>("status").parse()?;
            let count: i64 = row.get("count");
            by_type
                .entry(job_type)
                .or_insert_with(|| QueueStats::empty(job_type))
                .add(status, count);
        }

        Ok(JobType::ALL
            .into_iter()
            .filter_map(|jt| by_type.remove(&jt))
            .collect())
    }
}

#[async_trait]
impl LeaseManager for PgJobRepository {
    async fn try_lease(
        &self,
        job_ids: &[Uuid],
        worker_id: &str,
        ttl: Duration,
    ) -> Result<Vec<WorkerJob>> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            "UPDATE worker_jobs
             SET status = 'leased',
                 lease_owner = $2,
                 lease_expires_at = now() + make_interval(secs => $3),
                 attempts = attempts + 1,
                 updated_at = now()
             WHERE id = ANY($1)
               AND status = 'queued'
               AND available_at <= now()
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_ids)
        .bind(worker_id)
        .bind(interval_secs(ttl))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let leased = Self::parse_rows(&rows)?;
        debug!(
            subsystem = "db",
            component = "leases",
            op = "try_lease",
            worker_id = %worker_id,
            requested = job_ids.len(),
            result_count = leased.len(),
            "Lease attempt finished"
        );
        Ok(leased)
    }

    async fn renew(&self, job_id: Uuid, worker_id: &str, ttl: Duration) -> Result<DateTime<Utc>> {
        let expires_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "UPDATE worker_jobs
             SET lease_expires_at = now() + make_interval(secs => $3),
                 updated_at = now()
             WHERE id = $1 AND status = 'leased' AND lease_owner = $2
             RETURNING lease_expires_at",
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(interval_secs(ttl))
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        expires_at.ok_or(Error::LeaseLost { job_id })
    }

    async fn release(
        &self,
        job_id: Uuid,
        worker_id: &str,
        release: Release,
    ) -> Result<ReleaseReceipt> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        if !lock_if_owned(&mut *tx, job_id, worker_id).await? {
            warn!(
                subsystem = "db",
                component = "leases",
                op = "release",
                job_id = %job_id,
                worker_id = %worker_id,
                release = release.name(),
                "Release rejected, lease no longer held"
            );
            return Err(Error::LeaseLost { job_id });
        }

        let (delay, error) = match &release {
            Release::Completed { .. } => (Duration::ZERO, None),
            Release::Retry { delay, error, .. } => (*delay, Some(error.as_str())),
            Release::Failed { error, .. } => (Duration::ZERO, Some(error.as_str())),
        };

        let row = sqlx::query(&format!(
            "UPDATE worker_jobs
             SET status = $2,
                 lease_owner = NULL,
                 lease_expires_at = NULL,
                 available_at = CASE WHEN $2 = 'queued'
                                     THEN now() + make_interval(secs => $3)
                                     ELSE available_at END,
                 last_error = COALESCE($4::text, last_error),
                 last_error_at = CASE WHEN $4::text IS NULL THEN last_error_at ELSE now() END,
                 updated_at = now()
             WHERE id = $1
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id)
        .bind(release.job_status().as_str())
        .bind(interval_secs(delay))
        .bind(error)
        .fetch_one(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let job = Self::parse_job_row(&row)?;

        let effect_applied = match release.item_effect() {
            Some(effect) => apply_effect(&mut *tx, effect).await?,
            None => false,
        };

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "leases",
            op = "release",
            job_id = %job_id,
            worker_id = %worker_id,
            release = release.name(),
            effect_applied,
            "Lease released"
        );
        Ok(ReleaseReceipt {
            job,
            effect_applied,
        })
    }

    async fn apply_as_owner(
        &self,
        job_id: Uuid,
        worker_id: &str,
        effect: &ItemEffect,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        if !lock_if_owned(&mut *tx, job_id, worker_id).await? {
            warn!(
                subsystem = "db",
                component = "leases",
                op = "apply_as_owner",
                job_id = %job_id,
                worker_id = %worker_id,
                item_id = %effect.item_id,
                "Item write rejected, lease no longer held"
            );
            return Err(Error::LeaseLost { job_id });
        }

        let applied = apply_effect(&mut *tx, effect).await?;
        tx.commit().await.map_err(Error::Database)?;
        Ok(applied)
    }
}

/// Queue a job for an existing item on `conn`.
pub(crate) async fn insert_job(
    conn: &mut PgConnection,
    job_type: JobType,
    item_id: Uuid,
) -> Result<WorkerJob> {
    let row = sqlx::query(&format!(
        "INSERT INTO worker_jobs (id, job_type, item_id, status, attempts, available_at,
                                  created_at, updated_at)
         SELECT $1, $2, $3, 'queued', 0, now(), now(), now()
         WHERE EXISTS (SELECT 1 FROM items WHERE id = $3)
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(new_v7())
    .bind(job_type.as_str())
    .bind(item_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(Error::Database)?
    .ok_or(Error::InvalidTarget(item_id))?;

    let job = PgJobRepository::parse_job_row(&row)?;
    debug!(
        subsystem = "db",
        component = "jobs",
        op = "enqueue",
        job_id = %job.id,
        job_type = %job_type,
        item_id = %item_id,
        "Job queued"
    );
    Ok(job)
}

/// Lock the job row and report whether `worker_id` holds its lease.
///
/// Run inside a transaction: the row lock lasts until it ends, so a
/// concurrent requeue or release waits for the caller's item write.
async fn lock_if_owned(conn: &mut PgConnection, job_id: Uuid, worker_id: &str) -> Result<bool> {
    let owned: Option<bool> = sqlx::query_scalar(
        "SELECT (status = 'leased' AND lease_owner = $2)
         FROM worker_jobs
         WHERE id = $1
         FOR UPDATE",
    )
    .bind(job_id)
    .bind(worker_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(Error::Database)?;
    Ok(owned == Some(true))
}
