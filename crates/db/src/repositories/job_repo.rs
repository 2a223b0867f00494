//! Repository for the `jobs` table.
//!
//! Uses `JobStatus` from `models::status` for every status literal. All
//! mutations of an active job match on `lease_id` so a worker whose lease was
//! reaped cannot overwrite the next holder's work.

use hireflow_core::types::{DbId, Timestamp};
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use crate::models::job::{Job, Lease, NewFlow, NewJob};
use crate::models::status::JobStatus;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, queue_name, kind, payload, status_id, correlation_id, \
    attempts, max_attempts, \
    parent_id, is_flow_parent, child_index, child_total, \
    progress_percent, progress_message, result, error, \
    lease_id, lease_expires_at, run_at, created_at, updated_at, finished_at";

/// Everything needed to insert one row; shared by standalone and flow inserts.
struct InsertRow<'a> {
    queue_name: &'a str,
    kind: &'a str,
    payload: serde_json::Value,
    correlation_id: &'a str,
    max_attempts: i32,
    parent_id: Option<DbId>,
    is_flow_parent: bool,
    child_index: Option<i32>,
    child_total: Option<i32>,
}

/// Provides queue operations over the `jobs` table.
pub struct JobRepo;

impl JobRepo {
    /// Create a standalone pending job.
    pub async fn insert(pool: &PgPool, input: &NewJob) -> Result<Job, sqlx::Error> {
        let row = InsertRow {
            queue_name: &input.queue_name,
            kind: input.payload.kind().as_str(),
            payload: input.payload.body(),
            correlation_id: &input.correlation_id,
            max_attempts: input.max_attempts,
            parent_id: None,
            is_flow_parent: false,
            child_index: None,
            child_total: None,
        };
        Self::insert_row(pool, row).await
    }

    /// Create a flow parent and its children in one transaction.
    pub async fn insert_flow(
        pool: &PgPool,
        input: &NewFlow,
    ) -> Result<(Job, Vec<Job>), sqlx::Error> {
        let total = input.children.len() as i32;
        let mut tx = pool.begin().await?;

        let parent = Self::insert_row(
            &mut *tx,
            InsertRow {
                queue_name: &input.queue_name,
                kind: input.parent.kind().as_str(),
                payload: input.parent.body(),
                correlation_id: &input.correlation_id,
                max_attempts: input.max_attempts,
                parent_id: None,
                is_flow_parent: true,
                child_index: None,
                child_total: Some(total),
            },
        )
        .await?;

        let mut children = Vec::with_capacity(input.children.len());
        for (i, payload) in input.children.iter().enumerate() {
            let child = Self::insert_row(
                &mut *tx,
                InsertRow {
                    queue_name: &input.queue_name,
                    kind: payload.kind().as_str(),
                    payload: payload.body(),
                    correlation_id: &input.correlation_id,
                    max_attempts: input.max_attempts,
                    parent_id: Some(parent.id),
                    is_flow_parent: false,
                    child_index: Some(i as i32 + 1),
                    child_total: Some(total),
                },
            )
            .await?;
            children.push(child);
        }

        tx.commit().await?;
        Ok((parent, children))
    }

    async fn insert_row<'e, E>(executor: E, row: InsertRow<'_>) -> Result<Job, sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let query = format!(
            "INSERT INTO jobs \
                 (queue_name, kind, payload, status_id, correlation_id, max_attempts, \
                  parent_id, is_flow_parent, child_index, child_total) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(row.queue_name)
            .bind(row.kind)
            .bind(row.payload)
            .bind(JobStatus::Pending.id())
            .bind(row.correlation_id)
            .bind(row.max_attempts)
            .bind(row.parent_id)
            .bind(row.is_flow_parent)
            .bind(row.child_index)
            .bind(row.child_total)
            .fetch_one(executor)
            .await
    }

    /// Atomically lease the oldest runnable pending job in a queue.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent workers never
    /// claim the same row.
    pub async fn claim_next(
        pool: &PgPool,
        queue: &str,
        lease_id: Uuid,
        now: Timestamp,
        expires_at: Timestamp,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, attempts = attempts + 1, \
                 lease_id = $3, lease_expires_at = $4, updated_at = $5 \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE queue_name = $1 AND status_id = $6 \
                   AND is_flow_parent = FALSE AND run_at <= $5 \
                 ORDER BY id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(queue)
            .bind(JobStatus::Active.id())
            .bind(lease_id)
            .bind(expires_at)
            .bind(now)
            .bind(JobStatus::Pending.id())
            .fetch_optional(pool)
            .await
    }

    /// Release every expired lease in a queue.
    ///
    /// Jobs with attempts remaining go back to `pending`; exhausted jobs
    /// become `failed`.
    pub async fn reap_expired(
        pool: &PgPool,
        queue: &str,
        now: Timestamp,
        error: &str,
    ) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = CASE WHEN attempts >= max_attempts THEN $3 ELSE $4 END, \
                 finished_at = CASE WHEN attempts >= max_attempts THEN $5 ELSE NULL END, \
                 error = $6, lease_id = NULL, lease_expires_at = NULL, \
                 run_at = $5, updated_at = $5 \
             WHERE id IN ( \
                 SELECT id FROM jobs \
                 WHERE queue_name = $1 AND status_id = $2 AND lease_expires_at < $5 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(queue)
            .bind(JobStatus::Active.id())
            .bind(JobStatus::Failed.id())
            .bind(JobStatus::Pending.id())
            .bind(now)
            .bind(error)
            .fetch_all(pool)
            .await
    }

    /// Record progress and push the lease expiry forward.
    ///
    /// Returns `None` if the lease is no longer held.
    pub async fn update_progress(
        pool: &PgPool,
        lease: &Lease,
        percent: i16,
        message: Option<&str>,
        now: Timestamp,
        expires_at: Timestamp,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET progress_percent = $3, progress_message = $4, \
                 lease_expires_at = $5, updated_at = $6 \
             WHERE id = $1 AND lease_id = $2 AND status_id = $7 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(lease.job_id)
            .bind(lease.lease_id)
            .bind(percent)
            .bind(message)
            .bind(expires_at)
            .bind(now)
            .bind(JobStatus::Active.id())
            .fetch_optional(pool)
            .await
    }

    /// Mark a leased job as completed with its result payload.
    pub async fn complete(
        pool: &PgPool,
        lease: &Lease,
        result: &serde_json::Value,
        now: Timestamp,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $3, result = $4, error = NULL, progress_percent = 100, \
                 lease_id = NULL, lease_expires_at = NULL, \
                 finished_at = $5, updated_at = $5 \
             WHERE id = $1 AND lease_id = $2 AND status_id = $6 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(lease.job_id)
            .bind(lease.lease_id)
            .bind(JobStatus::Completed.id())
            .bind(result)
            .bind(now)
            .bind(JobStatus::Active.id())
            .fetch_optional(pool)
            .await
    }

    /// Return a leased job to `pending`, runnable from `run_at`.
    pub async fn retry_later(
        pool: &PgPool,
        lease: &Lease,
        error: &str,
        now: Timestamp,
        run_at: Timestamp,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $3, error = $4, run_at = $5, \
                 lease_id = NULL, lease_expires_at = NULL, updated_at = $6 \
             WHERE id = $1 AND lease_id = $2 AND status_id = $7 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(lease.job_id)
            .bind(lease.lease_id)
            .bind(JobStatus::Pending.id())
            .bind(error)
            .bind(run_at)
            .bind(now)
            .bind(JobStatus::Active.id())
            .fetch_optional(pool)
            .await
    }

    /// Mark a leased job as terminally failed.
    pub async fn fail(
        pool: &PgPool,
        lease: &Lease,
        error: &str,
        now: Timestamp,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $3, error = $4, \
                 lease_id = NULL, lease_expires_at = NULL, \
                 finished_at = $5, updated_at = $5 \
             WHERE id = $1 AND lease_id = $2 AND status_id = $6 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(lease.job_id)
            .bind(lease.lease_id)
            .bind(JobStatus::Failed.id())
            .bind(error)
            .bind(now)
            .bind(JobStatus::Active.id())
            .fetch_optional(pool)
            .await
    }

    /// Complete a pending flow parent. `None` if it was already completed.
    pub async fn complete_flow_parent(
        pool: &PgPool,
        parent_id: DbId,
        result: &serde_json::Value,
        now: Timestamp,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "UPDATE jobs \
             SET status_id = $2, result = $3, progress_percent = 100, \
                 finished_at = $4, updated_at = $4 \
             WHERE id = $1 AND is_flow_parent = TRUE AND status_id = $5 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(parent_id)
            .bind(JobStatus::Completed.id())
            .bind(result)
            .bind(now)
            .bind(JobStatus::Pending.id())
            .fetch_optional(pool)
            .await
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Job>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = $1");
        sqlx::query_as::<_, Job>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Find the newest root job of a correlation id.
    pub async fn find_latest_root(
        pool: &PgPool,
        correlation_id: &str,
    ) -> Result<Option<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE correlation_id = $1 AND parent_id IS NULL \
             ORDER BY id DESC LIMIT 1"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(correlation_id)
            .fetch_optional(pool)
            .await
    }

    /// List the children of a flow in `child_index` order.
    pub async fn list_children(pool: &PgPool, parent_id: DbId) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs WHERE parent_id = $1 ORDER BY child_index ASC"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(parent_id)
            .fetch_all(pool)
            .await
    }

    /// List flow parents still waiting on children.
    pub async fn list_open_flow_parents(pool: &PgPool) -> Result<Vec<Job>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM jobs \
             WHERE is_flow_parent = TRUE AND status_id = $1 \
             ORDER BY id ASC"
        );
        sqlx::query_as::<_, Job>(&query)
            .bind(JobStatus::Pending.id())
            .fetch_all(pool)
            .await
    }

    /// Delete finished root jobs with the given status, keeping the `keep`
    /// most recently finished. Children are removed by `ON DELETE CASCADE`.
    pub async fn purge_finished(
        pool: &PgPool,
        status: JobStatus,
        keep: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE id IN ( \
                 SELECT id FROM jobs \
                 WHERE parent_id IS NULL AND status_id = $1 \
                 ORDER BY finished_at DESC NULLS LAST, id DESC \
                 OFFSET $2 \
             )",
        )
        .bind(status.id())
        .bind(keep)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
