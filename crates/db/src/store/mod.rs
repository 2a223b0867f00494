//! Job persistence behind a trait, so the queue can run against Postgres in
//! production and an in-process map in tests and local development.
//!
//! Every mutation of an active job is guarded by its [`Lease`]: the call
//! succeeds only while the caller's `lease_id` is still the one recorded on
//! the job. Otherwise it returns [`StoreError::LeaseLost`].

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use hireflow_core::error::CoreError;
use hireflow_core::settings::RetentionPolicy;
use hireflow_core::types::{DbId, Timestamp};

use crate::models::job::{Job, Lease, NewFlow, NewJob};

pub use memory::MemoryJobStore;
pub use postgres::PgJobStore;

/// Message recorded on a job whose lease ran out before it was acked.
pub const LEASE_EXPIRED_ERROR: &str = "Lease expired before the job was acknowledged";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(DbId),

    #[error("Lease on job {job_id} is no longer held")]
    LeaseLost { job_id: DbId },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => CoreError::NotFound { entity: "Job", id },
            StoreError::LeaseLost { job_id } => {
                CoreError::Conflict(format!("Lease on job {job_id} is no longer held"))
            }
            StoreError::Database(e) => match e {
                sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::Io(_)
                | sqlx::Error::Tls(_) => CoreError::Unavailable(e.to_string()),
                other => CoreError::Internal(other.to_string()),
            },
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a standalone pending job.
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Insert a flow parent and all its children atomically.
    ///
    /// Children get `child_index` 1..=n in input order and inherit the
    /// parent's correlation id.
    async fn insert_flow(&self, flow: NewFlow) -> Result<(Job, Vec<Job>), StoreError>;

    /// Lease the oldest runnable pending job in `queue`, incrementing its
    /// attempt count. Flow parents are never claimed.
    async fn claim_next(
        &self,
        queue: &str,
        lease_duration: Duration,
    ) -> Result<Option<Job>, StoreError>;

    /// Release jobs in `queue` whose lease has expired.
    ///
    /// Jobs with attempts left return to `pending`; the rest become `failed`.
    /// Returns the rows as they are after the transition.
    async fn reap_expired(&self, queue: &str) -> Result<Vec<Job>, StoreError>;

    /// Record handler progress and extend the lease.
    async fn update_progress(
        &self,
        lease: &Lease,
        percent: i16,
        message: Option<&str>,
        lease_duration: Duration,
    ) -> Result<Job, StoreError>;

    async fn complete(&self, lease: &Lease, result: &serde_json::Value)
        -> Result<Job, StoreError>;

    /// Return the job to `pending`, runnable after `delay`.
    async fn retry_later(
        &self,
        lease: &Lease,
        error: &str,
        delay: Duration,
    ) -> Result<Job, StoreError>;

    /// Mark the job terminally `failed`.
    async fn fail(&self, lease: &Lease, error: &str) -> Result<Job, StoreError>;

    /// Move a pending flow parent to `completed`.
    ///
    /// Returns `None` when the parent was already completed, so at most one
    /// caller ever observes the transition.
    async fn complete_flow_parent(
        &self,
        parent_id: DbId,
        result: &serde_json::Value,
    ) -> Result<Option<Job>, StoreError>;

    async fn find_by_id(&self, id: DbId) -> Result<Option<Job>, StoreError>;

    /// The most recently created root job (standalone or flow parent)
    /// carrying `correlation_id`.
    async fn find_latest_root(&self, correlation_id: &str) -> Result<Option<Job>, StoreError>;

    /// Children of a flow, ordered by `child_index`.
    async fn list_children(&self, parent_id: DbId) -> Result<Vec<Job>, StoreError>;

    /// Flow parents that have not completed yet.
    async fn list_open_flow_parents(&self) -> Result<Vec<Job>, StoreError>;

    /// Delete finished root jobs beyond the retention counts (children go
    /// with their parent). Returns the number of root jobs removed.
    async fn purge_retained(&self, policy: RetentionPolicy) -> Result<u64, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

/// `now + duration`, saturating far in the future on overflow.
pub(crate) fn deadline(now: Timestamp, duration: Duration) -> Timestamp {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn lease_lost_maps_to_conflict() {
        let err: CoreError = StoreError::LeaseLost { job_id: 7 }.into();
        assert_matches!(err, CoreError::Conflict(msg) if msg.contains('7'));
    }

    #[test]
    fn pool_timeout_maps_to_unavailable() {
        let err: CoreError = StoreError::Database(sqlx::Error::PoolTimedOut).into();
        assert_matches!(err, CoreError::Unavailable(_));
    }

    #[test]
    fn not_found_keeps_id() {
        let err: CoreError = StoreError::NotFound(42).into();
        assert_matches!(err, CoreError::NotFound { entity: "Job", id: 42 });
    }

    #[test]
    fn deadline_saturates() {
        let now = chrono::Utc::now();
        assert_eq!(
            deadline(now, Duration::from_secs(u64::MAX)),
            chrono::DateTime::<chrono::Utc>::MAX_UTC
        );
        assert!(deadline(now, Duration::from_secs(1)) > now);
    }
}
