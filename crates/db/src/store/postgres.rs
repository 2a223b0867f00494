use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hireflow_core::settings::RetentionPolicy;
use hireflow_core::types::DbId;
use uuid::Uuid;

use super::{deadline, JobStore, StoreError, LEASE_EXPIRED_ERROR};
use crate::models::job::{Job, Lease, NewFlow, NewJob};
use crate::models::status::JobStatus;
use crate::repositories::JobRepo;
use crate::DbPool;

/// [`JobStore`] backed by the `jobs` table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: DbPool,
}

impl PgJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn held(job: Option<Job>, lease: &Lease) -> Result<Job, StoreError> {
    job.ok_or(StoreError::LeaseLost {
        job_id: lease.job_id,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: NewJob) -> Result<Job, StoreError> {
        Ok(JobRepo::insert(&self.pool, &job).await?)
    }

    async fn insert_flow(&self, flow: NewFlow) -> Result<(Job, Vec<Job>), StoreError> {
        Ok(JobRepo::insert_flow(&self.pool, &flow).await?)
    }

    async fn claim_next(
        &self,
        queue: &str,
        lease_duration: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let job = JobRepo::claim_next(
            &self.pool,
            queue,
            Uuid::new_v4(),
            now,
            deadline(now, lease_duration),
        )
        .await?;
        Ok(job)
    }

    async fn reap_expired(&self, queue: &str) -> Result<Vec<Job>, StoreError> {
        Ok(JobRepo::reap_expired(&self.pool, queue, Utc::now(), LEASE_EXPIRED_ERROR).await?)
    }

    async fn update_progress(
        &self,
        lease: &Lease,
        percent: i16,
        message: Option<&str>,
        lease_duration: Duration,
    ) -> Result<Job, StoreError> {
        let now = Utc::now();
        let job = JobRepo::update_progress(
            &self.pool,
            lease,
            percent,
            message,
            now,
            deadline(now, lease_duration),
        )
        .await?;
        held(job, lease)
    }

    async fn complete(
        &self,
        lease: &Lease,
        result: &serde_json::Value,
    ) -> Result<Job, StoreError> {
        let job = JobRepo::complete(&self.pool, lease, result, Utc::now()).await?;
        held(job, lease)
    }

    async fn retry_later(
        &self,
        lease: &Lease,
        error: &str,
        delay: Duration,
    ) -> Result<Job, StoreError> {
        let now = Utc::now();
        let job = JobRepo::retry_later(&self.pool, lease, error, now, deadline(now, delay)).await?;
        held(job, lease)
    }

    async fn fail(&self, lease: &Lease, error: &str) -> Result<Job, StoreError> {
        let job = JobRepo::fail(&self.pool, lease, error, Utc::now()).await?;
        held(job, lease)
    }

    async fn complete_flow_parent(
        &self,
        parent_id: DbId,
        result: &serde_json::Value,
    ) -> Result<Option<Job>, StoreError> {
        Ok(JobRepo::complete_flow_parent(&self.pool, parent_id, result, Utc::now()).await?)
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Job>, StoreError> {
        Ok(JobRepo::find_by_id(&self.pool, id).await?)
    }

    async fn find_latest_root(&self, correlation_id: &str) -> Result<Option<Job>, StoreError> {
        Ok(JobRepo::find_latest_root(&self.pool, correlation_id).await?)
    }

    async fn list_children(&self, parent_id: DbId) -> Result<Vec<Job>, StoreError> {
        Ok(JobRepo::list_children(&self.pool, parent_id).await?)
    }

    async fn list_open_flow_parents(&self) -> Result<Vec<Job>, StoreError> {
        Ok(JobRepo::list_open_flow_parents(&self.pool).await?)
    }

    async fn purge_retained(&self, policy: RetentionPolicy) -> Result<u64, StoreError> {
        let completed =
            JobRepo::purge_finished(&self.pool, JobStatus::Completed, policy.keep_completed as i64)
                .await?;
        let failed =
            JobRepo::purge_finished(&self.pool, JobStatus::Failed, policy.keep_failed as i64)
                .await?;
        Ok(completed + failed)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(crate::health_check(&self.pool).await?)
    }
}
