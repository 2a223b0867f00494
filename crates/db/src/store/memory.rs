//! In-process [`JobStore`] for tests and local runs without a database.
//!
//! One mutex guards the whole map, which gives every operation the same
//! atomicity the Postgres store gets from row locks and transactions.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hireflow_core::settings::RetentionPolicy;
use hireflow_core::types::{DbId, Timestamp};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{deadline, JobStore, StoreError, LEASE_EXPIRED_ERROR};
use crate::models::job::{Job, Lease, NewFlow, NewJob};
use crate::models::status::JobStatus;

#[derive(Default)]
struct State {
    jobs: BTreeMap<DbId, Job>,
    next_id: DbId,
}

impl State {
    #[allow(clippy::too_many_arguments)]
    fn insert(
        &mut self,
        queue_name: &str,
        payload: &hireflow_core::payload::JobPayload,
        correlation_id: &str,
        max_attempts: i32,
        parent_id: Option<DbId>,
        is_flow_parent: bool,
        child_index: Option<i32>,
        child_total: Option<i32>,
        now: Timestamp,
    ) -> Job {
        self.next_id += 1;
        let job = Job {
            id: self.next_id,
            queue_name: queue_name.to_string(),
            kind: payload.kind(),
            payload: payload.body(),
            status: JobStatus::Pending,
            correlation_id: correlation_id.to_string(),
            attempts: 0,
            max_attempts,
            parent_id,
            is_flow_parent,
            child_index,
            child_total,
            progress_percent: 0,
            progress_message: None,
            result: None,
            error: None,
            lease_id: None,
            lease_expires_at: None,
            run_at: now,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };
        self.jobs.insert(job.id, job.clone());
        job
    }

    /// The job behind `lease`, if the lease is still the one recorded on it.
    fn leased_mut(&mut self, lease: &Lease) -> Result<&mut Job, StoreError> {
        match self.jobs.get_mut(&lease.job_id) {
            Some(job) if job.status == JobStatus::Active && job.lease_id == Some(lease.lease_id) => {
                Ok(job)
            }
            _ => Err(StoreError::LeaseLost {
                job_id: lease.job_id,
            }),
        }
    }

    /// Remove a root job and all its children.
    fn remove_tree(&mut self, root_id: DbId) {
        self.jobs.remove(&root_id);
        self.jobs.retain(|_, job| job.parent_id != Some(root_id));
    }
}

fn release(job: &mut Job, now: Timestamp) {
    job.lease_id = None;
    job.lease_expires_at = None;
    job.updated_at = now;
}

#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<State>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs, children included.
    pub async fn len(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Force a job's lease to be already expired.
    pub async fn expire_lease(&self, job_id: DbId) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.lease_expires_at.is_some() {
                job.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
            }
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, input: NewJob) -> Result<Job, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state.insert(
            &input.queue_name,
            &input.payload,
            &input.correlation_id,
            input.max_attempts,
            None,
            false,
            None,
            None,
            Utc::now(),
        ))
    }

    async fn insert_flow(&self, input: NewFlow) -> Result<(Job, Vec<Job>), StoreError> {
        let now = Utc::now();
        let total = input.children.len() as i32;
        let mut state = self.state.lock().await;

        let parent = state.insert(
            &input.queue_name,
            &input.parent,
            &input.correlation_id,
            input.max_attempts,
            None,
            true,
            None,
            Some(total),
            now,
        );
        let children = input
            .children
            .iter()
            .enumerate()
            .map(|(i, payload)| {
                state.insert(
                    &input.queue_name,
                    payload,
                    &input.correlation_id,
                    input.max_attempts,
                    Some(parent.id),
                    false,
                    Some(i as i32 + 1),
                    Some(total),
                    now,
                )
            })
            .collect();
        Ok((parent, children))
    }

    async fn claim_next(
        &self,
        queue: &str,
        lease_duration: Duration,
    ) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let next = state.jobs.values_mut().find(|job| {
            job.queue_name == queue
                && job.status == JobStatus::Pending
                && !job.is_flow_parent
                && job.run_at <= now
        });

        Ok(next.map(|job| {
            job.status = JobStatus::Active;
            job.attempts += 1;
            job.lease_id = Some(Uuid::new_v4());
            job.lease_expires_at = Some(deadline(now, lease_duration));
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn reap_expired(&self, queue: &str) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let reaped = state
            .jobs
            .values_mut()
            .filter(|job| {
                job.queue_name == queue
                    && job.status == JobStatus::Active
                    && job.lease_expires_at.is_some_and(|at| at < now)
            })
            .map(|job| {
                if job.attempts >= job.max_attempts {
                    job.status = JobStatus::Failed;
                    job.finished_at = Some(now);
                } else {
                    job.status = JobStatus::Pending;
                }
                job.error = Some(LEASE_EXPIRED_ERROR.to_string());
                job.run_at = now;
                release(job, now);
                job.clone()
            })
            .collect();
        Ok(reaped)
    }

    async fn update_progress(
        &self,
        lease: &Lease,
        percent: i16,
        message: Option<&str>,
        lease_duration: Duration,
    ) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let job = state.leased_mut(lease)?;
        job.progress_percent = percent;
        job.progress_message = message.map(str::to_string);
        job.lease_expires_at = Some(deadline(now, lease_duration));
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn complete(
        &self,
        lease: &Lease,
        result: &serde_json::Value,
    ) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let job = state.leased_mut(lease)?;
        job.status = JobStatus::Completed;
        job.result = Some(result.clone());
        job.error = None;
        job.progress_percent = 100;
        job.finished_at = Some(now);
        release(job, now);
        Ok(job.clone())
    }

    async fn retry_later(
        &self,
        lease: &Lease,
        error: &str,
        delay: Duration,
    ) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let job = state.leased_mut(lease)?;
        job.status = JobStatus::Pending;
        job.error = Some(error.to_string());
        job.run_at = deadline(now, delay);
        release(job, now);
        Ok(job.clone())
    }

    async fn fail(&self, lease: &Lease, error: &str) -> Result<Job, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let job = state.leased_mut(lease)?;
        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.finished_at = Some(now);
        release(job, now);
        Ok(job.clone())
    }

    async fn complete_flow_parent(
        &self,
        parent_id: DbId,
        result: &serde_json::Value,
    ) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&parent_id) {
            Some(job) if job.is_flow_parent && job.status == JobStatus::Pending => {
                job.status = JobStatus::Completed;
                job.result = Some(result.clone());
                job.progress_percent = 100;
                job.finished_at = Some(now);
                job.updated_at = now;
                Ok(Some(job.clone()))
            }
            Some(_) => Ok(None),
            None => Err(StoreError::NotFound(parent_id)),
        }
    }

    async fn find_by_id(&self, id: DbId) -> Result<Option<Job>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn find_latest_root(&self, correlation_id: &str) -> Result<Option<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .rev()
            .find(|job| job.parent_id.is_none() && job.correlation_id == correlation_id)
            .cloned())
    }

    async fn list_children(&self, parent_id: DbId) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        let mut children: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|job| job.child_index);
        Ok(children)
    }

    async fn list_open_flow_parents(&self) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.is_flow_parent && job.status == JobStatus::Pending)
            .cloned()
            .collect())
    }

    async fn purge_retained(&self, policy: RetentionPolicy) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut purged = 0;

        for (status, keep) in [
            (JobStatus::Completed, policy.keep_completed),
            (JobStatus::Failed, policy.keep_failed),
        ] {
            let mut finished: Vec<(Option<Timestamp>, DbId)> = state
                .jobs
                .values()
                .filter(|job| job.parent_id.is_none() && job.status == status)
                .map(|job| (job.finished_at, job.id))
                .collect();
            // Most recently finished first.
            finished.sort_unstable_by(|a, b| b.cmp(a));

            for (_, id) in finished.into_iter().skip(keep) {
                state.remove_tree(id);
                purged += 1;
            }
        }
        Ok(purged)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use hireflow_core::payload::JobPayload;
    use serde_json::json;

    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    fn parse_resume(candidate: &str) -> JobPayload {
        JobPayload::from_parts(
            "parse_resume",
            json!({"candidate_id": candidate, "resume_uri": format!("s3://resumes/{candidate}.pdf")}),
        )
        .unwrap()
    }

    fn new_job(queue: &str, max_attempts: i32) -> NewJob {
        NewJob {
            queue_name: queue.to_string(),
            payload: parse_resume("c-1"),
            correlation_id: "corr-1".to_string(),
            max_attempts,
        }
    }

    fn new_flow(children: usize) -> NewFlow {
        NewFlow {
            queue_name: "resumes".to_string(),
            correlation_id: "flow-corr".to_string(),
            max_attempts: 3,
            parent: JobPayload::from_parts("screen_batch", json!({"hiring_job_id": "h-1"}))
                .unwrap(),
            children: (0..children)
                .map(|i| parse_resume(&format!("c-{i}")))
                .collect(),
        }
    }

    #[tokio::test]
    async fn claim_is_fifo_and_exclusive() {
        let store = MemoryJobStore::new();
        let first = store.insert(new_job("resumes", 3)).await.unwrap();
        let second = store.insert(new_job("resumes", 3)).await.unwrap();

        let a = store.claim_next("resumes", LEASE).await.unwrap().unwrap();
        let b = store.claim_next("resumes", LEASE).await.unwrap().unwrap();
        assert_eq!(a.id, first.id);
        assert_eq!(b.id, second.id);
        assert_eq!(a.attempts, 1);
        assert!(a.lease().is_some());
        assert!(store.claim_next("resumes", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_respects_queue_and_skips_flow_parent() {
        let store = MemoryJobStore::new();
        store.insert(new_job("scoring", 3)).await.unwrap();
        let (parent, children) = store.insert_flow(new_flow(1)).await.unwrap();

        let claimed = store.claim_next("resumes", LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, children[0].id);
        assert_ne!(claimed.id, parent.id);
        assert!(store.claim_next("resumes", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flow_children_are_indexed_and_inherit_correlation() {
        let store = MemoryJobStore::new();
        let (parent, children) = store.insert_flow(new_flow(3)).await.unwrap();

        assert!(parent.is_flow_parent);
        assert_eq!(parent.child_total, Some(3));
        for (i, child) in children.iter().enumerate() {
            assert_eq!(child.parent_id, Some(parent.id));
            assert_eq!(child.child_index, Some(i as i32 + 1));
            assert_eq!(child.child_total, Some(3));
            assert_eq!(child.correlation_id, "flow-corr");
        }
        let listed = store.list_children(parent.id).await.unwrap();
        assert_eq!(listed, children);
    }

    #[tokio::test]
    async fn latest_root_ignores_children_and_older_roots() {
        let store = MemoryJobStore::new();
        store.insert(new_job("resumes", 3)).await.unwrap();
        let newer = store.insert(new_job("resumes", 3)).await.unwrap();
        let (parent, _) = store.insert_flow(new_flow(2)).await.unwrap();

        let root = store.find_latest_root("corr-1").await.unwrap().unwrap();
        assert_eq!(root.id, newer.id);
        let root = store.find_latest_root("flow-corr").await.unwrap().unwrap();
        assert_eq!(root.id, parent.id);
        assert!(store.find_latest_root("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_lease_cannot_mutate() {
        let store = MemoryJobStore::new();
        store.insert(new_job("resumes", 3)).await.unwrap();
        let job = store.claim_next("resumes", LEASE).await.unwrap().unwrap();
        let lease = job.lease().unwrap();

        let stale = Lease {
            lease_id: Uuid::new_v4(),
            ..lease
        };
        let err = store.complete(&stale, &json!({})).await.unwrap_err();
        assert_matches!(err, StoreError::LeaseLost { job_id } if job_id == job.id);

        let done = store.complete(&lease, &json!({"ok": true})).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress_percent, 100);

        let err = store.fail(&lease, "late").await.unwrap_err();
        assert_matches!(err, StoreError::LeaseLost { .. });
    }

    #[tokio::test]
    async fn retry_later_delays_next_claim() {
        let store = MemoryJobStore::new();
        store.insert(new_job("resumes", 3)).await.unwrap();
        let job = store.claim_next("resumes", LEASE).await.unwrap().unwrap();

        let pending = store
            .retry_later(&job.lease().unwrap(), "boom", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(pending.status, JobStatus::Pending);
        assert_eq!(pending.error.as_deref(), Some("boom"));
        assert!(store.claim_next("resumes", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reaping_repends_or_fails_by_attempts() {
        let store = MemoryJobStore::new();
        store.insert(new_job("resumes", 1)).await.unwrap();
        store.insert(new_job("resumes", 2)).await.unwrap();
        let exhausted = store.claim_next("resumes", LEASE).await.unwrap().unwrap();
        let retryable = store.claim_next("resumes", LEASE).await.unwrap().unwrap();
        store.expire_lease(exhausted.id).await;
        store.expire_lease(retryable.id).await;

        let reaped = store.reap_expired("resumes").await.unwrap();
        assert_eq!(reaped.len(), 2);
        assert_eq!(reaped[0].status, JobStatus::Failed);
        assert_eq!(reaped[1].status, JobStatus::Pending);
        assert!(reaped.iter().all(|job| job.lease().is_none()));

        let again = store.claim_next("resumes", LEASE).await.unwrap().unwrap();
        assert_eq!(again.id, retryable.id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn progress_extends_lease() {
        let store = MemoryJobStore::new();
        store.insert(new_job("resumes", 3)).await.unwrap();
        let job = store
            .claim_next("resumes", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let lease = job.lease().unwrap();

        let updated = store
            .update_progress(&lease, 40, Some("parsing"), LEASE)
            .await
            .unwrap();
        assert_eq!(updated.progress_percent, 40);
        assert!(updated.lease_expires_at.unwrap() > lease.expires_at);
    }

    #[tokio::test]
    async fn flow_parent_completes_once() {
        let store = MemoryJobStore::new();
        let (parent, _) = store.insert_flow(new_flow(1)).await.unwrap();

        let first = store.complete_flow_parent(parent.id, &json!({})).await.unwrap();
        let second = store.complete_flow_parent(parent.id, &json!({})).await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
        assert!(store.list_open_flow_parents().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_keeps_newest_and_cascades_children() {
        let store = MemoryJobStore::new();
        let (parent, _) = store.insert_flow(new_flow(2)).await.unwrap();
        store.complete_flow_parent(parent.id, &json!({})).await.unwrap();
        store.insert(new_job("scoring", 3)).await.unwrap();
        let newest = store.claim_next("scoring", LEASE).await.unwrap().unwrap();
        store
            .complete(&newest.lease().unwrap(), &json!({}))
            .await
            .unwrap();

        let purged = store
            .purge_retained(RetentionPolicy {
                keep_completed: 1,
                keep_failed: 10,
            })
            .await
            .unwrap();

        assert_eq!(purged, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.find_by_id(newest.id).await.unwrap().is_some());
        assert!(store.find_by_id(parent.id).await.unwrap().is_none());
    }
}
