#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hireflow_core::payload::JobPayload;
use hireflow_core::retry::RetryPolicy;
use hireflow_core::settings::QueueSettings;
use hireflow_core::types::DbId;
use hireflow_db::models::job::Job;
use hireflow_db::store::{JobStore, MemoryJobStore};
use hireflow_events::{EventBus, ProgressEvent, Subscription};
use hireflow_worker::{FlowCoordinator, QueueStore, WorkerPool};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Queue settings scaled down so retries and polling finish in milliseconds.
pub fn fast_settings() -> QueueSettings {
    QueueSettings {
        max_attempts: 3,
        retry: RetryPolicy::new(Duration::from_millis(10)),
        lease_duration: Duration::from_secs(30),
        dequeue_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
    }
}

/// The full in-process stack over a memory store.
pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub bus: Arc<EventBus>,
    pub queue: Arc<QueueStore>,
    pub coordinator: Arc<FlowCoordinator>,
    pub pool: Arc<WorkerPool>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(fast_settings())
    }

    pub fn with_settings(settings: QueueSettings) -> Self {
        Self::build(settings, EventBus::default())
    }

    /// A harness whose lifecycle channel holds only `capacity` events.
    pub fn with_lifecycle_capacity(capacity: usize) -> Self {
        Self::build(fast_settings(), EventBus::new(capacity))
    }

    fn build(settings: QueueSettings, bus: EventBus) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let bus = Arc::new(bus);
        let queue = Arc::new(QueueStore::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            Arc::clone(&bus),
            settings,
        ));
        let coordinator = Arc::new(FlowCoordinator::new(Arc::clone(&queue)));
        let pool = Arc::new(WorkerPool::new(Arc::clone(&queue)));
        Self {
            store,
            bus,
            queue,
            coordinator,
            pool,
            cancel: CancellationToken::new(),
        }
    }

    /// Start the coordinator relay. Call before starting pool slots.
    pub fn start_relay(&self) -> JoinHandle<()> {
        let events = self.bus.subscribe_lifecycle();
        let coordinator = Arc::clone(&self.coordinator);
        tokio::spawn(coordinator.run(events, self.cancel.clone()))
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        self.cancel.cancel();
    }

    /// Poll until the job reaches a terminal status.
    pub async fn wait_terminal(&self, job_id: DbId) -> Job {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                if let Some(job) = self.queue.get(job_id).await.unwrap() {
                    if job.status.is_terminal() {
                        return job;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not finish in time")
    }
}

/// Collect events until the subscription closes.
pub async fn drain(mut sub: Subscription) -> Vec<ProgressEvent> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let mut events = Vec::new();
        while let Some(event) = sub.recv().await {
            events.push(event);
        }
        events
    })
    .await
    .expect("subscription did not close in time")
}

/// Assert sequence strictly increases and percent never decreases.
pub fn assert_monotonic(events: &[ProgressEvent]) {
    for pair in events.windows(2) {
        assert!(
            pair[1].sequence > pair[0].sequence,
            "sequence went from {} to {}",
            pair[0].sequence,
            pair[1].sequence
        );
    }
    let percents: Vec<u8> = events.iter().filter_map(|e| e.percent).collect();
    for pair in percents.windows(2) {
        assert!(pair[1] >= pair[0], "percent went from {} to {}", pair[0], pair[1]);
    }
}

// ---------------------------------------------------------------------------
// Payload builders
// ---------------------------------------------------------------------------

pub fn parse_resume(candidate: &str) -> JobPayload {
    JobPayload::from_parts(
        "parse_resume",
        json!({"candidate_id": candidate, "resume_uri": format!("s3://resumes/{candidate}.pdf")}),
    )
    .unwrap()
}

pub fn score(candidate: &str) -> JobPayload {
    JobPayload::from_parts(
        "score_candidate",
        json!({"candidate_id": candidate, "hiring_job_id": "h-1"}),
    )
    .unwrap()
}

pub fn screen_batch() -> JobPayload {
    JobPayload::from_parts("screen_batch", json!({"hiring_job_id": "h-1"})).unwrap()
}
