mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{parse_resume, score, Harness};
use hireflow_core::error::CoreError;
use hireflow_core::job_events::{STAGE_ACTIVE, STAGE_COMPLETED, STAGE_QUEUED, STAGE_RETRYING};
use hireflow_db::models::status::JobStatus;
use hireflow_events::EventKind;
use hireflow_worker::EnqueueOptions;
use serde_json::json;

// ---------------------------------------------------------------------------
// Enqueue / dequeue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn enqueue_then_dequeue_leases_job() {
    let h = Harness::new();
    let job = h
        .queue
        .enqueue("resumes", parse_resume("c-1"), EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
    assert!(!job.correlation_id.is_empty());

    let leased = h.queue.dequeue("resumes").await.unwrap().unwrap();
    assert_eq!(leased.id, job.id);
    assert_eq!(leased.status, JobStatus::Active);
    assert_eq!(leased.attempts, 1);
    assert!(leased.lease().is_some());
}

#[tokio::test]
async fn dequeue_only_sees_its_own_queue() {
    let h = Harness::new();
    h.queue
        .enqueue("scoring", score("c-1"), EnqueueOptions::default())
        .await
        .unwrap();

    assert!(h.queue.dequeue("resumes").await.unwrap().is_none());
    assert!(h.queue.dequeue("scoring").await.unwrap().is_some());
}

#[tokio::test]
async fn jobs_are_dequeued_in_enqueue_order() {
    let h = Harness::new();
    let mut ids = Vec::new();
    for n in 0..3 {
        let job = h
            .queue
            .enqueue("resumes", parse_resume(&format!("c-{n}")), EnqueueOptions::default())
            .await
            .unwrap();
        ids.push(job.id);
    }

    for id in ids {
        assert_eq!(h.queue.dequeue("resumes").await.unwrap().unwrap().id, id);
    }
}

#[tokio::test]
async fn enqueue_rejects_bad_options() {
    let h = Harness::new();

    let err = h
        .queue
        .enqueue("bad queue", parse_resume("c"), EnqueueOptions::default())
        .await
        .unwrap_err();
    assert_matches!(err, CoreError::Validation(_));

    let err = h
        .queue
        .enqueue(
            "resumes",
            parse_resume("c"),
            EnqueueOptions {
                max_attempts: Some(0),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, CoreError::Validation(_));

    assert!(h.store.is_empty().await);
}

#[tokio::test]
async fn caller_correlation_id_is_kept() {
    let h = Harness::new();
    let job = h
        .queue
        .enqueue(
            "resumes",
            parse_resume("c"),
            EnqueueOptions {
                correlation_id: Some("upload-77".into()),
                max_attempts: Some(5),
            },
        )
        .await
        .unwrap();
    assert_eq!(job.correlation_id, "upload-77");
    assert_eq!(job.max_attempts, 5);
}

// ---------------------------------------------------------------------------
// Long polling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_queue_times_out() {
    let h = Harness::new();
    let started = std::time::Instant::now();
    let next = h
        .queue
        .dequeue_timeout("resumes", Duration::from_millis(40))
        .await
        .unwrap();
    assert!(next.is_none());
    assert!(started.elapsed() >= Duration::from_millis(40));
}

#[tokio::test]
async fn waiting_dequeue_wakes_on_enqueue() {
    let h = Harness::new();
    let queue = Arc::clone(&h.queue);
    let waiter =
        tokio::spawn(async move { queue.dequeue_timeout("resumes", Duration::from_secs(5)).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let job = h
        .queue
        .enqueue("resumes", parse_resume("c"), EnqueueOptions::default())
        .await
        .unwrap();

    let leased = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("dequeue was not woken")
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(leased.id, job.id);
}

#[tokio::test]
async fn concurrent_dequeues_never_share_a_job() {
    let h = Harness::new();
    for n in 0..20 {
        h.queue
            .enqueue("resumes", parse_resume(&format!("c-{n}")), EnqueueOptions::default())
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let queue = Arc::clone(&h.queue);
        tasks.push(tokio::spawn(async move {
            let mut got = Vec::new();
            while let Some(job) = queue
                .dequeue_timeout("resumes", Duration::from_millis(20))
                .await
                .unwrap()
            {
                got.push(job.id);
            }
            got
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
}

// ---------------------------------------------------------------------------
// Completion and failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ack_stores_result() {
    let h = Harness::new();
    h.queue
        .enqueue("scoring", score("c"), EnqueueOptions::default())
        .await
        .unwrap();
    let job = h.queue.dequeue("scoring").await.unwrap().unwrap();

    let done = h
        .queue
        .ack(&job.lease().unwrap(), json!({"score": 0.9}))
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result, Some(json!({"score": 0.9})));
    assert_eq!(done.progress_percent, 100);
    assert!(done.finished_at.is_some());
}

#[tokio::test]
async fn retryable_failures_stop_at_max_attempts() {
    let h = Harness::new();
    let job = h
        .queue
        .enqueue("resumes", parse_resume("c"), EnqueueOptions::default())
        .await
        .unwrap();

    for attempt in 1..=3 {
        let leased = h
            .queue
            .dequeue_timeout("resumes", Duration::from_secs(2))
            .await
            .unwrap()
            .expect("retry should become runnable after backoff");
        assert_eq!(leased.attempts, attempt);

        let after = h
            .queue
            .fail(&leased.lease().unwrap(), "upstream timeout", false)
            .await
            .unwrap();
        if attempt < 3 {
            assert_eq!(after.status, JobStatus::Pending);
            assert!(after.run_at > leased.run_at);
        } else {
            assert_eq!(after.status, JobStatus::Failed);
        }
        assert_eq!(after.error.as_deref(), Some("upstream timeout"));
    }

    let final_job = h.queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(final_job.attempts, 3);
    assert!(h
        .queue
        .dequeue_timeout("resumes", Duration::from_millis(50))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn permanent_failure_skips_remaining_attempts() {
    let h = Harness::new();
    h.queue
        .enqueue("resumes", parse_resume("c"), EnqueueOptions::default())
        .await
        .unwrap();
    let leased = h.queue.dequeue("resumes").await.unwrap().unwrap();

    let failed = h
        .queue
        .fail(&leased.lease().unwrap(), "resume is not a PDF", true)
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.attempts, 1);
}

#[tokio::test]
async fn progress_is_recorded() {
    let h = Harness::new();
    h.queue
        .enqueue("resumes", parse_resume("c"), EnqueueOptions::default())
        .await
        .unwrap();
    let leased = h.queue.dequeue("resumes").await.unwrap().unwrap();

    let job = h
        .queue
        .report_progress(&leased.lease().unwrap(), "extracting", 40, Some("Reading pages"))
        .await
        .unwrap();
    assert_eq!(job.progress_percent, 40);
    assert_eq!(job.progress_message.as_deref(), Some("Reading pages"));
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn expired_lease_is_reaped_and_old_holder_rejected() {
    let h = Harness::new();
    h.queue
        .enqueue("resumes", parse_resume("c"), EnqueueOptions::default())
        .await
        .unwrap();
    let first = h.queue.dequeue("resumes").await.unwrap().unwrap();
    let stale = first.lease().unwrap();

    h.store.expire_lease(first.id).await;

    let second = h.queue.dequeue("resumes").await.unwrap().unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.attempts, 2);
    assert_ne!(second.lease().unwrap().lease_id, stale.lease_id);

    let err = h.queue.ack(&stale, json!({})).await.unwrap_err();
    assert_matches!(err, CoreError::Conflict(_));
    let err = h
        .queue
        .report_progress(&stale, "late", 50, None)
        .await
        .unwrap_err();
    assert_matches!(err, CoreError::Conflict(_));

    h.queue
        .ack(&second.lease().unwrap(), json!({"ok": true}))
        .await
        .unwrap();
}

#[tokio::test]
async fn expired_lease_on_last_attempt_fails_job() {
    let h = Harness::new();
    let job = h
        .queue
        .enqueue(
            "resumes",
            parse_resume("c"),
            EnqueueOptions {
                max_attempts: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.queue.dequeue("resumes").await.unwrap().unwrap();
    h.store.expire_lease(job.id).await;

    assert!(h
        .queue
        .dequeue_timeout("resumes", Duration::from_millis(20))
        .await
        .unwrap()
        .is_none());
    let reaped = h.queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(reaped.status, JobStatus::Failed);
    assert!(reaped.error.is_some());
}

// ---------------------------------------------------------------------------
// Lifecycle events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transitions_are_emitted_in_order() {
    let h = Harness::new();
    let mut events = h.bus.subscribe_lifecycle();

    h.queue
        .enqueue("resumes", parse_resume("c"), EnqueueOptions::default())
        .await
        .unwrap();
    let leased = h.queue.dequeue("resumes").await.unwrap().unwrap();
    h.queue
        .fail(&leased.lease().unwrap(), "flaky", false)
        .await
        .unwrap();
    let leased = h
        .queue
        .dequeue_timeout("resumes", Duration::from_secs(2))
        .await
        .unwrap()
        .unwrap();
    h.queue
        .ack(&leased.lease().unwrap(), json!({"parsed": true}))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push((event.kind, event.stage));
    }
    assert_eq!(
        seen,
        vec![
            (EventKind::Progress, STAGE_QUEUED.to_string()),
            (EventKind::Progress, STAGE_ACTIVE.to_string()),
            (EventKind::Progress, STAGE_RETRYING.to_string()),
            (EventKind::Progress, STAGE_ACTIVE.to_string()),
            (EventKind::Completed, STAGE_COMPLETED.to_string()),
        ]
    );
}
