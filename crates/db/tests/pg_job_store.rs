//! Postgres-backed store tests. They need a live database, so they are
//! ignored by default; run with `DATABASE_URL=... cargo test -- --ignored`.

use std::time::Duration;

use hireflow_core::payload::JobPayload;
use hireflow_db::models::job::{NewFlow, NewJob};
use hireflow_db::models::status::JobStatus;
use hireflow_db::store::{JobStore, PgJobStore, StoreError};
use serde_json::json;
use sqlx::PgPool;

const LEASE: Duration = Duration::from_secs(60);

fn score(candidate: &str) -> JobPayload {
    JobPayload::from_parts(
        "score_candidate",
        json!({"candidate_id": candidate, "hiring_job_id": "h-1"}),
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// Test: claim leases each job once
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires a Postgres DATABASE_URL"]
async fn claim_next_is_exclusive(pool: PgPool) {
    let store = PgJobStore::new(pool);
    for c in ["c-1", "c-2"] {
        store
            .insert(NewJob {
                queue_name: "scoring".into(),
                payload: score(c),
                correlation_id: "corr".into(),
                max_attempts: 3,
            })
            .await
            .unwrap();
    }

    let (a, b) = tokio::join!(
        store.claim_next("scoring", LEASE),
        store.claim_next("scoring", LEASE)
    );
    let (a, b) = (a.unwrap().unwrap(), b.unwrap().unwrap());
    assert_ne!(a.id, b.id);
    assert!(store.claim_next("scoring", LEASE).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Test: flow insert and parent completion
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
#[ignore = "requires a Postgres DATABASE_URL"]
async fn flow_round_trip(pool: PgPool) {
    let store = PgJobStore::new(pool);
    let (parent, children) = store
        .insert_flow(NewFlow {
            queue_name: "scoring".into(),
            correlation_id: "flow".into(),
            max_attempts: 3,
            parent: JobPayload::from_parts("screen_batch", json!({"hiring_job_id": "h-1"}))
                .unwrap(),
            children: vec![score("c-1"), score("c-2")],
        })
        .await
        .unwrap();

    assert_eq!(children.len(), 2);
    assert_eq!(store.list_children(parent.id).await.unwrap(), children);

    let claimed = store.claim_next("scoring", LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.id, children[0].id);

    let lease = claimed.lease().unwrap();
    let done = store.complete(&lease, &json!({"score": 0.8})).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);

    let err = store.fail(&lease, "late").await.unwrap_err();
    assert!(matches!(err, StoreError::LeaseLost { .. }));

    assert!(store
        .complete_flow_parent(parent.id, &json!({}))
        .await
        .unwrap()
        .is_some());
    assert!(store
        .complete_flow_parent(parent.id, &json!({}))
        .await
        .unwrap()
        .is_none());
}
