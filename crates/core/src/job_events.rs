//! Live-update message types and lifecycle stage names.
//!
//! The message types are the `type` field of every frame sent to a live
//! subscriber. Stage names travel in the `stage` field and identify which
//! lifecycle transition (or handler-reported step) produced the event.

/// First frame on every live connection.
pub const MSG_TYPE_CONNECTED: &str = "connected";

/// Progress update (job step, retry, or flow aggregate).
pub const MSG_TYPE_PROGRESS: &str = "progress";

/// Job or flow completed.
pub const MSG_TYPE_COMPLETED: &str = "completed";

/// Job failed permanently.
pub const MSG_TYPE_FAILED: &str = "failed";

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Job accepted and waiting for a worker.
pub const STAGE_QUEUED: &str = "queued";

/// Job leased by a worker slot.
pub const STAGE_ACTIVE: &str = "active";

/// Job failed and was scheduled for another attempt.
pub const STAGE_RETRYING: &str = "retrying";

/// Job finished successfully.
pub const STAGE_COMPLETED: &str = "completed";

/// Job exhausted its attempts (or failed permanently).
pub const STAGE_FAILED: &str = "failed";

/// A flow child reached `completed`.
pub const STAGE_CHILD_COMPLETED: &str = "child_completed";

/// A flow child reached `failed`.
pub const STAGE_CHILD_FAILED: &str = "child_failed";

/// Every child of a flow is terminal.
pub const STAGE_FLOW_COMPLETED: &str = "flow_completed";
