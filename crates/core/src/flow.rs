//! Flow aggregation.
//!
//! A flow's state is always derived from a snapshot of its children; nothing
//! here is stored.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Upper bound on children per flow.
pub const MAX_FLOW_CHILDREN: usize = 1_000;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Aggregate state of a flow.
///
/// `Pending -> Partial -> Complete | CompleteWithFailures`; never reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Partial,
    Complete,
    CompleteWithFailures,
}

/// How a single child currently stands, as far as the flow is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildOutcome {
    Open,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowCounts {
    pub total: u32,
    pub completed_count: u32,
    pub failed_count: u32,
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

impl FlowCounts {
    pub fn tally<I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = ChildOutcome>,
    {
        outcomes
            .into_iter()
            .fold(Self::default(), |mut counts, outcome| {
                counts.total += 1;
                match outcome {
                    ChildOutcome::Completed => counts.completed_count += 1,
                    ChildOutcome::Failed => counts.failed_count += 1,
                    ChildOutcome::Open => {}
                }
                counts
            })
    }

    pub fn terminal_count(&self) -> u32 {
        self.completed_count + self.failed_count
    }

    pub fn is_complete(&self) -> bool {
        self.terminal_count() >= self.total
    }

    /// `round(100 * terminal / total)`, half rounding up.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let done = u64::from(self.terminal_count().min(self.total));
        let total = u64::from(self.total);
        ((200 * done + total) / (2 * total)) as u8
    }

    pub fn status(&self) -> FlowStatus {
        if self.is_complete() {
            if self.failed_count == 0 {
                FlowStatus::Complete
            } else {
                FlowStatus::CompleteWithFailures
            }
        } else if self.terminal_count() == 0 {
            FlowStatus::Pending
        } else {
            FlowStatus::Partial
        }
    }
}

/// Check the child count of a flow about to be created.
pub fn validate_child_count(count: usize) -> Result<(), CoreError> {
    if count == 0 {
        return Err(CoreError::Validation(
            "A flow needs at least one child".to_string(),
        ));
    }
    if count > MAX_FLOW_CHILDREN {
        return Err(CoreError::Validation(format!(
            "A flow may have at most {MAX_FLOW_CHILDREN} children, got {count}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
