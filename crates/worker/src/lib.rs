//! Job execution for hireflow.
//!
//! - [`QueueStore`]: enqueue, leased dequeue, ack/fail with retry, progress.
//! - [`FlowCoordinator`]: atomic flow creation and parent completion, plus
//!   the relay from lifecycle events to correlation topics.
//! - [`WorkerPool`]: per-queue slots running registered [`JobHandler`]s.
//! - [`retention`]: periodic purge of finished jobs.

pub mod config;
pub mod flow;
pub mod handlers;
pub mod pool;
pub mod queue;
pub mod retention;

pub use config::{QueueSpec, WorkerConfig};
pub use flow::{CreatedFlow, FlowCoordinator, FlowSummary};
pub use pool::{handler_fn, HandlerError, JobContext, JobHandler, WorkerPool};
pub use queue::{EnqueueOptions, QueueStore};
