//! Hireflow event bus.
//!
//! - [`EventBus`]: in-process hub with two channels. The lifecycle firehose
//!   carries every [`JobEvent`] to internal consumers (the flow coordinator);
//!   per-correlation topics carry sequenced [`ProgressEvent`]s to live
//!   subscribers.
//! - [`LiveUpdate`]: the JSON frame sent to external subscribers.

pub mod bus;
pub mod event;

pub use bus::{EventBus, Subscription};
pub use event::{EventKind, JobEvent, LiveUpdate, ProgressEvent, ProgressUpdate};
