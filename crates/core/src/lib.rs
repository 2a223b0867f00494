pub mod error;
pub mod flow;
pub mod job_events;
pub mod payload;
pub mod retry;
pub mod settings;
pub mod types;
