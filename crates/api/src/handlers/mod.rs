//! Request handlers.
//!
//! Each submodule provides async handler functions for one resource.
//! Handlers delegate to the queue store or flow coordinator and map errors
//! via [`AppError`](crate::error::AppError).

pub mod flows;
pub mod jobs;
