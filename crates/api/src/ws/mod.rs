//! Live-update WebSocket infrastructure.
//!
//! Provides the correlation-keyed [`Broadcaster`], the keep-alive task, and
//! the HTTP upgrade handler used by Axum routes.

pub mod broadcaster;
mod handler;
mod keepalive;

pub use broadcaster::{Broadcaster, WsSender};
pub use handler::ws_handler;
pub use keepalive::start_keepalive;
