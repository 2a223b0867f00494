use std::sync::Arc;

use hireflow_events::EventBus;
use hireflow_worker::{FlowCoordinator, QueueStore};

use crate::config::ServerConfig;
use crate::ws::Broadcaster;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; every field is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Named job queues over the configured store.
    pub queue: Arc<QueueStore>,
    pub coordinator: Arc<FlowCoordinator>,
    /// Live connections keyed by correlation id.
    pub broadcaster: Arc<Broadcaster>,
    pub event_bus: Arc<EventBus>,
    pub config: Arc<ServerConfig>,
}
