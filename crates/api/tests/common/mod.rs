#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use hireflow_api::config::ServerConfig;
use hireflow_api::router::build_app_router;
use hireflow_api::state::AppState;
use hireflow_api::ws::Broadcaster;
use hireflow_core::retry::RetryPolicy;
use hireflow_core::settings::QueueSettings;
use hireflow_db::store::{JobStore, MemoryJobStore};
use hireflow_events::EventBus;
use hireflow_worker::{FlowCoordinator, QueueStore, WorkerPool};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        ws_keepalive_secs: 30,
    }
}

/// Queue settings scaled down for tests.
pub fn test_settings() -> QueueSettings {
    QueueSettings {
        max_attempts: 3,
        retry: RetryPolicy::new(Duration::from_millis(10)),
        lease_duration: Duration::from_secs(30),
        dequeue_timeout: Duration::from_millis(50),
        poll_interval: Duration::from_millis(5),
    }
}

/// Everything behind one test server: the state handed to the router plus
/// direct handles for driving jobs.
pub struct TestServer {
    pub state: AppState,
    pub store: Arc<MemoryJobStore>,
    pub pool: Arc<WorkerPool>,
    pub cancel: CancellationToken,
}

impl TestServer {
    pub fn new() -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let event_bus = Arc::new(EventBus::default());
        let queue = Arc::new(QueueStore::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            Arc::clone(&event_bus),
            test_settings(),
        ));
        let coordinator = Arc::new(FlowCoordinator::new(Arc::clone(&queue)));
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&coordinator)));
        let pool = Arc::new(WorkerPool::new(Arc::clone(&queue)));

        let state = AppState {
            queue,
            coordinator,
            broadcaster,
            event_bus,
            config: Arc::new(test_config()),
        };
        Self {
            state,
            store,
            pool,
            cancel: CancellationToken::new(),
        }
    }

    /// Start the lifecycle relay that feeds correlation topics.
    pub fn start_relay(&self) {
        let events = self.state.event_bus.subscribe_lifecycle();
        tokio::spawn(
            Arc::clone(&self.state.coordinator).run(events, self.cancel.clone()),
        );
    }

    /// The full application router with all middleware layers.
    pub fn app(&self) -> Router {
        build_app_router(self.state.clone(), &test_config())
    }

    /// Serve the app on an ephemeral port and return its address.
    pub async fn serve(&self) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = self.app();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
        self.cancel.cancel();
    }
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response<Body> {
    app.oneshot(
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}
