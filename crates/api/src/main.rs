use std::sync::Arc;
use std::time::Duration;

use hireflow_api::config::ServerConfig;
use hireflow_api::router::build_app_router;
use hireflow_api::state::AppState;
use hireflow_api::ws;
use hireflow_core::payload::JobKind;
use hireflow_db::store::{JobStore, MemoryJobStore, PgJobStore};
use hireflow_events::EventBus;
use hireflow_worker::handlers::AiDelegateHandler;
use hireflow_worker::{retention, FlowCoordinator, QueueStore, WorkerConfig, WorkerPool};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "hireflow_api=debug,hireflow_worker=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");
    let worker_config = WorkerConfig::from_env();
    tracing::info!(queues = ?worker_config.queues, "Loaded worker configuration");

    // --- Job store ---
    let store: Arc<dyn JobStore> = match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = hireflow_db::create_pool(&database_url)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Database connection pool created");

            hireflow_db::health_check(&pool)
                .await
                .expect("Database health check failed");

            hireflow_db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Database migrations applied");

            Arc::new(PgJobStore::new(pool))
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, jobs are kept in memory and lost on restart");
            Arc::new(MemoryJobStore::new())
        }
    };

    // --- Event bus and queues ---
    let event_bus = Arc::new(EventBus::default());
    let queue = Arc::new(QueueStore::new(
        Arc::clone(&store),
        Arc::clone(&event_bus),
        worker_config.settings.clone(),
    ));
    let background_cancel = CancellationToken::new();

    // --- Flow coordinator ---
    // Subscribe before any slot starts so no transition is missed.
    let coordinator = Arc::new(FlowCoordinator::new(Arc::clone(&queue)));
    let lifecycle = event_bus.subscribe_lifecycle();
    if let Err(e) = coordinator.sweep().await {
        tracing::error!(error = %e, "Start-up flow sweep failed");
    }
    let coordinator_handle = tokio::spawn(
        Arc::clone(&coordinator).run(lifecycle, background_cancel.clone()),
    );

    // --- Worker pool ---
    let pool = Arc::new(WorkerPool::new(Arc::clone(&queue)));
    match &worker_config.ai_worker_url {
        Some(url) => {
            let handler = Arc::new(
                AiDelegateHandler::new(url.clone()).expect("Failed to build AI worker client"),
            );
            for spec in &worker_config.queues {
                for kind in JobKind::ALL {
                    pool.register_handler(&spec.name, kind, handler.clone()).await;
                }
            }
            tracing::info!(url = %url, "AI delegate handler registered");
        }
        None => {
            tracing::warn!("AI_WORKER_URL not set, jobs will fail with no handler registered");
        }
    }
    for spec in &worker_config.queues {
        pool.start(&spec.name, spec.concurrency);
    }

    // --- Retention ---
    let retention_handle = tokio::spawn(retention::run(
        Arc::clone(&store),
        worker_config.retention,
        worker_config.retention_interval,
        background_cancel.clone(),
    ));

    // --- Live updates ---
    let broadcaster = Arc::new(ws::Broadcaster::new(Arc::clone(&coordinator)));
    let keepalive_handle = ws::start_keepalive(
        Arc::clone(&broadcaster),
        Duration::from_secs(config.ws_keepalive_secs),
        background_cancel.clone(),
    );

    // --- App state ---
    let state = AppState {
        queue: Arc::clone(&queue),
        coordinator: Arc::clone(&coordinator),
        broadcaster: Arc::clone(&broadcaster),
        event_bus: Arc::clone(&event_bus),
        config: Arc::new(config.clone()),
    };
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = config.bind_addr();
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    let grace = Duration::from_secs(config.shutdown_timeout_secs);

    // Let in-flight jobs finish so their final events reach the coordinator.
    if tokio::time::timeout(grace, pool.shutdown()).await.is_err() {
        tracing::warn!("Worker pool did not drain in time; leases will expire");
    }

    background_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), coordinator_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), retention_handle).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), keepalive_handle).await;
    tracing::info!("Background tasks stopped");

    let ws_count = broadcaster.connection_count().await;
    tracing::info!(ws_count, "Closing remaining live connections");
    broadcaster.shutdown_all().await;

    tracing::info!("Graceful shutdown complete");
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
