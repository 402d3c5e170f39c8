use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vantage_api::config::ServerConfig;
use vantage_api::router::build_app_router;
use vantage_api::state::AppState;
use vantage_core::job::JobKind;
use vantage_events::ProgressHub;
use vantage_pipeline::{
    DataSink, DataSource, MemoryPipelineStore, MemorySink, MemorySource, PipelineExecutor,
    PipelineStore,
};
use vantage_worker::handlers::{
    AiStreamHandler, AlertCheckHandler, EmailSendHandler, PipelineJobHandler, PulseHandler,
    ReportHandler, StaticChunks,
};
use vantage_worker::{EngineConfig, HandlerMap, JobEngine, Notifier, RecordingNotifier};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vantage_api=debug,vantage_worker=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let server_config = ServerConfig::from_env();
    let engine_config = EngineConfig::from_env();
    tracing::info!(
        host = %server_config.host,
        port = %server_config.port,
        workers = engine_config.worker_count,
        "Loaded configuration"
    );

    // --- Adapters ---
    // In-memory source, sink, and definition store; swap for concrete
    // warehouse adapters behind the same traits in deployments.
    let store: Arc<dyn PipelineStore> = Arc::new(MemoryPipelineStore::new());
    let source: Arc<dyn DataSource> = Arc::new(MemorySource::new(Vec::new()));
    let sink: Arc<dyn DataSink> = Arc::new(MemorySink::new());
    let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::new());

    // --- Progress hub ---
    let hub = Arc::new(ProgressHub::default());

    // --- Pipeline executor ---
    let executor = Arc::new(
        PipelineExecutor::new(
            Arc::clone(&store),
            Arc::clone(&source),
            Arc::clone(&sink),
            Arc::clone(&hub),
        )
        .with_default_row_limit(engine_config.pipeline_row_limit_default),
    );

    // --- Handlers, one per job kind ---
    let handlers = HandlerMap::new()
        .register(
            JobKind::Pipeline,
            Arc::new(PipelineJobHandler::new(Arc::clone(&executor))),
        )
        .register(
            JobKind::ScheduledReport,
            Arc::new(ReportHandler::new(
                Arc::clone(&source),
                Arc::clone(&notifier),
            )),
        )
        .register(
            JobKind::AlertCheck,
            Arc::new(AlertCheckHandler::new(
                Arc::clone(&source),
                Arc::clone(&notifier),
            )),
        )
        .register(
            JobKind::EmailSend,
            Arc::new(EmailSendHandler::new(Arc::clone(&notifier))),
        )
        .register(
            JobKind::Pulse,
            Arc::new(PulseHandler::new(Arc::clone(&notifier))),
        )
        .register(
            JobKind::AiStream,
            Arc::new(AiStreamHandler::new(Arc::new(StaticChunks(Vec::new())))),
        );

    // --- Engine ---
    let shutdown_grace = Duration::from_secs(server_config.shutdown_timeout_secs);
    let engine = Arc::new(JobEngine::new(engine_config, handlers, Arc::clone(&hub)));
    engine.start();
    tracing::info!("Execution engine started");

    // --- App state & router ---
    let state = AppState::new(Arc::clone(&engine), Arc::new(server_config.clone()));
    let app = build_app_router(state, &server_config);

    // --- Start server ---
    let addr = SocketAddr::new(
        server_config.host.parse().expect("Invalid HOST address"),
        server_config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    // Stop the scheduler first so no new jobs materialize, then wait
    // up to the grace period for in-flight executions to finish.
    engine.stop(shutdown_grace).await;

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager (e.g. systemd, Docker, Kubernetes).
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
