//! FormPilot worker binary.
//!
//! Wires the libSQL store, the sidecar browser adapter, the handler
//! registry, and the claim loop together, then serves a health endpoint
//! while workers run.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Json;
use axum::routing::get;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use formpilot::adapter::http::HttpAdapterFactory;
use formpilot::config::OrchestratorConfig;
use formpilot::executor::JobExecutor;
use formpilot::handlers::{FormApplicationHandler, HandlerRegistry};
use formpilot::notify::{CallbackNotifier, NullNotifier, WebhookNotifier};
use formpilot::signal::LocalResumeBus;
use formpilot::store::{JobStore, LibSqlBackend, ManualStore};
use formpilot::worker::{Worker, run_expiry_sweep};

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = OrchestratorConfig::from_env().context("loading configuration")?;

    let db_path =
        std::env::var("FORMPILOT_DB_PATH").unwrap_or_else(|_| "formpilot.db".to_string());
    let backend = Arc::new(
        LibSqlBackend::new_local(&db_path)
            .await
            .with_context(|| format!("opening database at {db_path}"))?,
    );
    let store: Arc<dyn JobStore> = backend.clone();
    let manuals: Arc<dyn ManualStore> = backend.clone();

    let sidecar_url = std::env::var("FORMPILOT_SIDECAR_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:7333".to_string());
    let factory = Arc::new(HttpAdapterFactory {
        base_url: sidecar_url.clone(),
    });

    let notifier: Arc<dyn CallbackNotifier> = match std::env::var("FORMPILOT_CALLBACK_URL") {
        Ok(url) => Arc::new(WebhookNotifier::new(url)),
        Err(_) => Arc::new(NullNotifier),
    };

    let handlers = Arc::new(HandlerRegistry::new());
    handlers.register(Arc::new(FormApplicationHandler::new()));

    let signals = Arc::new(LocalResumeBus::new());

    let executor = Arc::new(JobExecutor::new(
        Arc::clone(&store),
        manuals,
        factory,
        handlers,
        Arc::clone(&notifier),
        signals,
        config.clone(),
    ));

    let worker_id = std::env::var("FORMPILOT_WORKER_ID").unwrap_or_else(|_| {
        format!(
            "worker-{}",
            uuid::Uuid::new_v4().simple().to_string()[..8].to_owned()
        )
    });
    tracing::info!(worker_id = %worker_id, db = %db_path, sidecar = %sidecar_url, "FormPilot starting");

    let worker = Worker::new(worker_id, Arc::clone(&store), executor, notifier, config);
    tokio::spawn(async move { worker.run().await });
    tokio::spawn(run_expiry_sweep(store, EXPIRY_SWEEP_INTERVAL));

    serve_health().await
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,formpilot=debug"));

    match std::env::var("FORMPILOT_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "formpilot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        }
    }
}

async fn serve_health() -> anyhow::Result<()> {
    let addr =
        std::env::var("FORMPILOT_LISTEN_ADDR").unwrap_or_else(|_| "127.0.0.1:7400".to_string());
    let app = axum::Router::new()
        .route(
            "/healthz",
            get(|| async { Json(serde_json::json!({"status": "ok"})) }),
        )
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding health listener on {addr}"))?;
    tracing::info!(addr = %addr, "Health endpoint listening");
    axum::serve(listener, app).await.context("health server")
}
