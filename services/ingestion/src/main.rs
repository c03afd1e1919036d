use ingestion::auth::AuthGate;
use ingestion::closure::ClosureOrchestrator;
use ingestion::config::Config;
use ingestion::live::LiveFeeds;
use ingestion::pipeline::Pipeline;
use ingestion::sessionizer::Sessionizer;
use ingestion::state::AppState;
use ingestion::trust::KeyResolver;
use ingestion::{broker, db, tick};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = Config::from_env();

    info!("connecting to database...");
    let pool = db::create_pool(&config.db_path).await;
    db::run_migrations(&pool).await;
    info!("migrations applied");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let live = LiveFeeds::default();
    let sessionizer = Arc::new(Sessionizer::new(
        config.session_gap_seconds,
        config.close_silence_seconds,
    ));

    let ops_client = if config.ops_events_enabled {
        match broker::connect(&config.ops_broker_url, &config.ops_client_id).await {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(url = %config.ops_broker_url, error = %e, "ops publisher unavailable");
                None
            }
        }
    } else {
        None
    };
    let closure = Arc::new(ClosureOrchestrator::new(
        pool.clone(),
        ops_client,
        config.kernel_url.clone(),
        config.ops_events_enabled,
        config.kernel_fallback_enabled,
        config.auto_report_enabled,
    ));
    let pipeline = Arc::new(Pipeline::new(
        pool.clone(),
        sessionizer,
        live.clone(),
        closure,
    ));
    let resolver = Arc::new(KeyResolver::new(
        config.identity_url.clone(),
        config.device_keys_json.as_deref(),
    ));

    let ingest = broker::spawn_ingest(
        config.broker_url.clone(),
        config.broker_client_id.clone(),
        config.shards,
        Arc::clone(&pipeline),
        resolver,
        shutdown_rx.clone(),
    );
    let ticker = tick::spawn_tick_driver(Arc::clone(&pipeline), shutdown_rx.clone());

    let auth = Arc::new(AuthGate::from_config(&config.auth));
    let state = AppState::new(pool, live, auth);
    let router = ingestion::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %config.bind_addr, "ingestion service listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Stop the long-lived tasks; they all observe the watch channel within
    // one tick.
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(2), async {
        let _ = ingest.await;
        let _ = ticker.await;
    })
    .await;
    info!("ingestion service shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
