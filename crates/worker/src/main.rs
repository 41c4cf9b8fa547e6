use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use pipewright_engine::{
    EngineConfig, ExternalProgramProcessor, ProcessorRegistry, ServiceEngine, Stores,
};
use pipewright_events::{EmailConfig, EmailDelivery, EventBus, NotificationDelivery};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often undelivered notifications are picked up.
const NOTIFICATION_INTERVAL: Duration = Duration::from_secs(5);

/// How long each background loop gets to stop after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = pipewright_db::create_pool(&database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    pipewright_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    pipewright_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    let config = EngineConfig::from_env().context("Invalid engine configuration")?;
    tracing::info!(
        queue_id = %config.queue_id,
        processing_slots = config.processing_slots,
        max_waiting_slots = config.max_waiting_slots,
        "Engine configuration loaded"
    );

    let registry = ProcessorRegistry::builder()
        .register(ExternalProgramProcessor::new(config.output_root.clone()))
        .build();
    let stores = Stores::postgres(pool);
    let email = EmailConfig::from_env().map(EmailDelivery::new);
    let delivery = NotificationDelivery::new(
        stores.notifications.clone(),
        email,
        NOTIFICATION_INTERVAL,
    );
    let engine = ServiceEngine::new(config, stores, registry, Arc::new(EventBus::default()));

    let cancel = CancellationToken::new();

    let dispatcher = engine.dispatcher().clone();
    let dispatcher_cancel = cancel.clone();
    let dispatcher_handle = tokio::spawn(async move { dispatcher.run(dispatcher_cancel).await });

    let scheduler = engine.scheduler().clone();
    let scheduler_cancel = cancel.clone();
    let scheduler_handle = tokio::spawn(async move { scheduler.run(scheduler_cancel).await });

    let delivery_cancel = cancel.clone();
    let delivery_handle = tokio::spawn(async move { delivery.run(delivery_cancel).await });

    tracing::info!("Worker started");
    shutdown_signal().await;

    // --- Shutdown ---
    cancel.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, dispatcher_handle).await;
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, scheduler_handle).await;
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, delivery_handle).await;

    let running = engine.dispatcher().running().len();
    if running > 0 {
        tracing::warn!(running, "Services still running at shutdown");
    }
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Human-readable logs by default; `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            "pipewright_worker=debug,pipewright_engine=debug,pipewright_events=info".into()
        });
    let registry = tracing_subscriber::registry().with(filter);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
