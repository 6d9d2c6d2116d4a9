use booking_settlement::clock::SystemClock;
use booking_settlement::config::AppConfig;
use booking_settlement::database::services_repository::PgServicesStore;
use booking_settlement::database::users_repository::PgUsersStore;
use booking_settlement::database::ScopePools;
use booking_settlement::logging::init_tracing;
use booking_settlement::payments::build_gateway;
use booking_settlement::services::{EngineContext, EngineSettings};
use booking_settlement::workers::Scheduler;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        gateway = ?config.gateway.kind,
        hold_ttl_secs = config.scheduler.hold_ttl_secs,
        "Starting booking settlement engine"
    );

    let pools = ScopePools::connect(&config.services_db, &config.users_db).await?;
    pools.migrate().await?;
    pools.health_check().await?;

    let gateway = build_gateway(&config.gateway)?;
    info!(gateway = gateway.name(), "Payment gateway ready");

    let ctx = Arc::new(EngineContext::new(
        Arc::new(PgServicesStore::new(pools.services.clone())),
        Arc::new(PgUsersStore::new(pools.users.clone())),
        gateway,
        Arc::new(SystemClock),
        EngineSettings::from(&config),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(ctx, config.scheduler.clone());
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    if let Err(e) = scheduler_handle.await {
        error!(error = %e, "scheduler task ended abnormally");
    }

    pools.close().await;
    info!("Booking settlement engine stopped");

    Ok(())
}
