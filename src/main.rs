use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use stockledger_api::config::{init_tracing, load_config};
use stockledger_api::db::{establish_connection_from_app_config, run_migrations};
use stockledger_api::events::{process_events, EventSender};
use stockledger_api::handlers::AppState;
use stockledger_api::services::{ExpirySweeper, StockLedgerService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(load_config().context("failed to load configuration")?);
    // Production always logs structured JSON, whatever the config file says.
    init_tracing(config.log_level(), config.log_json || config.is_production());
    info!(
        environment = %config.environment,
        "Starting stock ledger service"
    );

    let db = Arc::new(
        establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?,
    );
    if config.auto_migrate {
        run_migrations(&db).await.context("migration failed")?;
    }

    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = EventSender::new(event_tx);
    tokio::spawn(process_events(event_rx));

    let stock_ledger = StockLedgerService::new(
        Arc::clone(&db),
        event_sender.clone(),
        config.near_expiry_horizon_days,
    );
    let sweeper = ExpirySweeper::new(
        Arc::clone(&db),
        event_sender,
        config.near_expiry_horizon_days,
    );

    if config.sweep_on_start {
        match sweeper.sweep_expired().await {
            Ok(outcome) => info!(
                batches_expired = outcome.batches_expired,
                quantity_written_off = outcome.quantity_written_off,
                "Startup expiry sweep finished"
            ),
            Err(e) => error!(error = %e, "Startup expiry sweep failed"),
        }
    }
    tokio::spawn(sweeper.clone().run(config.sweep_interval_secs));

    let state = AppState {
        db,
        stock_ledger,
        sweeper,
        config: Arc::clone(&config),
    };
    let router = stockledger_api::app(state);

    let addr = config.server_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(address = %addr, "Listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received ctrl-c, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
