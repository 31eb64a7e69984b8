//! Realmcore Game Server
//!
//! Serves the status and login protocols on the login port and the game
//! protocol on the game port, with all application logic on one
//! dispatcher thread.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use realmcore_server::auth::MemoryAccountStore;
use realmcore_server::config::ServerConfig;
use realmcore_server::net::{AdmissionPredicate, ServiceManager};
use realmcore_server::protocol::{GameProtocol, LoginProtocol, StatusProtocol};
use realmcore_server::state::ServerContext;
use realmcore_server::VERSION;

/// How often stale admission and status entries are dropped
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Realmcore Game Server v{}", VERSION);

    // Load configuration
    let config = ServerConfig::load().await?;
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    // Seed accounts
    let accounts = Arc::new(MemoryAccountStore::new());
    match &config.accounts_file {
        Some(path) => {
            accounts.load_seed_file(path).await?;
        }
        None => warn!("No accounts file configured, nobody will be able to log in"),
    }

    let context = Arc::new(
        ServerContext::builder(config.clone())
            .accounts(accounts)
            .build(),
    );
    context
        .start()
        .context("Failed to start dispatcher threads")?;

    // Open services
    let services = ServiceManager::new(Arc::clone(&context));
    let admit: AdmissionPredicate = {
        let context = Arc::clone(&context);
        Arc::new(move |ip: IpAddr| context.bans.admit(ip))
    };

    let ip = config.bind_addr();
    services
        .add::<LoginProtocol>(ip, config.login_port, Arc::clone(&admit))
        .await
        .context("Failed to open login service")?;
    services
        .add::<StatusProtocol>(ip, config.login_port, Arc::clone(&admit))
        .await
        .context("Failed to open status service")?;
    services
        .add::<GameProtocol>(ip, config.game_port, admit)
        .await
        .context("Failed to open game service")?;

    // Periodic housekeeping
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let purge_context = Arc::clone(&context);
    let mut purge_shutdown_rx = shutdown_tx.subscribe();
    let purge_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    purge_context.bans.purge_stale();
                    purge_context.purge_status_requests();
                }
                _ = purge_shutdown_rx.recv() => break,
            }
        }
    });

    info!("Server startup complete!");
    info!("{} is ready for connections", config.server_name);

    // Wait for shutdown signal
    wait_for_shutdown(shutdown_tx).await;

    info!("Shutting down server...");

    services.stop().await;
    let _ = purge_handle.await;

    // Cleanup
    context.connections.close_all();
    info!("All connections closed");

    // Give release tasks queued by the closes a moment to run
    tokio::time::sleep(Duration::from_millis(100)).await;
    context.shutdown();

    info!("Server shutdown complete. Goodbye!");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,realmcore_server=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true)
        .init();
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Signal all tasks to shut down
    let _ = shutdown_tx.send(());
}
