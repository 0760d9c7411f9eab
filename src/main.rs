use proxyvisor::admin::{AdminServer, PKG_NAME, VERSION};
use proxyvisor::config::Config;
use proxyvisor::manager::InstanceManager;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("proxyvisor=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("proxyvisor.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = InstanceManager::from_config(&config);

    let admin_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&manager), shutdown_rx, admin_token);
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    let started = manager.autostart();
    if !started.is_empty() {
        info!(instances = ?started, "Auto-start complete");
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or config reload (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sighup = signal(SignalKind::hangup())
            .expect("Failed to install SIGHUP handler");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading instances...");
                    match manager.reload_config(&config_path).await {
                        Ok(result) => {
                            if !result.added.is_empty() {
                                info!(instances = ?result.added, "Instances added");
                            }
                            if !result.removed.is_empty() {
                                info!(instances = ?result.removed, "Instances removed");
                            }
                            if !result.updated.is_empty() {
                                info!(instances = ?result.updated, "Instances updated, changes apply on next start");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reload configuration");
                        }
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping all instances...");
    manager.shutdown().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), admin_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy supervisor");
    info!(
        bind = %config.server.bind,
        admin_port = config.server.admin_port,
        observer_buffer = config.server.observer_buffer,
        "Server configuration"
    );
    info!(
        log_buffer_lines = config.supervisor.log_buffer_lines,
        stop_timeout_secs = config.supervisor.stop_timeout_secs,
        shutdown_grace_secs = config.supervisor.shutdown_grace_secs,
        "Supervisor settings"
    );
    info!(
        max_attempts = config.restart.max_attempts,
        window_secs = config.restart.window_secs,
        backoff_step_ms = config.restart.backoff_step_ms,
        "Restart policy"
    );

    let mut ids: Vec<&String> = config.instances.keys().collect();
    ids.sort();
    info!(instance_count = ids.len(), instances = ?ids, "Configured instances");
}
