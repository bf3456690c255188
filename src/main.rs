use dockroute::admin::{AdminServer, PKG_NAME, VERSION};
use dockroute::config::Config;
use dockroute::dispatcher::Dispatcher;
use dockroute::docker::DockerRuntime;
use dockroute::store;
use dockroute::sync::{SyncEvent, Synchronizer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "dockroute.toml";
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("dockroute=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = load_config()?;
    print_startup_banner(&config);

    let runtime = DockerRuntime::connect(config.docker.host.as_deref()).await?;
    let route_store = store::from_config(&config.store)?;
    let synchronizer = Synchronizer::new(Arc::new(runtime), route_store, &config.sync);
    let dispatcher = Dispatcher::new(Arc::clone(&synchronizer));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Log completion events as they happen
    let events_handle = tokio::spawn(log_sync_events(synchronizer.subscribe()));

    // Subscribe before reconciling so no start event falls in between
    dispatcher.start();

    if config.sync.sync_on_start {
        match dispatcher.sync().await {
            Ok(report) => info!(
                attempted = report.attempted,
                balanced = report.balanced,
                failed = report.failed.len(),
                "Startup reconciliation complete"
            ),
            Err(e) => error!(error = %e, "Startup reconciliation failed"),
        }
    }

    let admin_handle = if config.admin.enabled {
        let admin_addr: SocketAddr = format!("{}:{}", config.admin.bind, config.admin.port)
            .parse()
            .map_err(|e| {
                error!(bind = %config.admin.bind, port = config.admin.port, error = %e, "Invalid admin bind address");
                anyhow::anyhow!("Invalid admin bind address: {}", e)
            })?;

        let admin_token = config.admin.token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin.token to set a fixed value)");
            token
        });

        let admin_server = AdminServer::new(
            admin_addr,
            Arc::clone(&dispatcher),
            shutdown_rx.clone(),
            admin_token,
        );
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);
    dispatcher.stop();

    // Let in-flight operations and the admin server wind down
    if !dispatcher.wait_idle(SHUTDOWN_TIMEOUT).await {
        warn!("Shutting down with sync operations still in flight");
    }
    if let Some(handle) = admin_handle {
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await;
    }
    events_handle.abort();

    info!("Shutdown complete");
    Ok(())
}

fn load_config() -> anyhow::Result<Config> {
    let explicit = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    if explicit.is_none() && !config_path.exists() {
        info!(path = %config_path.display(), "No configuration file, using defaults");
        return Ok(Config::default());
    }

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "Configuration loaded");
    Ok(config)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

async fn log_sync_events(mut events: broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::Balance { id, routes }) => {
                debug!(container_id = %id, routes = ?routes, "balance");
            }
            Ok(SyncEvent::Unbalance { id, results }) => {
                let failed = results.iter().filter(|r| !r.is_ok()).count();
                debug!(container_id = %id, vhosts = results.len(), failed, "unbalance");
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Sync event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting route synchronizer");
    info!(
        default_vhost = %config.sync.default_vhost,
        default_port = config.sync.default_port,
        settle_interval_ms = config.sync.settle_interval_ms,
        serialize_per_container = config.sync.serialize_per_container,
        "Sync settings"
    );
    info!(
        hostname = %config.sync.env.hostname,
        port = %config.sync.env.port,
        prefix = %config.sync.env.prefix,
        custom_prefix = %config.sync.env.custom_prefix,
        divisor = %config.sync.env.divisor,
        max_slots = config.sync.env.max_slots,
        "Environment naming scheme"
    );
    info!(
        store = ?config.store.kind,
        docker_host = ?config.docker.host,
        admin = config.admin.enabled,
        "Collaborators"
    );
}
