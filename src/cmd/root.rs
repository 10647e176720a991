//! Main daemon command: wire everything together and serve.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use hyperfleet_daemon::config::Configuration;
use hyperfleet_daemon::database::Database;
use hyperfleet_daemon::machine::registry::RuntimeRegistry;
use hyperfleet_daemon::machine::service::{DefaultDriverFactory, MachineService};
use hyperfleet_daemon::network::NetworkManager;
use hyperfleet_daemon::proxy::watcher::PortWatcher;
use hyperfleet_daemon::proxy::{build_proxy_router, ProxyState};
use hyperfleet_daemon::router::{self, AppState};

/// Run the daemon until interrupted.
pub async fn run(config_path: &str) -> Result<()> {
    info!("Loading configuration from: {}", config_path);
    let config = Arc::new(Configuration::load(config_path)?);

    info!("  API: {}:{}", config.api.host, config.api.port);
    info!("  Proxy port: {}", config.proxy.port);
    info!("  Data directory: {}", config.system.data_directory.display());

    let db = Arc::new(Database::open(config.system.database_path())?);
    let registry = Arc::new(RuntimeRegistry::new());

    // Host networking needs CAP_NET_ADMIN; without it the daemon still
    // serves container machines
    let network = if config.network.enabled {
        let manager = Arc::new(NetworkManager::new(config.network.clone())?);
        match manager.init().await {
            Ok(()) => Some(manager),
            Err(e) => {
                warn!(error = %e, "Network init failed; hypervisor networking disabled");
                None
            }
        }
    } else {
        None
    };

    // Restore the address pool bookkeeping (tap numbering survives restarts)
    let ipam_state_path = config.system.data_directory.join("ipam.json");
    if let Some(network) = &network {
        match std::fs::read_to_string(&ipam_state_path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(state) => {
                    network.import_state(state);
                    info!("Restored IPAM state from {}", ipam_state_path.display());
                }
                Err(e) => warn!(error = %e, "Ignoring unreadable IPAM state file"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "Failed to read IPAM state file"),
        }
    }

    let factory = Arc::new(DefaultDriverFactory::new(Arc::clone(&config)));
    let service = Arc::new(MachineService::new(
        Arc::clone(&db),
        Arc::clone(&registry),
        network.clone(),
        Arc::clone(&config),
        factory,
    ));

    // Records from a previous daemon process have no live handles
    service.recover().await?;

    let shutdown_token = CancellationToken::new();

    // Reverse proxy control listener (path mode + host mode)
    let proxy_state = ProxyState::new(Arc::clone(&service), Arc::clone(&config));
    let proxy_addr: SocketAddr = format!("{}:{}", config.api.host, config.proxy.port)
        .parse()
        .expect("Invalid proxy bind address");
    let proxy_handle = axum_server::Handle::new();
    {
        let router = build_proxy_router(proxy_state.clone());
        let handle = proxy_handle.clone();
        tokio::spawn(async move {
            info!("Starting proxy listener on {}", proxy_addr);
            if let Err(e) = axum_server::bind(proxy_addr)
                .handle(handle)
                .serve(router.into_make_service())
                .await
            {
                error!("Proxy listener error: {}", e);
            }
        });
    }

    // Dynamic per-port listeners for exposed guest ports
    let watcher = PortWatcher::new(proxy_state);
    let watcher_token = shutdown_token.clone();
    let reconcile_interval = Duration::from_secs(config.proxy.reconcile_interval);
    tokio::spawn(async move {
        watcher.run(reconcile_interval, watcher_token).await;
    });
    info!(
        "Started proxy port watcher (every {}s)",
        config.proxy.reconcile_interval
    );

    // Main API server
    let state = AppState {
        service: Arc::clone(&service),
        config: Arc::clone(&config),
    };
    let app = router::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .expect("Invalid bind address");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    let shutdown_proxy = proxy_handle.clone();
    let shutdown_network = network.clone();
    let token = shutdown_token.clone();

    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        warn!("Received shutdown signal, stopping");

        token.cancel();
        shutdown_proxy.shutdown();

        if let Some(network) = shutdown_network {
            network.shutdown().await;
            // Allocations are gone now; persisting keeps the tap index
            // monotonic across daemon restarts
            match serde_json::to_string_pretty(&network.export_state()) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(&ipam_state_path, json) {
                        warn!(error = %e, "Failed to persist IPAM state");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to serialize IPAM state"),
            }
        }

        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    info!("Starting HTTP server on {}", bind_addr);
    axum_server::bind(bind_addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    info!("Daemon stopped");
    Ok(())
}
