//! Dynamic host-mode listeners.
//!
//! A reconciliation loop keeps one listening socket per TCP port in the
//! union of `exposed_ports` across running hypervisor machines, excluding
//! the control listener's own port. Listeners for ports that fell out of
//! the set are shut down; new ports get listeners. A port that fails to
//! bind is logged and skipped, never aborting the pass.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use axum_server::Handle;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::machine::{MachineFilter, MachineStatus};

use super::{build_proxy_router, ProxyState};

pub struct PortWatcher {
    state: ProxyState,
    control_port: u16,
    listeners: Mutex<HashMap<u16, Handle>>,
}

impl PortWatcher {
    pub fn new(state: ProxyState) -> Self {
        let control_port = state.config.proxy.port;
        Self {
            state,
            control_port,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Ports that should have a listener right now.
    async fn desired_ports(&self) -> HashSet<u16> {
        let machines = match self
            .state
            .service
            .list(MachineFilter {
                status: Some(MachineStatus::Running),
                runtime_type: None,
            })
            .await
        {
            Ok(machines) => machines,
            Err(e) => {
                warn!(error = %e, "Listing machines for port reconciliation failed");
                return HashSet::new();
            }
        };

        machines
            .iter()
            .filter(|m| m.runtime_type.is_hypervisor())
            .flat_map(|m| m.exposed_ports.iter().copied())
            .filter(|port| *port != self.control_port)
            .collect()
    }

    /// One reconciliation pass: stop undesired listeners, start missing ones.
    pub async fn reconcile(&self) {
        let desired = self.desired_ports().await;
        let mut listeners = self.listeners.lock().await;

        let stale: Vec<u16> = listeners
            .keys()
            .copied()
            .filter(|port| !desired.contains(port))
            .collect();
        for port in stale {
            if let Some(handle) = listeners.remove(&port) {
                info!(port, "Stopping proxy listener");
                handle.shutdown();
            }
        }

        for port in desired {
            if listeners.contains_key(&port) {
                continue;
            }
            match self.start_listener(port) {
                Ok(handle) => {
                    info!(port, "Started proxy listener");
                    listeners.insert(port, handle);
                }
                Err(e) => {
                    // Next pass retries; other ports are unaffected
                    warn!(port, error = %e, "Failed to bind proxy listener");
                }
            }
        }
    }

    fn start_listener(&self, port: u16) -> std::io::Result<Handle> {
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let handle = Handle::new();
        let router = build_proxy_router(self.state.clone());
        let serve_handle = handle.clone();

        tokio::spawn(async move {
            if let Err(e) = axum_server::from_tcp(listener)
                .handle(serve_handle)
                .serve(router.into_make_service())
                .await
            {
                warn!(port, error = %e, "Proxy listener terminated");
            }
        });

        Ok(handle)
    }

    /// Reconcile on an interval until cancelled, then stop every listener.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Port watcher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.reconcile().await;
                }
            }
        }

        let mut listeners = self.listeners.lock().await;
        for (port, handle) in listeners.drain() {
            debug!(port, "Stopping proxy listener on shutdown");
            handle.shutdown();
        }
    }

    #[cfg(test)]
    async fn listening_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.listeners.lock().await.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}
