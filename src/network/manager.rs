//! Per-machine network allocation.
//!
//! Owns the bridge, the address pool and NAT state. Machine allocation is
//! tap + address + bridge port; failures roll back in reverse order so a
//! half-built attachment never leaks. A NAT failure after bridge setup is
//! only a warning: local (bridge-scope) networking still works.

use std::net::Ipv4Addr;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::NetworkConfiguration;
use crate::machine::NetworkAttachment;

use super::ipam::{Ipam, IpamState, IpamStats};
use super::nat::NatManager;
use super::tap::{delete_tap, TapDevice, TapOptions};
use super::{bridge, netlink, NetworkResult};

pub struct NetworkManager {
    config: NetworkConfiguration,
    ipam: Mutex<Ipam>,
    nat: AsyncMutex<Option<NatManager>>,
}

impl NetworkManager {
    pub fn new(config: NetworkConfiguration) -> NetworkResult<Self> {
        let ipam = Ipam::new(&config)?;
        Ok(Self {
            config,
            ipam: Mutex::new(ipam),
            nat: AsyncMutex::new(None),
        })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.ipam.lock().gateway()
    }

    /// Bring up the bridge with the gateway address and program NAT.
    /// Idempotent; called once at daemon init.
    pub async fn init(&self) -> NetworkResult<()> {
        let bridge_name = &self.config.bridge_name;
        let (gateway, prefix) = {
            let ipam = self.ipam.lock();
            (ipam.gateway(), ipam.prefix())
        };

        bridge::create_bridge(bridge_name)?;
        netlink::add_address(bridge_name, gateway, prefix)?;
        netlink::link_up(bridge_name)?;
        info!(bridge = %bridge_name, gateway = %gateway, "Bridge is up");

        match NatManager::init(self.config.subnet_cidr.clone()).await {
            Ok(nat) => {
                *self.nat.lock().await = Some(nat);
            }
            Err(e) => {
                // Guests still reach each other and the host over the bridge
                warn!(error = %e, "NAT setup failed; external connectivity disabled");
            }
        }

        Ok(())
    }

    /// Allocate an address, create the machine's tap and attach it to the
    /// bridge. On failure everything acquired so far is rolled back.
    pub fn allocate_for_machine(&self, machine_id: &str) -> NetworkResult<NetworkAttachment> {
        let allocation = self.ipam.lock().allocate(machine_id)?;
        let gateway = self.ipam.lock().gateway();

        // Past this point the allocation must be released on any failure
        let result = (|| -> NetworkResult<String> {
            let tap = TapDevice::create(
                &allocation.tap_name,
                &TapOptions {
                    persist: true,
                    ..Default::default()
                },
            )?;
            let tap_name = tap.name().to_string();

            // Close our fd before the VMM starts; persistence keeps the
            // device alive for the VMM to open exclusively.
            tap.close();

            let cleanup = scopeguard::guard(tap_name.clone(), |name| {
                delete_tap(&name).ok();
            });

            netlink::link_up(&tap_name)?;
            bridge::add_port(&self.config.bridge_name, &tap_name)?;

            Ok(scopeguard::ScopeGuard::into_inner(cleanup))
        })();

        match result {
            Ok(tap_name) => {
                info!(
                    machine = machine_id,
                    tap = %tap_name,
                    ip = %allocation.ip,
                    "Allocated guest network"
                );
                Ok(NetworkAttachment {
                    tap: tap_name,
                    tap_ip: gateway.to_string(),
                    guest_ip: allocation.ip.to_string(),
                    guest_mac: allocation.mac,
                })
            }
            Err(e) => {
                self.ipam.lock().release(machine_id);
                Err(e)
            }
        }
    }

    /// Release a machine's attachment: bridge port, tap, then address.
    /// Best effort throughout; release never fails the caller.
    pub fn release_for_machine(&self, machine_id: &str) {
        let allocation = match self.ipam.lock().release(machine_id) {
            Some(allocation) => allocation,
            None => return,
        };

        if let Err(e) = bridge::remove_port(&self.config.bridge_name, &allocation.tap_name) {
            warn!(machine = machine_id, error = %e, "Failed to detach bridge port");
        }
        if let Err(e) = delete_tap(&allocation.tap_name) {
            warn!(machine = machine_id, error = %e, "Failed to delete tap");
        }

        info!(machine = machine_id, ip = %allocation.ip, "Released guest network");
    }

    pub fn stats(&self) -> IpamStats {
        self.ipam.lock().stats()
    }

    pub fn export_state(&self) -> IpamState {
        self.ipam.lock().export()
    }

    pub fn import_state(&self, state: IpamState) {
        self.ipam.lock().import(state);
    }

    /// Tear everything down: per-machine taps, NAT rules, the bridge.
    pub async fn shutdown(&self) {
        let machine_ids: Vec<String> = {
            let ipam = self.ipam.lock();
            ipam.export()
                .allocations
                .into_iter()
                .map(|a| a.machine_id)
                .collect()
        };
        for machine_id in machine_ids {
            self.release_for_machine(&machine_id);
        }

        if let Some(nat) = self.nat.lock().await.take() {
            nat.teardown().await;
        }

        if let Err(e) = bridge::delete_bridge(&self.config.bridge_name) {
            warn!(error = %e, "Failed to delete bridge");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NetworkConfiguration {
        NetworkConfiguration {
            subnet_cidr: "10.199.0.0/24".into(),
            bridge_name: "hfbr-test".into(),
            tap_prefix: "hftest".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_allocation_rolls_back_on_tap_failure() {
        let manager = NetworkManager::new(config()).unwrap();
        let before = manager.stats();

        match manager.allocate_for_machine("m1") {
            Ok(attachment) => {
                // Running privileged: a real tap was created. Clean up and
                // check the books balance afterwards.
                assert!(attachment.tap.starts_with("hftest"));
                assert_eq!(attachment.guest_ip, "10.199.0.2");
                manager.release_for_machine("m1");
            }
            Err(_) => {
                // Unprivileged: the tap ioctl failed and the address must
                // have been released again.
            }
        }

        assert_eq!(manager.stats().allocated, 0);
        assert_eq!(manager.stats().available, before.available);
    }

    #[test]
    fn test_state_roundtrip_through_manager() {
        let manager = NetworkManager::new(config()).unwrap();
        // Populate IPAM directly; no host resources involved
        manager.ipam.lock().allocate("m1").unwrap();

        let state = manager.export_state();
        let restored = NetworkManager::new(config()).unwrap();
        restored.import_state(state);

        assert_eq!(restored.stats().allocated, 1);
        assert!(restored.ipam.lock().lookup("m1").is_some());
    }
}
