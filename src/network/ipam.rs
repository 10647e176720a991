//! IP address management for the guest subnet.
//!
//! Allocation scans host offsets low to high for the first free slot
//! between the configured bounds. The network address and the gateway are
//! never allocatable. Each allocation gets a deterministic MAC derived from
//! the IP under the locally-administered `aa:fc` prefix, and a fresh tap
//! name from a monotonic counter that is never reused, even after release.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::NetworkConfiguration;

use super::{NetworkError, NetworkResult};

/// One live binding of machine to address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAllocation {
    pub machine_id: String,
    pub ip: Ipv4Addr,
    pub mac: String,
    pub tap_name: String,
    pub allocated_at: DateTime<Utc>,
}

/// Pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IpamStats {
    pub total: u32,
    pub allocated: u32,
    pub available: u32,
}

/// Serializable pool state, for export/import across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpamState {
    pub allocations: Vec<IpAllocation>,
    pub next_tap_index: u32,
}

/// Deterministic locally-administered MAC for an IPv4 address.
pub fn mac_for_ip(ip: Ipv4Addr) -> String {
    let octets = ip.octets();
    format!(
        "aa:fc:{:02x}:{:02x}:{:02x}:{:02x}",
        octets[0], octets[1], octets[2], octets[3]
    )
}

/// Parse `a.b.c.d/len` into base address and prefix length.
pub fn parse_cidr(cidr: &str) -> NetworkResult<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| NetworkError::InvalidCidr(cidr.to_string()))?;

    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| NetworkError::InvalidCidr(cidr.to_string()))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| NetworkError::InvalidCidr(cidr.to_string()))?;
    if prefix > 30 {
        // Anything smaller than a /30 has no room for gateway plus guests
        return Err(NetworkError::InvalidCidr(cidr.to_string()));
    }

    let mask = u32::MAX << (32 - prefix as u32);
    Ok((Ipv4Addr::from(u32::from(addr) & mask), prefix))
}

/// The address pool.
#[derive(Debug)]
pub struct Ipam {
    base: u32,
    prefix: u8,
    gateway: Ipv4Addr,
    start_offset: u32,
    end_offset: u32,
    tap_prefix: String,
    next_tap_index: u32,
    /// ip -> allocation
    allocations: HashMap<Ipv4Addr, IpAllocation>,
}

impl Ipam {
    pub fn new(config: &NetworkConfiguration) -> NetworkResult<Self> {
        let (network, prefix) = parse_cidr(&config.subnet_cidr)?;
        let base = u32::from(network);
        let size = 1u32 << (32 - prefix as u32);
        let broadcast_offset = size - 1;

        // Gateway defaults to the first usable address
        let gateway = Ipv4Addr::from(base + 1);

        let start_offset = config.start_offset.max(2);
        let end_offset = if config.end_offset == 0 {
            broadcast_offset - 1
        } else {
            config.end_offset.min(broadcast_offset - 1)
        };

        if start_offset > end_offset {
            return Err(NetworkError::InvalidCidr(config.subnet_cidr.clone()));
        }

        Ok(Self {
            base,
            prefix,
            gateway,
            start_offset,
            end_offset,
            tap_prefix: config.tap_prefix.clone(),
            next_tap_index: 0,
            allocations: HashMap::new(),
        })
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.gateway
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// First-free scan between the configured offsets.
    pub fn allocate(&mut self, machine_id: &str) -> NetworkResult<IpAllocation> {
        for offset in self.start_offset..=self.end_offset {
            let ip = Ipv4Addr::from(self.base + offset);
            if ip == self.gateway || self.allocations.contains_key(&ip) {
                continue;
            }

            let tap_name = format!("{}{}", self.tap_prefix, self.next_tap_index);
            self.next_tap_index += 1;

            let allocation = IpAllocation {
                machine_id: machine_id.to_string(),
                ip,
                mac: mac_for_ip(ip),
                tap_name,
                allocated_at: Utc::now(),
            };
            self.allocations.insert(ip, allocation.clone());
            return Ok(allocation);
        }

        Err(NetworkError::PoolExhausted)
    }

    /// Release whatever is bound to the machine. The tap index is not
    /// reused.
    pub fn release(&mut self, machine_id: &str) -> Option<IpAllocation> {
        let ip = self
            .allocations
            .iter()
            .find(|(_, a)| a.machine_id == machine_id)
            .map(|(ip, _)| *ip)?;
        self.allocations.remove(&ip)
    }

    pub fn lookup(&self, machine_id: &str) -> Option<&IpAllocation> {
        self.allocations
            .values()
            .find(|a| a.machine_id == machine_id)
    }

    pub fn stats(&self) -> IpamStats {
        // Offsets minus the gateway slot when it falls inside the range
        let gateway_offset = u32::from(self.gateway) - self.base;
        let mut total = self.end_offset - self.start_offset + 1;
        if (self.start_offset..=self.end_offset).contains(&gateway_offset) {
            total -= 1;
        }

        let allocated = self.allocations.len() as u32;
        IpamStats {
            total,
            allocated,
            available: total - allocated,
        }
    }

    pub fn export(&self) -> IpamState {
        let mut allocations: Vec<_> = self.allocations.values().cloned().collect();
        allocations.sort_by(|a, b| a.ip.cmp(&b.ip));
        IpamState {
            allocations,
            next_tap_index: self.next_tap_index,
        }
    }

    pub fn import(&mut self, state: IpamState) {
        self.allocations = state
            .allocations
            .into_iter()
            .map(|a| (a.ip, a))
            .collect();
        self.next_tap_index = state.next_tap_index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NetworkConfiguration {
        NetworkConfiguration {
            subnet_cidr: "172.16.0.0/24".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_cidr() {
        let (network, prefix) = parse_cidr("172.16.0.0/24").unwrap();
        assert_eq!(network, Ipv4Addr::new(172, 16, 0, 0));
        assert_eq!(prefix, 24);

        // Host bits are masked off
        let (network, _) = parse_cidr("10.1.2.3/16").unwrap();
        assert_eq!(network, Ipv4Addr::new(10, 1, 0, 0));

        assert!(parse_cidr("not-a-cidr").is_err());
        assert!(parse_cidr("172.16.0.0").is_err());
        assert!(parse_cidr("172.16.0.0/31").is_err());
    }

    #[test]
    fn test_mac_is_deterministic_and_local() {
        let ip = Ipv4Addr::new(172, 16, 0, 2);
        assert_eq!(mac_for_ip(ip), "aa:fc:ac:10:00:02");
        assert_eq!(mac_for_ip(ip), mac_for_ip(ip));

        // First octet 0xaa has the locally-administered bit set
        assert_eq!(0xaa & 0x02, 0x02);
    }

    #[test]
    fn test_allocation_order_and_gateway_reserved() {
        let mut ipam = Ipam::new(&config()).unwrap();
        assert_eq!(ipam.gateway(), Ipv4Addr::new(172, 16, 0, 1));

        let a = ipam.allocate("m1").unwrap();
        let b = ipam.allocate("m2").unwrap();
        assert_eq!(a.ip, Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(b.ip, Ipv4Addr::new(172, 16, 0, 3));
        assert_eq!(a.tap_name, "hftap0");
        assert_eq!(b.tap_name, "hftap1");
        assert_eq!(a.mac, "aa:fc:ac:10:00:02");
    }

    #[test]
    fn test_release_frees_ip_but_not_tap_index() {
        let mut ipam = Ipam::new(&config()).unwrap();

        let a = ipam.allocate("m1").unwrap();
        let _b = ipam.allocate("m2").unwrap();

        let released = ipam.release("m1").unwrap();
        assert_eq!(released.ip, a.ip);
        assert!(ipam.lookup("m1").is_none());

        // The freed IP is handed out again, with a fresh tap name
        let c = ipam.allocate("m3").unwrap();
        assert_eq!(c.ip, a.ip);
        assert_eq!(c.tap_name, "hftap2");
    }

    #[test]
    fn test_exactly_one_binding_per_ip() {
        let mut ipam = Ipam::new(&config()).unwrap();
        let mut seen = std::collections::HashSet::new();
        for i in 0..50 {
            let allocation = ipam.allocate(&format!("m{}", i)).unwrap();
            assert!(seen.insert(allocation.ip), "duplicate ip {}", allocation.ip);
        }
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut ipam = Ipam::new(&NetworkConfiguration {
            subnet_cidr: "10.0.0.0/29".into(),
            ..Default::default()
        })
        .unwrap();

        // /29 = 8 addresses; minus network, gateway, broadcast = 5 usable
        for i in 0..5 {
            ipam.allocate(&format!("m{}", i)).unwrap();
        }
        assert!(matches!(
            ipam.allocate("overflow"),
            Err(NetworkError::PoolExhausted)
        ));

        let stats = ipam.stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.allocated, 5);
        assert_eq!(stats.available, 0);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let mut ipam = Ipam::new(&config()).unwrap();
        ipam.allocate("m1").unwrap();
        ipam.allocate("m2").unwrap();
        ipam.release("m1");

        let state = ipam.export();

        let mut restored = Ipam::new(&config()).unwrap();
        restored.import(state);

        assert_eq!(restored.lookup("m2"), ipam.lookup("m2"));
        assert!(restored.lookup("m1").is_none());

        // Tap numbering continues where it left off
        let next = restored.allocate("m3").unwrap();
        assert_eq!(next.tap_name, "hftap2");
    }

    #[test]
    fn test_custom_offsets() {
        let mut ipam = Ipam::new(&NetworkConfiguration {
            subnet_cidr: "172.16.0.0/24".into(),
            start_offset: 10,
            end_offset: 12,
            ..Default::default()
        })
        .unwrap();

        assert_eq!(ipam.allocate("a").unwrap().ip, Ipv4Addr::new(172, 16, 0, 10));
        assert_eq!(ipam.allocate("b").unwrap().ip, Ipv4Addr::new(172, 16, 0, 11));
        assert_eq!(ipam.allocate("c").unwrap().ip, Ipv4Addr::new(172, 16, 0, 12));
        assert!(ipam.allocate("d").is_err());
    }
}
