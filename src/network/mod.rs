//! Host networking for microVM guests.
//!
//! Each machine that requests networking gets a persistent TAP device
//! attached to a shared Linux bridge, an address from the managed subnet,
//! and NAT out through the host's external interface. The pieces:
//!
//! - [`tap`] creates TAP devices through the tun ioctls
//! - [`netlink`] assigns addresses via rtnetlink and flips links up/down
//! - [`bridge`] owns the shared bridge and its ports
//! - [`ipam`] hands out addresses, MACs and tap names
//! - [`nat`] programs masquerade and forwarding rules
//! - [`manager`] composes the above into per-machine allocate/release

pub mod bridge;
pub mod ipam;
pub mod manager;
pub mod nat;
pub mod netlink;
pub mod tap;

use thiserror::Error;

pub use ipam::{IpAllocation, Ipam, IpamStats};
pub use manager::NetworkManager;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} failed: {1}")]
    Syscall(&'static str, std::io::Error),

    #[error("Invalid CIDR {0}")]
    InvalidCidr(String),

    #[error("No free addresses in subnet")]
    PoolExhausted,

    #[error("No allocation for machine {0}")]
    NotAllocated(String),

    #[error("NAT programming failed: {0}")]
    Nat(String),

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

impl From<NetworkError> for crate::error::DaemonError {
    fn from(e: NetworkError) -> Self {
        crate::error::DaemonError::Runtime(e.to_string())
    }
}
