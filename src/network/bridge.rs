//! Linux bridge lifecycle via the bridge ioctls.
//!
//! One bridge per managed subnet, created at network-manager init and
//! carrying the gateway address. Per-VM taps are attached as ports. All
//! operations are idempotent: add-or-noop on init, delete-if-exists on
//! teardown.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use tracing::debug;

use super::netlink::if_index;
use super::{NetworkError, NetworkResult};

// Bridge ioctls, from linux/sockios.h
const SIOCBRADDBR: libc::c_ulong = 0x89a0;
const SIOCBRDELBR: libc::c_ulong = 0x89a1;
const SIOCBRADDIF: libc::c_ulong = 0x89a2;
const SIOCBRDELIF: libc::c_ulong = 0x89a3;

/// `struct ifreq` with the ifindex arm of the union.
#[repr(C)]
struct IfReqIndex {
    ifr_name: [u8; 16],
    ifr_ifindex: libc::c_int,
    _pad: [u8; 20],
}

fn control_socket() -> NetworkResult<OwnedFd> {
    socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .map_err(|e| NetworkError::Syscall("socket(AF_INET)", e.into()))
}

fn name_bytes(name: &str) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    let src = name.as_bytes();
    let len = src.len().min(15);
    bytes[..len].copy_from_slice(&src[..len]);
    bytes
}

/// Create the bridge if it does not exist yet.
pub fn create_bridge(name: &str) -> NetworkResult<()> {
    let fd = control_socket()?;
    let c_name = name_bytes(name);

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), SIOCBRADDBR as _, c_name.as_ptr()) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EEXIST) {
            debug!(bridge = name, "Bridge already exists");
            return Ok(());
        }
        return Err(NetworkError::Syscall("SIOCBRADDBR", err));
    }

    debug!(bridge = name, "Created bridge");
    Ok(())
}

/// Delete the bridge; absence is not an error.
pub fn delete_bridge(name: &str) -> NetworkResult<()> {
    let fd = control_socket()?;
    let c_name = name_bytes(name);

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), SIOCBRDELBR as _, c_name.as_ptr()) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENXIO)
            || err.raw_os_error() == Some(libc::ENODEV)
        {
            return Ok(());
        }
        return Err(NetworkError::Syscall("SIOCBRDELBR", err));
    }

    debug!(bridge = name, "Deleted bridge");
    Ok(())
}

/// Attach an interface as a bridge port. Already-attached is accepted.
pub fn add_port(bridge: &str, ifname: &str) -> NetworkResult<()> {
    let fd = control_socket()?;

    let mut request = IfReqIndex {
        ifr_name: name_bytes(bridge),
        ifr_ifindex: if_index(ifname)? as libc::c_int,
        _pad: [0u8; 20],
    };

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), SIOCBRADDIF as _, &mut request) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EBUSY) {
            debug!(bridge, port = ifname, "Port already attached");
            return Ok(());
        }
        return Err(NetworkError::Syscall("SIOCBRADDIF", err));
    }

    debug!(bridge, port = ifname, "Attached bridge port");
    Ok(())
}

/// Detach an interface from the bridge. Not-attached is accepted.
pub fn remove_port(bridge: &str, ifname: &str) -> NetworkResult<()> {
    let fd = control_socket()?;

    let index = match if_index(ifname) {
        Ok(index) => index,
        // The tap may already be gone
        Err(NetworkError::InterfaceNotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };

    let mut request = IfReqIndex {
        ifr_name: name_bytes(bridge),
        ifr_ifindex: index as libc::c_int,
        _pad: [0u8; 20],
    };

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), SIOCBRDELIF as _, &mut request) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINVAL) || err.raw_os_error() == Some(libc::ENODEV) {
            return Ok(());
        }
        return Err(NetworkError::Syscall("SIOCBRDELIF", err));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_index_layout() {
        assert_eq!(std::mem::size_of::<IfReqIndex>(), 40);
    }

    #[test]
    fn test_name_bytes_truncates() {
        let bytes = name_bytes("a-very-long-bridge-name");
        assert_eq!(bytes[15], 0);
        assert_eq!(&bytes[..15], &"a-very-long-bridge-name".as_bytes()[..15]);
    }

    #[test]
    fn test_unprivileged_create_fails_cleanly() {
        // Without CAP_NET_ADMIN this returns EPERM; either way it must not
        // panic and the error must name the ioctl.
        match create_bridge("hfbr-test") {
            Ok(()) => {
                delete_bridge("hfbr-test").ok();
            }
            Err(e) => assert!(e.to_string().contains("SIOCBRADDBR")),
        }
    }
}
