//! TAP device creation through the tun ioctls.
//!
//! A TAP is created by opening `/dev/net/tun` and issuing `TUNSETIFF` with
//! `IFF_TAP | IFF_NO_PI` (layer 2, no packet-info header). The kernel fills
//! the assigned name back into the request. `TUNSETPERSIST` keeps the device
//! after the creating fd closes; the fd is closed before the VMM starts so
//! the VMM can open the device exclusively. Deleting a persistent tap means
//! attaching to it again and clearing persistence.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;

use super::{NetworkError, NetworkResult};

const TUN_DEVICE: &str = "/dev/net/tun";

// Tun ioctl numbers and flags, from linux/if_tun.h
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETPERSIST: libc::c_ulong = 0x4004_54cb;
const TUNSETOWNER: libc::c_ulong = 0x4004_54cc;
const TUNSETGROUP: libc::c_ulong = 0x4004_54ce;

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;

pub const IFNAMSIZ: usize = 16;

/// `struct ifreq` with the flags arm of the union, as the tun ioctls use it.
#[repr(C)]
struct IfReqFlags {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReqFlags {
    fn new(name: &str, flags: libc::c_short) -> Self {
        let mut ifr_name = [0u8; IFNAMSIZ];
        let bytes = name.as_bytes();
        let len = bytes.len().min(IFNAMSIZ - 1);
        ifr_name[..len].copy_from_slice(&bytes[..len]);

        Self {
            ifr_name,
            ifr_flags: flags,
            _pad: [0u8; 22],
        }
    }

    fn name(&self) -> String {
        let end = self
            .ifr_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(IFNAMSIZ);
        String::from_utf8_lossy(&self.ifr_name[..end]).to_string()
    }
}

/// Options for tap creation.
#[derive(Debug, Clone, Default)]
pub struct TapOptions {
    pub persist: bool,
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub multi_queue: bool,
}

/// An attached TAP device. Dropping the handle closes the fd; a persistent
/// tap survives that.
#[derive(Debug)]
pub struct TapDevice {
    name: String,
    file: File,
}

impl TapDevice {
    /// Create (or attach to) a TAP named `name`. The kernel returns the
    /// actual interface name, which may differ when `name` is a pattern.
    pub fn create(name: &str, options: &TapOptions) -> NetworkResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TUN_DEVICE)?;

        let mut flags = IFF_TAP | IFF_NO_PI;
        if options.multi_queue {
            flags |= IFF_MULTI_QUEUE;
        }

        let mut request = IfReqFlags::new(name, flags);
        ioctl(&file, TUNSETIFF, &mut request as *mut _ as libc::c_ulong, "TUNSETIFF")?;

        if let Some(owner) = options.owner {
            ioctl(&file, TUNSETOWNER, owner as libc::c_ulong, "TUNSETOWNER")?;
        }
        if let Some(group) = options.group {
            ioctl(&file, TUNSETGROUP, group as libc::c_ulong, "TUNSETGROUP")?;
        }
        if options.persist {
            ioctl(&file, TUNSETPERSIST, 1, "TUNSETPERSIST")?;
        }

        Ok(Self {
            name: request.name(),
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Close the creating fd, leaving a persistent tap behind for the VMM
    /// to open.
    pub fn close(self) {
        drop(self.file);
    }
}

/// Delete a persistent tap: attach to it, clear persistence, close.
pub fn delete_tap(name: &str) -> NetworkResult<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(TUN_DEVICE)?;

    let mut request = IfReqFlags::new(name, IFF_TAP | IFF_NO_PI);
    ioctl(&file, TUNSETIFF, &mut request as *mut _ as libc::c_ulong, "TUNSETIFF")?;
    ioctl(&file, TUNSETPERSIST, 0, "TUNSETPERSIST")?;

    Ok(())
}

fn ioctl(
    file: &File,
    request: libc::c_ulong,
    arg: libc::c_ulong,
    name: &'static str,
) -> NetworkResult<()> {
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request as _, arg) };
    if ret < 0 {
        return Err(NetworkError::Syscall(name, std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_name_roundtrip() {
        let request = IfReqFlags::new("hftap3", IFF_TAP | IFF_NO_PI);
        assert_eq!(request.name(), "hftap3");
        assert_eq!(request.ifr_flags, IFF_TAP | IFF_NO_PI);
    }

    #[test]
    fn test_ifreq_name_truncated() {
        let request = IfReqFlags::new("an-interface-name-way-too-long", IFF_TAP);
        assert_eq!(request.name().len(), IFNAMSIZ - 1);
    }

    #[test]
    fn test_ifreq_layout_matches_kernel() {
        // struct ifreq is 16 bytes of name plus a 24-byte union
        assert_eq!(std::mem::size_of::<IfReqFlags>(), 40);
    }

    #[test]
    fn test_create_requires_tun_device() {
        // In environments without privileges (or without /dev/net/tun) this
        // must fail with a syscall error rather than panic.
        let result = TapDevice::create("hftest0", &TapOptions::default());
        if let Err(e) = result {
            let message = e.to_string();
            assert!(
                message.contains("TUNSETIFF")
                    || message.contains("I/O error")
                    || message.contains("denied"),
                "unexpected error: {}",
                message
            );
        }
    }
}
