//! Address assignment over rtnetlink and link state via ifreq ioctls.
//!
//! The daemon speaks raw rtnetlink for IPv4 address add/remove: fixed-layout
//! `nlmsghdr` + `ifaddrmsg` + rtattr messages over an `AF_NETLINK` socket,
//! acked by the kernel with an `NLMSG_ERROR` frame (code 0 means success).
//! Link up/down goes through the legacy `SIOCGIFFLAGS`/`SIOCSIFFLAGS`
//! ioctls on an `AF_INET` datagram socket.

use std::ffi::CString;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::socket::{socket, AddressFamily, SockFlag, SockProtocol, SockType};

use super::{NetworkError, NetworkResult};

// rtnetlink message types and flags, from linux/rtnetlink.h and linux/netlink.h
const RTM_NEWADDR: u16 = 20;
const RTM_DELADDR: u16 = 21;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;

const NLMSG_ERROR: u16 = 0x0002;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_BROADCAST: u16 = 4;

const NLMSG_HDRLEN: usize = 16;
const IFADDRMSG_LEN: usize = 8;
const RTATTR_HDRLEN: usize = 4;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Serialize one rtattr carrying an IPv4 address.
fn push_addr_attr(buf: &mut Vec<u8>, kind: u16, addr: Ipv4Addr) {
    let len = (RTATTR_HDRLEN + 4) as u16;
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(&addr.octets());
    // 4-byte payload is already aligned
}

/// Build a complete RTM_NEWADDR / RTM_DELADDR message.
fn build_addr_message(
    msg_type: u16,
    flags: u16,
    ifindex: u32,
    ip: Ipv4Addr,
    prefix: u8,
    broadcast: Option<Ipv4Addr>,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);

    // nlmsghdr, length patched at the end
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&1u32.to_ne_bytes()); // seq
    buf.extend_from_slice(&0u32.to_ne_bytes()); // pid (kernel fills ours)

    // ifaddrmsg
    buf.push(libc::AF_INET as u8); // ifa_family
    buf.push(prefix); // ifa_prefixlen
    buf.push(0); // ifa_flags
    buf.push(0); // ifa_scope (RT_SCOPE_UNIVERSE)
    buf.extend_from_slice(&ifindex.to_ne_bytes());

    push_addr_attr(&mut buf, IFA_LOCAL, ip);
    push_addr_attr(&mut buf, IFA_ADDRESS, ip);
    if let Some(broadcast) = broadcast {
        push_addr_attr(&mut buf, IFA_BROADCAST, broadcast);
    }

    let total = align4(buf.len());
    buf.resize(total, 0);
    let len_bytes = (total as u32).to_ne_bytes();
    buf[..4].copy_from_slice(&len_bytes);

    buf
}

/// Broadcast address for `ip/prefix`.
pub fn broadcast_for(ip: Ipv4Addr, prefix: u8) -> Ipv4Addr {
    if prefix >= 32 {
        return ip;
    }
    let mask = u32::MAX << (32 - prefix as u32);
    Ipv4Addr::from(u32::from(ip) | !mask)
}

fn open_route_socket() -> NetworkResult<OwnedFd> {
    socket(
        AddressFamily::Netlink,
        SockType::Raw,
        SockFlag::empty(),
        SockProtocol::NetlinkRoute,
    )
    .map_err(|e| NetworkError::Syscall("socket(AF_NETLINK)", e.into()))
}

/// Send one request and wait for the kernel's ack frame.
fn netlink_transact(message: &[u8]) -> NetworkResult<()> {
    let fd = open_route_socket()?;

    let sent = unsafe {
        libc::send(
            fd.as_raw_fd(),
            message.as_ptr() as *const libc::c_void,
            message.len(),
            0,
        )
    };
    if sent < 0 {
        return Err(NetworkError::Syscall(
            "send(netlink)",
            std::io::Error::last_os_error(),
        ));
    }

    let mut response = [0u8; 4096];
    let received = unsafe {
        libc::recv(
            fd.as_raw_fd(),
            response.as_mut_ptr() as *mut libc::c_void,
            response.len(),
            0,
        )
    };
    if received < 0 {
        return Err(NetworkError::Syscall(
            "recv(netlink)",
            std::io::Error::last_os_error(),
        ));
    }
    let received = received as usize;

    if received < NLMSG_HDRLEN + 4 {
        return Err(NetworkError::Syscall(
            "recv(netlink)",
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short netlink reply"),
        ));
    }

    let msg_type = u16::from_ne_bytes([response[4], response[5]]);
    if msg_type == NLMSG_ERROR {
        let code = i32::from_ne_bytes([
            response[NLMSG_HDRLEN],
            response[NLMSG_HDRLEN + 1],
            response[NLMSG_HDRLEN + 2],
            response[NLMSG_HDRLEN + 3],
        ]);
        if code != 0 {
            return Err(NetworkError::Syscall(
                "netlink request",
                std::io::Error::from_raw_os_error(-code),
            ));
        }
    }

    Ok(())
}

/// Interface index by name.
pub fn if_index(name: &str) -> NetworkResult<u32> {
    let c_name = CString::new(name)
        .map_err(|_| NetworkError::InterfaceNotFound(name.to_string()))?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(NetworkError::InterfaceNotFound(name.to_string()));
    }
    Ok(index)
}

/// Add `ip/prefix` to the named interface, with the matching broadcast.
/// Already-present addresses are accepted.
pub fn add_address(ifname: &str, ip: Ipv4Addr, prefix: u8) -> NetworkResult<()> {
    let index = if_index(ifname)?;
    let message = build_addr_message(
        RTM_NEWADDR,
        NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        index,
        ip,
        prefix,
        Some(broadcast_for(ip, prefix)),
    );

    match netlink_transact(&message) {
        Err(NetworkError::Syscall(_, e)) if e.raw_os_error() == Some(libc::EEXIST) => Ok(()),
        other => other,
    }
}

/// Remove `ip/prefix` from the named interface. A missing address is fine.
pub fn del_address(ifname: &str, ip: Ipv4Addr, prefix: u8) -> NetworkResult<()> {
    let index = if_index(ifname)?;
    let message = build_addr_message(
        RTM_DELADDR,
        NLM_F_REQUEST | NLM_F_ACK,
        index,
        ip,
        prefix,
        None,
    );

    match netlink_transact(&message) {
        Err(NetworkError::Syscall(_, e)) if e.raw_os_error() == Some(libc::EADDRNOTAVAIL) => {
            Ok(())
        }
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Link flags via ifreq
// ---------------------------------------------------------------------------

#[repr(C)]
struct IfReqFlags {
    ifr_name: [u8; 16],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

fn open_inet_socket() -> NetworkResult<OwnedFd> {
    socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .map_err(|e| NetworkError::Syscall("socket(AF_INET)", e.into()))
}

fn set_link_flags(ifname: &str, up: bool) -> NetworkResult<()> {
    let fd = open_inet_socket()?;

    let mut request = IfReqFlags {
        ifr_name: [0u8; 16],
        ifr_flags: 0,
        _pad: [0u8; 22],
    };
    let bytes = ifname.as_bytes();
    let len = bytes.len().min(15);
    request.ifr_name[..len].copy_from_slice(&bytes[..len]);

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut request) };
    if ret < 0 {
        return Err(NetworkError::Syscall(
            "SIOCGIFFLAGS",
            std::io::Error::last_os_error(),
        ));
    }

    let up_flags = (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    if up {
        request.ifr_flags |= up_flags;
    } else {
        request.ifr_flags &= !up_flags;
    }

    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::SIOCSIFFLAGS as _, &request) };
    if ret < 0 {
        return Err(NetworkError::Syscall(
            "SIOCSIFFLAGS",
            std::io::Error::last_os_error(),
        ));
    }

    Ok(())
}

pub fn link_up(ifname: &str) -> NetworkResult<()> {
    set_link_flags(ifname, true)
}

pub fn link_down(ifname: &str) -> NetworkResult<()> {
    set_link_flags(ifname, false)
}
