//! Socket options and address helpers shared by connect and listen paths.

use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};

#[cfg(target_os = "linux")]
use nix::sys::socket::{setsockopt, sockopt};
use serde::{Deserialize, Serialize};
use socket2::{SockAddr, Socket};
use tracing::trace;

use super::resolver::VSOCK_MARKER;

/// DSCP AF21, the low-latency class from RFC 4594.
const IPTOS_DSCP_AF21: u32 = 0x48;

/// `TC_PRIO_INTERACTIVE` from `<linux/pkt_sched.h>`.
#[cfg(target_os = "linux")]
const TC_PRIO_INTERACTIVE: libc::c_int = 6;

/// Send priority hint for a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Interactive traffic: tty sessions, handshake and setup packets
    LowDelay,
    /// Everything else, left at the default class
    #[default]
    Bulk,
}

/// Disable Nagle. Fails harmlessly on non-TCP sockets.
pub fn set_nodelay(socket: &Socket) {
    if let Err(e) = socket.set_nodelay(true) {
        trace!("Couldn't set TCP_NODELAY on fd {}: {}", socket.as_raw_fd(), e);
    }
}

/// Apply the DSCP class and, on Linux, the local queueing priority.
///
/// Best-effort: `ENOTSOCK` is ignored silently, anything else is only traced.
pub fn set_priority(socket: &Socket, prio: Priority, disable_ip_tos: bool) {
    if !disable_ip_tos {
        let tos = match prio {
            Priority::LowDelay => IPTOS_DSCP_AF21,
            Priority::Bulk => 0,
        };
        if let Err(e) = socket.set_tclass_v6(tos) {
            trace_unless_notsock("IPV6_TCLASS", &e);
        }
        if let Err(e) = socket.set_tos(tos) {
            trace_unless_notsock("IP_TOS", &e);
        }
    }

    #[cfg(target_os = "linux")]
    {
        let qos = match prio {
            Priority::LowDelay => TC_PRIO_INTERACTIVE,
            Priority::Bulk => 0,
        };
        if let Err(e) = setsockopt(socket, sockopt::Priority, &qos) {
            let e = io::Error::from(e);
            trace_unless_notsock("SO_PRIORITY", &e);
        }
    }
}

/// Enable server-side TCP fast open with the given pending-request queue length.
///
/// socket2 has no typed setter for `TCP_FASTOPEN`, so this one goes through
/// setsockopt(2) directly.
#[cfg(target_os = "linux")]
pub fn set_listen_fast_open(socket: &Socket, qlen: i32) {
    if let Err(e) = setsockopt_int(socket.as_raw_fd(), libc::SOL_TCP, libc::TCP_FASTOPEN, qlen) {
        trace!(
            "set_listen_fast_open failed for socket {}: {}",
            socket.as_raw_fd(),
            e
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_listen_fast_open(_socket: &Socket, _qlen: i32) {}

fn trace_unless_notsock(option: &str, e: &io::Error) {
    if e.raw_os_error() != Some(libc::ENOTSOCK) {
        trace!("Couldn't set {} ({})", option, e);
    }
}

#[cfg(target_os = "linux")]
fn setsockopt_int(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as _,
            mem::size_of_val(&value) as _,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Port a socket is bound to: the inet port, the vsock port, or 0 for
/// anything without one.
pub fn local_port(socket: &Socket) -> u32 {
    match socket.local_addr() {
        Ok(addr) => sock_addr_port(&addr),
        Err(e) => {
            trace!("getsockname failed: {}", e);
            0
        }
    }
}

pub fn sock_addr_port(addr: &SockAddr) -> u32 {
    if let Some(sa) = addr.as_socket() {
        return sa.port() as u32;
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some((_, port)) = addr.as_vsock_address() {
        return port;
    }
    0
}

/// Numeric host and port text for a socket address.
///
/// Vsock addresses render as `"<cid>%vsock"`; families without a host/port
/// notion yield empty strings.
pub fn address_strings(addr: &SockAddr) -> (String, String) {
    if let Some(sa) = addr.as_socket() {
        return (sa.ip().to_string(), sa.port().to_string());
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some((cid, port)) = addr.as_vsock_address() {
        return (format!("{}{}", cid, VSOCK_MARKER), port.to_string());
    }
    (String::new(), String::new())
}

/// Local and peer address strings of a connected socket.
pub fn socket_address_strings(socket: &Socket) -> io::Result<((String, String), (String, String))> {
    let local = address_strings(&socket.local_addr()?);
    let peer = address_strings(&socket.peer_addr()?);
    Ok((local, peer))
}

/// Longest Unix socket path that still leaves room for the NUL terminator.
pub fn max_unix_path_len() -> usize {
    // SAFETY: sockaddr_un is plain old data.
    let addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_path.len() - 1
}
