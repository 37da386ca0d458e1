//! Multi-family TCP listening
//!
//! Binds one listening socket per resolved address family. When an
//! ephemeral port is requested, the port the first socket received is
//! reused for every later family so the peer sees a single port.

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::Socket;
use tracing::{trace, warn};

use super::error::ListenError;
use super::resolver::{AddressFamily, Resolve, ResolveHints};
use super::socket::{local_port, set_listen_fast_open, set_nodelay};
use crate::config::ForwardingConfig;

/// Upper bound on sockets bound for one request.
pub const MAX_LISTEN_SOCKETS: usize = 4;

/// Knobs applied to every listening socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenOptions {
    /// Bind to this network interface (`SO_BINDTODEVICE`)
    pub interface: Option<String>,
    pub backlog: i32,
    /// Server-side TCP fast open queue length, if enabled
    pub fast_open_queue: Option<i32>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            interface: None,
            backlog: 128,
            fast_open_queue: None,
        }
    }
}

impl From<&ForwardingConfig> for ListenOptions {
    fn from(config: &ForwardingConfig) -> Self {
        Self {
            interface: config.interface.clone(),
            backlog: config.listen_backlog,
            fast_open_queue: config.listen_fast_open.then_some(config.listen_backlog),
        }
    }
}

/// Sockets bound for one listen request, all on `port`.
#[derive(Debug)]
pub struct BoundListener {
    pub sockets: Vec<Socket>,
    pub port: u32,
}

impl BoundListener {
    pub fn raw_fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.sockets.iter().map(AsRawFd::as_raw_fd)
    }

    pub fn max_fd(&self) -> RawFd {
        self.raw_fds().max().unwrap_or(-1)
    }
}

/// Listen on `address`/`port` for stream connections.
///
/// `address` selects the scope: `None` is loopback only, `Some("")` is every
/// interface, anything else is resolved as given. Succeeds if at least one
/// family bound; otherwise the last OS error is reported.
pub fn listen_tcp(
    resolver: &dyn Resolve,
    address: Option<&str>,
    port: &str,
    options: &ListenOptions,
) -> Result<BoundListener, ListenError> {
    let (host, hints) = match address {
        None => {
            trace!("listen: local loopback");
            (None, ResolveHints::stream())
        }
        Some("") => {
            match &options.interface {
                Some(iface) => trace!("listen: {}", iface),
                None => trace!("listen: all interfaces"),
            }
            (None, ResolveHints::stream().passive())
        }
        Some(addr) => (Some(addr), ResolveHints::stream().passive()),
    };

    let candidates = resolver.resolve(host, port, &hints)?;

    let mut sockets = Vec::new();
    let mut allocated_port = 0;
    let mut last_error = None;

    for mut candidate in candidates {
        if sockets.len() >= MAX_LISTEN_SOCKETS {
            break;
        }
        if allocated_port > 0 {
            candidate.address.set_port(allocated_port);
        }

        let result = candidate
            .address
            .domain()
            .and_then(|domain| Socket::new(domain, candidate.socket_type, candidate.protocol))
            .and_then(|socket| {
                prepare_listener(&socket, candidate.family(), options);
                socket.bind(&candidate.address.to_sock_addr()?)?;
                socket.listen(options.backlog)?;
                Ok(socket)
            });

        match result {
            Ok(socket) => {
                if allocated_port == 0 {
                    allocated_port = local_port(&socket);
                }
                trace!("listening on {} (fd {})", candidate.address, socket.as_raw_fd());
                sockets.push(socket);
            }
            Err(e) => {
                trace!("listen on {} failed: {}", candidate.address, e);
                last_error = Some(e);
            }
        }
    }

    if sockets.is_empty() {
        return Err(match last_error {
            Some(e) => ListenError::NoSocketBound(e),
            None => ListenError::NoAddress,
        });
    }

    trace!("listen: {} socks bound on port {}", sockets.len(), allocated_port);
    Ok(BoundListener {
        sockets,
        port: allocated_port,
    })
}

fn prepare_listener(socket: &Socket, family: AddressFamily, options: &ListenOptions) {
    if let Err(e) = socket.set_reuse_address(true) {
        trace!("Couldn't set SO_REUSEADDR: {}", e);
    }

    if let Some(iface) = &options.interface {
        if let Err(e) = bind_device(socket, iface) {
            warn!("Couldn't set SO_BINDTODEVICE: {}", e);
        }
    }

    if family == AddressFamily::Inet6 {
        if let Err(e) = socket.set_only_v6(true) {
            warn!("Couldn't set IPV6_V6ONLY: {}", e);
        }
    }

    set_nodelay(socket);

    if let Some(qlen) = options.fast_open_queue {
        set_listen_fast_open(socket, qlen);
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_device(socket: &Socket, iface: &str) -> io::Result<()> {
    socket.bind_device(Some(iface.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_device(_socket: &Socket, _iface: &str) -> io::Result<()> {
    Err(io::Error::from(io::ErrorKind::Unsupported))
}
