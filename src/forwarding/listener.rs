//! Listener Registry
//!
//! Bound forwarding listeners of one session, keyed by
//! (channel type, requested address, port). The registry also accepts
//! inbound connections on them once the event loop reports readability.

use std::fmt;
use std::os::unix::io::{AsRawFd, RawFd};

use bytes::{Bytes, BytesMut};
use slab::Slab;
use socket2::Socket;
use tracing::{debug, info, trace};

use super::error::ForwardError;
use super::wire::encode_forwarded_tcpip;
use crate::net::socket::set_nodelay;
use crate::net::{address_strings, listen_tcp, BoundListener, FdSet, ListenOptions, Resolve};

/// SSH channel types the forwarding core deals with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    /// Server to client, for a connection accepted on a remote forward
    ForwardedTcpip,
    /// Client to server, connect out to host:port
    DirectTcpip,
    /// Client to server, connect out to a Unix socket
    DirectStreamlocal,
}

impl ChannelType {
    pub fn name(self) -> &'static str {
        match self {
            Self::ForwardedTcpip => "forwarded-tcpip",
            Self::DirectTcpip => "direct-tcpip",
            Self::DirectStreamlocal => "direct-streamlocal@openssh.com",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Self> {
        match name {
            b"forwarded-tcpip" => Some(Self::ForwardedTcpip),
            b"direct-tcpip" => Some(Self::DirectTcpip),
            b"direct-streamlocal@openssh.com" => Some(Self::DirectStreamlocal),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a TCP forwarding listener was asked for and what it got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpForwardInfo {
    /// Address exactly as the peer sent it; cancellation matches on this
    pub request_address: String,
    /// Address actually bound. `None` is loopback only
    pub listen_address: Option<String>,
    /// Requested port, replaced by the allocated one once bound
    pub listen_port: u32,
    pub interface: Option<String>,
}

impl TcpForwardInfo {
    pub fn new(request_address: impl Into<String>, listen_port: u32) -> Self {
        Self {
            request_address: request_address.into(),
            listen_address: None,
            listen_port,
            interface: None,
        }
    }
}

/// Stable reference to a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId {
    key: usize,
    generation: u64,
}

/// One forwarding listener: every family's socket on the same port.
#[derive(Debug)]
pub struct Listener {
    pub id: ListenerId,
    pub channel_type: ChannelType,
    pub info: TcpForwardInfo,
    bound: BoundListener,
}

impl Listener {
    pub fn port(&self) -> u32 {
        self.bound.port
    }

    pub fn socket_count(&self) -> usize {
        self.bound.sockets.len()
    }

    pub fn sockets(&self) -> &[Socket] {
        &self.bound.sockets
    }

    fn matches(&self, channel_type: ChannelType, address: &str, port: u32) -> bool {
        self.channel_type == channel_type
            && self.info.listen_port == port
            && self.info.request_address == address
    }
}

/// A peer connected to a forwarding listener.
#[derive(Debug)]
pub struct InboundConnection {
    pub listener: ListenerId,
    pub channel_type: ChannelType,
    pub socket: Socket,
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

impl InboundConnection {
    /// Type-specific data for the channel open announcing this connection.
    pub fn open_payload(&self) -> Bytes {
        let mut buf = BytesMut::new();
        encode_forwarded_tcpip(
            &mut buf,
            &self.connected_address,
            self.connected_port,
            &self.originator_address,
            self.originator_port,
        );
        buf.freeze()
    }
}

/// All forwarding listeners of a session.
#[derive(Debug)]
pub struct ListenerRegistry {
    listeners: Slab<Listener>,
    next_generation: u64,
    max_fd: RawFd,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: Slab::new(),
            next_generation: 0,
            max_fd: -1,
        }
    }

    /// Bind `info.listen_address`/`info.listen_port` on every family and
    /// register the listener. Returns its id and the allocated port.
    pub fn listen_forward(
        &mut self,
        resolver: &dyn Resolve,
        mut info: TcpForwardInfo,
        channel_type: ChannelType,
        options: &ListenOptions,
    ) -> Result<(ListenerId, u32), ForwardError> {
        let mut options = options.clone();
        if info.interface.is_some() {
            options.interface = info.interface.clone();
        }

        let port = info.listen_port.to_string();
        let bound = listen_tcp(resolver, info.listen_address.as_deref(), &port, &options)?;
        info.listen_port = bound.port;
        self.max_fd = self.max_fd.max(bound.max_fd());

        let generation = self.next_generation;
        self.next_generation += 1;
        let entry = self.listeners.vacant_entry();
        let id = ListenerId {
            key: entry.key(),
            generation,
        };
        info!(
            "{} listener on '{}' port {} ({} sockets)",
            channel_type,
            info.request_address,
            bound.port,
            bound.sockets.len()
        );
        let allocated = bound.port;
        entry.insert(Listener {
            id,
            channel_type,
            info,
            bound,
        });
        Ok((id, allocated))
    }

    /// Remove the listener whose identity matches exactly, closing all of
    /// its sockets.
    pub fn cancel_forward(
        &mut self,
        address: &str,
        port: u32,
        channel_type: ChannelType,
    ) -> Result<TcpForwardInfo, ForwardError> {
        let key = self
            .listeners
            .iter()
            .find(|(_, l)| l.matches(channel_type, address, port))
            .map(|(key, _)| key)
            .ok_or_else(|| ForwardError::NotFound {
                address: address.to_string(),
                port,
            })?;

        let listener = self.listeners.remove(key);
        info!(
            "{} listener on '{}' port {} removed",
            channel_type, address, port
        );
        Ok(listener.info)
    }

    pub fn get(&self, id: ListenerId) -> Option<&Listener> {
        self.listeners
            .get(id.key)
            .filter(|l| l.id.generation == id.generation)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Listener> + '_ {
        self.listeners.iter().map(|(_, l)| l)
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn max_fd(&self) -> RawFd {
        self.max_fd
    }

    /// Register every listening socket for readability.
    pub fn populate_read_set(&self, set: &mut FdSet) {
        for (_, listener) in self.listeners.iter() {
            for fd in listener.bound.raw_fds() {
                set.insert(fd);
            }
        }
    }

    /// Accept one connection per ready listening socket.
    pub fn accept_ready(&mut self, ready: &FdSet) -> Vec<InboundConnection> {
        let mut accepted = Vec::new();
        for (_, listener) in self.listeners.iter() {
            for socket in &listener.bound.sockets {
                let fd = socket.as_raw_fd();
                if !ready.contains(fd) {
                    continue;
                }
                match accept_one(listener, socket) {
                    Ok(conn) => {
                        self.max_fd = self.max_fd.max(conn.socket.as_raw_fd());
                        accepted.push(conn);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => debug!("accept on fd {} failed: {}", fd, e),
                }
            }
        }
        accepted
    }

    /// Close every listener. Used at session teardown.
    pub fn clear(&mut self) {
        if !self.listeners.is_empty() {
            trace!("closing {} listeners", self.listeners.len());
        }
        self.listeners.clear();
    }
}

fn accept_one(listener: &Listener, socket: &Socket) -> std::io::Result<InboundConnection> {
    let (conn, peer) = socket.accept()?;
    conn.set_nonblocking(true)?;
    set_nodelay(&conn);

    let (originator_address, originator_port) = address_strings(&peer);
    trace!(
        "accepted {}:{} on {} listener port {}",
        originator_address,
        originator_port,
        listener.channel_type,
        listener.bound.port
    );
    Ok(InboundConnection {
        listener: listener.id,
        channel_type: listener.channel_type,
        socket: conn,
        connected_address: listener.info.request_address.clone(),
        connected_port: listener.bound.port,
        originator_address,
        originator_port: originator_port.parse().unwrap_or(0),
    })
}
