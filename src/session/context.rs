//! Per-session forwarding state
//!
//! Everything the forwarding core needs for one SSH session, passed
//! explicitly to each entry point.

use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use crate::config::ForwardingConfig;
use crate::forwarding::{InboundConnection, ListenerRegistry};
use crate::net::{
    default_resolver, poll_sets, ConnectOptions, FdSet, ListenOptions, PendingSet, Resolve,
};

/// Forwarding state owned by a session's event loop.
pub struct SessionContext {
    pub config: ForwardingConfig,
    pub resolver: Rc<dyn Resolve>,
    pub pending: PendingSet,
    pub listeners: ListenerRegistry,
    /// Ports below 1024 may be requested for remote forwards
    pub allow_priv_port: bool,
}

impl SessionContext {
    /// Session with the resolver stack the configuration asks for.
    /// Privileged ports are allowed when running as root.
    pub fn new(config: ForwardingConfig) -> Self {
        let resolver = default_resolver(config.vsock);
        let allow_priv_port = nix::unistd::geteuid().is_root();
        Self::with_resolver(config, resolver, allow_priv_port)
    }

    pub fn with_resolver(
        config: ForwardingConfig,
        resolver: Rc<dyn Resolve>,
        allow_priv_port: bool,
    ) -> Self {
        let pending = PendingSet::new(resolver.clone(), ConnectOptions::from(&config));
        Self {
            config,
            resolver,
            pending,
            listeners: ListenerRegistry::new(),
            allow_priv_port,
        }
    }

    pub fn listen_options(&self) -> ListenOptions {
        ListenOptions::from(&self.config)
    }

    /// Highest descriptor either component has registered.
    pub fn max_fd(&self) -> RawFd {
        self.pending.max_fd().max(self.listeners.max_fd())
    }

    /// Contribute listener sockets to `read` and pending connects to `write`.
    pub fn populate(&mut self, read: &mut FdSet, write: &mut FdSet) {
        self.listeners.populate_read_set(read);
        self.pending.populate_write_set(write);
    }

    /// Handle the sets returned by the event loop's wait. Pending connects
    /// complete through their callbacks; accepted connections are returned
    /// for the caller to open `forwarded-tcpip` channels.
    pub fn consume(&mut self, readable: &FdSet, writable: &FdSet) -> Vec<InboundConnection> {
        self.pending.consume_write_set(writable);
        self.listeners.accept_ready(readable)
    }

    /// One populate, wait, consume round.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<Vec<InboundConnection>> {
        let mut read = FdSet::new();
        let mut write = FdSet::new();
        self.populate(&mut read, &mut write);
        if read.is_empty() && write.is_empty() {
            return Ok(Vec::new());
        }
        let (readable, writable) = poll_sets(&read, &write, timeout)?;
        Ok(self.consume(&readable, &writable))
    }

    /// Drop pending connects without callbacks and close every listener.
    pub fn teardown(&mut self) {
        debug!(
            "session teardown: {} pending connects, {} listeners",
            self.pending.len(),
            self.listeners.len()
        );
        self.pending.clear();
        self.listeners.clear();
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::{ChannelType, TcpForwardInfo};
    use crate::net::{Priority, SystemResolver};
    use std::cell::Cell;
    use std::net::TcpStream;

    fn context() -> SessionContext {
        SessionContext::with_resolver(ForwardingConfig::default(), Rc::new(SystemResolver), false)
    }

    #[test]
    fn test_run_once_idle() {
        let mut ctx = context();
        assert!(ctx.run_once(Some(Duration::from_millis(1))).unwrap().is_empty());
        assert_eq!(ctx.max_fd(), -1);
    }

    #[test]
    fn test_loop_accepts_and_connects() {
        let mut ctx = context();
        let options = ctx.listen_options();
        let (_, port) = ctx
            .listeners
            .listen_forward(
                &*ctx.resolver,
                TcpForwardInfo::new("localhost", 0),
                ChannelType::ForwardedTcpip,
                &options,
            )
            .unwrap();

        // Connect to our own forward through the pending set.
        let connected = Rc::new(Cell::new(false));
        let flag = connected.clone();
        ctx.pending.begin_connect(
            "127.0.0.1",
            &port.to_string(),
            None,
            Priority::Bulk,
            move |r| flag.set(r.is_connected()),
        );

        let mut inbound = Vec::new();
        for _ in 0..50 {
            inbound.extend(ctx.run_once(Some(Duration::from_millis(100))).unwrap());
            if connected.get() && !inbound.is_empty() {
                break;
            }
        }
        assert!(connected.get());
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].connected_port, port);
        assert!(ctx.max_fd() >= 0);
    }

    #[test]
    fn test_teardown_closes_listeners() {
        let mut ctx = context();
        let options = ctx.listen_options();
        let (_, port) = ctx
            .listeners
            .listen_forward(
                &*ctx.resolver,
                TcpForwardInfo::new("localhost", 0),
                ChannelType::ForwardedTcpip,
                &options,
            )
            .unwrap();
        ctx.pending
            .begin_connect("127.0.0.1", "no-such-service-xyz", None, Priority::Bulk, |_| {
                panic!("callback must not run after teardown")
            });

        ctx.teardown();
        assert!(ctx.listeners.is_empty());
        assert!(ctx.pending.is_empty());
        assert!(TcpStream::connect(("127.0.0.1", port as u16)).is_err());
    }
}
