//! Forwarding authorization
//!
//! The authentication layer decides what an authenticated identity may
//! forward; the forwarding core only asks through [`ForwardingPolicy`].

/// Questions the forwarding core asks about the current identity.
pub trait ForwardingPolicy {
    /// Any TCP or stream forwarding at all.
    fn allows_tcp_forwarding(&self) -> bool;

    /// A `direct-tcpip` channel to `host`:`port`.
    fn allows_local_tcp_forwarding(&self, host: &str, port: u32) -> bool;
}

/// No restrictions.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ForwardingPolicy for AllowAll {
    fn allows_tcp_forwarding(&self) -> bool {
        true
    }

    fn allows_local_tcp_forwarding(&self, _host: &str, _port: u32) -> bool {
        true
    }
}

/// Canned answers for tests. An empty destination list allows any.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub(crate) struct Restricted {
    pub no_port_forwarding: bool,
    pub destinations: Vec<(String, u32)>,
}

#[cfg(test)]
impl ForwardingPolicy for Restricted {
    fn allows_tcp_forwarding(&self) -> bool {
        !self.no_port_forwarding
    }

    fn allows_local_tcp_forwarding(&self, host: &str, port: u32) -> bool {
        self.destinations.is_empty()
            || self.destinations.iter().any(|(h, p)| h == host && *p == port)
    }
}
