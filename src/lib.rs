//! oxidesshd - outbound connection engine and forwarding core of an SSH daemon
//!
//! Non-blocking, multi-family connection establishment plus the server side
//! of SSH port forwarding (`tcpip-forward`, `direct-tcpip`,
//! `direct-streamlocal@openssh.com`). Single-threaded and readiness driven:
//! the session event loop calls [`SessionContext::populate`] before its wait
//! and [`SessionContext::consume`] after it.

pub mod config;
pub mod forwarding;
pub mod net;
pub mod session;

pub use config::{ConfigError, ForwardingConfig};
pub use forwarding::{ForwardError, ForwardingPolicy};
pub use net::{ConnectHandle, ConnectResult, PendingSet, Priority};
pub use session::SessionContext;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging
///
/// `RUST_LOG` overrides the default `info` level, e.g.
/// `RUST_LOG=oxidesshd_lib::net=trace` for per-candidate connect detail.
/// Calling it twice is harmless.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
