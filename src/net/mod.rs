//! Outbound connection engine
//!
//! Resolution, non-blocking multi-candidate connects and multi-family
//! listening. Nothing here blocks after resolution; progress is driven by
//! the session event loop through [`PendingSet`].

pub mod connect;
pub mod error;
pub mod listen;
pub mod pending;
pub mod queue;
pub mod readiness;
pub mod resolver;
pub mod socket;

pub use connect::{
    AttemptState, BindSource, ConnectCallback, ConnectOptions, ConnectResult, ConnectionAttempt,
    FastOpen, KernelFastOpen,
};
pub use error::{CandidateError, ListenError, ResolutionError};
pub use listen::{listen_tcp, BoundListener, ListenOptions};
pub use pending::{ConnectHandle, PendingSet};
pub use queue::{PacketQueue, SharedWriteQueue};
pub use readiness::{poll_readable, poll_sets, poll_writable, FdSet};
pub use resolver::{
    default_resolver, AddressFamily, Candidate, Resolve, ResolveHints, ResolvedAddress,
    SystemResolver, VsockResolver, VMADDR_CID_ANY, VSOCK_MARKER,
};
pub use socket::{
    address_strings, local_port, max_unix_path_len, socket_address_strings, Priority,
};
