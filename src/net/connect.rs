//! Outbound Connection Attempt
//!
//! One attempt owns the resolved candidates for a single target and walks
//! them in order until a connect goes through or the list runs out.
//!
//! ```text
//! Resolving ──► Trying(i) ──► Connecting ──► Completed(Success)
//!                  ▲  │            │
//!                  │  ▼            ▼
//!                  └─ candidate failed (next i) ──► Completed(Failure)
//! ```
//!
//! Resolution happens synchronously when the attempt is created. Everything
//! after that is non-blocking: the pending set drives [`ConnectionAttempt::try_next`]
//! while populating the write set and [`ConnectionAttempt::check_connected`] once
//! the socket reports writable.

use std::fmt;
use std::io::{self, IoSlice};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use socket2::{SockAddr, Socket};
use tracing::{debug, trace};

use super::error::CandidateError;
use super::queue::SharedWriteQueue;
use super::resolver::{AddressFamily, Candidate, Resolve, ResolveHints};
use super::socket::{set_nodelay, set_priority, Priority};
use crate::config::ForwardingConfig;

/// Packets bundled into a fast-open SYN. Enough to hold the initial
/// handshake packets.
const FAST_OPEN_MAX_PACKETS: usize = 6;

/// Platform iovec ceiling for a single sendmsg(2).
const IOV_MAX: usize = 1024;

/// Outcome delivered to an attempt's callback, exactly once.
pub enum ConnectResult {
    /// Connected, non-blocking socket. Ownership passes to the callback.
    Connected(Socket),
    /// Every candidate failed; carries the last error text.
    Failed(String),
}

impl ConnectResult {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed(msg) => Some(msg),
            Self::Connected(_) => None,
        }
    }
}

impl fmt::Debug for ConnectResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(s) => write!(f, "Connected(fd {})", s.as_raw_fd()),
            Self::Failed(msg) => f.debug_tuple("Failed").field(msg).finish(),
        }
    }
}

/// Sends the first queued packets in the SYN of a fresh socket.
///
/// `Ok(n)` means the connect is under way and `n` bytes ride with it. An
/// `EINPROGRESS` error also starts the connect, with nothing sent. Any other
/// error leaves the socket unconnected.
pub trait FastOpen {
    fn send(&self, socket: &Socket, target: &SockAddr, packets: &[IoSlice<'_>]) -> io::Result<usize>;
}

/// `sendmsg(2)` with `MSG_FASTOPEN`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelFastOpen;

impl FastOpen for KernelFastOpen {
    #[cfg(target_os = "linux")]
    fn send(&self, socket: &Socket, target: &SockAddr, packets: &[IoSlice<'_>]) -> io::Result<usize> {
        socket.send_to_vectored_with_flags(packets, target, libc::MSG_FASTOPEN)
    }

    #[cfg(not(target_os = "linux"))]
    fn send(&self, _socket: &Socket, _target: &SockAddr, _packets: &[IoSlice<'_>]) -> io::Result<usize> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// Completion callback. Any context it needs is captured by the closure.
pub type ConnectCallback = Box<dyn FnOnce(ConnectResult)>;

/// Optional local source to bind before connecting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindSource {
    pub address: Option<String>,
    pub port: Option<String>,
}

impl BindSource {
    pub fn new(address: Option<&str>, port: Option<&str>) -> Option<Self> {
        if address.is_none() && port.is_none() {
            return None;
        }
        Some(Self {
            address: address.map(str::to_string),
            port: port.map(str::to_string),
        })
    }
}

/// Observable phase of a live attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// Candidates remain and no socket is open
    Trying,
    /// A socket is open and waiting for writability
    Connecting,
    /// Candidates exhausted; the failure is reported on the next populate
    Exhausted,
}

/// Settings an attempt needs from the daemon configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub disable_ip_tos: bool,
    pub tcp_fast_open: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            disable_ip_tos: false,
            tcp_fast_open: true,
        }
    }
}

impl From<&ForwardingConfig> for ConnectOptions {
    fn from(config: &ForwardingConfig) -> Self {
        Self {
            disable_ip_tos: config.disable_ip_tos,
            tcp_fast_open: config.tcp_fast_open,
        }
    }
}

/// One outbound connection target and its in-progress socket.
pub struct ConnectionAttempt {
    remote_host: String,
    remote_port: Option<String>,
    candidates: Vec<Candidate>,
    cursor: usize,
    socket: Option<Socket>,
    bind: Option<BindSource>,
    priority: Priority,
    write_queue: Option<SharedWriteQueue>,
    /// Bytes handed to fast open on the current socket. They leave the
    /// queue only once that socket connects.
    fast_open_sent: usize,
    callback: ConnectCallback,
    error: Option<String>,
}

impl ConnectionAttempt {
    /// Resolve `host`/`port` and prepare to connect. A resolution failure
    /// leaves the attempt exhausted with the resolver's message.
    pub fn remote(
        resolver: &dyn Resolve,
        host: &str,
        port: &str,
        bind: Option<BindSource>,
        priority: Priority,
        callback: ConnectCallback,
    ) -> Self {
        let mut attempt = Self::empty(host.to_string(), Some(port.to_string()), priority, callback);
        attempt.bind = bind;
        match resolver.resolve(Some(host), port, &ResolveHints::stream()) {
            Ok(candidates) => attempt.candidates = candidates,
            Err(e) => {
                trace!("Error resolving: {}", e.message);
                attempt.error = Some(e.to_string());
            }
        }
        attempt
    }

    /// Prepare a Unix-domain stream connection. The caller checks the path
    /// length first.
    pub fn unix(path: &Path, priority: Priority, callback: ConnectCallback) -> Self {
        let mut attempt = Self::empty(path.display().to_string(), None, priority, callback);
        attempt.candidates = vec![Candidate::unix(path)];
        attempt
    }

    fn empty(
        remote_host: String,
        remote_port: Option<String>,
        priority: Priority,
        callback: ConnectCallback,
    ) -> Self {
        Self {
            remote_host,
            remote_port,
            candidates: Vec::new(),
            cursor: 0,
            socket: None,
            bind: None,
            priority,
            write_queue: None,
            fast_open_sent: 0,
            callback,
            error: None,
        }
    }

    /// Target for diagnostics: `host port N` or the socket path.
    pub fn target(&self) -> String {
        match &self.remote_port {
            Some(port) => format!("{} port {}", self.remote_host, port),
            None => self.remote_host.clone(),
        }
    }

    pub fn state(&self) -> AttemptState {
        if self.socket.is_some() {
            AttemptState::Connecting
        } else if self.cursor < self.candidates.len() {
            AttemptState::Trying
        } else {
            AttemptState::Exhausted
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Let the first packets ride along with the connect via fast open.
    pub fn set_write_queue(&mut self, queue: SharedWriteQueue) {
        self.write_queue = Some(queue);
    }

    /// Swap in a callback that closes a late success and ignores failure.
    pub fn cancel(&mut self) {
        self.callback = Box::new(cancelled);
    }

    /// Walk candidates until one has a connect in flight or none remain.
    pub(crate) fn try_next(
        &mut self,
        resolver: &dyn Resolve,
        fast_open: &dyn FastOpen,
        options: &ConnectOptions,
    ) {
        debug_assert!(self.socket.is_none());

        while self.cursor < self.candidates.len() {
            let candidate = &self.candidates[self.cursor];
            self.cursor += 1;

            match start_candidate(
                candidate,
                self.bind.as_ref(),
                self.priority,
                &mut self.write_queue,
                resolver,
                fast_open,
                options,
            ) {
                Ok((socket, sent)) => {
                    trace!(
                        "connect to {} in flight via {} (fd {})",
                        self.target(),
                        candidate.address,
                        socket.as_raw_fd()
                    );
                    self.socket = Some(socket);
                    self.fast_open_sent = sent;
                    return;
                }
                Err(e) => {
                    trace!("candidate {} for {} failed: {}", candidate.address, self.target(), e);
                    self.error = Some(e.to_string());
                }
            }
        }
    }

    /// Read the pending socket's error status after it polled writable.
    ///
    /// Returns the connected socket on success, after dropping any bytes fast
    /// open delivered from the write queue. On failure the socket is closed,
    /// the queue is left whole for the next candidate, and the attempt goes
    /// back to trying the remaining candidates.
    pub(crate) fn check_connected(&mut self) -> Option<Socket> {
        let socket = self.socket.take()?;
        let sent = std::mem::take(&mut self.fast_open_sent);
        match socket.take_error() {
            Ok(None) => {
                if let Some(queue) = self.write_queue.as_ref().filter(|_| sent > 0) {
                    queue.borrow_mut().consume(sent);
                }
                Some(socket)
            }
            Ok(Some(e)) => {
                debug!("connect to {} failed: {}", self.target(), e);
                self.error = Some(e.to_string());
                None
            }
            Err(e) => {
                trace!("getsockopt SO_ERROR failed on fd {}: {}", socket.as_raw_fd(), e);
                self.error = Some(e.to_string());
                None
            }
        }
    }

    /// Hand the outcome to the callback, consuming the attempt.
    pub(crate) fn complete(self, result: ConnectResult) {
        (self.callback)(result)
    }

    /// Final failure text, synthesized if no candidate produced one.
    pub(crate) fn take_error(&mut self) -> String {
        self.error
            .take()
            .unwrap_or_else(|| "unexpected failure".to_string())
    }
}

impl fmt::Debug for ConnectionAttempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionAttempt")
            .field("target", &self.target())
            .field("candidates", &self.candidates.len())
            .field("cursor", &self.cursor)
            .field("fd", &self.raw_fd())
            .field("priority", &self.priority)
            .field("error", &self.error)
            .finish()
    }
}

fn cancelled(result: ConnectResult) {
    if let ConnectResult::Connected(socket) = result {
        trace!("closing fd {} of cancelled connection", socket.as_raw_fd());
        drop(socket);
    }
}

/// Open, configure and start connecting one candidate.
///
/// Returns the socket and the number of queued bytes fast open sent on it.
fn start_candidate(
    candidate: &Candidate,
    bind: Option<&BindSource>,
    priority: Priority,
    write_queue: &mut Option<SharedWriteQueue>,
    resolver: &dyn Resolve,
    fast_open: &dyn FastOpen,
    options: &ConnectOptions,
) -> Result<(Socket, usize), CandidateError> {
    let domain = candidate.address.domain().map_err(CandidateError::Socket)?;
    let socket = Socket::new(domain, candidate.socket_type, candidate.protocol)
        .map_err(CandidateError::Socket)?;

    // connect(2) on a non-blocking Unix socket reports EAGAIN, not EINPROGRESS.
    let slow_path = if candidate.family() == AddressFamily::Unix {
        libc::EAGAIN
    } else {
        libc::EINPROGRESS
    };

    if let Some(bind) = bind {
        bind_source(&socket, bind, candidate.family(), resolver)?;
    }

    set_nodelay(&socket);
    set_priority(&socket, priority, options.disable_ip_tos);
    socket.set_nonblocking(true).map_err(CandidateError::Socket)?;

    let target = candidate
        .address
        .to_sock_addr()
        .map_err(CandidateError::Address)?;

    let mut started = false;
    let mut sent = 0;
    if options.tcp_fast_open && candidate.address.is_inet() {
        if let Some(queue) = write_queue.as_ref().filter(|q| !q.borrow().is_empty()) {
            let result = {
                let queue = queue.borrow();
                let slices = queue.io_slices(FAST_OPEN_MAX_PACKETS.min(IOV_MAX));
                fast_open.send(&socket, &target, &slices)
            };
            match result {
                Ok(n) => {
                    trace!("fast open sent {} bytes", n);
                    sent = n;
                    started = true;
                }
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => started = true,
                Err(e) => {
                    trace!("sendmsg tcp_fastopen failed, falling back. {}", e);
                    *write_queue = None;
                }
            }
        }
    }

    if !started {
        match socket.connect(&target) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(slow_path) => {}
            Err(e) => return Err(CandidateError::Connect(e)),
        }
    }

    Ok((socket, sent))
}

fn bind_source(
    socket: &Socket,
    bind: &BindSource,
    family: AddressFamily,
    resolver: &dyn Resolve,
) -> Result<(), CandidateError> {
    let address = bind.address.as_deref();
    let port = bind.port.as_deref().unwrap_or("0");
    let describe = || (address.unwrap_or_default().to_string(), port.to_string());

    let hints = ResolveHints::stream().with_family(family).passive();
    let local = resolver
        .resolve(address, port, &hints)
        .map_err(|e| {
            let (address, port) = describe();
            CandidateError::BindResolve {
                address,
                port,
                message: e.message,
            }
        })?
        .into_iter()
        .next()
        .ok_or_else(|| {
            let (address, port) = describe();
            CandidateError::BindResolve {
                address,
                port,
                message: "no usable address".to_string(),
            }
        })?;

    let local = local.address.to_sock_addr().map_err(CandidateError::Address)?;
    socket.bind(&local).map_err(|source| {
        let (address, port) = describe();
        CandidateError::Bind {
            address,
            port,
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::error::ResolutionError;
    use crate::net::resolver::SystemResolver;
    use std::cell::RefCell;
    use std::net::TcpListener;
    use std::rc::Rc;

    struct FailingResolver;

    impl Resolve for FailingResolver {
        fn resolve(
            &self,
            host: Option<&str>,
            service: &str,
            _hints: &ResolveHints,
        ) -> Result<Vec<Candidate>, ResolutionError> {
            Err(ResolutionError::new(host, service, "Name or service not known"))
        }
    }

    fn noop() -> ConnectCallback {
        Box::new(|_| {})
    }

    #[test]
    fn test_resolution_failure_exhausts_attempt() {
        let mut attempt =
            ConnectionAttempt::remote(&FailingResolver, "nowhere", "22", None, Priority::Bulk, noop());
        assert_eq!(attempt.state(), AttemptState::Exhausted);
        assert_eq!(
            attempt.take_error(),
            "Error resolving 'nowhere' port '22'. Name or service not known"
        );
    }

    #[test]
    fn test_connect_in_flight_to_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();

        let mut attempt =
            ConnectionAttempt::remote(&SystemResolver, "127.0.0.1", &port, None, Priority::LowDelay, noop());
        assert_eq!(attempt.state(), AttemptState::Trying);

        attempt.try_next(&SystemResolver, &KernelFastOpen, &ConnectOptions::default());
        assert_eq!(attempt.state(), AttemptState::Connecting);
        assert!(attempt.raw_fd().is_some());
    }

    #[test]
    fn test_missing_unix_path_fails_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.sock");

        let mut attempt = ConnectionAttempt::unix(&path, Priority::Bulk, noop());
        attempt.try_next(&SystemResolver, &KernelFastOpen, &ConnectOptions::default());
        assert_eq!(attempt.state(), AttemptState::Exhausted);
        assert!(!attempt.take_error().is_empty());
    }

    #[test]
    fn test_bind_failure_is_candidate_local() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port().to_string();

        // TEST-NET-3 is never assigned to a local interface.
        let bind = BindSource::new(Some("203.0.113.7"), None);
        let mut attempt =
            ConnectionAttempt::remote(&SystemResolver, "127.0.0.1", &port, bind, Priority::Bulk, noop());
        attempt.try_next(&SystemResolver, &KernelFastOpen, &ConnectOptions::default());

        assert_eq!(attempt.state(), AttemptState::Exhausted);
        let err = attempt.take_error();
        assert!(err.starts_with("Error binding local address '203.0.113.7' (port 0)."), "{}", err);
    }

    #[test]
    fn test_cancel_closes_late_success() {
        let seen = Rc::new(RefCell::new(false));
        let seen_cb = seen.clone();
        let mut attempt = ConnectionAttempt::unix(
            Path::new("/nonexistent"),
            Priority::Bulk,
            Box::new(move |_| *seen_cb.borrow_mut() = true),
        );
        attempt.cancel();

        let (a, _b) = std::os::unix::net::UnixStream::pair().unwrap();
        attempt.complete(ConnectResult::Connected(Socket::from(a)));
        assert!(!*seen.borrow());
    }

    #[test]
    fn test_bind_source_none_when_empty() {
        assert!(BindSource::new(None, None).is_none());
        assert_eq!(
            BindSource::new(None, Some("4000")),
            Some(BindSource {
                address: None,
                port: Some("4000".into())
            })
        );
    }
}
