//! Address Resolution
//!
//! Turns a host/service pair into an ordered list of connection candidates.
//!
//! Two strategies implement [`Resolve`]:
//! - [`SystemResolver`] calls getaddrinfo(3) and copies every usable record
//!   out before the list is released with freeaddrinfo(3).
//! - [`VsockResolver`] wraps another resolver and synthesizes AF_VSOCK
//!   candidates for hosts carrying the `%vsock` marker, which the system
//!   resolver does not understand. Synthesized candidates are plain owned
//!   values and never reach freeaddrinfo(3).

use std::ffi::{CStr, CString};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::path::PathBuf;
use std::ptr;
use std::rc::Rc;

use socket2::{Domain, Protocol, SockAddr, Type};
use tracing::trace;

use super::error::ResolutionError;

/// Marker that selects the vsock family, e.g. `"3%vsock"` or `"%vsock"`.
pub const VSOCK_MARKER: &str = "%vsock";

/// `VMADDR_CID_ANY` from `<linux/vm_sockets.h>`.
pub const VMADDR_CID_ANY: u32 = u32::MAX;

/// Address family requested from, or produced by, resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Unspec,
    Inet,
    Inet6,
    Unix,
    Vsock,
}

/// A single resolved address with its family-specific payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAddress {
    Inet(SocketAddrV4),
    Inet6(SocketAddrV6),
    Unix(PathBuf),
    Vsock { cid: u32, port: u32 },
}

impl ResolvedAddress {
    pub fn family(&self) -> AddressFamily {
        match self {
            Self::Inet(_) => AddressFamily::Inet,
            Self::Inet6(_) => AddressFamily::Inet6,
            Self::Unix(_) => AddressFamily::Unix,
            Self::Vsock { .. } => AddressFamily::Vsock,
        }
    }

    /// True for the IP families, the only ones that can use TCP options.
    pub fn is_inet(&self) -> bool {
        matches!(self, Self::Inet(_) | Self::Inet6(_))
    }

    /// Port for families that have one.
    pub fn port(&self) -> Option<u32> {
        match self {
            Self::Inet(a) => Some(a.port() as u32),
            Self::Inet6(a) => Some(a.port() as u32),
            Self::Vsock { port, .. } => Some(*port),
            Self::Unix(_) => None,
        }
    }

    /// Rewrite the port; a no-op for Unix paths.
    pub fn set_port(&mut self, port: u32) {
        match self {
            Self::Inet(a) => a.set_port(port as u16),
            Self::Inet6(a) => a.set_port(port as u16),
            Self::Vsock { port: p, .. } => *p = port,
            Self::Unix(_) => {}
        }
    }

    pub fn domain(&self) -> io::Result<Domain> {
        match self {
            Self::Inet(_) => Ok(Domain::IPV4),
            Self::Inet6(_) => Ok(Domain::IPV6),
            Self::Unix(_) => Ok(Domain::UNIX),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Self::Vsock { .. } => Ok(Domain::VSOCK),
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            Self::Vsock { .. } => Err(vsock_unsupported()),
        }
    }

    pub fn to_sock_addr(&self) -> io::Result<SockAddr> {
        match self {
            Self::Inet(a) => Ok(SockAddr::from(*a)),
            Self::Inet6(a) => Ok(SockAddr::from(*a)),
            Self::Unix(path) => SockAddr::unix(path),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            Self::Vsock { cid, port } => Ok(SockAddr::vsock(*cid, *port)),
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            Self::Vsock { .. } => Err(vsock_unsupported()),
        }
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet(a) => write!(f, "{}", a),
            Self::Inet6(a) => write!(f, "{}", a),
            Self::Unix(path) => write!(f, "{}", path.display()),
            Self::Vsock { cid, port } => write!(f, "{}{}:{}", cid, VSOCK_MARKER, port),
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn vsock_unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "vsock is not supported on this platform",
    )
}

/// One candidate tried in turn while connecting or listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub address: ResolvedAddress,
    pub socket_type: Type,
    pub protocol: Option<Protocol>,
}

impl Candidate {
    pub fn new(address: ResolvedAddress, socket_type: Type) -> Self {
        Self {
            address,
            socket_type,
            protocol: None,
        }
    }

    /// Stream candidate for a Unix-domain path.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::new(ResolvedAddress::Unix(path.into()), Type::STREAM)
    }

    pub fn family(&self) -> AddressFamily {
        self.address.family()
    }
}

/// Resolution hints, mirroring the fields of `struct addrinfo` we use.
#[derive(Debug, Clone, Copy)]
pub struct ResolveHints {
    pub family: AddressFamily,
    pub socket_type: Type,
    /// `AI_PASSIVE`: a missing host means "all interfaces" instead of loopback.
    pub passive: bool,
}

impl ResolveHints {
    /// Stream sockets of any family, active (outbound) use.
    pub fn stream() -> Self {
        Self {
            family: AddressFamily::Unspec,
            socket_type: Type::STREAM,
            passive: false,
        }
    }

    pub fn with_family(mut self, family: AddressFamily) -> Self {
        self.family = family;
        self
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }
}

impl Default for ResolveHints {
    fn default() -> Self {
        Self::stream()
    }
}

/// Resolution strategy.
///
/// `host == None` follows getaddrinfo(3): loopback for active hints, the
/// wildcard address for passive ones.
pub trait Resolve {
    fn resolve(
        &self,
        host: Option<&str>,
        service: &str,
        hints: &ResolveHints,
    ) -> Result<Vec<Candidate>, ResolutionError>;
}

impl<R: Resolve + ?Sized> Resolve for Rc<R> {
    fn resolve(
        &self,
        host: Option<&str>,
        service: &str,
        hints: &ResolveHints,
    ) -> Result<Vec<Candidate>, ResolutionError> {
        (**self).resolve(host, service, hints)
    }
}

/// getaddrinfo(3) backed resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(
        &self,
        host: Option<&str>,
        service: &str,
        hints: &ResolveHints,
    ) -> Result<Vec<Candidate>, ResolutionError> {
        let family = match hints.family {
            AddressFamily::Unspec => libc::AF_UNSPEC,
            AddressFamily::Inet => libc::AF_INET,
            AddressFamily::Inet6 => libc::AF_INET6,
            AddressFamily::Unix | AddressFamily::Vsock => {
                return Err(ResolutionError::new(
                    host,
                    service,
                    "Address family not supported by the system resolver",
                ));
            }
        };

        let c_host = host
            .map(CString::new)
            .transpose()
            .map_err(|_| ResolutionError::new(host, service, "host contains a NUL byte"))?;
        let c_service = CString::new(service)
            .map_err(|_| ResolutionError::new(host, service, "service contains a NUL byte"))?;

        // SAFETY: all-zero is a valid `addrinfo` hints value.
        let mut raw_hints: libc::addrinfo = unsafe { mem::zeroed() };
        raw_hints.ai_family = family;
        raw_hints.ai_socktype = libc::c_int::from(hints.socket_type);
        if hints.passive {
            raw_hints.ai_flags = libc::AI_PASSIVE;
        }

        let mut res: *mut libc::addrinfo = ptr::null_mut();
        let rc = unsafe {
            libc::getaddrinfo(
                c_host.as_ref().map_or(ptr::null(), |h| h.as_ptr()),
                c_service.as_ptr(),
                &raw_hints,
                &mut res,
            )
        };
        if rc != 0 {
            let message = gai_message(rc);
            trace!("getaddrinfo({:?}, {}) failed: {}", host, service, message);
            return Err(ResolutionError::new(host, service, message));
        }

        let list = AddrInfoList(res);
        Ok(list.iter().filter_map(candidate_from_addrinfo).collect())
    }
}

/// Resolver decorator adding the synthetic vsock path.
#[derive(Debug, Clone, Default)]
pub struct VsockResolver<R> {
    inner: R,
}

impl<R: Resolve> VsockResolver<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Resolve> Resolve for VsockResolver<R> {
    fn resolve(
        &self,
        host: Option<&str>,
        service: &str,
        hints: &ResolveHints,
    ) -> Result<Vec<Candidate>, ResolutionError> {
        let wants_vsock = matches!(hints.family, AddressFamily::Unspec | AddressFamily::Vsock);
        if let Some(h) = host.filter(|_| wants_vsock) {
            if let Some(pos) = h.find(VSOCK_MARKER) {
                let cid = if pos == 0 {
                    VMADDR_CID_ANY
                } else {
                    leading_u32(h)
                };
                let port = leading_u32(service);
                trace!("Synthesized vsock candidate cid={} port={}", cid, port);
                return Ok(vec![Candidate::new(
                    ResolvedAddress::Vsock { cid, port },
                    hints.socket_type,
                )]);
            }
        }
        self.inner.resolve(host, service, hints)
    }
}

/// Build the resolver stack for the given capability.
pub fn default_resolver(vsock: bool) -> Rc<dyn Resolve> {
    if vsock {
        Rc::new(VsockResolver::new(SystemResolver))
    } else {
        Rc::new(SystemResolver)
    }
}

/// Leading-digit parse with atoi(3) semantics: stops at the first
/// non-digit, yields 0 when there are none.
pub(crate) fn leading_u32(s: &str) -> u32 {
    s.trim_start()
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u32, |acc, d| acc.wrapping_mul(10).wrapping_add((d - b'0') as u32))
}

fn gai_message(code: libc::c_int) -> String {
    if code == libc::EAI_SYSTEM {
        return io::Error::last_os_error().to_string();
    }
    // SAFETY: gai_strerror returns a pointer to a static string.
    unsafe { CStr::from_ptr(libc::gai_strerror(code)) }
        .to_string_lossy()
        .into_owned()
}

fn candidate_from_addrinfo(ai: &libc::addrinfo) -> Option<Candidate> {
    if ai.ai_addr.is_null() {
        return None;
    }
    let len = ai.ai_addrlen as usize;
    let address = match ai.ai_family {
        libc::AF_INET if len >= mem::size_of::<libc::sockaddr_in>() => {
            // SAFETY: family and length checked above.
            let sin = unsafe { ptr::read_unaligned(ai.ai_addr as *const libc::sockaddr_in) };
            ResolvedAddress::Inet(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            ))
        }
        libc::AF_INET6 if len >= mem::size_of::<libc::sockaddr_in6>() => {
            // SAFETY: family and length checked above.
            let sin6 = unsafe { ptr::read_unaligned(ai.ai_addr as *const libc::sockaddr_in6) };
            ResolvedAddress::Inet6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            ))
        }
        _ => return None,
    };
    Some(Candidate {
        address,
        socket_type: Type::from(ai.ai_socktype),
        protocol: (ai.ai_protocol != 0).then(|| Protocol::from(ai.ai_protocol)),
    })
}

/// Owned getaddrinfo(3) result, released with freeaddrinfo(3) on drop.
struct AddrInfoList(*mut libc::addrinfo);

impl AddrInfoList {
    fn iter(&self) -> AddrInfoIter<'_> {
        AddrInfoIter {
            cur: self.0,
            _list: PhantomData,
        }
    }
}

impl Drop for AddrInfoList {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe { libc::freeaddrinfo(self.0) };
        }
    }
}

struct AddrInfoIter<'a> {
    cur: *const libc::addrinfo,
    _list: PhantomData<&'a AddrInfoList>,
}

impl<'a> Iterator for AddrInfoIter<'a> {
    type Item = &'a libc::addrinfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur.is_null() {
            return None;
        }
        // SAFETY: the list outlives the iterator and is not mutated.
        let ai = unsafe { &*self.cur };
        self.cur = ai.ai_next;
        Some(ai)
    }
}
