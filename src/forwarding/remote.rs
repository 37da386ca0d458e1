//! Remote Port Forwarding (server side)
//!
//! Handles the `tcpip-forward` and `cancel-tcpip-forward` global requests
//! (RFC 4254 section 7.1). A successful `tcpip-forward` leaves a listener
//! in the session's registry; connections accepted on it become
//! `forwarded-tcpip` channels.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, trace};

use super::error::ForwardError;
use super::listener::{ChannelType, TcpForwardInfo};
use super::policy::ForwardingPolicy;
use super::wire::{
    SshBufExt, WireError, MAX_HOST_LEN, MAX_NAME_LEN, SSH_MSG_REQUEST_FAILURE,
    SSH_MSG_REQUEST_SUCCESS,
};
use crate::session::SessionContext;

pub const TCPIP_FORWARD: &str = "tcpip-forward";
pub const CANCEL_TCPIP_FORWARD: &str = "cancel-tcpip-forward";

/// Highest reserved port (`IPPORT_RESERVED - 1`).
const MAX_PRIVILEGED_PORT: u32 = 1023;

/// Reply to a global request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalReply {
    /// `port` is set when the peer asked for an ephemeral port
    Success { port: Option<u32> },
    Failure,
}

impl GlobalReply {
    /// The reply message, including its message number.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5);
        match self {
            Self::Success { port } => {
                buf.put_u8(SSH_MSG_REQUEST_SUCCESS);
                if let Some(port) = port {
                    buf.put_u32(*port);
                }
            }
            Self::Failure => buf.put_u8(SSH_MSG_REQUEST_FAILURE),
        }
        buf.freeze()
    }
}

/// Handle an `SSH_MSG_GLOBAL_REQUEST` payload (after the message number).
///
/// Returns the reply to send, or `None` when the peer did not want one.
/// Only a payload too short to carry the request name and want-reply flag
/// is an error; every other problem becomes a failure reply.
pub fn handle_global_request(
    ctx: &mut SessionContext,
    policy: &dyn ForwardingPolicy,
    payload: &[u8],
) -> Result<Option<GlobalReply>, WireError> {
    let mut buf = payload;
    let name = buf.get_ssh_string()?;
    let want_reply = buf.get_ssh_bool()?;
    trace!(
        "global request '{}' want_reply={}",
        String::from_utf8_lossy(&name),
        want_reply
    );

    let reply = match dispatch(ctx, policy, &name, buf) {
        Ok(port) => GlobalReply::Success { port },
        Err(e) => {
            debug!(
                "global request '{}' failed: {}",
                String::from_utf8_lossy(&name),
                e
            );
            GlobalReply::Failure
        }
    };

    Ok(want_reply.then_some(reply))
}

fn dispatch(
    ctx: &mut SessionContext,
    policy: &dyn ForwardingPolicy,
    name: &[u8],
    body: &[u8],
) -> Result<Option<u32>, ForwardError> {
    if !ctx.config.remote_tcp_forwarding {
        return Err(ForwardError::Disabled("remote tcp"));
    }
    if !policy.allows_tcp_forwarding() {
        return Err(ForwardError::PolicyDenied);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(WireError::TooLong {
            len: name.len(),
            max: MAX_NAME_LEN,
        }
        .into());
    }

    match name {
        n if n == TCPIP_FORWARD.as_bytes() => tcpip_forward(ctx, body),
        n if n == CANCEL_TCPIP_FORWARD.as_bytes() => {
            cancel_tcpip_forward(ctx, body)?;
            Ok(None)
        }
        other => Err(ForwardError::UnknownRequest(
            String::from_utf8_lossy(other).into_owned(),
        )),
    }
}

/// Returns the allocated port when the peer asked for port 0.
fn tcpip_forward(ctx: &mut SessionContext, mut body: &[u8]) -> Result<Option<u32>, ForwardError> {
    let request_address = body.get_ssh_text(MAX_HOST_LEN)?;
    let port = body.get_ssh_u32()?;

    if port != 0 {
        if port > 65535 {
            return Err(ForwardError::InvalidPort(port));
        }
        if !ctx.allow_priv_port && port <= MAX_PRIVILEGED_PORT {
            return Err(ForwardError::PrivilegedPort(port));
        }
    }

    let mut info = TcpForwardInfo::new(request_address, port);
    info.interface = ctx.config.interface.clone();
    if ctx.config.listen_fwd_all && info.request_address != "localhost" {
        info.listen_address = Some(info.request_address.clone());
    }

    let options = ctx.listen_options();
    let (_, allocated) = ctx.listeners.listen_forward(
        &*ctx.resolver,
        info,
        ChannelType::ForwardedTcpip,
        &options,
    )?;

    info!("remote forward requested for port {}, bound {}", port, allocated);
    Ok((port == 0).then_some(allocated))
}

fn cancel_tcpip_forward(ctx: &mut SessionContext, mut body: &[u8]) -> Result<(), ForwardError> {
    let address = body.get_ssh_text(MAX_HOST_LEN)?;
    let port = body.get_ssh_u32()?;
    ctx.listeners
        .cancel_forward(&address, port, ChannelType::ForwardedTcpip)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwardingConfig;
    use crate::forwarding::policy::{AllowAll, Restricted};
    use crate::forwarding::wire::SshBufMutExt;
    use crate::net::{local_port, SystemResolver};
    use std::net::TcpStream;
    use std::rc::Rc;

    fn context(config: ForwardingConfig) -> SessionContext {
        SessionContext::with_resolver(config, Rc::new(SystemResolver), false)
    }

    fn request(name: &str, want_reply: bool, address: &str, port: u32) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_ssh_string(name.as_bytes());
        buf.put_ssh_bool(want_reply);
        buf.put_ssh_string(address.as_bytes());
        buf.put_u32(port);
        buf.to_vec()
    }

    fn ipv6_enabled() -> bool {
        std::fs::read_to_string("/proc/net/if_inet6").map_or(false, |s| !s.trim().is_empty())
    }

    fn allocated_port(reply: Option<GlobalReply>) -> u32 {
        match reply {
            Some(GlobalReply::Success { port: Some(port) }) => port,
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_reply_encoding() {
        assert_eq!(
            &GlobalReply::Success { port: Some(4022) }.encode()[..],
            &[81, 0, 0, 0x0f, 0xb6]
        );
        assert_eq!(&GlobalReply::Success { port: None }.encode()[..], &[81]);
        assert_eq!(&GlobalReply::Failure.encode()[..], &[82]);
    }

    #[test]
    fn test_forward_ephemeral_all_interfaces() {
        let mut ctx = context(ForwardingConfig {
            listen_fwd_all: true,
            ..Default::default()
        });
        let reply =
            handle_global_request(&mut ctx, &AllowAll, &request(TCPIP_FORWARD, true, "", 0)).unwrap();
        let port = allocated_port(reply);
        assert!(port > 0);

        let listener = ctx.listeners.iter().next().unwrap();
        assert_eq!(listener.info.listen_address.as_deref(), Some(""));
        for socket in listener.sockets() {
            assert_eq!(local_port(socket), port);
        }
        let _peer = TcpStream::connect(("127.0.0.1", port as u16)).unwrap();

        if ipv6_enabled() {
            assert_eq!(listener.socket_count(), 2);
            let _peer6 = TcpStream::connect(("::1", port as u16)).unwrap();
        } else {
            assert_eq!(listener.socket_count(), 1);
        }
    }

    #[test]
    fn test_localhost_stays_loopback() {
        let mut ctx = context(ForwardingConfig {
            listen_fwd_all: true,
            ..Default::default()
        });
        let reply = handle_global_request(
            &mut ctx,
            &AllowAll,
            &request(TCPIP_FORWARD, true, "localhost", 0),
        )
        .unwrap();
        allocated_port(reply);
        let listener = ctx.listeners.iter().next().unwrap();
        assert_eq!(listener.info.listen_address, None);
    }

    #[test]
    fn test_explicit_port_reply_has_no_port() {
        let mut ctx = context(ForwardingConfig::default());
        // Find a free port, then release it for the request.
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port() as u32;
        drop(probe);

        let reply = handle_global_request(
            &mut ctx,
            &AllowAll,
            &request(TCPIP_FORWARD, true, "localhost", port),
        )
        .unwrap();
        assert_eq!(reply, Some(GlobalReply::Success { port: None }));
    }

    #[test]
    fn test_privileged_and_invalid_ports() {
        let mut ctx = context(ForwardingConfig::default());
        for port in [22, 1023, 65536] {
            let reply = handle_global_request(
                &mut ctx,
                &AllowAll,
                &request(TCPIP_FORWARD, true, "localhost", port),
            )
            .unwrap();
            assert_eq!(reply, Some(GlobalReply::Failure), "port {}", port);
        }
        assert!(ctx.listeners.is_empty());
    }

    #[test]
    fn test_disabled_still_consumes_and_replies() {
        let mut ctx = context(ForwardingConfig {
            remote_tcp_forwarding: false,
            ..Default::default()
        });
        let reply =
            handle_global_request(&mut ctx, &AllowAll, &request(TCPIP_FORWARD, true, "", 0)).unwrap();
        assert_eq!(reply, Some(GlobalReply::Failure));

        let reply =
            handle_global_request(&mut ctx, &AllowAll, &request(TCPIP_FORWARD, false, "", 0)).unwrap();
        assert_eq!(reply, None);
        assert!(ctx.listeners.is_empty());
    }

    #[test]
    fn test_policy_denies() {
        let mut ctx = context(ForwardingConfig::default());
        let policy = Restricted {
            no_port_forwarding: true,
            ..Default::default()
        };
        let reply =
            handle_global_request(&mut ctx, &policy, &request(TCPIP_FORWARD, true, "", 0)).unwrap();
        assert_eq!(reply, Some(GlobalReply::Failure));
    }

    #[test]
    fn test_cancel_matches_requested_address() {
        let mut ctx = context(ForwardingConfig::default());
        let reply = handle_global_request(
            &mut ctx,
            &AllowAll,
            &request(TCPIP_FORWARD, true, "localhost", 0),
        )
        .unwrap();
        let port = allocated_port(reply);

        let miss = handle_global_request(
            &mut ctx,
            &AllowAll,
            &request(CANCEL_TCPIP_FORWARD, true, "127.0.0.1", port),
        )
        .unwrap();
        assert_eq!(miss, Some(GlobalReply::Failure));
        assert_eq!(ctx.listeners.len(), 1);

        let hit = handle_global_request(
            &mut ctx,
            &AllowAll,
            &request(CANCEL_TCPIP_FORWARD, true, "localhost", port),
        )
        .unwrap();
        assert_eq!(hit, Some(GlobalReply::Success { port: None }));
        assert!(ctx.listeners.is_empty());
    }

    #[test]
    fn test_unknown_and_overlong_names() {
        let mut ctx = context(ForwardingConfig::default());
        let reply = handle_global_request(
            &mut ctx,
            &AllowAll,
            &request("keepalive@openssh.com", true, "", 0),
        )
        .unwrap();
        assert_eq!(reply, Some(GlobalReply::Failure));

        let long = "x".repeat(MAX_NAME_LEN + 1);
        let reply = handle_global_request(&mut ctx, &AllowAll, &request(&long, true, "", 0)).unwrap();
        assert_eq!(reply, Some(GlobalReply::Failure));
    }

    #[test]
    fn test_truncated_body_fails_request() {
        let mut ctx = context(ForwardingConfig::default());
        let mut payload = request(TCPIP_FORWARD, true, "", 0);
        payload.truncate(payload.len() - 2);
        let reply = handle_global_request(&mut ctx, &AllowAll, &payload).unwrap();
        assert_eq!(reply, Some(GlobalReply::Failure));

        let header: &[u8] = &[0, 0, 0, 3, b'a'];
        assert!(handle_global_request(&mut ctx, &AllowAll, header).is_err());
    }
}
