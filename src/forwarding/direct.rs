//! Local Forwarding Channels (server side)
//!
//! `direct-tcpip` (RFC 4254 section 7.2) and `direct-streamlocal@openssh.com`
//! channel opens. Each accepted open starts an outbound connection; the
//! channel layer learns the outcome through [`ChannelCompleter`].

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::rc::Rc;

use tracing::{debug, trace};

use super::error::ForwardError;
use super::listener::ChannelType;
use super::policy::ForwardingPolicy;
use super::wire::{SshBufExt, MAX_HOST_LEN};
use crate::net::{max_unix_path_len, ConnectHandle, ConnectResult, PendingSet, Priority, VSOCK_MARKER};
use crate::session::SessionContext;

/// `SSH_MSG_CHANNEL_OPEN_FAILURE` reason codes used here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpenFailureReason {
    AdministrativelyProhibited = 1,
    ConnectFailed = 2,
}

impl OpenFailureReason {
    pub fn code(self) -> u32 {
        self as u32
    }
}

/// Result of a channel open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOpenOutcome {
    /// Connect started; confirmation waits for the completion callback
    InProgress(ConnectHandle),
    Rejected(OpenFailureReason),
}

/// The channel being opened, as seen by the forwarding core.
pub trait ForwardChannel {
    fn index(&self) -> u32;

    /// Remember the outbound connect so a close can cancel it.
    fn set_pending_connect(&mut self, handle: ConnectHandle);

    fn take_pending_connect(&mut self) -> Option<ConnectHandle>;
}

/// Channel layer entry point for finished outbound connects.
///
/// A connected socket belongs to the channel from here on. A failure should
/// be answered with [`OpenFailureReason::ConnectFailed`].
pub trait ChannelCompleter {
    fn connect_done(&self, channel: u32, result: ConnectResult);
}

/// Dispatch a client channel open by type.
pub fn open_forward_channel(
    ctx: &mut SessionContext,
    policy: &dyn ForwardingPolicy,
    channel_type: ChannelType,
    channel: &mut dyn ForwardChannel,
    completer: Rc<dyn ChannelCompleter>,
    payload: &[u8],
) -> ChannelOpenOutcome {
    match channel_type {
        ChannelType::DirectTcpip => open_direct_tcpip(ctx, policy, channel, completer, payload),
        ChannelType::DirectStreamlocal => {
            open_direct_streamlocal(ctx, policy, channel, completer, payload)
        }
        // Only the server opens these.
        ChannelType::ForwardedTcpip => {
            debug!("client tried to open a {} channel", channel_type);
            ChannelOpenOutcome::Rejected(OpenFailureReason::AdministrativelyProhibited)
        }
    }
}

/// Handle a `direct-tcpip` open. `payload` is the type-specific data:
/// host to connect, port, originator address, originator port.
pub fn open_direct_tcpip(
    ctx: &mut SessionContext,
    policy: &dyn ForwardingPolicy,
    channel: &mut dyn ForwardChannel,
    completer: Rc<dyn ChannelCompleter>,
    payload: &[u8],
) -> ChannelOpenOutcome {
    trace!("direct-tcpip channel {}", channel.index());
    let result = direct_tcpip(ctx, policy, channel.index(), completer, payload);
    finish(channel, ChannelType::DirectTcpip, result)
}

/// Handle a `direct-streamlocal@openssh.com` open. `payload` is the socket
/// path followed by a reserved string and a reserved uint32.
pub fn open_direct_streamlocal(
    ctx: &mut SessionContext,
    policy: &dyn ForwardingPolicy,
    channel: &mut dyn ForwardChannel,
    completer: Rc<dyn ChannelCompleter>,
    payload: &[u8],
) -> ChannelOpenOutcome {
    trace!("streamlocal channel {}", channel.index());
    let result = direct_streamlocal(ctx, policy, channel.index(), completer, payload);
    finish(channel, ChannelType::DirectStreamlocal, result)
}

/// Cancel the outbound connect of a channel closing before it completed.
pub fn cancel_channel_connect(pending: &mut PendingSet, channel: &mut dyn ForwardChannel) -> bool {
    match channel.take_pending_connect() {
        Some(handle) => pending.cancel(handle),
        None => false,
    }
}

fn finish(
    channel: &mut dyn ForwardChannel,
    channel_type: ChannelType,
    result: Result<ConnectHandle, ForwardError>,
) -> ChannelOpenOutcome {
    match result {
        Ok(handle) => {
            channel.set_pending_connect(handle);
            ChannelOpenOutcome::InProgress(handle)
        }
        Err(e) => {
            debug!("{} channel {} rejected: {}", channel_type, channel.index(), e);
            ChannelOpenOutcome::Rejected(OpenFailureReason::AdministrativelyProhibited)
        }
    }
}

fn completion(
    completer: Rc<dyn ChannelCompleter>,
    channel: u32,
) -> impl FnOnce(ConnectResult) + 'static {
    move |result| completer.connect_done(channel, result)
}

fn direct_tcpip(
    ctx: &mut SessionContext,
    policy: &dyn ForwardingPolicy,
    channel: u32,
    completer: Rc<dyn ChannelCompleter>,
    mut payload: &[u8],
) -> Result<ConnectHandle, ForwardError> {
    if !ctx.config.local_tcp_forwarding {
        return Err(ForwardError::Disabled("local tcp"));
    }
    if !policy.allows_tcp_forwarding() {
        return Err(ForwardError::PolicyDenied);
    }

    let dest_host = payload.get_ssh_text(MAX_HOST_LEN)?;
    let dest_port = payload.get_ssh_u32()?;
    let orig_host = payload.get_ssh_text(MAX_HOST_LEN)?;
    let orig_port = payload.get_ssh_u32()?;

    // Vsock originators carry 32-bit ports.
    let vsock_origin = ctx.config.vsock && orig_host.contains(VSOCK_MARKER);
    if !vsock_origin {
        if dest_port > 65535 {
            return Err(ForwardError::InvalidPort(dest_port));
        }
        if orig_port > 65535 {
            return Err(ForwardError::InvalidPort(orig_port));
        }
    }

    if !policy.allows_local_tcp_forwarding(&dest_host, dest_port) {
        return Err(ForwardError::PolicyDenied);
    }

    debug!(
        "direct-tcpip to {} port {} from {} port {}",
        dest_host, dest_port, orig_host, orig_port
    );
    Ok(ctx.pending.begin_connect(
        &dest_host,
        &dest_port.to_string(),
        None,
        Priority::Bulk,
        completion(completer, channel),
    ))
}

fn direct_streamlocal(
    ctx: &mut SessionContext,
    policy: &dyn ForwardingPolicy,
    channel: u32,
    completer: Rc<dyn ChannelCompleter>,
    mut payload: &[u8],
) -> Result<ConnectHandle, ForwardError> {
    if !ctx.config.local_streamlocal_forwarding {
        return Err(ForwardError::Disabled("local streamlocal"));
    }
    if !policy.allows_tcp_forwarding() {
        return Err(ForwardError::PolicyDenied);
    }

    let path = payload.get_ssh_string()?;
    let _reserved = payload.get_ssh_string()?;
    let _reserved = payload.get_ssh_u32()?;

    let max = max_unix_path_len();
    if path.len() > max {
        return Err(ForwardError::PathTooLong {
            len: path.len(),
            max,
        });
    }

    let path = PathBuf::from(OsStr::from_bytes(&path));
    debug!("direct-streamlocal to {}", path.display());
    let handle = ctx
        .pending
        .begin_connect_unix(&path, Priority::Bulk, completion(completer, channel));
    // The length was checked above, so the attempt always starts.
    handle.ok_or(ForwardError::PathTooLong {
        len: path.as_os_str().len(),
        max,
    })
}
