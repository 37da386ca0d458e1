//! Port Forwarding Module
//!
//! Server side of SSH TCP/IP and Unix stream forwarding: remote forwards
//! requested with `tcpip-forward`, and `direct-tcpip` /
//! `direct-streamlocal@openssh.com` channels that connect out.

pub mod direct;
mod error;
pub mod listener;
pub mod policy;
pub mod remote;
pub mod wire;

pub use direct::{
    cancel_channel_connect, open_direct_streamlocal, open_direct_tcpip, open_forward_channel,
    ChannelCompleter, ChannelOpenOutcome, ForwardChannel, OpenFailureReason,
};
pub use error::ForwardError;
pub use listener::{
    ChannelType, InboundConnection, Listener, ListenerId, ListenerRegistry, TcpForwardInfo,
};
pub use policy::{AllowAll, ForwardingPolicy};
pub use remote::{handle_global_request, GlobalReply, CANCEL_TCPIP_FORWARD, TCPIP_FORWARD};
pub use wire::WireError;
