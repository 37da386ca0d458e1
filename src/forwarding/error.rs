//! Forwarding error types

use thiserror::Error;

use super::wire::WireError;
use crate::net::ListenError;

/// Why a forwarding request or channel open was refused.
///
/// Never sent to the peer verbatim: global requests answer with a bare
/// failure, channel opens with a reason code.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] WireError),

    #[error("{0} forwarding disabled")]
    Disabled(&'static str),

    #[error("forwarding not permitted by policy")]
    PolicyDenied,

    #[error("invalid port: {0}")]
    InvalidPort(u32),

    #[error("can't assign port {0} < 1024 for non-root")]
    PrivilegedPort(u32),

    #[error("stream path of {len} bytes exceeds limit of {max}")]
    PathTooLong { len: usize, max: usize },

    #[error("no forward listening on '{address}' port {port}")]
    NotFound { address: String, port: u32 },

    #[error("unsupported request '{0}'")]
    UnknownRequest(String),

    #[error(transparent)]
    Listen(#[from] ListenError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            ForwardError::PrivilegedPort(80).to_string(),
            "can't assign port 80 < 1024 for non-root"
        );
        assert_eq!(
            ForwardError::from(WireError::UnexpectedEnd).to_string(),
            "protocol violation: unexpected end of payload"
        );
        assert_eq!(
            ForwardError::NotFound {
                address: "localhost".into(),
                port: 8080
            }
            .to_string(),
            "no forward listening on 'localhost' port 8080"
        );
    }
}
