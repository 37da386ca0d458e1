//! Network error types

use std::io;

use thiserror::Error;

/// Name or address lookup failed.
///
/// `message` is the resolver's own text (`gai_strerror` or the OS error),
/// so callers can surface it unchanged.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Error resolving '{host}' port '{service}'. {message}")]
pub struct ResolutionError {
    pub host: String,
    pub service: String,
    pub message: String,
}

impl ResolutionError {
    pub fn new(
        host: Option<&str>,
        service: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            host: host.unwrap_or_default().to_string(),
            service: service.into(),
            message: message.into(),
        }
    }
}

/// One connection candidate failed. Never fatal on its own: the attempt
/// records the text and moves on to the next candidate.
#[derive(Error, Debug)]
pub enum CandidateError {
    #[error("{0}")]
    Socket(io::Error),

    #[error("Error resolving bind address '{address}' (port {port}). {message}")]
    BindResolve {
        address: String,
        port: String,
        message: String,
    },

    #[error("Error binding local address '{address}' (port {port}). {source}")]
    Bind {
        address: String,
        port: String,
        source: io::Error,
    },

    #[error("{0}")]
    Connect(io::Error),

    #[error("{0}")]
    Address(io::Error),
}

/// Binding a forwarding listener failed for every resolved family.
#[derive(Error, Debug)]
pub enum ListenError {
    #[error(transparent)]
    Resolve(#[from] ResolutionError),

    #[error("Error listening: {0}")]
    NoSocketBound(io::Error),

    #[error("Error listening: no usable address")]
    NoAddress,
}
