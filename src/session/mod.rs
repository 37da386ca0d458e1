//! Session Module
//!
//! Owns the per-session forwarding state driven by the session event loop.

mod context;

pub use context::SessionContext;
