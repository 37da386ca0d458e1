//! Configuration Management Module
//!
//! Runtime capability flags and socket knobs for the forwarding core,
//! persisted as JSON.

pub mod storage;
pub mod types;

pub use storage::ConfigError;
pub use types::{ForwardingConfig, CONFIG_VERSION};
