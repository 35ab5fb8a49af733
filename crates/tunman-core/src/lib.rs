//! tunman Core Library
//!
//! Shared functionality for the tunman daemon:
//! - Tunnel settings model (the hot-reloadable snapshot)
//! - Configuration file loading and environment overrides
//! - Common error types
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::{Config, DaemonConfig, TunnelSettings, TunnelSpec};
pub use error::{Error, Result};
