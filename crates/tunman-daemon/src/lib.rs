//! tunman Daemon Library
//!
//! Keeps a reverse SSH tunnel alive:
//! - Change gate for hot-reloaded tunnel settings
//! - Known-hosts and private key files with scoped cleanup
//! - Transport invocation building
//! - Process supervision with linear backoff and output relaying
//! - Config file watching

pub mod artifact;
pub mod backoff;
pub mod credential;
pub mod error;
pub mod gate;
pub mod invocation;
pub mod output;
pub mod supervisor;
pub mod trust;
pub mod watcher;

pub use error::{ConfigError, SupervisorError};
pub use gate::ChangeGate;
pub use supervisor::{SupervisorEvent, TunnelSupervisor};
pub use watcher::ConfigWatcher;
