//! Configuration model and loading for tunman.
//!
//! A configuration file carries two sections:
//! 1. `tunman` -- the tunnel settings snapshot, re-read whenever the file changes
//! 2. `daemon` -- process-level settings, read once at startup
//!
//! Files ending in `.toml` are parsed as TOML, anything else as JSON.
//! Environment variables override the file (see [`apply_overrides`]).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default `ServerAliveInterval` passed to the transport.
pub const DEFAULT_SERVER_ALIVE_INTERVAL: u32 = 30;
/// Default `ServerAliveCountMax` passed to the transport.
pub const DEFAULT_SERVER_ALIVE_COUNT_MAX: u32 = 10;
/// Default `ExitOnForwardFailure` passed to the transport.
pub const DEFAULT_EXIT_ON_FORWARD_FAILURE: bool = true;

/// Complete tunman configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default, alias = "TunMan")]
    pub tunman: TunnelSettings,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

/// One desired tunnel state.
///
/// Compared structurally: two snapshots are equal only if every field,
/// including the order and content of `remote_host_keys` and `tunnels`, is.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TunnelSettings {
    pub server_alive_interval: Option<u32>,
    pub server_alive_count_max: Option<u32>,
    pub exit_on_forward_failure: Option<bool>,
    pub user: Option<String>,
    pub remote_host: Option<String>,
    /// Accepted host keys for `remote_host`, e.g. `"ssh-ed25519 AAAA..."`.
    pub remote_host_keys: Vec<String>,
    /// Inline private key. Ignored when `private_key_path` is set.
    pub private_key_content: Option<String>,
    pub private_key_path: Option<String>,
    /// Remote forwards, one `-R` rule each, in order.
    pub tunnels: Vec<TunnelSpec>,
}

impl TunnelSettings {
    pub fn server_alive_interval(&self) -> u32 {
        self.server_alive_interval
            .unwrap_or(DEFAULT_SERVER_ALIVE_INTERVAL)
    }

    pub fn server_alive_count_max(&self) -> u32 {
        self.server_alive_count_max
            .unwrap_or(DEFAULT_SERVER_ALIVE_COUNT_MAX)
    }

    pub fn exit_on_forward_failure(&self) -> bool {
        self.exit_on_forward_failure
            .unwrap_or(DEFAULT_EXIT_ON_FORWARD_FAILURE)
    }
}

/// A single remote forward: `remote_port` on the remote host is forwarded
/// to `local_host:local_port` on this side.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct TunnelSpec {
    pub remote_port: Option<u16>,
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
}

/// What to do with a running transport when its settings are superseded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeAction {
    /// Signal the process and wait for it before relaunching.
    #[default]
    Terminate,
    /// Stop relaying and waiting, leave the process running.
    Detach,
}

/// What to do when the current settings cannot be turned into an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigErrorAction {
    /// Park until the next settings change (or shutdown).
    #[default]
    WaitForChange,
    /// Stop the supervisor with the error.
    Exit,
}

/// Daemon-level configuration. Not hot-reloaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Transport executable.
    pub ssh_program: PathBuf,
    /// Optional shell wrapper; the transport is then run as
    /// `<shell> -c "exec <cmdline>"`.
    pub shell: Option<PathBuf>,
    /// Directory for known-hosts and key files. Defaults to the system temp dir.
    pub artifact_dir: Option<PathBuf>,
    pub backoff_step_ms: u64,
    pub backoff_max_ms: u64,
    pub terminate_timeout_secs: u64,
    pub on_change: ChangeAction,
    pub on_config_error: ConfigErrorAction,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            shell: None,
            artifact_dir: None,
            backoff_step_ms: 500,
            backoff_max_ms: 5000,
            terminate_timeout_secs: 5,
            on_change: ChangeAction::default(),
            on_config_error: ConfigErrorAction::default(),
        }
    }
}

/// Default config file: `<config_dir>/tunman/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tunman").join("config.toml"))
}

/// Load a configuration file and apply environment overrides.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = load_config_file(path)?;
    apply_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Parse a configuration file without applying overrides.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    parse_config(&content, is_toml(path)).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"))
}

/// Parse configuration text, TOML or JSON.
pub fn parse_config(content: &str, toml: bool) -> Result<Config> {
    if toml {
        Ok(toml::from_str(content)?)
    } else {
        Ok(serde_json::from_str(content)?)
    }
}

/// Apply `TUNMAN_*` overrides, looking each variable up through `lookup`.
pub fn apply_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("TUNMAN_USER") {
        config.tunman.user = Some(val);
    }
    if let Some(val) = lookup("TUNMAN_REMOTE_HOST") {
        config.tunman.remote_host = Some(val);
    }
    if let Some(val) = lookup("TUNMAN_PRIVATE_KEY_PATH") {
        config.tunman.private_key_path = Some(val);
    }
    if let Some(val) = lookup("TUNMAN_PRIVATE_KEY_CONTENT") {
        config.tunman.private_key_content = Some(val);
    }
    if let Some(val) = lookup("TUNMAN_SSH_PROGRAM") {
        config.daemon.ssh_program = PathBuf::from(val);
    }
}
