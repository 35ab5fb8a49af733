//! Known-hosts material for the remote host.

use std::path::Path;

use tracing::info;

use crate::artifact::EphemeralFile;
use crate::error::{ConfigError, SupervisorError};
use tunman_core::TunnelSettings;

/// Render one `"<host> <key>\n"` line per key, in order.
pub fn render_known_hosts(remote_host: &str, keys: &[String]) -> Result<String, ConfigError> {
    if keys.is_empty() {
        return Err(ConfigError::NoHostKeys);
    }
    Ok(keys
        .iter()
        .map(|key| format!("{remote_host} {key}\n"))
        .collect())
}

/// Write the known-hosts file for `settings` to a fresh ephemeral file,
/// under `dir` or the system temp dir.
pub fn write_known_hosts(
    settings: &TunnelSettings,
    dir: Option<&Path>,
) -> Result<EphemeralFile, SupervisorError> {
    let remote_host = settings
        .remote_host
        .as_deref()
        .ok_or(ConfigError::MissingField("remoteHost"))?;
    let contents = render_known_hosts(remote_host, &settings.remote_host_keys)?;
    info!(
        remote_host,
        keys = settings.remote_host_keys.len(),
        "Writing to trusted hosts"
    );
    Ok(EphemeralFile::create_in(
        dir,
        "tunman-known-hosts-",
        contents.as_bytes(),
    )?)
}
