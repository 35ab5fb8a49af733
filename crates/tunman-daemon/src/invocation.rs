//! Transport command line construction.

use std::fmt;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::info;

use crate::error::ConfigError;
use tunman_core::TunnelSettings;

/// Arguments for one transport launch, in the order the transport expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    args: Vec<String>,
}

impl Invocation {
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The `user@host` destination, always the last argument.
    pub fn destination(&self) -> Option<&str> {
        self.args.last().map(String::as_str)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}

/// Validate `settings` and render the transport arguments.
///
/// Pure: the known-hosts and identity files must already exist.
pub fn build_invocation(
    settings: &TunnelSettings,
    known_hosts: &Path,
    identity: Option<&Path>,
) -> Result<Invocation, ConfigError> {
    if settings.tunnels.is_empty() {
        return Err(ConfigError::NoTunnels);
    }
    let remote_host = settings
        .remote_host
        .as_deref()
        .ok_or(ConfigError::MissingField("remoteHost"))?;
    let user = settings
        .user
        .as_deref()
        .ok_or(ConfigError::MissingField("user"))?;

    let exit_on_forward_failure = if settings.exit_on_forward_failure() {
        "yes"
    } else {
        "no"
    };

    let mut args = vec![
        "-NT".to_string(),
        "-o".to_string(),
        format!("ServerAliveInterval={}", settings.server_alive_interval()),
        "-o".to_string(),
        format!("ServerAliveCountMax={}", settings.server_alive_count_max()),
        "-o".to_string(),
        format!("ExitOnForwardFailure={exit_on_forward_failure}"),
        "-o".to_string(),
        format!("UserKnownHostsFile={}", known_hosts.display()),
    ];
    if let Some(identity) = identity {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }

    info!(count = settings.tunnels.len(), "Defining tunnel(s)");
    for (index, tunnel) in settings.tunnels.iter().enumerate() {
        let local_host = tunnel
            .local_host
            .as_deref()
            .ok_or(ConfigError::TunnelField { index, field: "localHost" })?;
        let local_port = tunnel
            .local_port
            .ok_or(ConfigError::TunnelField { index, field: "localPort" })?;
        let remote_port = tunnel
            .remote_port
            .ok_or(ConfigError::TunnelField { index, field: "remotePort" })?;
        info!(remote_port, local_host, local_port, "Tunnel found");
        args.push("-R".to_string());
        args.push(format!("{remote_port}:{local_host}:{local_port}"));
    }

    args.push(format!("{user}@{remote_host}"));
    Ok(Invocation { args })
}

/// How the transport executable is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launcher {
    program: PathBuf,
    shell: Option<PathBuf>,
}

impl Launcher {
    /// Execute `program` directly with the invocation as its argv.
    pub fn direct(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            shell: None,
        }
    }

    /// Run `program` through `<shell> -c "exec <program> <args>"`.
    ///
    /// The shell replaces itself with the transport, so signals sent to the
    /// spawned pid reach the transport.
    pub fn shell(shell: impl Into<PathBuf>, program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            shell: Some(shell.into()),
        }
    }

    /// The executable that will actually be spawned.
    pub fn executable(&self) -> &Path {
        self.shell.as_deref().unwrap_or(&self.program)
    }

    pub fn command(&self, invocation: &Invocation) -> Command {
        match &self.shell {
            None => {
                let mut cmd = Command::new(&self.program);
                cmd.args(invocation.args());
                cmd
            }
            Some(shell) => {
                let quoted = std::iter::once(self.program.display().to_string())
                    .chain(invocation.args().iter().cloned())
                    .map(|arg| shell_quote(&arg))
                    .collect::<Vec<_>>()
                    .join(" ");
                let line = format!("exec {quoted}");
                let mut cmd = Command::new(shell);
                cmd.arg("-c").arg(line);
                cmd
            }
        }
    }
}

/// Single-quote `arg` unless it only contains shell-safe characters.
fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_=.,:/@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tunman_core::TunnelSpec;

    fn minimal() -> TunnelSettings {
        TunnelSettings {
            user: Some("u".into()),
            remote_host: Some("r".into()),
            remote_host_keys: vec!["ssh-ed25519 AAAA".into()],
            tunnels: vec![TunnelSpec {
                remote_port: Some(8080),
                local_host: Some("127.0.0.1".into()),
                local_port: Some(80),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn defaults_are_rendered() {
        let invocation =
            build_invocation(&minimal(), Path::new("/tmp/kh"), Some(Path::new("/tmp/id"))).unwrap();
        let args = invocation.args();
        assert!(args.contains(&"ServerAliveInterval=30".to_string()));
        assert!(args.contains(&"ServerAliveCountMax=10".to_string()));
        assert!(args.contains(&"ExitOnForwardFailure=yes".to_string()));
        assert!(invocation.to_string().contains("-R 8080:127.0.0.1:80"));
        assert_eq!(invocation.destination(), Some("u@r"));
    }

    #[test]
    fn full_argument_order() {
        let mut settings = minimal();
        settings.server_alive_interval = Some(15);
        settings.server_alive_count_max = Some(3);
        settings.exit_on_forward_failure = Some(false);
        settings.tunnels.push(TunnelSpec {
            remote_port: Some(2222),
            local_host: Some("localhost".into()),
            local_port: Some(22),
        });
        let invocation =
            build_invocation(&settings, Path::new("/tmp/kh"), Some(Path::new("/tmp/id"))).unwrap();
        assert_eq!(
            invocation.to_string(),
            "-NT -o ServerAliveInterval=15 -o ServerAliveCountMax=3 \
             -o ExitOnForwardFailure=no -o UserKnownHostsFile=/tmp/kh -i /tmp/id \
             -R 8080:127.0.0.1:80 -R 2222:localhost:22 u@r"
        );
    }

    #[test]
    fn identity_is_omitted_without_key() {
        let invocation = build_invocation(&minimal(), Path::new("/tmp/kh"), None).unwrap();
        assert!(!invocation.args().contains(&"-i".to_string()));
    }

    #[test]
    fn empty_tunnels_are_rejected() {
        let mut settings = minimal();
        settings.tunnels.clear();
        assert_eq!(
            build_invocation(&settings, Path::new("/tmp/kh"), None),
            Err(ConfigError::NoTunnels)
        );
    }

    #[test]
    fn missing_user_and_host_are_rejected() {
        let mut settings = minimal();
        settings.user = None;
        assert_eq!(
            build_invocation(&settings, Path::new("/tmp/kh"), None),
            Err(ConfigError::MissingField("user"))
        );

        let mut settings = minimal();
        settings.remote_host = None;
        assert_eq!(
            build_invocation(&settings, Path::new("/tmp/kh"), None),
            Err(ConfigError::MissingField("remoteHost"))
        );
    }

    #[test]
    fn tunnel_missing_local_port_is_rejected() {
        let mut settings = minimal();
        settings.tunnels.push(TunnelSpec {
            remote_port: Some(9000),
            local_host: Some("127.0.0.1".into()),
            local_port: None,
        });
        assert_eq!(
            build_invocation(&settings, Path::new("/tmp/kh"), None),
            Err(ConfigError::TunnelField {
                index: 1,
                field: "localPort"
            })
        );
    }

    #[test]
    fn direct_launcher_passes_argv() {
        let invocation = build_invocation(&minimal(), Path::new("/tmp/kh"), None).unwrap();
        let launcher = Launcher::direct("ssh");
        let cmd = launcher.command(&invocation);
        assert_eq!(cmd.as_std().get_program(), "ssh");
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, invocation.args());
    }

    #[test]
    fn shell_launcher_wraps_command_line() {
        let invocation =
            build_invocation(&minimal(), Path::new("/tmp/my dir/kh"), None).unwrap();
        let launcher = Launcher::shell("/bin/sh", "ssh");
        assert_eq!(launcher.executable(), Path::new("/bin/sh"));
        let cmd = launcher.command(&invocation);
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args[0], "-c");
        assert!(args[1].starts_with("exec ssh -NT -o ServerAliveInterval=30"));
        assert!(args[1].contains("'UserKnownHostsFile=/tmp/my dir/kh'"));
        assert!(args[1].ends_with("u@r"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain-arg"), "plain-arg");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }
}
