//! Tunnel process supervisor.
//!
//! Runs the transport in a loop: back off, prepare the invocation from the
//! current settings, launch, relay output, wait for exit or invalidation,
//! and go around again until shutdown.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tunman_core::TunnelSettings;
use tunman_core::config::{ChangeAction, ConfigErrorAction, DaemonConfig};

use crate::artifact::EphemeralFile;
use crate::backoff::BackoffPolicy;
use crate::credential::{self, Identity};
use crate::error::{ConfigError, SupervisorError};
use crate::gate::{ChangeGate, Generation};
use crate::invocation::{Invocation, Launcher, build_invocation};
use crate::output::{self, OutputStream};
use crate::trust;

/// State transitions published by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// Sleeping before the next launch.
    Backoff {
        delay: Duration,
        sequential_failures: u32,
    },
    /// Building the invocation for the current settings.
    Preparing,
    /// The current settings were rejected.
    ConfigRejected(ConfigError),
    /// The transport process is running.
    Running { attempt: u64, pid: Option<u32> },
    /// The transport process exited on its own.
    Exited {
        code: Option<i32>,
        sequential_failures: u32,
    },
    /// The settings changed while the transport was running.
    Superseded,
    /// The supervisor loop ended.
    Terminated,
}

/// How long relays may keep draining after the transport exits on its own.
/// A descendant holding the pipes open must not stall the loop.
const RELAY_DRAIN_GRACE: Duration = Duration::from_secs(1);

enum RunOutcome {
    Exited(Option<i32>),
    Superseded,
    Shutdown,
}

/// Everything one launch needs. Dropping it removes the ephemeral files.
struct PreparedLaunch {
    invocation: Invocation,
    known_hosts: EphemeralFile,
    identity: Identity,
}

impl PreparedLaunch {
    /// Remove the ephemeral files at the end of an iteration. Failures are
    /// logged by [`EphemeralFile::close`].
    fn release(self) {
        let _ = self.known_hosts.close();
        let _ = self.identity.release();
    }
}

fn prepare(
    settings: &TunnelSettings,
    artifact_dir: Option<&Path>,
) -> Result<PreparedLaunch, SupervisorError> {
    let known_hosts = trust::write_known_hosts(settings, artifact_dir)?;
    let identity = credential::materialize(
        settings.private_key_path.as_deref(),
        settings.private_key_content.as_deref(),
        artifact_dir,
    )?;
    info!("Building command line arguments");
    let invocation = build_invocation(settings, known_hosts.path(), identity.path())?;
    Ok(PreparedLaunch {
        invocation,
        known_hosts,
        identity,
    })
}

/// Keeps the tunnel transport running for the gate's current settings.
pub struct TunnelSupervisor {
    gate: Arc<ChangeGate>,
    launcher: Launcher,
    backoff: BackoffPolicy,
    on_change: ChangeAction,
    on_config_error: ConfigErrorAction,
    terminate_timeout: Duration,
    artifact_dir: Option<PathBuf>,
    events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
}

impl TunnelSupervisor {
    pub fn new(gate: Arc<ChangeGate>, launcher: Launcher) -> Self {
        Self {
            gate,
            launcher,
            backoff: BackoffPolicy::default(),
            on_change: ChangeAction::default(),
            on_config_error: ConfigErrorAction::default(),
            terminate_timeout: Duration::from_secs(5),
            artifact_dir: None,
            events: None,
        }
    }

    /// Create a supervisor from the daemon section of the config file.
    pub fn from_config(gate: Arc<ChangeGate>, config: &DaemonConfig) -> Self {
        let launcher = match &config.shell {
            Some(shell) => Launcher::shell(shell.clone(), config.ssh_program.clone()),
            None => Launcher::direct(config.ssh_program.clone()),
        };
        Self::new(gate, launcher)
            .with_backoff(BackoffPolicy {
                step: Duration::from_millis(config.backoff_step_ms),
                max: Duration::from_millis(config.backoff_max_ms),
            })
            .with_change_action(config.on_change)
            .with_config_error_action(config.on_config_error)
            .with_terminate_timeout(Duration::from_secs(config.terminate_timeout_secs))
            .with_artifact_dir(config.artifact_dir.clone())
    }

    #[must_use]
    pub const fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub const fn with_change_action(mut self, action: ChangeAction) -> Self {
        self.on_change = action;
        self
    }

    #[must_use]
    pub const fn with_config_error_action(mut self, action: ConfigErrorAction) -> Self {
        self.on_config_error = action;
        self
    }

    #[must_use]
    pub const fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    /// Write known-hosts and key files under `dir` instead of the system
    /// temp dir.
    #[must_use]
    pub fn with_artifact_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.artifact_dir = dir;
        self
    }

    /// Publish state transitions on `events`.
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Returns an error if the transport cannot be started, or if the
    /// settings are invalid and the config-error action is `Exit`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SupervisorError> {
        info!(
            program = %self.launcher.executable().display(),
            "Tunnel supervisor started"
        );
        let result = self.supervise(&shutdown).await;
        match &result {
            Ok(()) => info!("Tunnel supervisor stopped"),
            Err(e) => error!(error = %e, "Tunnel supervisor terminated"),
        }
        self.emit(SupervisorEvent::Terminated);
        result
    }

    async fn supervise(&self, shutdown: &CancellationToken) -> Result<(), SupervisorError> {
        let mut sequential_failures: u32 = 0;
        let mut attempt: u64 = 0;

        while !shutdown.is_cancelled() {
            let delay = self.backoff.delay_for(sequential_failures);
            if !delay.is_zero() {
                info!(
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    sequential_failures,
                    "Waiting before relaunch"
                );
                self.emit(SupervisorEvent::Backoff {
                    delay,
                    sequential_failures,
                });
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = shutdown.cancelled() => break,
                }
            }

            // Registered before the settings are read, so a change landing in
            // between cancels this generation.
            let generation = self.gate.begin_generation(shutdown);
            let settings = self.gate.current();
            self.emit(SupervisorEvent::Preparing);

            let prepared = match prepare(&settings, self.artifact_dir.as_deref()) {
                Ok(prepared) => prepared,
                Err(SupervisorError::Config(e)) => {
                    error!(error = %e, "Invalid tunnel settings");
                    self.emit(SupervisorEvent::ConfigRejected(e.clone()));
                    match self.on_config_error {
                        ConfigErrorAction::Exit => return Err(e.into()),
                        ConfigErrorAction::WaitForChange => {
                            info!("Waiting for a settings change");
                            generation.cancelled().await;
                            continue;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to prepare tunnel launch");
                    sequential_failures = sequential_failures.saturating_add(1);
                    continue;
                }
            };

            attempt += 1;
            let outcome = self.launch(&prepared, &generation, shutdown, attempt).await;
            prepared.release();
            match outcome? {
                RunOutcome::Exited(code) => {
                    sequential_failures = if code == Some(0) {
                        0
                    } else {
                        sequential_failures.saturating_add(1)
                    };
                    info!(exit_code = ?code, sequential_failures, "SSH process exited");
                    self.emit(SupervisorEvent::Exited {
                        code,
                        sequential_failures,
                    });
                }
                RunOutcome::Superseded => {
                    info!("Settings changed, rebuilding tunnel");
                    self.emit(SupervisorEvent::Superseded);
                }
                RunOutcome::Shutdown => break,
            }
        }
        Ok(())
    }

    async fn launch(
        &self,
        prepared: &PreparedLaunch,
        generation: &Generation,
        shutdown: &CancellationToken,
        attempt: u64,
    ) -> Result<RunOutcome, SupervisorError> {
        info!(args = %prepared.invocation, "Launch args");
        let mut command = self.launcher.command(&prepared.invocation);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        info!(attempt, "Starting SSH process");
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let program = self.launcher.executable().display().to_string();
                error!(program = %program, error = %source, "Failed to start SSH process");
                return Err(SupervisorError::Launch { program, source });
            }
        };
        let pid = child.id();
        self.emit(SupervisorEvent::Running { attempt, pid });

        let relay_cancel = generation.token().child_token();
        let mut relays = JoinSet::new();
        if let Some(stdout) = child.stdout.take() {
            relays.spawn(output::relay(
                stdout,
                OutputStream::Stdout,
                relay_cancel.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            relays.spawn(output::relay(
                stderr,
                OutputStream::Stderr,
                relay_cancel.clone(),
            ));
        }

        info!(pid, "Waiting for SSH termination or settings change");
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            () = generation.cancelled() => None,
        };

        let outcome = match exited {
            Some(Ok(status)) => RunOutcome::Exited(status.code()),
            Some(Err(e)) => {
                warn!(error = %e, "Failed to wait for SSH process");
                relay_cancel.cancel();
                RunOutcome::Exited(None)
            }
            None => {
                let shutting_down = shutdown.is_cancelled();
                if shutting_down || self.on_change == ChangeAction::Terminate {
                    self.terminate(&mut child).await;
                } else {
                    warn!(pid, "Leaving superseded SSH process running");
                }
                if shutting_down {
                    RunOutcome::Shutdown
                } else {
                    RunOutcome::Superseded
                }
            }
        };

        if matches!(outcome, RunOutcome::Exited(_)) {
            let drained = tokio::time::timeout(RELAY_DRAIN_GRACE, async {
                while relays.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(pid, "SSH output still open after exit, stopping relays");
            }
        }
        relay_cancel.cancel();
        while relays.join_next().await.is_some() {}
        Ok(outcome)
    }

    /// Ask the transport to exit, killing it after the terminate timeout.
    async fn terminate(&self, child: &mut Child) {
        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                // SAFETY: pid is a valid process ID obtained from our own Child handle.
                // kill(2) with SIGTERM is safe to call on any owned subprocess.
                #[allow(unsafe_code)]
                #[allow(clippy::cast_possible_wrap)]
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    let err = std::io::Error::last_os_error();
                    warn!(pid, error = %err, "Failed to send SIGTERM");
                }
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = child.start_kill() {
                warn!(error = %e, "Failed to kill SSH process");
            }
        }

        match tokio::time::timeout(self.terminate_timeout, child.wait()).await {
            Ok(Ok(status)) => info!(?status, "SSH process terminated"),
            Ok(Err(e)) => {
                warn!(error = %e, "Error waiting for SSH process");
                child.kill().await.ok();
            }
            Err(_) => {
                warn!("Timeout waiting for SSH process to exit, killing");
                child.kill().await.ok();
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tunman_core::TunnelSpec;

    fn valid() -> TunnelSettings {
        TunnelSettings {
            user: Some("u".into()),
            remote_host: Some("r".into()),
            remote_host_keys: vec!["ssh-ed25519 AAAA".into()],
            private_key_content: Some("KEY".into()),
            tunnels: vec![TunnelSpec {
                remote_port: Some(8080),
                local_host: Some("127.0.0.1".into()),
                local_port: Some(80),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn prepare_builds_invocation_with_ephemeral_files() {
        let prepared = prepare(&valid(), None).unwrap();
        let args = prepared.invocation.args();
        let known_hosts = args
            .iter()
            .find_map(|a| a.strip_prefix("UserKnownHostsFile="))
            .unwrap()
            .to_string();
        let identity_index = args.iter().position(|a| a == "-i").unwrap();
        let identity = args[identity_index + 1].clone();

        assert_eq!(std::fs::read_to_string(&known_hosts).unwrap(), "r ssh-ed25519 AAAA\n");
        assert_eq!(std::fs::read_to_string(&identity).unwrap(), "KEY");

        drop(prepared);
        assert!(!Path::new(&known_hosts).exists());
        assert!(!Path::new(&identity).exists());
    }

    #[test]
    fn release_removes_files_under_artifact_dir() {
        let dir = tempfile::tempdir().unwrap();
        let prepared = prepare(&valid(), Some(dir.path())).unwrap();
        assert_eq!(prepared.known_hosts.path().parent(), Some(dir.path()));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
        prepared.release();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn prepare_rejects_missing_host_keys() {
        let mut settings = valid();
        settings.remote_host_keys.clear();
        assert!(matches!(
            prepare(&settings, None),
            Err(SupervisorError::Config(ConfigError::NoHostKeys))
        ));
    }

    #[test]
    fn prepare_rejects_empty_tunnels() {
        let mut settings = valid();
        settings.tunnels.clear();
        assert!(matches!(
            prepare(&settings, None),
            Err(SupervisorError::Config(ConfigError::NoTunnels))
        ));
    }

    #[test]
    fn from_config_maps_daemon_settings() {
        let gate = Arc::new(ChangeGate::new(valid()));
        let config = DaemonConfig {
            shell: Some("/bin/bash".into()),
            backoff_step_ms: 100,
            backoff_max_ms: 1000,
            on_change: ChangeAction::Detach,
            artifact_dir: Some("/run/tunman".into()),
            ..Default::default()
        };
        let supervisor = TunnelSupervisor::from_config(gate, &config);
        assert_eq!(supervisor.launcher, Launcher::shell("/bin/bash", "ssh"));
        assert_eq!(supervisor.backoff.delay_for(3), Duration::from_millis(300));
        assert_eq!(supervisor.backoff.delay_for(30), Duration::from_secs(1));
        assert_eq!(supervisor.on_change, ChangeAction::Detach);
        assert_eq!(supervisor.on_config_error, ConfigErrorAction::WaitForChange);
        assert_eq!(supervisor.artifact_dir, Some(PathBuf::from("/run/tunman")));
    }

    #[tokio::test]
    async fn cancelled_shutdown_returns_immediately() {
        let gate = Arc::new(ChangeGate::new(valid()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let supervisor =
            TunnelSupervisor::new(gate, Launcher::direct("/nonexistent/ssh")).with_events(tx);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        supervisor.run(shutdown).await.unwrap();
        assert_eq!(rx.recv().await, Some(SupervisorEvent::Terminated));
    }
}
