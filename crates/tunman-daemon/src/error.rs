//! Supervisor error types.

/// The current settings cannot describe a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} not set")]
    MissingField(&'static str),

    #[error("No tunnels defined in configuration")]
    NoTunnels,

    #[error("remoteHostKeys is not configured so no ssh tunnel can be established")]
    NoHostKeys,

    #[error("{field} not set on tunnel #{index}")]
    TunnelField { index: usize, field: &'static str },
}

/// Errors that end a supervisor iteration or the supervisor itself.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to write ephemeral file: {0}")]
    Artifact(#[from] std::io::Error),

    #[error("Failed to start {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
