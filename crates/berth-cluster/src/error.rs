//! Error types for host membership and the host agent.

use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("invalid host registration: {0}")]
    InvalidRegistration(String),

    #[error("task driver error: {0}")]
    Driver(String),

    #[error("control plane request failed: {0}")]
    Transport(String),

    /// The control plane answered with an error envelope.
    #[error("control plane returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("agent is not registered")]
    NotRegistered,

    #[error(transparent)]
    State(#[from] berth_state::StateError),

    #[error(transparent)]
    HealthCheck(#[from] berth_health::HealthCheckError),
}

impl ClusterError {
    /// The control plane no longer knows the host.
    pub fn is_unknown_host(&self) -> bool {
        matches!(self, ClusterError::UnknownHost(_) | ClusterError::Api { status: 404, .. })
    }
}
