//! Reconciler error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("task definition not found: {0}")]
    TaskDefinitionNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] berth_state::StateError),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;
