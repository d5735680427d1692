use crate::hypervisor::HypervisorError;
use crate::operation::OperationKind;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Hypervisor error: {0}")]
    Hypervisor(HypervisorError),

    #[error("Machine not found: {0}")]
    NotFound(String),

    #[error("Storage pool not found: {0}")]
    PoolNotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Malformed domain description: missing or invalid {0}")]
    MalformedDomainDescription(String),

    #[error("Operation {active} already in progress for machine {machine_id}")]
    OperationInProgress {
        machine_id: Uuid,
        active: OperationKind,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transition failed: {0}")]
    TransitionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Guard rejections: nothing was attempted, the caller may retry later.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            OrchestratorError::OperationInProgress { .. } | OrchestratorError::InvalidState(_)
        )
    }
}

impl From<roxmltree::Error> for OrchestratorError {
    fn from(err: roxmltree::Error) -> Self {
        OrchestratorError::MalformedDomainDescription(format!("document ({})", err))
    }
}

/// Missing domains and pools are consistency errors, not backend failures.
impl From<HypervisorError> for OrchestratorError {
    fn from(err: HypervisorError) -> Self {
        match err {
            HypervisorError::DomainNotFound(id) => OrchestratorError::NotFound(id.to_string()),
            HypervisorError::PoolNotFound(pool) => OrchestratorError::PoolNotFound(pool),
            other => OrchestratorError::Hypervisor(other),
        }
    }
}
