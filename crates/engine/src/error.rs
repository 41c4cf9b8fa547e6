use pipewright_core::error::CoreError;
use pipewright_core::scheduling::ServiceState;
use pipewright_db::store::StoreError;

use crate::computation::ComputationError;

/// Error returned by engine management operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: ServiceState, to: ServiceState },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Core(CoreError::Validation(msg.into()))
    }

    pub fn not_found(entity: &'static str, id: i64) -> Self {
        EngineError::Core(CoreError::NotFound { entity, id })
    }

    /// Whether the caller supplied something invalid (as opposed to an
    /// infrastructure failure).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::Core(CoreError::Validation(_))
                | EngineError::Store(StoreError::Validation(_))
                | EngineError::InvalidTransition { .. }
        )
    }
}

impl From<EngineError> for ComputationError {
    fn from(err: EngineError) -> Self {
        ComputationError::failed(err.to_string())
    }
}

impl From<StoreError> for ComputationError {
    fn from(err: StoreError) -> Self {
        ComputationError::failed(err.to_string())
    }
}
