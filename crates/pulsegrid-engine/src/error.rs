use pulse_core::CoreError;
use pulsegrid_state::StateError;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Malformed score or identifier.
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("store error: {0}")]
    State(#[from] StateError),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The store failed and no last-known data could stand in.
    #[error("data unavailable: {0}")]
    Unavailable(String),
}

impl EngineError {
    /// Whether the caller sent something malformed, as opposed to a
    /// failure inside the engine.
    pub fn is_client_error(&self) -> bool {
        matches!(self, EngineError::Core(_) | EngineError::InvalidQuery(_))
    }
}
