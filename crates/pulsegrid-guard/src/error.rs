use thiserror::Error;

pub type GuardResult<T> = Result<T, GuardError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("no breaker or quota configured for dependency {0:?}")]
    UnknownDependency(String),
}
