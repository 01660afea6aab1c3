use thiserror::Error;

pub type ContextResult<T> = Result<T, ContextError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("Context conflict")]
    Conflict,
    #[error("Context is not available")]
    Unavailable,
    #[error("Context `{key}` was created with a different value type")]
    TypeMismatch { key: String },
}
