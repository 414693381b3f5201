use thiserror::Error;

/// Errors raised while building or filling a [`Batch`](crate::Batch).
///
/// A failing call never leaves the batch partially modified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch allocation failed: {0}")]
    Allocation(String),
    #[error("invalid batch argument: {0}")]
    InvalidArgument(String),
    #[error("batch capacity exceeded: {capacity} tokens")]
    CapacityExceeded { capacity: usize },
    #[error("too many sequence ids for one token: {given} > {max}")]
    TooManySequences { given: usize, max: usize },
    #[error("batch holds {holds}, cannot add {adding}")]
    WrongInput {
        holds: &'static str,
        adding: &'static str,
    },
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to load model: {0}")]
    ModelLoad(String),
    #[error("failed to create context: {0}")]
    ContextCreate(String),
    #[error("tokenization failed: {0}")]
    Tokenize(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("batch error: {0}")]
    Batch(#[from] BatchError),
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;
