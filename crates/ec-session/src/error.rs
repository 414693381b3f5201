use ec_backend::{BackendError, BatchError};
use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("allocation failed: {0}")]
    Allocation(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("batch capacity exceeded ({capacity} entries)")]
    CapacityExceeded { capacity: usize },

    /// The backend rejected a decode. `text` is whatever the failing step
    /// had already assembled; it is not rolled back.
    #[error("decode failed with status {status}")]
    Decode { status: i32, text: String },

    #[error("chat template failed with code {code}")]
    Template { code: i32 },

    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl From<BatchError> for SessionError {
    fn from(e: BatchError) -> Self {
        match e {
            BatchError::Allocation(msg) => SessionError::Allocation(msg),
            BatchError::CapacityExceeded { capacity } => {
                SessionError::CapacityExceeded { capacity }
            }
            other => SessionError::InvalidArgument(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
