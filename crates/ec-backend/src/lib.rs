//! `ec-backend` - the boundary between edgechat and an inference backend.
//!
//! This crate provides:
//! - The `Backend`, `Model` and `Context` traits a backend implements
//! - A capacity-checked `Batch` buffer submitted to `Context::decode`
//! - Chat message types consumed by template renderers
//! - Model and context parameters with safe defaults
//! - A deterministic in-process backend (feature `scripted`)
//! - A llama.cpp backend (feature `llama-cpp`)

pub mod backend;
pub mod batch;
pub mod chat;
pub mod error;
#[cfg(feature = "llama-cpp")]
pub mod llama_cpp;
pub mod params;
#[cfg(any(test, feature = "scripted"))]
pub mod scripted;
pub mod token;

// Re-export primary types at the crate root for convenience.
pub use backend::{Backend, Context, Model};
pub use batch::Batch;
pub use chat::{ChatMessage, Role};
pub use error::{BackendError, BatchError, Result};
pub use params::{default_thread_count, ContextParams, ModelParams};
pub use token::{Pos, SeqId, TokenId};
