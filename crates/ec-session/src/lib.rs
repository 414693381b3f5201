//! Session layer over an inference backend.
//!
//! - [`session::CompletionSession`]: prime with a prompt, then generate one
//!   token per step with UTF-8 safe text output
//! - [`bench::run_benchmark`]: prompt-processing / text-generation throughput
//! - [`chat::format_chat`]: chat template rendering with buffer growth
//! - [`engine::Engine`]: one model's context, batch, sampler and session,
//!   with streaming [`stream::CompletionStream`] output

pub mod bench;
pub mod chat;
pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod session;
pub mod stream;
pub mod utf8;

pub use bench::{run_benchmark, BenchParams, BenchReport, PhaseStats, RunningStats};
pub use chat::format_chat;
pub use config::SessionConfig;
pub use engine::{load_model, Engine};
pub use error::{Result, SessionError};
pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use session::{
    CacheShortfall, CompletionSession, DecodePolicy, FinishReason, Prime, SessionState, Step,
};
pub use stream::CompletionStream;
pub use utf8::{is_complete_utf8, utf8_status, InvalidUtf8Policy, Utf8Assembler, Utf8Status};
