use std::path::Path;

use crate::batch::Batch;
use crate::chat::ChatMessage;
use crate::error::Result;
use crate::params::{ContextParams, ModelParams};
use crate::token::TokenId;

/// Entry point of an inference backend: loads models and creates contexts.
///
/// A context borrows the model it was created from, so a model can never be
/// dropped while one of its contexts is alive. Models, contexts and batches
/// are released by `Drop`, exactly once.
pub trait Backend {
    /// Loaded weights.
    type Model: Model;

    /// Execution context (KV cache, thread pool) bound to one model.
    type Context<'m>: Context<Model = Self::Model>
    where
        Self: 'm;

    /// Load a model from a filesystem path.
    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<Self::Model>;

    /// Create an execution context for `model`.
    fn new_context<'m>(
        &'m self,
        model: &'m Self::Model,
        params: &ContextParams,
    ) -> Result<Self::Context<'m>>;

    /// Human-readable description of the host and backend build.
    fn system_info(&self) -> String {
        format!(
            "CPUS = {} | ARCH = {} | OS = {}",
            num_cpus::get(),
            std::env::consts::ARCH,
            std::env::consts::OS
        )
    }
}

/// Read-only model queries: metadata, vocabulary and chat template.
pub trait Model {
    /// Short descriptor such as "llama 1B Q4_0".
    fn description(&self) -> String;

    /// Serialized size of the weights in bytes.
    fn size(&self) -> u64;

    /// Number of parameters.
    fn n_params(&self) -> u64;

    /// Returns true if `token` ends generation (EOS, EOT, ...).
    fn is_eog(&self, token: TokenId) -> bool;

    /// Convert text into token ids.
    ///
    /// - `add_special`: prepend/append the model's BOS/EOS markers
    /// - `parse_special`: recognise special-token text such as `<|im_end|>`
    fn tokenize(&self, text: &str, add_special: bool, parse_special: bool)
        -> Result<Vec<TokenId>>;

    /// Raw bytes of one token. A piece may be an incomplete UTF-8 sequence.
    fn token_to_piece(&self, token: TokenId) -> Vec<u8>;

    /// Render `messages` with the model's chat template into `buf`.
    ///
    /// Returns the length the full rendering requires. When that exceeds
    /// `buf.len()`, only a prefix was written and the caller should grow the
    /// buffer and call again. A negative value means the template could not
    /// be applied.
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_assistant: bool,
        buf: &mut [u8],
    ) -> i32;
}

/// Mutable execution state: every decode call updates the KV cache.
///
/// A context is not safe for concurrent use; callers serialize access.
pub trait Context {
    type Model: Model;

    /// The model this context was created from.
    fn model(&self) -> &Self::Model;

    /// KV cache capacity in tokens.
    fn n_ctx(&self) -> u32;

    /// Run the model over `batch`. Returns 0 on success; any other value is a
    /// backend-specific failure status.
    fn decode(&mut self, batch: &Batch) -> i32;

    /// Logits produced for batch entry `i` by the last decode, or for the most
    /// recent output when `i` is -1. `None` if that entry was not flagged.
    fn logits_ith(&self, i: i32) -> Option<&[f32]>;

    /// Drop every cached position of every sequence.
    fn kv_cache_clear(&mut self);
}
