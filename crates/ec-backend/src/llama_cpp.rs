//! llama.cpp backend via the llama-cpp-2 bindings.
//!
//! Model loading, context creation, decoding and detokenization are
//! delegated to llama.cpp. The crate's own [`Batch`] is copied into a
//! llama.cpp batch right before each decode.

use std::num::NonZeroU32;
use std::path::Path;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{LlamaChatMessage, LlamaModel};
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::DecodeError;
use llama_cpp_sys_2::{LLAMA_FLASH_ATTN_TYPE_DISABLED, LLAMA_FLASH_ATTN_TYPE_ENABLED};
use tracing::{debug, info, warn};

use crate::backend::{Backend, Context, Model};
use crate::batch::Batch;
use crate::chat::ChatMessage;
use crate::error::{BackendError, Result};
use crate::params::{ContextParams, ModelParams};
use crate::token::TokenId;

/// Status reported when the batch cannot be handed to llama.cpp at all.
const STATUS_BAD_BATCH: i32 = -1;

/// The `llama_decode` return code behind a decode error.
fn decode_status(err: &DecodeError) -> i32 {
    match err {
        DecodeError::NoKvCacheSlot => 1,
        DecodeError::NTokensZero => -1,
        DecodeError::Unknown(code) => *code,
    }
}

/// Owns the process-wide llama.cpp backend. Only one may exist at a time.
pub struct LlamaCppBackend {
    backend: LlamaBackend,
}

impl LlamaCppBackend {
    pub fn init() -> Result<Self> {
        let backend = LlamaBackend::init()
            .map_err(|e| BackendError::Other(format!("backend init: {e}")))?;
        Ok(Self { backend })
    }
}

pub struct LlamaCppModel {
    model: LlamaModel,
}

pub struct LlamaCppContext<'m> {
    ctx: LlamaContext<'m>,
    model: &'m LlamaCppModel,
    n_ctx: u32,
    /// Scratch llama.cpp batch and the (capacity, max_sequences) it was sized for.
    scratch: Option<(LlamaBatch, usize, usize)>,
    /// Batch indices that produced logits in the last successful decode.
    outputs: Vec<i32>,
}

fn thread_count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

impl Backend for LlamaCppBackend {
    type Model = LlamaCppModel;
    type Context<'m> = LlamaCppContext<'m>;

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<LlamaCppModel> {
        let model_params = LlamaModelParams::default()
            .with_n_gpu_layers(params.n_gpu_layers)
            .with_use_mlock(params.use_mlock);
        info!(
            path = %path.display(),
            n_gpu_layers = params.n_gpu_layers,
            use_mlock = params.use_mlock,
            "loading model"
        );
        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| BackendError::ModelLoad(e.to_string()))?;
        Ok(LlamaCppModel { model })
    }

    fn new_context<'m>(
        &'m self,
        model: &'m LlamaCppModel,
        params: &ContextParams,
    ) -> Result<LlamaCppContext<'m>> {
        params
            .validate()
            .map_err(|e| BackendError::ContextCreate(e.to_string()))?;
        let flash_attn = if params.flash_attn {
            LLAMA_FLASH_ATTN_TYPE_ENABLED
        } else {
            LLAMA_FLASH_ATTN_TYPE_DISABLED
        };
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(params.n_ctx))
            .with_n_batch(params.n_batch)
            .with_n_threads(thread_count(params.n_threads))
            .with_n_threads_batch(thread_count(params.n_threads_batch))
            .with_flash_attention_policy(flash_attn);
        info!(
            n_ctx = params.n_ctx,
            n_threads = params.n_threads,
            flash_attn = params.flash_attn,
            "creating context"
        );
        let ctx = model
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| BackendError::ContextCreate(e.to_string()))?;
        Ok(LlamaCppContext {
            ctx,
            model,
            n_ctx: params.n_ctx,
            scratch: None,
            outputs: Vec::new(),
        })
    }

    fn system_info(&self) -> String {
        format!(
            "LLAMA_CPP = 1 | CPUS = {} | ARCH = {}",
            num_cpus::get(),
            std::env::consts::ARCH
        )
    }
}

impl Model for LlamaCppModel {
    fn description(&self) -> String {
        let arch = self
            .model
            .meta_val_str("general.architecture")
            .unwrap_or_else(|_| "unknown".to_string());
        format!("{arch} {:.1}B", self.model.n_params() as f64 / 1e9)
    }

    fn size(&self) -> u64 {
        self.model.size() as u64
    }

    fn n_params(&self) -> u64 {
        self.model.n_params() as u64
    }

    fn is_eog(&self, token: TokenId) -> bool {
        self.model.vocab().is_eog(LlamaToken(token))
    }

    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>> {
        let tokens = self
            .model
            .vocab()
            .tokenize(text.as_bytes(), add_special, parse_special);
        Ok(tokens.into_iter().map(|t| t.0).collect())
    }

    // Special tokens render as their text, like the rest of the piece.
    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        self.model
            .vocab()
            .token_to_piece(LlamaToken(token), true, None)
    }

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_assistant: bool,
        buf: &mut [u8],
    ) -> i32 {
        let template = match self.model.chat_template(None) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "model has no usable chat template");
                return -1;
            }
        };
        let mut chat = Vec::with_capacity(messages.len());
        for msg in messages {
            match LlamaChatMessage::new(msg.role.as_str().to_string(), msg.content.clone()) {
                Ok(m) => chat.push(m),
                Err(e) => {
                    warn!(error = %e, "invalid chat message");
                    return -1;
                }
            }
        }
        match self.model.apply_chat_template(&template, &chat, add_assistant) {
            Ok(rendered) => {
                let bytes = rendered.as_bytes();
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                i32::try_from(bytes.len()).unwrap_or(-1)
            }
            Err(e) => {
                warn!(error = %e, "apply_chat_template failed");
                -1
            }
        }
    }
}

impl LlamaCppContext<'_> {
    /// Make sure the scratch llama.cpp batch can hold everything `batch` can.
    fn ensure_scratch(&mut self, batch: &Batch) {
        let fits = matches!(
            &self.scratch,
            Some((_, cap, seqs)) if *cap >= batch.capacity() && *seqs >= batch.max_sequences()
        );
        if !fits {
            let n_seq_max = i32::try_from(batch.max_sequences()).unwrap_or(i32::MAX);
            self.scratch = Some((
                LlamaBatch::new(batch.capacity(), n_seq_max),
                batch.capacity(),
                batch.max_sequences(),
            ));
        }
    }
}

impl Context for LlamaCppContext<'_> {
    type Model = LlamaCppModel;

    fn model(&self) -> &LlamaCppModel {
        self.model
    }

    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn decode(&mut self, batch: &Batch) -> i32 {
        if batch.tokens().is_none() {
            warn!("embedding batches are not supported by this backend");
            return STATUS_BAD_BATCH;
        }
        self.ensure_scratch(batch);
        let Some((scratch, _, _)) = self.scratch.as_mut() else {
            return STATUS_BAD_BATCH;
        };
        scratch.clear();
        for e in batch.entries() {
            let token = LlamaToken(e.token.unwrap_or_default());
            if let Err(err) = scratch.add(token, e.pos, e.seq_ids, e.logits) {
                warn!(error = %err, "llama batch add failed");
                return STATUS_BAD_BATCH;
            }
        }

        match self.ctx.decode(scratch) {
            Ok(()) => {
                self.outputs = batch.output_indices().map(|i| i as i32).collect();
                0
            }
            Err(err) => {
                debug!(error = %err, "llama_decode failed");
                decode_status(&err)
            }
        }
    }

    fn logits_ith(&self, i: i32) -> Option<&[f32]> {
        let idx = if i < 0 { *self.outputs.last()? } else { i };
        if !self.outputs.contains(&idx) {
            return None;
        }
        Some(self.ctx.get_logits_ith(idx))
    }

    fn kv_cache_clear(&mut self) {
        self.ctx.clear_kv_cache();
        self.outputs.clear();
    }
}
