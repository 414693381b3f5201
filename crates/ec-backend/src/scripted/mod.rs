//! Deterministic in-process backend.
//!
//! The model "predicts" a fixed script of tokens: every decode that flags at
//! least one entry for output yields a strongly peaked distribution on the
//! next scripted token, then on EOS once the script is exhausted. The KV
//! cache is bounded by `n_ctx` and decode fails with status 1 when it is
//! full, like a real backend. Failures can be injected for decode calls and
//! for template rendering.

pub mod kv_cache;
pub mod vocab;

pub use kv_cache::KvCells;
pub use vocab::Vocab;

use std::path::Path;

use tracing::debug;

use crate::backend::{Backend, Context, Model};
use crate::batch::Batch;
use crate::chat::ChatMessage;
use crate::error::{BackendError, Result};
use crate::params::{ContextParams, ModelParams};
use crate::token::{Pos, SeqId, TokenId};

/// Logit given to the scripted token; every other token gets 0.
pub const PEAK_LOGIT: f32 = 30.0;

/// Status returned when the KV cache has no room for a batch.
pub const STATUS_NO_KV_SLOT: i32 = 1;

/// Status returned for an empty batch.
pub const STATUS_EMPTY_BATCH: i32 = -1;

#[derive(Debug, Clone)]
pub struct ScriptedModel {
    vocab: Vocab,
    script: Vec<TokenId>,
    description: String,
    fail_template: bool,
}

impl ScriptedModel {
    /// A byte-level model with the given extra word tokens and an empty
    /// script (it predicts EOS immediately).
    pub fn new(words: &[&str]) -> Self {
        Self {
            vocab: Vocab::byte_level(words),
            script: Vec::new(),
            description: "scripted byte-level".to_string(),
            fail_template: false,
        }
    }

    /// Predict exactly these tokens, in order, then EOS.
    pub fn with_script(mut self, script: Vec<TokenId>) -> Self {
        self.script = script;
        self
    }

    /// Predict the tokens that encode `text`, then EOS.
    pub fn with_script_text(mut self, text: &str) -> Self {
        self.script = self.vocab.encode(text, false);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Make every chat template rendering report failure.
    pub fn with_template_failure(mut self) -> Self {
        self.fail_template = true;
        self
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn script(&self) -> &[TokenId] {
        &self.script
    }

    pub fn bos(&self) -> TokenId {
        self.vocab.bos_id
    }

    pub fn eos(&self) -> TokenId {
        self.vocab.eos_id
    }

    /// ChatML rendering used by [`Model::apply_chat_template`].
    pub fn render_chat(messages: &[ChatMessage], add_assistant: bool) -> String {
        let mut out = String::new();
        for msg in messages {
            out.push_str("<|im_start|>");
            out.push_str(msg.role.as_str());
            out.push('\n');
            out.push_str(&msg.content);
            out.push_str("<|im_end|>\n");
        }
        if add_assistant {
            out.push_str("<|im_start|>assistant\n");
        }
        out
    }
}

impl Model for ScriptedModel {
    fn description(&self) -> String {
        self.description.clone()
    }

    fn size(&self) -> u64 {
        (self.vocab.len() * std::mem::size_of::<f32>()) as u64
    }

    fn n_params(&self) -> u64 {
        self.vocab.len() as u64
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == self.vocab.eos_id
    }

    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> Result<Vec<TokenId>> {
        let mut ids = Vec::with_capacity(text.len() + 1);
        if add_special {
            ids.push(self.vocab.bos_id);
        }
        ids.extend(self.vocab.encode(text, parse_special));
        Ok(ids)
    }

    fn token_to_piece(&self, token: TokenId) -> Vec<u8> {
        self.vocab.piece(token)
    }

    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_assistant: bool,
        buf: &mut [u8],
    ) -> i32 {
        if self.fail_template {
            return -1;
        }
        let rendered = Self::render_chat(messages, add_assistant);
        let bytes = rendered.as_bytes();
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        i32::try_from(bytes.len()).unwrap_or(-1)
    }
}

/// Snapshot of one decode call, kept for inspection.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeRecord {
    pub tokens: Vec<TokenId>,
    pub positions: Vec<Pos>,
    pub seq_ids: Vec<Vec<SeqId>>,
    pub logits: Vec<bool>,
    pub status: i32,
}

impl DecodeRecord {
    fn of(batch: &Batch, status: i32) -> Self {
        Self {
            tokens: batch.tokens().map(<[TokenId]>::to_vec).unwrap_or_default(),
            positions: batch.positions().to_vec(),
            seq_ids: (0..batch.len()).map(|i| batch.seq_ids(i).to_vec()).collect(),
            logits: (0..batch.len()).map(|i| batch.wants_logits(i)).collect(),
            status,
        }
    }
}

pub struct ScriptedContext<'m> {
    model: &'m ScriptedModel,
    n_ctx: u32,
    cells: KvCells,
    /// (batch index, logits) for every flagged entry of the last good decode.
    outputs: Vec<(i32, Vec<f32>)>,
    /// Index into the model script of the next prediction.
    generated: usize,
    /// (call index, status) pairs for injected failures.
    failures: Vec<(usize, i32)>,
    records: Vec<DecodeRecord>,
}

impl<'m> ScriptedContext<'m> {
    pub fn new(model: &'m ScriptedModel, n_ctx: u32) -> Self {
        Self {
            model,
            n_ctx,
            cells: KvCells::new(n_ctx as usize),
            outputs: Vec::new(),
            generated: 0,
            failures: Vec::new(),
            records: Vec::new(),
        }
    }

    /// Make the decode call with zero-based index `call` return `status`
    /// without touching the cache.
    pub fn fail_decode_at(&mut self, call: usize, status: i32) {
        self.failures.push((call, status));
    }

    /// Every decode call so far, in order.
    pub fn records(&self) -> &[DecodeRecord] {
        &self.records
    }

    pub fn decode_calls(&self) -> usize {
        self.records.len()
    }

    /// Occupied KV cells.
    pub fn kv_used(&self) -> usize {
        self.cells.used()
    }

    pub fn kv_cells(&self) -> &KvCells {
        &self.cells
    }

    fn peaked_logits(&self, target: TokenId) -> Vec<f32> {
        let mut logits = vec![0.0f32; self.model.vocab.len()];
        if let Some(slot) = usize::try_from(target).ok().and_then(|i| logits.get_mut(i)) {
            *slot = PEAK_LOGIT;
        }
        logits
    }

    fn try_decode(&mut self, batch: &Batch) -> i32 {
        let call = self.records.len();
        if batch.is_empty() {
            return STATUS_EMPTY_BATCH;
        }
        if let Some(&(_, status)) = self.failures.iter().find(|(c, _)| *c == call) {
            return status;
        }
        if !self.cells.insert(batch) {
            return STATUS_NO_KV_SLOT;
        }

        let target = self
            .model
            .script
            .get(self.generated)
            .copied()
            .unwrap_or(self.model.vocab.eos_id);
        let outputs: Vec<(i32, Vec<f32>)> = batch
            .output_indices()
            .map(|i| (i as i32, self.peaked_logits(target)))
            .collect();
        if !outputs.is_empty() {
            self.outputs = outputs;
            self.generated += 1;
        }
        0
    }
}

impl Context for ScriptedContext<'_> {
    type Model = ScriptedModel;

    fn model(&self) -> &ScriptedModel {
        self.model
    }

    fn n_ctx(&self) -> u32 {
        self.n_ctx
    }

    fn decode(&mut self, batch: &Batch) -> i32 {
        let status = self.try_decode(batch);
        debug!(n_tokens = batch.len(), status, kv_used = self.cells.used(), "scripted decode");
        self.records.push(DecodeRecord::of(batch, status));
        status
    }

    fn logits_ith(&self, i: i32) -> Option<&[f32]> {
        let found = if i < 0 {
            self.outputs.last()
        } else {
            self.outputs.iter().find(|(idx, _)| *idx == i)
        };
        found.map(|(_, logits)| logits.as_slice())
    }

    fn kv_cache_clear(&mut self) {
        self.cells.clear();
        self.outputs.clear();
        self.generated = 0;
    }
}

/// Backend whose `load_model` hands out copies of one scripted model.
#[derive(Debug, Clone)]
pub struct ScriptedBackend {
    model: ScriptedModel,
}

impl ScriptedBackend {
    pub fn new(model: ScriptedModel) -> Self {
        Self { model }
    }
}

impl Backend for ScriptedBackend {
    type Model = ScriptedModel;
    type Context<'m> = ScriptedContext<'m>;

    fn load_model(&self, path: &Path, params: &ModelParams) -> Result<ScriptedModel> {
        if path.as_os_str().is_empty() {
            return Err(BackendError::InvalidArgument(
                "model path is empty".to_string(),
            ));
        }
        debug!(path = %path.display(), n_gpu_layers = params.n_gpu_layers, "scripted model load");
        Ok(self.model.clone())
    }

    fn new_context<'m>(
        &'m self,
        model: &'m ScriptedModel,
        params: &ContextParams,
    ) -> Result<ScriptedContext<'m>> {
        params
            .validate()
            .map_err(|e| BackendError::ContextCreate(e.to_string()))?;
        Ok(ScriptedContext::new(model, params.n_ctx))
    }

    fn system_info(&self) -> String {
        format!("SCRIPTED = 1 | CPUS = {}", num_cpus::get())
    }
}
