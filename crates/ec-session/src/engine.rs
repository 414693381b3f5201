//! One loaded model with everything needed to chat with it.

use std::path::Path;
use std::time::{Duration, Instant};

use ec_backend::{Backend, Batch, ChatMessage, Context, ModelParams};
use ec_sampler::SamplerChain;
use tracing::{info, warn};

use crate::bench::{run_benchmark, BenchParams, BenchReport};
use crate::chat::format_chat;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::session::CompletionSession;
use crate::stream::CompletionStream;

/// Load a model, rejecting an empty path before the backend sees it.
pub fn load_model<B: Backend>(backend: &B, path: &Path, params: &ModelParams) -> Result<B::Model> {
    if path.as_os_str().is_empty() {
        return Err(SessionError::InvalidArgument("model path is empty".to_string()));
    }
    info!(path = %path.display(), "loading model");
    let model = backend.load_model(path, params)?;
    info!(path = %path.display(), "loaded model");
    Ok(model)
}

/// Owns the context, batch, sampler chain and completion session for one
/// model. Not meant to be shared between threads; give each worker its own.
pub struct Engine<'m, B: Backend + 'm> {
    backend: &'m B,
    pub(crate) ctx: B::Context<'m>,
    pub(crate) batch: Batch,
    pub(crate) sampler: SamplerChain,
    pub(crate) session: CompletionSession,
    config: SessionConfig,
}

impl<'m, B: Backend + 'm> Engine<'m, B> {
    pub fn new(backend: &'m B, model: &'m B::Model, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let ctx = backend.new_context(model, &config.context)?;
        let batch = Batch::new(
            config.batch_capacity,
            config.embedding_dim,
            config.max_sequences,
        )?;
        let sampler = SamplerChain::from_params(&config.sampler);
        let session = CompletionSession::new(config.n_len)
            .with_decode_policy(config.decode_policy)
            .with_invalid_utf8(config.invalid_utf8);

        info!(
            n_ctx = config.context.n_ctx,
            n_threads = config.context.n_threads,
            batch_capacity = config.batch_capacity,
            samplers = ?sampler.names(),
            "engine ready"
        );

        Ok(Self {
            backend,
            ctx,
            batch,
            sampler,
            session,
            config,
        })
    }

    /// Stream a completion of `prompt`. The KV cache is cleared when the
    /// stream finishes or is dropped.
    ///
    /// A prompt rejected before anything is decoded leaves the cache as it
    /// was; a failed prompt decode clears it.
    pub fn complete(&mut self, prompt: &str) -> Result<CompletionStream<'_, 'm, B>> {
        match self.session.init(&mut self.ctx, &mut self.batch, prompt) {
            Ok(_) => Ok(CompletionStream::new(self)),
            Err(e @ SessionError::Decode { .. }) => {
                self.clear_context();
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Format `messages` with the model's chat template and stream the reply.
    pub fn chat(&mut self, messages: &[ChatMessage]) -> Result<CompletionStream<'_, 'm, B>> {
        let prompt = format_chat(&self.ctx, messages)?;
        self.complete(&prompt)
    }

    pub fn bench(&mut self, params: &BenchParams) -> Result<BenchReport> {
        run_benchmark(&mut self.ctx, &mut self.batch, params)
    }

    /// Run [`BenchParams::warmup`] first and skip the real run if the warm-up
    /// took longer than `max_warmup`.
    pub fn bench_after_warmup(
        &mut self,
        params: &BenchParams,
        max_warmup: Duration,
    ) -> Result<Option<BenchReport>> {
        let warmup = BenchParams {
            backend_label: params.backend_label.clone(),
            ..BenchParams::warmup()
        };
        let start = Instant::now();
        let report = self.bench(&warmup)?;
        let elapsed = start.elapsed();
        info!(elapsed_ms = elapsed.as_millis() as u64, "warm-up done\n{report}");

        if elapsed > max_warmup {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                limit_ms = max_warmup.as_millis() as u64,
                "warm-up took too long, skipping benchmark"
            );
            return Ok(None);
        }
        self.bench(params).map(Some)
    }

    /// Drop all cached positions and forget any in-progress generation.
    pub fn clear_context(&mut self) {
        self.ctx.kv_cache_clear();
        self.session.reset();
    }

    pub fn model(&self) -> &B::Model {
        self.ctx.model()
    }

    pub fn context(&self) -> &B::Context<'m> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut B::Context<'m> {
        &mut self.ctx
    }

    pub fn session(&self) -> &CompletionSession {
        &self.session
    }

    pub fn sampler_mut(&mut self) -> &mut SamplerChain {
        &mut self.sampler
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn system_info(&self) -> String {
        self.backend.system_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DecodePolicy, FinishReason, SessionState};
    use ec_backend::scripted::{ScriptedBackend, ScriptedModel};
    use ec_backend::ContextParams;

    fn config() -> SessionConfig {
        SessionConfig {
            n_len: 128,
            context: ContextParams {
                n_ctx: 256,
                ..ContextParams::default()
            },
            ..SessionConfig::default()
        }
    }

    fn backend(script: &str) -> ScriptedBackend {
        ScriptedBackend::new(ScriptedModel::new(&["hello"]).with_script_text(script))
    }

    #[test]
    fn test_complete_streams_text_and_clears_cache() {
        let backend = backend("hello wörld");
        let model = load_model(&backend, Path::new("model.gguf"), &ModelParams::default()).unwrap();
        let mut engine = Engine::new(&backend, &model, config()).unwrap();

        let pieces: Vec<String> = engine
            .complete("hi")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        // Whole-word token, then one piece per character; no empty pieces.
        assert_eq!(pieces[0], "hello");
        assert!(pieces.iter().all(|p| !p.is_empty()));
        assert_eq!(pieces.concat(), "hello wörld");
        assert_eq!(engine.context().kv_used(), 0);
        assert_eq!(engine.session().state(), SessionState::Idle);
    }

    #[test]
    fn test_chat_uses_template() {
        let backend = backend("ok");
        let model = backend.load_model(Path::new("m"), &ModelParams::default()).unwrap();
        let mut engine = Engine::new(&backend, &model, config()).unwrap();
        let messages = [ChatMessage::system("be brief"), ChatMessage::user("hey")];

        let text = engine.chat(&messages).unwrap().collect_text().unwrap();
        assert_eq!(text, "ok");

        let rendered = ScriptedModel::render_chat(&messages, true);
        let prompt = &engine.context().records()[0];
        assert_eq!(prompt.tokens[0], model.bos());
        assert_eq!(prompt.tokens.len(), 1 + rendered.len());
    }

    #[test]
    fn test_stop_early_then_restart() {
        let backend = backend("abc");
        let model = backend.load_model(Path::new("m"), &ModelParams::default()).unwrap();
        let mut engine = Engine::new(&backend, &model, config()).unwrap();

        let mut seen = Vec::new();
        let reason = engine
            .complete("hi")
            .unwrap()
            .for_each_piece(|p| {
                seen.push(p.to_string());
                false
            })
            .unwrap();
        assert_eq!(reason, None);
        assert_eq!(seen, vec!["a"]);
        assert_eq!(engine.context().kv_used(), 0);

        let text = engine.complete("hi").unwrap().collect_text().unwrap();
        assert_eq!(text, "abc");
    }

    #[test]
    fn test_for_each_piece_reports_finish() {
        let backend = backend("abc");
        let model = backend.load_model(Path::new("m"), &ModelParams::default()).unwrap();
        let mut engine = Engine::new(&backend, &model, config()).unwrap();

        let mut out = String::new();
        let reason = engine
            .complete("hi")
            .unwrap()
            .for_each_piece(|p| {
                out.push_str(p);
                true
            })
            .unwrap();
        assert_eq!(reason, Some(FinishReason::EndOfGeneration));
        assert_eq!(out, "abc");
    }

    #[test]
    fn test_strict_decode_error_surfaces_in_stream() {
        let backend = backend("abc");
        let model = backend.load_model(Path::new("m"), &ModelParams::default()).unwrap();
        let config = SessionConfig {
            decode_policy: DecodePolicy::Strict,
            ..config()
        };
        let mut engine = Engine::new(&backend, &model, config).unwrap();
        engine.context_mut().fail_decode_at(2, 5);

        let mut stream = engine.complete("hi").unwrap();
        assert_eq!(stream.next().unwrap().unwrap(), "a");
        assert!(matches!(
            stream.next(),
            Some(Err(SessionError::Decode { status: 5, .. }))
        ));
        assert!(stream.next().is_none());
        drop(stream);
        assert_eq!(engine.context().kv_used(), 0);
    }

    #[test]
    fn test_init_errors_leave_engine_usable() {
        let backend = backend("x");
        let model = backend.load_model(Path::new("m"), &ModelParams::default()).unwrap();
        let mut engine = Engine::new(&backend, &model, config()).unwrap();

        assert!(matches!(
            engine.complete(""),
            Err(SessionError::InvalidArgument(_))
        ));
        assert_eq!(engine.complete("hi").unwrap().collect_text().unwrap(), "x");
    }

    #[test]
    fn test_rejected_prompt_keeps_cache() {
        let backend = backend("x");
        let model = backend.load_model(Path::new("m"), &ModelParams::default()).unwrap();
        let mut engine = Engine::new(&backend, &model, config()).unwrap();

        let mut batch = Batch::new(4, 0, 1).unwrap();
        for pos in 0..3 {
            batch.add(0, pos, &[0], pos == 2).unwrap();
        }
        assert_eq!(engine.context_mut().decode(&batch), 0);
        assert_eq!(engine.context().kv_used(), 3);

        assert!(matches!(
            engine.complete(""),
            Err(SessionError::InvalidArgument(_))
        ));
        assert_eq!(engine.context().kv_used(), 3);
    }

    #[test]
    fn test_failed_prompt_decode_clears_cache() {
        let backend = backend("x");
        let model = backend.load_model(Path::new("m"), &ModelParams::default()).unwrap();
        let config = SessionConfig {
            decode_policy: DecodePolicy::Strict,
            ..config()
        };
        let mut engine = Engine::new(&backend, &model, config).unwrap();

        let mut batch = Batch::new(4, 0, 1).unwrap();
        batch.add(0, 0, &[0], true).unwrap();
        assert_eq!(engine.context_mut().decode(&batch), 0);
        engine.context_mut().fail_decode_at(1, 3);

        assert!(matches!(
            engine.complete("hi"),
            Err(SessionError::Decode { status: 3, .. })
        ));
        assert_eq!(engine.context().kv_used(), 0);
        assert_eq!(engine.session().state(), SessionState::Idle);
    }

    #[test]
    fn test_bench_and_warmup_gate() {
        let backend = backend("");
        let model = backend.load_model(Path::new("m"), &ModelParams::default()).unwrap();
        let mut engine = Engine::new(&backend, &model, config()).unwrap();
        let params = BenchParams {
            pp: 32,
            tg: 8,
            pl: 2,
            nr: 2,
            backend_label: None,
        };

        let report = engine.bench(&params).unwrap();
        assert_eq!(report.pp, 32);
        assert_eq!(engine.context().kv_used(), 0);

        let gated = engine
            .bench_after_warmup(&params, Duration::from_secs(600))
            .unwrap();
        assert_eq!(gated.map(|r| r.tg), Some(8));
    }

    #[test]
    fn test_construction_errors() {
        let backend = backend("x");
        assert!(matches!(
            load_model(&backend, Path::new(""), &ModelParams::default()),
            Err(SessionError::InvalidArgument(_))
        ));

        let model = backend.load_model(Path::new("m"), &ModelParams::default()).unwrap();
        let bad = SessionConfig {
            n_len: 0,
            ..SessionConfig::default()
        };
        assert!(matches!(
            Engine::new(&backend, &model, bad),
            Err(SessionError::Config(_))
        ));
        assert!(Engine::new(&backend, &model, config())
            .unwrap()
            .system_info()
            .starts_with("SCRIPTED = 1"));
    }
}
