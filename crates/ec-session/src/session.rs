//! Streaming completion: prime the context with a prompt, then generate one
//! token per [`CompletionSession::step`].

use std::fmt;

use ec_backend::{Batch, Context, Model, Pos, SeqId};
use ec_sampler::SamplerChain;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::utf8::{InvalidUtf8Policy, Utf8Assembler};

/// All completion tokens belong to one sequence.
const SEQ: SeqId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Primed,
    Generating,
    Done,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Primed => "primed",
            SessionState::Generating => "generating",
            SessionState::Done => "done",
        };
        f.write_str(s)
    }
}

/// How a nonzero decode status is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    /// Log, remember the status, keep going.
    #[default]
    BestEffort,
    /// Return [`SessionError::Decode`].
    Strict,
}

/// The KV cache is smaller than prompt plus generation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheShortfall {
    pub required: usize,
    pub available: usize,
}

/// Outcome of [`CompletionSession::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prime {
    /// Prompt tokens submitted to the backend.
    pub n_tokens: usize,
    pub shortfall: Option<CacheShortfall>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model produced an end-of-generation token.
    EndOfGeneration,
    /// The cursor reached `n_len`.
    LengthLimit,
}

/// Output of one [`CompletionSession::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Newly completed text. Empty while a multi-byte character is still
    /// being assembled.
    Text(String),
    End(FinishReason),
}

/// Per-generation state: cursor, pending UTF-8 bytes and decode status.
///
/// The context, batch and sampler are passed into each call so that one
/// set of backend resources can serve successive sessions.
#[derive(Debug)]
pub struct CompletionSession {
    n_len: Pos,
    n_cur: Pos,
    state: SessionState,
    assembler: Utf8Assembler,
    policy: DecodePolicy,
    last_decode_error: Option<i32>,
}

impl CompletionSession {
    /// Generation stops once the cursor (prompt plus generated tokens)
    /// reaches `n_len`.
    pub fn new(n_len: Pos) -> Self {
        Self {
            n_len,
            n_cur: 0,
            state: SessionState::Idle,
            assembler: Utf8Assembler::default(),
            policy: DecodePolicy::default(),
            last_decode_error: None,
        }
    }

    pub fn with_decode_policy(mut self, policy: DecodePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_invalid_utf8(mut self, policy: InvalidUtf8Policy) -> Self {
        self.assembler = Utf8Assembler::new(policy);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Position of the next generated token.
    pub fn n_cur(&self) -> Pos {
        self.n_cur
    }

    pub fn n_len(&self) -> Pos {
        self.n_len
    }

    pub fn decode_policy(&self) -> DecodePolicy {
        self.policy
    }

    /// Status of the most recent failed decode since `init`, if any.
    pub fn last_decode_error(&self) -> Option<i32> {
        self.last_decode_error
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending_bytes(&self) -> &[u8] {
        self.assembler.pending()
    }

    /// Forget the current generation. The KV cache is left alone.
    pub fn reset(&mut self) {
        self.n_cur = 0;
        self.state = SessionState::Idle;
        self.assembler.clear();
        self.last_decode_error = None;
    }

    /// Tokenize `prompt`, submit it as one batch on sequence 0 and decode.
    ///
    /// May be called in any state; it starts a new generation. Nothing is
    /// mutated when the prompt is empty or does not fit in `batch`.
    pub fn init<C: Context>(
        &mut self,
        ctx: &mut C,
        batch: &mut Batch,
        prompt: &str,
    ) -> Result<Prime> {
        if prompt.is_empty() {
            return Err(SessionError::InvalidArgument("prompt is empty".to_string()));
        }
        if batch.tokens().is_none() {
            return Err(SessionError::InvalidArgument(
                "completion needs a token batch".to_string(),
            ));
        }
        let tokens = ctx.model().tokenize(prompt, true, true)?;
        if tokens.is_empty() {
            return Err(SessionError::InvalidArgument(
                "prompt produced no tokens".to_string(),
            ));
        }
        if tokens.len() > batch.capacity() {
            return Err(SessionError::CapacityExceeded {
                capacity: batch.capacity(),
            });
        }

        self.reset();

        let n_tokens = tokens.len();
        let n_ctx = ctx.n_ctx() as usize;
        let n_len = usize::try_from(self.n_len).unwrap_or(0);
        let n_kv_req = n_tokens + n_len.saturating_sub(n_tokens);
        info!(n_len, n_ctx, n_kv_req, "completion init");

        let shortfall = (n_kv_req > n_ctx).then(|| {
            warn!(
                n_kv_req,
                n_ctx,
                "KV cache too small for the requested length; decode will fail once it fills"
            );
            CacheShortfall {
                required: n_kv_req,
                available: n_ctx,
            }
        });

        debug!(prompt, n_tokens, "prompt tokens");

        batch.clear();
        for (i, &token) in tokens.iter().enumerate() {
            batch.add(token, i as Pos, &[SEQ], i + 1 == n_tokens)?;
        }

        let status = ctx.decode(batch);
        if status != 0 {
            self.decode_failed(status, "init")?;
        }

        self.n_cur = n_tokens as Pos;
        self.state = SessionState::Primed;
        Ok(Prime {
            n_tokens,
            shortfall,
        })
    }

    /// Sample the next token, assemble its text and feed it back.
    ///
    /// Returns [`Step::End`] (and moves to `Done`) on an end-of-generation
    /// token or once the cursor has reached `n_len`.
    pub fn step<C: Context>(
        &mut self,
        ctx: &mut C,
        batch: &mut Batch,
        sampler: &mut SamplerChain,
    ) -> Result<Step> {
        if matches!(self.state, SessionState::Idle | SessionState::Done) {
            return Err(SessionError::InvalidState {
                state: self.state,
                operation: "step",
            });
        }

        let token = sampler.sample(ctx, -1);

        let finish = if ctx.model().is_eog(token) {
            Some(FinishReason::EndOfGeneration)
        } else if self.n_cur >= self.n_len {
            Some(FinishReason::LengthLimit)
        } else {
            None
        };
        if let Some(reason) = finish {
            info!(n_cur = self.n_cur, n_len = self.n_len, ?reason, "finished");
            if !self.assembler.is_empty() {
                debug!(bytes = ?self.assembler.pending(), "dropping incomplete character");
                self.assembler.clear();
            }
            self.state = SessionState::Done;
            return Ok(Step::End(reason));
        }

        batch.clear();
        batch.add(token, self.n_cur, &[SEQ], true)?;

        let piece = ctx.model().token_to_piece(token);
        let text = self.assembler.push(&piece).unwrap_or_default();
        debug!(token, text = %text, "sampled");

        self.n_cur += 1;
        self.state = SessionState::Generating;

        let status = ctx.decode(batch);
        if status != 0 && self.decode_failed(status, "step").is_err() {
            return Err(SessionError::Decode { status, text });
        }

        Ok(Step::Text(text))
    }

    fn decode_failed(&mut self, status: i32, phase: &'static str) -> Result<()> {
        self.last_decode_error = Some(status);
        match self.policy {
            DecodePolicy::BestEffort => {
                warn!(status, phase, n_cur = self.n_cur, "decode failed; continuing");
                Ok(())
            }
            DecodePolicy::Strict => {
                warn!(status, phase, n_cur = self.n_cur, "decode failed");
                Err(SessionError::Decode {
                    status,
                    text: String::new(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ec_backend::scripted::{ScriptedContext, ScriptedModel};

    fn run_to_end(
        session: &mut CompletionSession,
        ctx: &mut ScriptedContext<'_>,
        batch: &mut Batch,
        sampler: &mut SamplerChain,
    ) -> (Vec<String>, FinishReason) {
        let mut out = Vec::new();
        loop {
            match session.step(ctx, batch, sampler).unwrap() {
                Step::Text(t) => out.push(t),
                Step::End(reason) => return (out, reason),
            }
        }
    }

    #[test]
    fn test_generates_script_then_ends() {
        let model = ScriptedModel::new(&[]).with_script_text("héllo");
        let mut ctx = ScriptedContext::new(&model, 64);
        let mut batch = Batch::new(512, 0, 1).unwrap();
        let mut sampler = SamplerChain::standard();
        let mut session = CompletionSession::new(64);

        let prime = session.init(&mut ctx, &mut batch, "hi").unwrap();
        assert_eq!(prime.n_tokens, 3);
        assert_eq!(prime.shortfall, None);
        assert_eq!(session.state(), SessionState::Primed);
        assert_eq!(session.n_cur(), 3);

        let (pieces, reason) = run_to_end(&mut session, &mut ctx, &mut batch, &mut sampler);
        assert_eq!(reason, FinishReason::EndOfGeneration);
        // The two bytes of 'é' arrive as separate tokens.
        assert_eq!(pieces, vec!["h", "", "é", "l", "l", "o"]);
        assert_eq!(pieces.concat(), "héllo");
        assert_eq!(session.state(), SessionState::Done);
        assert_eq!(session.n_cur(), 3 + 6);
    }

    #[test]
    fn test_prompt_batch_layout() {
        let model = ScriptedModel::new(&[]).with_script_text("ab");
        let mut ctx = ScriptedContext::new(&model, 64);
        let mut batch = Batch::new(16, 0, 1).unwrap();
        let mut sampler = SamplerChain::standard();
        let mut session = CompletionSession::new(64);

        session.init(&mut ctx, &mut batch, "xyz").unwrap();
        session.step(&mut ctx, &mut batch, &mut sampler).unwrap();

        let records = ctx.records();
        assert_eq!(records[0].tokens[0], model.bos());
        assert_eq!(records[0].positions, vec![0, 1, 2, 3]);
        assert_eq!(records[0].logits, vec![false, false, false, true]);
        assert!(records[0].seq_ids.iter().all(|s| s == &vec![0]));

        assert_eq!(records[1].tokens, vec![i32::from(b'a')]);
        assert_eq!(records[1].positions, vec![4]);
        assert_eq!(records[1].logits, vec![true]);
    }

    #[test]
    fn test_length_limit_at_prompt_length() {
        let model = ScriptedModel::new(&[]).with_script_text("never");
        let mut ctx = ScriptedContext::new(&model, 64);
        let mut batch = Batch::new(16, 0, 1).unwrap();
        let mut sampler = SamplerChain::standard();
        // "hi" plus BOS is three tokens.
        let mut session = CompletionSession::new(3);

        session.init(&mut ctx, &mut batch, "hi").unwrap();
        let step = session.step(&mut ctx, &mut batch, &mut sampler).unwrap();
        assert_eq!(step, Step::End(FinishReason::LengthLimit));
        assert_eq!(ctx.decode_calls(), 1);
    }

    #[test]
    fn test_prompt_longer_than_limit_still_ends() {
        let model = ScriptedModel::new(&[]).with_script_text("more text");
        let mut ctx = ScriptedContext::new(&model, 64);
        let mut batch = Batch::new(16, 0, 1).unwrap();
        let mut sampler = SamplerChain::standard();
        let mut session = CompletionSession::new(2);

        session.init(&mut ctx, &mut batch, "a long prompt").unwrap();
        let step = session.step(&mut ctx, &mut batch, &mut sampler).unwrap();
        assert_eq!(step, Step::End(FinishReason::LengthLimit));
    }

    #[test]
    fn test_long_prompt_within_cache_has_no_shortfall() {
        let model = ScriptedModel::new(&[]).with_script_text("x");
        let mut ctx = ScriptedContext::new(&model, 64);
        let mut batch = Batch::new(16, 0, 1).unwrap();
        let mut session = CompletionSession::new(2);

        // Thirteen bytes plus BOS; the requirement is the prompt itself.
        let prime = session.init(&mut ctx, &mut batch, "a long prompt").unwrap();
        assert_eq!(prime.n_tokens, 14);
        assert_eq!(prime.shortfall, None);
        assert_eq!(ctx.kv_used(), 14);
    }

    #[test]
    fn test_long_prompt_larger_than_cache() {
        let model = ScriptedModel::new(&[]).with_script_text("x");
        let mut ctx = ScriptedContext::new(&model, 4);
        let mut batch = Batch::new(16, 0, 1).unwrap();
        let mut sampler = SamplerChain::standard();
        let mut session = CompletionSession::new(2);

        let prime = session.init(&mut ctx, &mut batch, "abcdef").unwrap();
        assert_eq!(prime.n_tokens, 7);
        assert_eq!(
            prime.shortfall,
            Some(CacheShortfall {
                required: 7,
                available: 4
            })
        );
        assert_eq!(session.last_decode_error(), Some(1));
        assert_eq!(ctx.kv_used(), 0);

        let step = session.step(&mut ctx, &mut batch, &mut sampler).unwrap();
        assert_eq!(step, Step::End(FinishReason::LengthLimit));
        assert_eq!(ctx.decode_calls(), 1);
    }

    #[test]
    fn test_immediate_end_of_generation() {
        let model = ScriptedModel::new(&[]);
        let mut ctx = ScriptedContext::new(&model, 64);
        let mut batch = Batch::new(16, 0, 1).unwrap();
        let mut sampler = SamplerChain::standard();
        let mut session = CompletionSession::new(64);

        session.init(&mut ctx, &mut batch, "hi").unwrap();
        let step = session.step(&mut ctx, &mut batch, &mut sampler).unwrap();
        assert_eq!(step, Step::End(FinishReason::EndOfGeneration));
    }

    #[test]
    fn test_end_of_generation_mid_character() {
        let model = ScriptedModel::new(&[]).with_script(vec![0xE4]);
        let mut ctx = ScriptedContext::new(&model, 64);
        let mut batch = Batch::new(16, 0, 1).unwrap();
        let mut sampler = SamplerChain::standard();
        let mut session = CompletionSession::new(64);

        session.init(&mut ctx, &mut batch, "hi").unwrap();
        let (pieces, reason) = run_to_end(&mut session, &mut ctx, &mut batch, &mut sampler);
        assert_eq!(reason, FinishReason::EndOfGeneration);
        assert!(pieces.iter().all(String::is_empty));
        assert!(session.pending_bytes().is_empty());
    }

    #[test]
    fn test_step_requires_init_and_stops_after_done() {
        let model = ScriptedModel::new(&[]);
        let mut ctx = ScriptedContext::new(&model, 64);
        let mut batch = Batch::new(16, 0, 1).unwrap();
        let mut sampler = SamplerChain::standard();
        let mut session = CompletionSession::new(64);

        let err = session.step(&mut ctx, &mut batch, &mut sampler).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                state: SessionState::Idle,
                ..
            }
        ));

        session.init(&mut ctx, &mut batch, "hi").unwrap();
        session.step(&mut ctx, &mut batch, &mut sampler).unwrap();
        let err = session.step(&mut ctx, &mut batch, &mut sampler).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidState {
                state: SessionState::Done,
                ..
            }
        ));
    }

    #[test]
    fn test_rejects_bad_prompts_without_side_effects() {
        let model = ScriptedModel::new(&[]);
        let mut ctx = ScriptedContext::new(&model, 64);
        let mut batch = Batch::new(4, 0, 1).unwrap();
        let mut session = CompletionSession::new(64);

        let err = session.init(&mut ctx, &mut batch, "").unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument(_)));

        let err = session.init(&mut ctx, &mut batch, "too long").unwrap_err();
        assert!(matches!(err, SessionError::CapacityExceeded { capacity: 4 }));

        assert_eq!(ctx.decode_calls(), 0);
        assert!(batch.is_empty());
        assert_eq!(session.state(), SessionState::Idle);

        let mut embeddings = Batch::new(4, 8, 1).unwrap();
        let err = session.init(&mut ctx, &mut embeddings, "hi").unwrap_err();
        assert!(matches!(err, SessionError::InvalidArgument(_)));
    }

    #[test]
    fn test_cache_shortfall_is_reported_not_fatal() {
        let model = ScriptedModel::new(&[]).with_script_text("abcdefgh");
        let mut ctx = ScriptedContext::new(&model, 6);
        let mut batch = Batch::new(16, 0, 1).unwrap();
        let mut sampler = SamplerChain::standard();
        let mut session = CompletionSession::new(10);

        let prime = session.init(&mut ctx, &mut batch, "hi").unwrap();
        assert_eq!(
            prime.shortfall,
            Some(CacheShortfall {
                required: 10,
                available: 6
            })
        );

        // Three prompt cells plus three generated fit; the fourth decode fails
        // but generation carries on.
        let (pieces, reason) = run_to_end(&mut session, &mut ctx, &mut batch, &mut sampler);
        assert_eq!(reason, FinishReason::LengthLimit);
        assert_eq!(pieces.len(), 7);
        assert_eq!(session.last_decode_error(), Some(1));
        assert_eq!(ctx.kv_used(), 6);
    }

    #[test]
    fn test_best_effort_decode_failure() {
        let model = ScriptedModel::new(&[]).with_script_text("ok");
        let mut ctx = ScriptedContext::new(&model, 64);
        ctx.fail_decode_at(1, 7);
        let mut batch = Batch::new(16, 0, 1).unwrap();
        let mut sampler = SamplerChain::standard();
        let mut session = CompletionSession::new(64);

        session.init(&mut ctx, &mut batch, "hi").unwrap();
        let step = session.step(&mut ctx, &mut batch, &mut sampler).unwrap();
        assert_eq!(step, Step::Text("o".to_string()));
        assert_eq!(session.last_decode_error(), Some(7));
        assert_eq!(session.n_cur(), 4);
    }

    #[test]
    fn test_strict_decode_failure_keeps_text() {
        let model = ScriptedModel::new(&[]).with_script_text("ok");
        let mut ctx = ScriptedContext::new(&model, 64);
        ctx.fail_decode_at(1, 7);
        let mut batch = Batch::new(16, 0, 1).unwrap();
        let mut sampler = SamplerChain::standard();
        let mut session = CompletionSession::new(64).with_decode_policy(DecodePolicy::Strict);

        session.init(&mut ctx, &mut batch, "hi").unwrap();
        let err = session.step(&mut ctx, &mut batch, &mut sampler).unwrap_err();
        match err {
            SessionError::Decode { status, text } => {
                assert_eq!(status, 7);
                assert_eq!(text, "o");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(session.n_cur(), 4);
        assert_eq!(session.state(), SessionState::Generating);
    }

    #[test]
    fn test_strict_init_failure() {
        let model = ScriptedModel::new(&[]);
        let mut ctx = ScriptedContext::new(&model, 64);
        ctx.fail_decode_at(0, 3);
        let mut batch = Batch::new(16, 0, 1).unwrap();
        let mut session = CompletionSession::new(64).with_decode_policy(DecodePolicy::Strict);

        let err = session.init(&mut ctx, &mut batch, "hi").unwrap_err();
        assert!(matches!(err, SessionError::Decode { status: 3, .. }));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_reinit_clears_pending_bytes() {
        let model = ScriptedModel::new(&[]).with_script(vec![0xE4, 0xB8]);
        let mut ctx = ScriptedContext::new(&model, 64);
        let mut batch = Batch::new(16, 0, 1).unwrap();
        let mut sampler = SamplerChain::standard();
        let mut session = CompletionSession::new(64);

        session.init(&mut ctx, &mut batch, "hi").unwrap();
        assert_eq!(
            session.step(&mut ctx, &mut batch, &mut sampler).unwrap(),
            Step::Text(String::new())
        );
        assert_eq!(session.pending_bytes(), &[0xE4]);

        ctx.kv_cache_clear();
        session.init(&mut ctx, &mut batch, "hi").unwrap();
        assert!(session.pending_bytes().is_empty());
        assert_eq!(session.last_decode_error(), None);
    }
}
