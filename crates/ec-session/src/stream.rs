use ec_backend::Backend;
use tracing::{debug, info};

use crate::engine::Engine;
use crate::error::Result;
use crate::session::{FinishReason, Step};

/// Iterator over the visible text of one completion.
///
/// Steps that only buffered part of a character are skipped, so every item
/// is non-empty. When generation ends, fails, or the stream is dropped, the
/// KV cache is cleared.
pub struct CompletionStream<'e, 'm, B: Backend + 'm> {
    engine: &'e mut Engine<'m, B>,
    finished: bool,
    finish_reason: Option<FinishReason>,
}

impl<'e, 'm, B: Backend + 'm> CompletionStream<'e, 'm, B> {
    pub(crate) fn new(engine: &'e mut Engine<'m, B>) -> Self {
        Self {
            engine,
            finished: false,
            finish_reason: None,
        }
    }

    /// Why generation ended. `None` while running, after an error, or when
    /// the caller stopped early.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    /// Feed each piece to `f` until generation ends or `f` returns false.
    pub fn for_each_piece<F>(mut self, mut f: F) -> Result<Option<FinishReason>>
    where
        F: FnMut(&str) -> bool,
    {
        while let Some(piece) = self.next() {
            if !f(&piece?) {
                info!("generation stopped by caller");
                return Ok(None);
            }
        }
        Ok(self.finish_reason)
    }

    /// Concatenate every piece.
    pub fn collect_text(self) -> Result<String> {
        self.collect()
    }

    fn finish(&mut self, reason: Option<FinishReason>) {
        self.finished = true;
        self.finish_reason = reason;
        self.engine.clear_context();
    }
}

impl<'e, 'm, B: Backend + 'm> Iterator for CompletionStream<'e, 'm, B> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let e = &mut *self.engine;
            match e.session.step(&mut e.ctx, &mut e.batch, &mut e.sampler) {
                Ok(Step::Text(text)) if text.is_empty() => continue,
                Ok(Step::Text(text)) => return Some(Ok(text)),
                Ok(Step::End(reason)) => {
                    debug!(?reason, "completion stream finished");
                    self.finish(Some(reason));
                }
                Err(err) => {
                    self.finish(None);
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

impl<'e, 'm, B: Backend + 'm> Drop for CompletionStream<'e, 'm, B> {
    fn drop(&mut self) {
        if !self.finished {
            self.finish(None);
        }
    }
}
