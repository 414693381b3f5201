use crate::sampler::{softmax, sort_descending, Sampler, TokenLogit};

/// Drops candidates whose probability is below `p` times the probability of
/// the most likely candidate, keeping at least `min_keep`.
pub struct MinPSampler {
    p: f32,
    min_keep: usize,
}

impl MinPSampler {
    pub fn new(p: f32, min_keep: usize) -> Self {
        Self { p, min_keep }
    }
}

impl Sampler for MinPSampler {
    fn name(&self) -> &str {
        "min_p"
    }

    fn apply(&mut self, logits: &mut Vec<TokenLogit>) {
        if self.p <= 0.0 || logits.is_empty() {
            return;
        }

        sort_descending(logits);
        let probs = softmax(logits);
        let threshold = probs[0] * self.p;

        let kept = probs.iter().take_while(|&&p| p >= threshold).count();
        logits.truncate(kept.max(self.min_keep).max(1));
    }
}
