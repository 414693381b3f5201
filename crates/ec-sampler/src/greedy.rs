use crate::sampler::{softmax, sort_descending, Sampler, TokenLogit};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::warn;

/// Seed used when none is configured.
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// Greedy stage: orders candidates so the highest logit comes first.
///
/// Nothing is removed, so a later random draw still decides the outcome.
/// Used as the last stage of a chain it selects the argmax.
pub struct GreedySampler;

impl GreedySampler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GreedySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for GreedySampler {
    fn name(&self) -> &str {
        "greedy"
    }

    fn apply(&mut self, logits: &mut Vec<TokenLogit>) {
        sort_descending(logits);
    }
}

/// Distribution-based sampler: converts logits to probabilities via softmax,
/// then draws one token. The RNG persists across draws and is only reseeded
/// by [`Sampler::reset`].
pub struct DistSampler {
    seed: u32,
    rng: StdRng,
}

impl DistSampler {
    pub fn new(seed: u32) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(u64::from(seed)),
        }
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }
}

impl Default for DistSampler {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}

impl Sampler for DistSampler {
    fn name(&self) -> &str {
        "dist"
    }

    fn apply(&mut self, logits: &mut Vec<TokenLogit>) {
        if logits.is_empty() {
            return;
        }

        let probs = softmax(logits);
        let dist = match WeightedIndex::new(&probs) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "invalid sampling weights; keeping first candidate");
                logits.truncate(1);
                return;
            }
        };

        let selected = logits[dist.sample(&mut self.rng)].clone();
        logits.clear();
        logits.push(selected);
    }

    fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(u64::from(self.seed));
    }
}
