use crate::sampler::{softmax, sort_descending, Sampler, TokenLogit};

/// Nucleus sampling: keeps the smallest set of tokens whose cumulative
/// probability exceeds the threshold `p`.
pub struct TopPSampler {
    p: f32,
}

impl TopPSampler {
    /// Create a new top-p (nucleus) sampler with the given probability threshold.
    pub fn new(p: f32) -> Self {
        Self { p }
    }
}

impl Sampler for TopPSampler {
    fn name(&self) -> &str {
        "top_p"
    }

    fn apply(&mut self, logits: &mut Vec<TokenLogit>) {
        if logits.is_empty() {
            return;
        }

        sort_descending(logits);
        let probs = softmax(logits);

        let mut cumulative = 0.0f32;
        let mut cutoff = logits.len();
        for (i, &prob) in probs.iter().enumerate() {
            cumulative += prob;
            if cumulative > self.p {
                cutoff = i + 1;
                break;
            }
        }

        logits.truncate(cutoff.max(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_p_keeps_nucleus() {
        let mut logits = vec![
            TokenLogit { token_id: 0, logit: 0.0 },
            TokenLogit { token_id: 1, logit: 10.0 },
            TokenLogit { token_id: 2, logit: 9.0 },
        ];
        TopPSampler::new(0.9).apply(&mut logits);
        let ids: Vec<i32> = logits.iter().map(|t| t.token_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
