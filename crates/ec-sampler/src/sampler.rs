use ec_backend::{Context, TokenId};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::greedy::{DistSampler, GreedySampler, DEFAULT_SEED};
use crate::min_p::MinPSampler;
use crate::temperature::TemperatureSampler;
use crate::top_k::TopKSampler;
use crate::top_p::TopPSampler;

/// A token ID paired with its logit value.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenLogit {
    pub token_id: TokenId,
    pub logit: f32,
}

/// Trait for samplers that modify or select from a set of token logits.
pub trait Sampler: Send + Sync {
    /// Returns the name of this sampler.
    fn name(&self) -> &str;

    /// Modify candidates in-place (filtering, scaling, reordering, drawing).
    fn apply(&mut self, logits: &mut Vec<TokenLogit>);

    /// Reset any internal state. Default implementation does nothing.
    fn reset(&mut self) {}
}

/// Sort candidates by descending logit. Ties keep their original order.
pub(crate) fn sort_descending(logits: &mut [TokenLogit]) {
    logits.sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(std::cmp::Ordering::Equal));
}

/// Softmax probabilities of `logits`, in the same order.
pub(crate) fn softmax(logits: &[TokenLogit]) -> Vec<f32> {
    let max_logit = logits
        .iter()
        .map(|t| t.logit)
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|t| (t.logit - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.iter().map(|e| e / sum).collect()
}

/// Knobs for [`SamplerChain::from_params`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerParams {
    /// Keep only the K most likely tokens (0 = disabled).
    pub top_k: usize,
    /// Nucleus threshold (1.0 = disabled).
    pub top_p: f32,
    /// Drop tokens less likely than `min_p` times the most likely one.
    pub min_p: f32,
    /// Tokens always kept by the min-p stage.
    pub min_keep: usize,
    pub temperature: f32,
    /// Seed of the final draw.
    pub seed: u32,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            top_k: 0,
            top_p: 1.0,
            min_p: 0.05,
            min_keep: 1,
            temperature: 0.8,
            seed: DEFAULT_SEED,
        }
    }
}

/// Composes multiple samplers into a pipeline.
/// The last sampler in the chain should be a selector (greedy or random).
pub struct SamplerChain {
    samplers: Vec<Box<dyn Sampler>>,
}

impl SamplerChain {
    /// Create a new empty sampler chain.
    pub fn new() -> Self {
        Self {
            samplers: Vec::new(),
        }
    }

    /// Add a sampler to the end of the chain. Returns self for builder-style usage.
    pub fn with(mut self, sampler: Box<dyn Sampler>) -> Self {
        self.samplers.push(sampler);
        self
    }

    /// greedy -> min-p(0.05, keep 1) -> temperature(0.8) -> dist(DEFAULT_SEED).
    pub fn standard() -> Self {
        Self::from_params(&SamplerParams::default())
    }

    /// Build a chain from parameters. Top-k and top-p run before min-p when
    /// enabled.
    pub fn from_params(params: &SamplerParams) -> Self {
        let mut chain = Self::new().with(Box::new(GreedySampler::new()));
        if params.top_k > 0 {
            chain = chain.with(Box::new(TopKSampler::new(params.top_k)));
        }
        if params.top_p < 1.0 {
            chain = chain.with(Box::new(TopPSampler::new(params.top_p)));
        }
        chain
            .with(Box::new(MinPSampler::new(params.min_p, params.min_keep)))
            .with(Box::new(TemperatureSampler::new(params.temperature)))
            .with(Box::new(DistSampler::new(params.seed)))
    }

    /// Stage names, in application order.
    pub fn names(&self) -> Vec<&str> {
        self.samplers.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }

    /// Run all samplers in order on raw logits, return the selected token ID.
    ///
    /// 1. Converts the `&[f32]` logits into `Vec<TokenLogit>` (token_id = index).
    /// 2. Applies each sampler in sequence.
    /// 3. Returns the first remaining candidate (0 if none is left).
    pub fn sample_logits(&mut self, logits: &[f32]) -> TokenId {
        let mut token_logits: Vec<TokenLogit> = logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| TokenLogit {
                token_id: i as TokenId,
                logit,
            })
            .collect();

        for sampler in &mut self.samplers {
            sampler.apply(&mut token_logits);
        }

        token_logits.first().map(|t| t.token_id).unwrap_or(0)
    }

    /// Sample from the distribution the context produced for batch entry
    /// `idx` (-1 = most recent output).
    pub fn sample<C: Context>(&mut self, ctx: &C, idx: i32) -> TokenId {
        match ctx.logits_ith(idx) {
            Some(logits) => self.sample_logits(logits),
            None => {
                warn!(idx, "no logits available; sampling an empty distribution");
                self.sample_logits(&[])
            }
        }
    }

    /// Reset every stage (reseeds the final draw).
    pub fn reset(&mut self) {
        for sampler in &mut self.samplers {
            sampler.reset();
        }
    }
}

impl Default for SamplerChain {
    fn default() -> Self {
        Self::new()
    }
}
