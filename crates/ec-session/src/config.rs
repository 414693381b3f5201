use std::path::Path;

use ec_backend::{ContextParams, ModelParams, Pos};
use ec_sampler::SamplerParams;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::session::DecodePolicy;
use crate::utf8::InvalidUtf8Policy;

/// Everything needed to load a model and run completions on it.
///
/// Missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Generation stops once prompt plus generated tokens reach this length.
    pub n_len: Pos,
    pub batch_capacity: usize,
    pub embedding_dim: usize,
    pub max_sequences: usize,
    pub decode_policy: DecodePolicy,
    pub invalid_utf8: InvalidUtf8Policy,
    pub model: ModelParams,
    pub context: ContextParams,
    pub sampler: SamplerParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            n_len: 1024,
            batch_capacity: 512,
            embedding_dim: 0,
            max_sequences: 1,
            decode_policy: DecodePolicy::default(),
            invalid_utf8: InvalidUtf8Policy::default(),
            model: ModelParams::default(),
            context: ContextParams::default(),
            sampler: SamplerParams::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SessionError::Config(format!("invalid config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_len <= 0 {
            return Err(SessionError::Config("n_len must be positive".into()));
        }
        if self.batch_capacity == 0 || self.max_sequences == 0 {
            return Err(SessionError::Config(
                "batch_capacity and max_sequences must be positive".into(),
            ));
        }
        if self.embedding_dim != 0 {
            return Err(SessionError::Config(
                "completion sessions need a token batch (embedding_dim = 0)".into(),
            ));
        }
        let s = &self.sampler;
        if !(0.0..=1.0).contains(&s.min_p) || !(0.0..=1.0).contains(&s.top_p) {
            return Err(SessionError::Config(
                "min_p and top_p must lie in [0, 1]".into(),
            ));
        }
        if !s.temperature.is_finite() || s.temperature < 0.0 {
            return Err(SessionError::Config(
                "temperature must be finite and non-negative".into(),
            ));
        }
        self.context
            .validate()
            .map_err(|e| SessionError::Config(e.to_string()))
    }
}
