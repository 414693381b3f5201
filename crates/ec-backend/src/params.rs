use serde::{Deserialize, Serialize};

use crate::error::{BackendError, Result};

/// Upper bound on decode threads.
const MAX_THREADS: usize = 8;
/// Cores left to the host application.
const RESERVED_CORES: usize = 2;

/// Thread count for a context: available processors minus the reserved
/// cores, clamped to `[1, 8]`.
pub fn default_thread_count() -> usize {
    num_cpus::get().saturating_sub(RESERVED_CORES).clamp(1, MAX_THREADS)
}

/// Parameters used when loading model weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelParams {
    /// Lock the weights in RAM so the OS cannot page them out.
    pub use_mlock: bool,
    /// Number of layers offloaded to an accelerator.
    pub n_gpu_layers: u32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            use_mlock: true,
            n_gpu_layers: 29,
        }
    }
}

/// Parameters for an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextParams {
    /// KV cache capacity in tokens.
    pub n_ctx: u32,
    /// Largest batch the context accepts in one decode call.
    pub n_batch: u32,
    /// Threads used for single-token generation.
    pub n_threads: usize,
    /// Threads used for prompt (batch) processing.
    pub n_threads_batch: usize,
    /// Use the fused attention kernel when the backend has one.
    pub flash_attn: bool,
}

impl Default for ContextParams {
    fn default() -> Self {
        let threads = default_thread_count();
        Self {
            n_ctx: 2048,
            n_batch: 512,
            n_threads: threads,
            n_threads_batch: threads,
            flash_attn: true,
        }
    }
}

impl ContextParams {
    /// Validate parameter values. Returns error on invalid values.
    pub fn validate(&self) -> Result<()> {
        if self.n_ctx == 0 {
            return Err(BackendError::InvalidArgument(
                "n_ctx must be > 0".to_string(),
            ));
        }
        if self.n_batch == 0 {
            return Err(BackendError::InvalidArgument(
                "n_batch must be > 0".to_string(),
            ));
        }
        if self.n_threads == 0 || self.n_threads_batch == 0 {
            return Err(BackendError::InvalidArgument(
                "thread counts must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thread_count_bounds() {
        let n = default_thread_count();
        assert!((1..=MAX_THREADS).contains(&n));
    }

    #[test]
    fn test_context_defaults_valid() {
        let params = ContextParams::default();
        assert_eq!(params.n_ctx, 2048);
        assert!(params.flash_attn);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_context_validate_rejects_zero() {
        let params = ContextParams {
            n_ctx: 0,
            ..ContextParams::default()
        };
        assert!(params.validate().is_err());

        let params = ContextParams {
            n_threads: 0,
            ..ContextParams::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_partial_params_from_json() {
        let params: ModelParams = serde_json::from_str(r#"{"n_gpu_layers": 0}"#).unwrap();
        assert_eq!(params.n_gpu_layers, 0);
        assert!(params.use_mlock);
    }
}
