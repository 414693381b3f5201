use crate::sampler::{Sampler, TokenLogit};

/// Scales all logits by dividing by a temperature value.
///
/// Higher temperatures flatten the distribution, lower ones sharpen it.
pub struct TemperatureSampler {
    temperature: f32,
}

impl TemperatureSampler {
    /// Create a new temperature sampler with the given temperature.
    pub fn new(temperature: f32) -> Self {
        Self { temperature }
    }
}

impl Sampler for TemperatureSampler {
    fn name(&self) -> &str {
        "temperature"
    }

    fn apply(&mut self, logits: &mut Vec<TokenLogit>) {
        // Non-positive temperatures collapse onto the argmax.
        let temp = if self.temperature <= 0.0 {
            1e-7
        } else {
            self.temperature
        };

        for token in logits.iter_mut() {
            token.logit /= temp;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_temperature_scales() {
        let mut logits = vec![
            TokenLogit { token_id: 0, logit: 1.6 },
            TokenLogit { token_id: 1, logit: -0.8 },
        ];
        TemperatureSampler::new(0.8).apply(&mut logits);
        assert_relative_eq!(logits[0].logit, 2.0, epsilon = 1e-6);
        assert_relative_eq!(logits[1].logit, -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_zero_temperature_is_finite() {
        let mut logits = vec![TokenLogit { token_id: 0, logit: 1e-3 }];
        TemperatureSampler::new(0.0).apply(&mut logits);
        assert!(logits[0].logit.is_finite());
        assert!(logits[0].logit > 1e3);
    }
}
