//! Reward shaping
//!
//! Turns a successful backend call into the raw reward fed to the bandit. The
//! shaper is pluggable; any `Fn(&RewardInput) -> ShapedReward` works.

use serde_json::json;

use super::bandit::DEFAULT_REWARD_CEILING;
use super::types::BackendDescriptor;

/// What is known about a successful call
#[derive(Debug, Clone, Copy)]
pub struct RewardInput<'a> {
    pub backend: &'a BackendDescriptor,
    pub output: &'a serde_json::Value,
    /// 1-based attempt number that succeeded
    pub attempt: usize,
    pub latency_ms: u64,
}

/// Raw reward plus the terms it was built from
#[derive(Debug, Clone, PartialEq)]
pub struct ShapedReward {
    pub reward: f64,
    pub components: serde_json::Value,
}

/// Reward policy applied after a successful route
pub trait RewardShaper: Send + Sync {
    fn shape(&self, input: &RewardInput<'_>) -> ShapedReward;
}

impl<F> RewardShaper for F
where
    F: Fn(&RewardInput<'_>) -> ShapedReward + Send + Sync,
{
    fn shape(&self, input: &RewardInput<'_>) -> ShapedReward {
        self(input)
    }
}

/// `(baseline - value) / baseline` clamped to `[-1, 1]`; 0 without a baseline
pub fn relative_delta(value: f64, baseline: f64) -> f64 {
    if !baseline.is_finite() || baseline <= 0.0 || !value.is_finite() {
        return 0.0;
    }
    ((baseline - value) / baseline).clamp(-1.0, 1.0)
}

/// Bonus for succeeding on the first attempt
pub const FIRST_ATTEMPT_BONUS: f64 = 0.5;

/// Default shaper: success, latency against the backend's hint, and a
/// first-attempt bonus
///
/// `reward = 1 + relative_delta(latency, hint) + 0.5 * [attempt == 1]`,
/// clamped to `[0, ceiling]`.
#[derive(Debug, Clone, Copy)]
pub struct LatencyRewardShaper {
    ceiling: f64,
}

impl Default for LatencyRewardShaper {
    fn default() -> Self {
        Self {
            ceiling: DEFAULT_REWARD_CEILING,
        }
    }
}

impl LatencyRewardShaper {
    pub fn new(ceiling: f64) -> Self {
        if ceiling.is_finite() && ceiling > 0.0 {
            Self { ceiling }
        } else {
            Self::default()
        }
    }
}

impl RewardShaper for LatencyRewardShaper {
    fn shape(&self, input: &RewardInput<'_>) -> ShapedReward {
        let latency = relative_delta(input.latency_ms as f64, input.backend.latency_ms);
        let first_attempt = if input.attempt == 1 {
            FIRST_ATTEMPT_BONUS
        } else {
            0.0
        };
        let reward = (1.0 + latency + first_attempt).clamp(0.0, self.ceiling);

        ShapedReward {
            reward,
            components: json!({
                "success": 1.0,
                "latency": latency,
                "firstAttempt": first_attempt,
                "latencyMs": input.latency_ms,
                "attempt": input.attempt,
            }),
        }
    }
}
