//! Routing event catalog
//!
//! Every telemetry event the router emits is a variant of [`Event`]. The
//! dotted name identifies the event on the bus, and the payload is the
//! variant's fields serialized with camelCase keys.

use serde::Serialize;

use crate::error::ErrorCode;

pub const BANDIT_INIT: &str = "routing.bandit.init";
pub const BANDIT_REWARD: &str = "routing.bandit.reward";
pub const BANDIT_HYDRATE: &str = "routing.bandit.hydrate";
pub const FALLBACK_ATTEMPT: &str = "fallback.attempt";
pub const FALLBACK_SUCCEEDED: &str = "fallback.succeeded";
pub const FALLBACK_FAILED: &str = "fallback.failed";
pub const HEALTH_DISABLED: &str = "provider.health.disabled";
pub const HEALTH_ENABLED: &str = "provider.health.enabled";

/// Transient routing event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum Event {
    /// A bandit arm was created with its prior
    BanditInit {
        backend_id: String,
        alpha: f64,
        beta: f64,
    },
    /// A reward was folded into an arm's posterior
    BanditReward {
        backend_id: String,
        reward: f64,
        reward_norm: f64,
        trials: u64,
        avg_reward: f64,
        alpha: f64,
        beta: f64,
        components: serde_json::Value,
    },
    /// Bandit state was replaced from a persisted snapshot
    BanditHydrate { backend_ids: Vec<String> },
    /// A backend is about to be tried
    FallbackAttempt {
        request_id: String,
        backend_id: String,
        attempt: usize,
        op: String,
    },
    /// A backend attempt produced output
    FallbackSucceeded {
        request_id: String,
        backend_id: String,
        attempt: usize,
        op: String,
        latency_ms: u64,
    },
    /// A backend attempt failed
    FallbackFailed {
        request_id: String,
        backend_id: String,
        attempt: usize,
        op: String,
        latency_ms: u64,
        error_code: ErrorCode,
        status: String,
        message: String,
    },
    /// A backend was taken out of rotation
    HealthDisabled {
        backend_id: String,
        reason: String,
        cooldown_ms: Option<u64>,
    },
    /// A backend was put back into rotation
    HealthEnabled { backend_id: String, reason: String },
}

impl Event {
    /// Dotted event name used for subscription
    pub fn name(&self) -> &'static str {
        match self {
            Self::BanditInit { .. } => BANDIT_INIT,
            Self::BanditReward { .. } => BANDIT_REWARD,
            Self::BanditHydrate { .. } => BANDIT_HYDRATE,
            Self::FallbackAttempt { .. } => FALLBACK_ATTEMPT,
            Self::FallbackSucceeded { .. } => FALLBACK_SUCCEEDED,
            Self::FallbackFailed { .. } => FALLBACK_FAILED,
            Self::HealthDisabled { .. } => HEALTH_DISABLED,
            Self::HealthEnabled { .. } => HEALTH_ENABLED,
        }
    }

    /// Structured payload for sinks that want JSON
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Backend the event refers to, if any
    pub fn backend_id(&self) -> Option<&str> {
        match self {
            Self::BanditInit { backend_id, .. }
            | Self::BanditReward { backend_id, .. }
            | Self::FallbackAttempt { backend_id, .. }
            | Self::FallbackSucceeded { backend_id, .. }
            | Self::FallbackFailed { backend_id, .. }
            | Self::HealthDisabled { backend_id, .. }
            | Self::HealthEnabled { backend_id, .. } => Some(backend_id),
            Self::BanditHydrate { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_uses_catalog_field_names() {
        let event = Event::FallbackFailed {
            request_id: "req-1".to_string(),
            backend_id: "openai".to_string(),
            attempt: 2,
            op: "run".to_string(),
            latency_ms: 15,
            error_code: ErrorCode::Timeout,
            status: "error".to_string(),
            message: "deadline".to_string(),
        };

        assert_eq!(event.name(), "fallback.failed");
        let payload = event.payload();
        assert_eq!(payload["requestId"], "req-1");
        assert_eq!(payload["backendId"], "openai");
        assert_eq!(payload["latencyMs"], 15);
        assert_eq!(payload["errorCode"], "TIMEOUT");
    }

    #[test]
    fn test_hydrate_payload() {
        let event = Event::BanditHydrate {
            backend_ids: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(event.payload()["backendIds"][1], "b");
        assert_eq!(event.backend_id(), None);
    }
}
