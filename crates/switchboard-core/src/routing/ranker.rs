//! Ranking
//!
//! Draws one Thompson sample per available backend and blends it with the
//! backend's static hints into a score. The full order is returned so the
//! fallback orchestrator can move down the list.

use serde::Serialize;
use tracing::debug;

use super::bandit::BanditEngine;
use super::types::{BackendDescriptor, RoutingPreference};

/// Weight of the hint bonus under the `Fast` and `Cost` preferences
const PREFERENCE_BONUS: f64 = 0.4;

/// A backend with the sample and score that placed it
#[derive(Debug, Clone)]
pub struct RankedBackend {
    pub backend: BackendDescriptor,
    pub sample: f64,
    pub score: f64,
}

/// Score entry for debug output
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendScore {
    pub backend_id: String,
    pub sample: f64,
    pub score: f64,
}

impl From<&RankedBackend> for BackendScore {
    fn from(ranked: &RankedBackend) -> Self {
        Self {
            backend_id: ranked.backend.id.clone(),
            sample: ranked.sample,
            score: ranked.score,
        }
    }
}

/// Turns bandit samples and backend hints into an attempt order
#[derive(Debug, Clone, Copy)]
pub struct Ranker {
    preference: RoutingPreference,
    cost_reference: f64,
    latency_reference_ms: f64,
}

impl Default for Ranker {
    fn default() -> Self {
        Self::new(RoutingPreference::Balanced)
    }
}

impl Ranker {
    pub fn new(preference: RoutingPreference) -> Self {
        Self {
            preference,
            cost_reference: 0.01,
            latency_reference_ms: 1000.0,
        }
    }

    /// Cost at which the cost factor halves
    pub fn with_cost_reference(mut self, cost: f64) -> Self {
        if cost.is_finite() && cost > 0.0 {
            self.cost_reference = cost;
        }
        self
    }

    /// Latency at which the latency factor halves
    pub fn with_latency_reference_ms(mut self, latency_ms: f64) -> Self {
        if latency_ms.is_finite() && latency_ms > 0.0 {
            self.latency_reference_ms = latency_ms;
        }
        self
    }

    pub fn preference(&self) -> RoutingPreference {
        self.preference
    }

    /// `1 / (1 + cost / reference)`: 1 for free backends, towards 0 for expensive ones
    fn cost_factor(&self, backend: &BackendDescriptor) -> f64 {
        1.0 / (1.0 + backend.cost.max(0.0) / self.cost_reference)
    }

    fn latency_factor(&self, backend: &BackendDescriptor) -> f64 {
        1.0 / (1.0 + backend.latency_ms.max(0.0) / self.latency_reference_ms)
    }

    /// Combine a Thompson sample with the backend's hints
    pub fn score(&self, sample: f64, backend: &BackendDescriptor) -> f64 {
        let base = sample * backend.weight.max(0.0);
        let score = match self.preference {
            RoutingPreference::Quality => base,
            RoutingPreference::Balanced => {
                base * (0.8 + 0.1 * self.cost_factor(backend) + 0.1 * self.latency_factor(backend))
            }
            RoutingPreference::Fast => base + PREFERENCE_BONUS * self.latency_factor(backend),
            RoutingPreference::Cost => base + PREFERENCE_BONUS * self.cost_factor(backend),
        };
        if score.is_finite() { score } else { 0.0 }
    }

    /// Rank every backend, best first
    ///
    /// Arms that do not exist yet are created with the backend's class prior.
    /// Equal scores are ordered by backend id.
    pub fn rank(
        &self,
        bandit: &mut BanditEngine,
        backends: &[BackendDescriptor],
        context: &str,
    ) -> Vec<RankedBackend> {
        let mut ranked: Vec<RankedBackend> = backends
            .iter()
            .map(|backend| {
                let sample = bandit.sample_arm(&backend.id, context, Some(backend.class.prior()));
                RankedBackend {
                    backend: backend.clone(),
                    sample,
                    score: self.score(sample, backend),
                }
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.backend.id.cmp(&b.backend.id))
        });

        debug!(
            context = %context,
            preference = %self.preference,
            order = ?ranked.iter().map(|r| r.backend.id.as_str()).collect::<Vec<_>>(),
            "Ranked backends"
        );
        ranked
    }
}

/// Order of backend ids in a ranking
pub fn order_of(ranked: &[RankedBackend]) -> Vec<String> {
    ranked.iter().map(|r| r.backend.id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::ObservabilityBus;
    use crate::routing::types::{BanditArmState, DEFAULT_CONTEXT, ProviderClass};

    fn engine() -> BanditEngine {
        BanditEngine::new(ObservabilityBus::new()).with_seed(42)
    }

    fn confident(engine: &mut BanditEngine, ids: &[&str]) {
        let state = BanditArmState {
            trials: 100,
            reward_sum: 125.0,
            alpha: 50.0,
            beta: 50.0,
        };
        engine.hydrate(ids.iter().map(|id| (format!("default:{id}"), state)));
    }

    #[test]
    fn test_rank_returns_every_backend_sorted() {
        let mut bandit = engine();
        let backends = vec![
            BackendDescriptor::new("a"),
            BackendDescriptor::new("b"),
            BackendDescriptor::new("c"),
        ];

        let ranked = Ranker::default().rank(&mut bandit, &backends, DEFAULT_CONTEXT);
        assert_eq!(ranked.len(), 3);
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(bandit.len(), 3);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let mut bandit = engine();
        let backends = vec![
            BackendDescriptor::new("zeta").with_weight(0.0),
            BackendDescriptor::new("alpha").with_weight(0.0),
            BackendDescriptor::new("mid").with_weight(-1.0),
        ];

        let ranked = Ranker::new(RoutingPreference::Quality).rank(&mut bandit, &backends, DEFAULT_CONTEXT);
        assert_eq!(order_of(&ranked), vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_non_finite_score_becomes_zero() {
        let ranker = Ranker::new(RoutingPreference::Quality);
        let backend = BackendDescriptor::new("a").with_weight(f64::INFINITY);
        assert_eq!(ranker.score(0.0, &backend), 0.0);
        assert_eq!(ranker.score(f64::NAN, &BackendDescriptor::new("b")), 0.0);
    }

    #[test]
    fn test_fast_preference_favors_low_latency() {
        let mut bandit = engine();
        confident(&mut bandit, &["quick", "sluggish"]);
        let backends = vec![
            BackendDescriptor::new("quick").with_latency_ms(50.0),
            BackendDescriptor::new("sluggish").with_latency_ms(5000.0),
        ];

        let ranker = Ranker::new(RoutingPreference::Fast);
        let quick_first = (0..100)
            .filter(|_| ranker.rank(&mut bandit, &backends, DEFAULT_CONTEXT)[0].backend.id == "quick")
            .count();
        assert!(quick_first > 90, "quick ranked first {quick_first} of 100");
    }

    #[test]
    fn test_cost_preference_favors_cheap() {
        let mut bandit = engine();
        confident(&mut bandit, &["cheap", "pricey"]);
        let backends = vec![
            BackendDescriptor::new("pricey").with_cost(0.1),
            BackendDescriptor::new("cheap").with_cost(0.001),
        ];

        let ranker = Ranker::new(RoutingPreference::Cost);
        let cheap_first = (0..100)
            .filter(|_| ranker.rank(&mut bandit, &backends, DEFAULT_CONTEXT)[0].backend.id == "cheap")
            .count();
        assert!(cheap_first > 90, "cheap ranked first {cheap_first} of 100");
    }

    #[test]
    fn test_balanced_discount_is_mild() {
        let ranker = Ranker::default();
        let free = BackendDescriptor::new("free");
        let costly = BackendDescriptor::new("costly")
            .with_cost(1000.0)
            .with_latency_ms(1_000_000.0);

        assert!((ranker.score(0.5, &free) - 0.5).abs() < 1e-12);
        let discounted = ranker.score(0.5, &costly);
        assert!(discounted < 0.5 && discounted > 0.39);
    }

    #[test]
    fn test_class_prior_used_for_new_arms() {
        let mut bandit = engine();
        let backends = vec![BackendDescriptor::new("a").with_class(ProviderClass::FastPricey)];
        Ranker::default().rank(&mut bandit, &backends, "chat");

        let arm = bandit.get("a", "chat").unwrap();
        assert_eq!((arm.alpha, arm.beta), (3.0, 1.0));
    }
}
