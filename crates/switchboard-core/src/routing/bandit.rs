//! Thompson Sampling bandit engine
//!
//! Each backend (arm) keeps a Beta(α, β) posterior over its normalized
//! reward, partitioned by a routing context. Ranking draws one sample per arm
//! and orders by the samples. Uncertain arms produce spread-out samples and get
//! explored. Arms with a high posterior mean win most of the time.
//!
//! ## Update rule
//!
//! A raw reward `r` is normalized against the reward ceiling:
//! `r' = clamp(r / ceiling, 0, 1)`, then `α += r'` and `β += 1 - r'`. The
//! parameters never decrease, so the posterior only sharpens.
//!
//! The engine is an in-memory cache. Durable state lives in a
//! [`BanditStore`](super::store::BanditStore) and is loaded with
//! [`BanditEngine::hydrate`].
//!
//! Events are published as they happen, unless the engine was built with
//! [`BanditEngine::with_deferred_events`]. Then they queue until
//! [`BanditEngine::take_events`], letting an owner behind a lock publish
//! them after the guard is dropped.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde_json::json;
use tracing::{debug, info, warn};

use super::sampling::sample_beta;
use super::types::{ArmKey, ArmSnapshot, BanditArmState, PersistedArm, Priors};
use crate::observability::{Event, ObservabilityBus};

/// Default raw reward that maps to a normalized reward of 1.0
pub const DEFAULT_REWARD_CEILING: f64 = 2.5;

/// Thompson Sampling posterior model over backends
pub struct BanditEngine {
    arms: HashMap<ArmKey, BanditArmState>,
    reward_ceiling: f64,
    default_priors: Priors,
    bus: ObservabilityBus,
    rng: Box<dyn RngCore + Send + Sync>,
    deferred: Option<Vec<Event>>,
}

impl std::fmt::Debug for BanditEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BanditEngine")
            .field("arms", &self.arms.len())
            .field("reward_ceiling", &self.reward_ceiling)
            .field("default_priors", &self.default_priors)
            .finish()
    }
}

impl BanditEngine {
    /// Create an engine with an entropy-seeded random source
    pub fn new(bus: ObservabilityBus) -> Self {
        Self {
            arms: HashMap::new(),
            reward_ceiling: DEFAULT_REWARD_CEILING,
            default_priors: Priors::default(),
            bus,
            rng: Box::new(StdRng::from_entropy()),
            deferred: None,
        }
    }

    /// Queue events instead of publishing them
    pub fn with_deferred_events(mut self) -> Self {
        self.deferred = Some(Vec::new());
        self
    }

    /// Drain queued events; always empty unless events are deferred
    pub fn take_events(&mut self) -> Vec<Event> {
        self.deferred.as_mut().map(std::mem::take).unwrap_or_default()
    }

    fn emit(&mut self, event: Event) {
        match &mut self.deferred {
            Some(queue) => queue.push(event),
            None => self.bus.publish(event),
        }
    }

    /// Use a fixed seed (for reproducibility in tests and simulations)
    pub fn with_seed(self, seed: u64) -> Self {
        self.with_rng(ChaCha8Rng::seed_from_u64(seed))
    }

    /// Inject the random source used for sampling
    pub fn with_rng<R>(mut self, rng: R) -> Self
    where
        R: RngCore + Send + Sync + 'static,
    {
        self.rng = Box::new(rng);
        self
    }

    /// Set the raw reward that normalizes to 1.0
    ///
    /// Non-finite or non-positive values keep the current ceiling.
    pub fn with_reward_ceiling(mut self, ceiling: f64) -> Self {
        if ceiling.is_finite() && ceiling > 0.0 {
            self.reward_ceiling = ceiling;
        }
        self
    }

    /// Set the prior used for arms created without an explicit one
    pub fn with_default_priors(mut self, priors: Priors) -> Self {
        self.default_priors = priors.sanitize();
        self
    }

    /// Current reward ceiling
    pub fn reward_ceiling(&self) -> f64 {
        self.reward_ceiling
    }

    /// Return the arm for `(backend_id, context)`, creating it if needed
    ///
    /// `priors` only matter on creation; an existing arm is returned as is.
    pub fn ensure(
        &mut self,
        backend_id: &str,
        context: &str,
        priors: Option<Priors>,
    ) -> BanditArmState {
        let key = self.ensure_key(backend_id, context, priors);
        self.arms
            .get(&key)
            .copied()
            .unwrap_or_else(|| BanditArmState::with_priors(self.default_priors))
    }

    fn ensure_key(&mut self, backend_id: &str, context: &str, priors: Option<Priors>) -> ArmKey {
        let key = ArmKey::new(context, backend_id);
        if !self.arms.contains_key(&key) {
            let priors = priors.map(Priors::sanitize).unwrap_or(self.default_priors);
            let state = BanditArmState::with_priors(priors);
            self.arms.insert(key.clone(), state);

            debug!(
                backend_id = %backend_id,
                context = %context,
                alpha = state.alpha,
                beta = state.beta,
                "Created bandit arm"
            );
            self.emit(Event::BanditInit {
                backend_id: backend_id.to_string(),
                alpha: state.alpha,
                beta: state.beta,
            });
        }
        key
    }

    /// Fold a raw reward into an arm's posterior
    ///
    /// Creates the arm with the default prior if it does not exist. A
    /// non-finite reward is recorded as 0.
    pub fn record_reward(
        &mut self,
        backend_id: &str,
        context: &str,
        reward: f64,
        components: Option<serde_json::Value>,
    ) -> BanditArmState {
        let reward = if reward.is_finite() {
            reward
        } else {
            warn!(backend_id = %backend_id, reward, "Non-finite reward recorded as 0");
            0.0
        };
        let reward_norm = (reward / self.reward_ceiling).clamp(0.0, 1.0);

        let key = self.ensure_key(backend_id, context, None);
        let default_priors = self.default_priors;
        let arm = self
            .arms
            .entry(key)
            .or_insert_with(|| BanditArmState::with_priors(default_priors));
        arm.trials += 1;
        arm.reward_sum += reward;
        arm.alpha += reward_norm;
        arm.beta += 1.0 - reward_norm;
        let state = *arm;

        debug!(
            backend_id = %backend_id,
            context = %context,
            reward,
            reward_norm,
            trials = state.trials,
            "Recorded bandit reward"
        );
        self.emit(Event::BanditReward {
            backend_id: backend_id.to_string(),
            reward,
            reward_norm,
            trials: state.trials,
            avg_reward: state.avg_reward(),
            alpha: state.alpha,
            beta: state.beta,
            components: components.unwrap_or_else(|| json!({})),
        });

        state
    }

    /// Draw one Thompson sample for an arm, creating it if needed
    pub fn sample_arm(&mut self, backend_id: &str, context: &str, priors: Option<Priors>) -> f64 {
        let state = self.ensure(backend_id, context, priors);
        sample_beta(state.alpha, state.beta, &mut *self.rng)
    }

    /// Arm state if it exists
    pub fn get(&self, backend_id: &str, context: &str) -> Option<BanditArmState> {
        self.arms.get(&ArmKey::new(context, backend_id)).copied()
    }

    /// Inspection view keyed by `context:backendId`
    pub fn snapshot(&self) -> BTreeMap<String, ArmSnapshot> {
        self.arms
            .iter()
            .map(|(key, state)| (key.storage_key(), ArmSnapshot::from(state)))
            .collect()
    }

    /// Raw arm states keyed by `context:backendId`, for persistence
    pub fn export(&self) -> BTreeMap<String, BanditArmState> {
        self.arms
            .iter()
            .map(|(key, state)| (key.storage_key(), *state))
            .collect()
    }

    /// Replace all in-memory state from a persisted snapshot
    ///
    /// Keys are `context:backendId` (a key without a separator belongs to the
    /// default context). Missing or invalid fields take their defaults.
    pub fn hydrate<I, K, P>(&mut self, states: I)
    where
        I: IntoIterator<Item = (K, P)>,
        K: AsRef<str>,
        P: Into<PersistedArm>,
    {
        self.arms = states
            .into_iter()
            .map(|(key, persisted)| (ArmKey::parse(key.as_ref()), persisted.into().into_state()))
            .collect();

        let backend_ids: Vec<String> = self
            .arms
            .keys()
            .map(|key| key.backend_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        info!(arms = self.arms.len(), backends = backend_ids.len(), "Hydrated bandit state");
        self.emit(Event::BanditHydrate { backend_ids });
    }

    /// Posterior means for every arm in a context
    pub fn expected_values(&self, context: &str) -> HashMap<String, f64> {
        self.arms
            .iter()
            .filter(|(key, _)| key.context == context)
            .map(|(key, state)| (key.backend_id.clone(), state.expected_value()))
            .collect()
    }

    /// Number of arms
    pub fn len(&self) -> usize {
        self.arms.len()
    }

    /// Whether no arm exists yet
    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::{BANDIT_HYDRATE, BANDIT_INIT, BANDIT_REWARD, EventRecorder};
    use crate::routing::types::DEFAULT_CONTEXT;

    fn engine() -> (BanditEngine, EventRecorder) {
        let bus = ObservabilityBus::new();
        let recorder = EventRecorder::attach(&bus);
        (BanditEngine::new(bus).with_seed(42), recorder)
    }

    #[test]
    fn test_ensure_emits_init_only_on_creation() {
        let (mut bandit, events) = engine();

        let first = bandit.ensure("openai", DEFAULT_CONTEXT, Some(Priors::new(3.0, 1.0)));
        let second = bandit.ensure("openai", DEFAULT_CONTEXT, Some(Priors::new(9.0, 9.0)));

        assert_eq!(first.alpha, 3.0);
        assert_eq!(second, first);
        assert_eq!(events.count(BANDIT_INIT), 1);
    }

    #[test]
    fn test_malformed_priors_replaced_with_defaults() {
        let (mut bandit, _) = engine();
        let state = bandit.ensure("x", DEFAULT_CONTEXT, Some(Priors::new(-1.0, f64::INFINITY)));
        assert_eq!(state.alpha, 1.0);
        assert_eq!(state.beta, 1.0);
    }

    #[test]
    fn test_record_reward_update_rule() {
        let (mut bandit, events) = engine();

        let state = bandit.record_reward("openai", DEFAULT_CONTEXT, 1.25, None);
        assert_eq!(state.trials, 1);
        assert_eq!(state.reward_sum, 1.25);
        assert!((state.alpha - 1.5).abs() < 1e-12);
        assert!((state.beta - 1.5).abs() < 1e-12);

        // Above the ceiling normalizes to 1.0
        let state = bandit.record_reward("openai", DEFAULT_CONTEXT, 10.0, None);
        assert_eq!(state.trials, 2);
        assert_eq!(state.reward_sum, 11.25);
        assert!((state.alpha - 2.5).abs() < 1e-12);
        assert!((state.beta - 1.5).abs() < 1e-12);

        assert_eq!(events.count(BANDIT_INIT), 1);
        assert_eq!(events.count(BANDIT_REWARD), 2);
    }

    #[test]
    fn test_record_reward_is_monotonic() {
        let (mut bandit, _) = engine();
        let mut prev = bandit.ensure("a", DEFAULT_CONTEXT, None);

        for reward in [0.0, 2.5, -3.0, 0.7, 1.9, 100.0] {
            let next = bandit.record_reward("a", DEFAULT_CONTEXT, reward, None);
            assert!(next.alpha >= prev.alpha);
            assert!(next.beta >= prev.beta);
            assert_eq!(next.trials, prev.trials + 1);
            assert!((next.reward_sum - (prev.reward_sum + reward)).abs() < 1e-9);
            prev = next;
        }
    }

    #[test]
    fn test_reward_event_payload() {
        let (mut bandit, events) = engine();
        bandit.record_reward("a", DEFAULT_CONTEXT, 2.0, Some(json!({ "latency": 0.5 })));

        let reward = events
            .events()
            .into_iter()
            .find(|e| e.name() == BANDIT_REWARD)
            .unwrap();
        let payload = reward.payload();
        assert_eq!(payload["backendId"], "a");
        assert_eq!(payload["trials"], 1);
        assert_eq!(payload["avgReward"], 2.0);
        assert_eq!(payload["components"]["latency"], 0.5);
    }

    #[test]
    fn test_non_finite_reward_recorded_as_zero() {
        let (mut bandit, _) = engine();
        let state = bandit.record_reward("a", DEFAULT_CONTEXT, f64::NAN, None);
        assert_eq!(state.reward_sum, 0.0);
        assert_eq!(state.alpha, 1.0);
        assert_eq!(state.beta, 2.0);
    }

    #[test]
    fn test_contexts_are_independent() {
        let (mut bandit, _) = engine();
        bandit.record_reward("a", "chat", 2.5, None);
        assert!(bandit.get("a", "code").is_none());
        assert_eq!(bandit.get("a", "chat").unwrap().trials, 1);
        assert!(bandit.snapshot().contains_key("chat:a"));
    }

    #[test]
    fn test_hydrate_snapshot_is_idempotent() {
        let (mut bandit, events) = engine();
        bandit.record_reward("a", DEFAULT_CONTEXT, 2.0, None);
        bandit.record_reward("b", "chat", 0.5, None);

        let snapshot = bandit.snapshot();
        bandit.hydrate(snapshot.clone());
        let once = bandit.snapshot();
        bandit.hydrate(once.clone());
        let twice = bandit.snapshot();

        assert_eq!(once, snapshot);
        assert_eq!(twice, once);
        assert_eq!(events.count(BANDIT_HYDRATE), 2);
    }

    #[test]
    fn test_hydrate_fills_missing_fields() {
        let (mut bandit, events) = engine();
        bandit.record_reward("stale", DEFAULT_CONTEXT, 1.0, None);

        bandit.hydrate([(
            "default:a",
            PersistedArm {
                trials: Some(4),
                ..Default::default()
            },
        )]);

        assert_eq!(bandit.len(), 1);
        let state = bandit.get("a", DEFAULT_CONTEXT).unwrap();
        assert_eq!(state.trials, 4);
        assert_eq!(state.alpha, 1.0);
        assert!(bandit.get("stale", DEFAULT_CONTEXT).is_none());

        let hydrate = events
            .events()
            .into_iter()
            .find(|e| e.name() == BANDIT_HYDRATE)
            .unwrap();
        assert_eq!(hydrate.payload()["backendIds"], json!(["a"]));
    }

    #[test]
    fn test_update_affects_expected_values() {
        let (mut bandit, _) = engine();
        for _ in 0..20 {
            bandit.record_reward("good", DEFAULT_CONTEXT, 2.5, None);
            bandit.record_reward("bad", DEFAULT_CONTEXT, 0.0, None);
        }

        let expected = bandit.expected_values(DEFAULT_CONTEXT);
        assert!(expected["good"] > 0.9);
        assert!(expected["bad"] < 0.1);

        let mut good_wins = 0;
        for _ in 0..50 {
            if bandit.sample_arm("good", DEFAULT_CONTEXT, None)
                > bandit.sample_arm("bad", DEFAULT_CONTEXT, None)
            {
                good_wins += 1;
            }
        }
        assert!(good_wins > 45, "good won {good_wins} of 50");
    }

    #[test]
    fn test_custom_reward_ceiling() {
        let bus = ObservabilityBus::new();
        let mut bandit = BanditEngine::new(bus).with_seed(1).with_reward_ceiling(1.0);
        let state = bandit.record_reward("a", DEFAULT_CONTEXT, 1.0, None);
        assert_eq!(state.alpha, 2.0);
        assert_eq!(state.beta, 1.0);

        let unchanged = BanditEngine::new(ObservabilityBus::new()).with_reward_ceiling(0.0);
        assert_eq!(unchanged.reward_ceiling(), DEFAULT_REWARD_CEILING);
    }

    #[test]
    fn test_deferred_events_wait_for_take() {
        let bus = ObservabilityBus::new();
        let events = EventRecorder::attach(&bus);
        let mut bandit = BanditEngine::new(bus.clone()).with_seed(3).with_deferred_events();

        bandit.record_reward("a", DEFAULT_CONTEXT, 2.0, None);
        assert!(events.events().is_empty());

        let queued = bandit.take_events();
        let names: Vec<&str> = queued.iter().map(Event::name).collect();
        assert_eq!(names, vec![BANDIT_INIT, BANDIT_REWARD]);
        assert!(bandit.take_events().is_empty());

        let (mut immediate, _) = engine();
        immediate.record_reward("a", DEFAULT_CONTEXT, 2.0, None);
        assert!(immediate.take_events().is_empty());
    }
}
