//! Routing coordinator
//!
//! Composes health filtering, sticky pinning, Thompson ranking and ordered
//! fallback into the per-request pipeline, then closes the feedback loop by
//! recording the reward of the backend that answered.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::json;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bandit::BanditEngine;
use super::fallback::{AttemptFailure, FallbackOrchestrator};
use super::health::ProviderHealthRegistry;
use super::ranker::{BackendScore, Ranker};
use super::reward::{LatencyRewardShaper, RewardInput, RewardShaper};
use super::sticky::StickyRouter;
use super::store::BanditStore;
use super::types::{ArmKey, ArmSnapshot, BackendDescriptor, BanditArmState, RoutingPreference};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{CanonicalError, Error, ErrorCode, Result};
use crate::observability::ObservabilityBus;

/// One request to route
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    /// Candidate backends, in no particular order
    pub backends: Vec<BackendDescriptor>,
    /// Arguments handed to the chosen backend; `requestId` and `userId` are read from it
    pub request: serde_json::Value,
    pub intent: Option<String>,
    /// Bandit context; the configured default when absent
    pub context: Option<String>,
    /// Attach ranking details to the outcome
    pub debug: bool,
}

impl RouteRequest {
    pub fn new(backends: Vec<BackendDescriptor>, request: serde_json::Value) -> Self {
        Self {
            backends,
            request,
            ..Default::default()
        }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// How a route was decided
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDebug {
    pub sticky_key: String,
    pub context: String,
    /// Backend moved to the front by a sticky pin
    pub pinned: Option<String>,
    /// Attempt order handed to the fallback orchestrator
    pub order: Vec<String>,
    /// Ranking scores; empty when a pin skipped ranking
    pub scores: Vec<BackendScore>,
    pub failures: Vec<AttemptFailure>,
    pub reward: f64,
}

/// Successful route
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOutcome {
    pub backend_used: String,
    pub output: serde_json::Value,
    pub request_id: String,
    pub attempt: usize,
    pub latency_ms: u64,
    /// Whether a sticky pin chose the order
    pub sticky: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<RouteDebug>,
}

/// Per-request routing pipeline
pub struct RoutingCoordinator {
    bus: ObservabilityBus,
    bandit: Arc<RwLock<BanditEngine>>,
    ranker: Ranker,
    sticky: Arc<StickyRouter>,
    health: Arc<ProviderHealthRegistry>,
    fallback: FallbackOrchestrator,
    shaper: Arc<dyn RewardShaper>,
    store: Option<Arc<dyn BanditStore>>,
    pending_writes: Mutex<Vec<JoinHandle<()>>>,
    /// Per-arm write gate holding the trial count last saved
    write_gates: Mutex<HashMap<ArmKey, WriteGate>>,
    config: Config,
}

type WriteGate = Arc<tokio::sync::Mutex<Option<u64>>>;

impl std::fmt::Debug for RoutingCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingCoordinator")
            .field("ranker", &self.ranker)
            .field("sticky", &self.sticky)
            .field("health", &self.health)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

impl Default for RoutingCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingCoordinator {
    /// Coordinator with default configuration and no store
    pub fn new() -> Self {
        RoutingCoordinatorBuilder::new().build()
    }

    pub fn builder() -> RoutingCoordinatorBuilder {
        RoutingCoordinatorBuilder::new()
    }

    pub fn bus(&self) -> &ObservabilityBus {
        &self.bus
    }

    pub fn health(&self) -> &ProviderHealthRegistry {
        &self.health
    }

    pub fn sticky(&self) -> &StickyRouter {
        &self.sticky
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current bandit arms keyed by `context:backendId`
    pub async fn bandit_snapshot(&self) -> BTreeMap<String, ArmSnapshot> {
        self.bandit.read().await.snapshot()
    }

    /// Route one request
    ///
    /// Fails with [`Error::NoProviders`] for an empty backend list,
    /// [`Error::AllProvidersDisabled`] when health filtering leaves nothing,
    /// and [`Error::Pipeline`] when every attempt failed.
    pub async fn route(&self, request: RouteRequest) -> Result<RouteOutcome> {
        let RouteRequest {
            backends,
            request,
            intent,
            context,
            debug: want_debug,
        } = request;

        if backends.is_empty() {
            warn!("Route rejected: no backends supplied");
            return Err(Error::NoProviders);
        }

        let available: Vec<BackendDescriptor> = backends
            .into_iter()
            .filter(|backend| !self.health.is_disabled(&backend.id))
            .collect();
        if available.is_empty() {
            warn!("Route rejected: every backend is disabled");
            return Err(Error::AllProvidersDisabled);
        }

        let provided_request_id = string_field(&request, "requestId");
        let user_id = string_field(&request, "userId");
        let request_id = provided_request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let sticky_key = StickyRouter::derive_key(
            user_id.as_deref(),
            intent.as_deref(),
            provided_request_id.as_deref(),
        );
        let context = self.context_for(context.as_deref());

        let (order, pinned, scores) = match self.sticky.resolve_pin(&available, &sticky_key) {
            Some(order) => {
                let pinned = order.first().map(|b| b.id.clone());
                (order, pinned, Vec::new())
            }
            None => {
                let ranked = self
                    .with_bandit(|bandit| self.ranker.rank(bandit, &available, &context))
                    .await;
                let scores: Vec<BackendScore> = ranked.iter().map(BackendScore::from).collect();
                (ranked.into_iter().map(|r| r.backend).collect::<Vec<_>>(), None, scores)
            }
        };

        debug!(
            request_id = %request_id,
            sticky_key = %sticky_key,
            context = %context,
            pinned = ?pinned,
            candidates = order.len(),
            "Routing request"
        );

        let report = self
            .fallback
            .execute_detailed(&order, &request, &request_id, self.config.routing.max_attempts)
            .await;

        self.absorb_failures(&report.failures, &sticky_key, pinned.as_deref(), &context)
            .await;

        let outcome = match report.outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(request_id = %request_id, code = %err.code, "Route failed");
                return Err(Error::Pipeline(err));
            }
        };

        let Some(used) = order.iter().find(|b| b.id == outcome.backend_used) else {
            return Err(Error::Pipeline(CanonicalError::new(
                ErrorCode::InternalError,
                format!("Backend {} is not in the attempt order", outcome.backend_used),
            )));
        };

        let shaped = self.shaper.shape(&RewardInput {
            backend: used,
            output: &outcome.output,
            attempt: outcome.attempt,
            latency_ms: outcome.latency_ms,
        });
        let state = self
            .with_bandit(|bandit| {
                bandit.ensure(&used.id, &context, Some(used.class.prior()));
                bandit.record_reward(&used.id, &context, shaped.reward, Some(shaped.components))
            })
            .await;
        self.write_through(&used.id, &context, state);
        self.sticky.record_success(&sticky_key, &used.id);

        info!(
            request_id = %request_id,
            backend_id = %used.id,
            attempt = outcome.attempt,
            reward = shaped.reward,
            sticky = pinned.is_some(),
            "Routed request"
        );

        let debug = want_debug.then(|| RouteDebug {
            sticky_key,
            context,
            pinned: pinned.clone(),
            order: order.iter().map(|b| b.id.clone()).collect(),
            scores,
            failures: report.failures,
            reward: shaped.reward,
        });

        Ok(RouteOutcome {
            backend_used: outcome.backend_used,
            output: outcome.output,
            request_id,
            attempt: outcome.attempt,
            latency_ms: outcome.latency_ms,
            sticky: pinned.is_some(),
            debug,
        })
    }

    /// Replace bandit state with everything in the store
    ///
    /// Returns the number of arms loaded; 0 without a store.
    pub async fn hydrate_from_store(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let states = store.load_all().await?;
        let count = states.len();
        self.flush().await;
        self.lock_gates().clear();
        self.with_bandit(|bandit| bandit.hydrate(states)).await;
        Ok(count)
    }

    /// Wait for every pending write-through save
    pub async fn flush(&self) {
        let pending: Vec<JoinHandle<()>> = {
            let mut writes = self.pending_writes.lock().unwrap_or_else(|e| e.into_inner());
            writes.drain(..).collect()
        };
        for handle in pending {
            if let Err(e) = handle.await {
                warn!(error = %e, "Bandit write-through task failed");
            }
        }
    }

    /// Save every bandit arm to the store
    ///
    /// Pending write-through saves finish first, so the store ends up with
    /// the current state. Returns the number of arms saved; 0 without a store.
    pub async fn persist(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        self.flush().await;
        let states: Vec<(String, BanditArmState)> =
            self.bandit.read().await.export().into_iter().collect();
        if !states.is_empty() {
            store.save_all(&states).await?;
            info!(count = states.len(), "Saved bandit state to store");
        }
        Ok(states.len())
    }

    fn context_for(&self, context: Option<&str>) -> String {
        match context.map(str::trim) {
            Some(context) if !context.is_empty() => context.replace(':', "_"),
            _ => self.config.routing.default_context.clone(),
        }
    }

    async fn absorb_failures(
        &self,
        failures: &[AttemptFailure],
        sticky_key: &str,
        pinned: Option<&str>,
        context: &str,
    ) {
        let health = &self.config.health;
        for failure in failures {
            if health.auto_disable && health.auto_disable_codes.contains(&failure.code) {
                self.health
                    .disable(&failure.backend_id, failure.code.as_str(), health.cooldown());
            }

            if pinned == Some(failure.backend_id.as_str()) {
                self.sticky.record_failure(sticky_key, &failure.backend_id);
            }

            if self.config.routing.record_failures {
                let state = self
                    .with_bandit(|bandit| {
                        bandit.record_reward(
                            &failure.backend_id,
                            context,
                            0.0,
                            Some(json!({ "success": 0.0, "errorCode": failure.code })),
                        )
                    })
                    .await;
                self.write_through(&failure.backend_id, context, state);
            }
        }
    }

    /// Run `f` under the bandit write lock, then publish its events unlocked
    async fn with_bandit<T>(&self, f: impl FnOnce(&mut BanditEngine) -> T) -> T {
        let (result, events) = {
            let mut bandit = self.bandit.write().await;
            let result = f(&mut *bandit);
            (result, bandit.take_events())
        };
        for event in events {
            self.bus.publish(event);
        }
        result
    }

    fn lock_gates(&self) -> std::sync::MutexGuard<'_, HashMap<ArmKey, WriteGate>> {
        self.write_gates.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Save an arm on a background task
    ///
    /// Saves of the same arm run one at a time, and a save whose state is
    /// older than the one already written is dropped.
    fn write_through(&self, backend_id: &str, context: &str, state: BanditArmState) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let gate = self
            .lock_gates()
            .entry(ArmKey::new(context, backend_id))
            .or_default()
            .clone();
        let backend_id = backend_id.to_string();
        let context = context.to_string();
        let handle = tokio::spawn(async move {
            let mut written = gate.lock().await;
            if written.is_some_and(|trials| trials >= state.trials) {
                debug!(
                    backend_id = %backend_id,
                    context = %context,
                    trials = state.trials,
                    "Skipped stale bandit write"
                );
                return;
            }
            match store.save(&backend_id, &context, &state).await {
                Ok(()) => *written = Some(state.trials),
                Err(e) => warn!(
                    backend_id = %backend_id,
                    context = %context,
                    error = %e,
                    "Failed to persist bandit arm"
                ),
            }
        });

        let mut writes = self.pending_writes.lock().unwrap_or_else(|e| e.into_inner());
        writes.retain(|h| !h.is_finished());
        writes.push(handle);
    }
}

fn string_field(value: &serde_json::Value, field: &str) -> Option<String> {
    match value.get(field)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Builder for [`RoutingCoordinator`]
pub struct RoutingCoordinatorBuilder {
    config: Config,
    seed: Option<u64>,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn BanditStore>>,
    shaper: Option<Arc<dyn RewardShaper>>,
    bus: Option<ObservabilityBus>,
}

impl Default for RoutingCoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingCoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
            seed: None,
            clock: None,
            store: None,
            shaper: None,
            bus: None,
        }
    }

    /// Set configuration
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set routing preference
    pub fn preference(mut self, preference: RoutingPreference) -> Self {
        self.config.routing.preference = preference;
        self
    }

    /// Seed the bandit's random source for reproducible rankings
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Clock shared by the health registry and sticky router
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Persist bandit arms to this store
    pub fn store(mut self, store: Arc<dyn BanditStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace the default latency-based reward shaper
    pub fn shaper(mut self, shaper: Arc<dyn RewardShaper>) -> Self {
        self.shaper = Some(shaper);
        self
    }

    /// Publish events on an existing bus
    pub fn bus(mut self, bus: ObservabilityBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Build the coordinator
    pub fn build(self) -> RoutingCoordinator {
        let config = self.config;
        let bus = self.bus.unwrap_or_default();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let routing = &config.routing;

        let mut bandit = BanditEngine::new(bus.clone())
            .with_reward_ceiling(routing.reward_ceiling)
            .with_deferred_events();
        if let Some(seed) = self.seed {
            bandit = bandit.with_seed(seed);
        }

        let ranker = Ranker::new(routing.preference)
            .with_cost_reference(routing.cost_reference)
            .with_latency_reference_ms(routing.latency_reference_ms);
        let sticky = StickyRouter::new()
            .with_ttl(config.sticky.ttl())
            .with_clock(clock.clone());
        let health = ProviderHealthRegistry::new(bus.clone())
            .with_clock(clock)
            .with_default_cooldown(config.health.cooldown());
        let shaper = self
            .shaper
            .unwrap_or_else(|| Arc::new(LatencyRewardShaper::new(routing.reward_ceiling)));

        RoutingCoordinator {
            fallback: FallbackOrchestrator::new(bus.clone()),
            bus,
            bandit: Arc::new(RwLock::new(bandit)),
            ranker,
            sticky: Arc::new(sticky),
            health: Arc::new(health),
            shaper,
            store: self.store,
            pending_writes: Mutex::new(Vec::new()),
            write_gates: Mutex::new(HashMap::new()),
            config,
        }
    }
}
