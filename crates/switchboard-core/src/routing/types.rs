//! Types for adaptive backend routing
//!
//! This module defines the data the router learns and acts on: bandit arm
//! state and priors, backend descriptors with their static hints, and the
//! ranking preference.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::classify::BackendError;

/// Context used when a caller does not partition arms
pub const DEFAULT_CONTEXT: &str = "default";

/// Default Beta prior shape parameters (uniform prior)
pub const DEFAULT_ALPHA: f64 = 1.0;
pub const DEFAULT_BETA: f64 = 1.0;

/// Identity of a bandit arm
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArmKey {
    pub context: String,
    pub backend_id: String,
}

impl ArmKey {
    pub fn new(context: impl Into<String>, backend_id: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            backend_id: backend_id.into(),
        }
    }

    /// Persistence key in `context:backendId` form
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.context, self.backend_id)
    }

    /// Parse a `context:backendId` key
    ///
    /// The context is everything before the first `:`, so backend ids may
    /// contain colons. A key without a separator belongs to the default
    /// context.
    pub fn parse(key: &str) -> Self {
        match key.split_once(':') {
            Some((context, backend_id)) if !context.is_empty() => Self::new(context, backend_id),
            _ => Self::new(DEFAULT_CONTEXT, key),
        }
    }
}

impl std::fmt::Display for ArmKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.context, self.backend_id)
    }
}

/// Beta prior shape parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Priors {
    pub alpha: f64,
    pub beta: f64,
}

impl Default for Priors {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            beta: DEFAULT_BETA,
        }
    }
}

impl Priors {
    pub fn new(alpha: f64, beta: f64) -> Self {
        Self { alpha, beta }
    }

    /// Replace non-finite or non-positive parameters with the defaults
    pub fn sanitize(self) -> Self {
        Self {
            alpha: valid_shape(self.alpha).unwrap_or(DEFAULT_ALPHA),
            beta: valid_shape(self.beta).unwrap_or(DEFAULT_BETA),
        }
    }
}

pub(crate) fn valid_shape(value: f64) -> Option<f64> {
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Coarse backend class used to pick an informed prior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderClass {
    /// Fast but expensive; optimistic prior
    FastPricey,
    /// Slow but cheap; neutral prior with more weight
    SlowCheap,
    /// Capable but flaky; pessimistic prior
    UnstablePowerful,
    /// No prior knowledge (uniform)
    #[default]
    Default,
}

impl ProviderClass {
    /// Prior used when an arm of this class is created
    pub fn prior(&self) -> Priors {
        match self {
            Self::FastPricey => Priors::new(3.0, 1.0),
            Self::SlowCheap => Priors::new(2.0, 2.0),
            Self::UnstablePowerful => Priors::new(1.5, 2.5),
            Self::Default => Priors::default(),
        }
    }
}

impl std::fmt::Display for ProviderClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FastPricey => write!(f, "fast_pricey"),
            Self::SlowCheap => write!(f, "slow_cheap"),
            Self::UnstablePowerful => write!(f, "unstable_powerful"),
            Self::Default => write!(f, "default"),
        }
    }
}

impl std::str::FromStr for ProviderClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fast_pricey" => Ok(Self::FastPricey),
            "slow_cheap" => Ok(Self::SlowCheap),
            "unstable_powerful" => Ok(Self::UnstablePowerful),
            "default" => Ok(Self::Default),
            _ => Err(format!("Unknown provider class: {}", s)),
        }
    }
}

/// Learned posterior for one (backend, context) arm
///
/// Serialized as `{trials, rewardSum, alpha, beta}`; missing fields take
/// their defaults when read back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BanditArmState {
    /// Number of recorded rewards
    pub trials: u64,
    /// Sum of raw (un-normalized) rewards
    pub reward_sum: f64,
    /// Beta distribution alpha parameter
    pub alpha: f64,
    /// Beta distribution beta parameter
    pub beta: f64,
}

impl Default for BanditArmState {
    fn default() -> Self {
        Self::with_priors(Priors::default())
    }
}

impl BanditArmState {
    /// Fresh arm with the given prior
    pub fn with_priors(priors: Priors) -> Self {
        let priors = priors.sanitize();
        Self {
            trials: 0,
            reward_sum: 0.0,
            alpha: priors.alpha,
            beta: priors.beta,
        }
    }

    /// Mean raw reward, 0 before the first trial
    pub fn avg_reward(&self) -> f64 {
        if self.trials == 0 {
            return 0.0;
        }
        self.reward_sum / self.trials as f64
    }

    /// Posterior mean of the Beta distribution
    pub fn expected_value(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }
}

/// Read-only view of an arm for inspection and export
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArmSnapshot {
    pub trials: u64,
    pub reward_sum: f64,
    pub alpha: f64,
    pub beta: f64,
    pub avg_reward: f64,
}

impl From<&BanditArmState> for ArmSnapshot {
    fn from(state: &BanditArmState) -> Self {
        Self {
            trials: state.trials,
            reward_sum: state.reward_sum,
            alpha: state.alpha,
            beta: state.beta,
            avg_reward: state.avg_reward(),
        }
    }
}

/// Possibly incomplete persisted arm, as accepted by hydration
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PersistedArm {
    pub trials: Option<u64>,
    pub reward_sum: Option<f64>,
    pub alpha: Option<f64>,
    pub beta: Option<f64>,
}

impl PersistedArm {
    /// Fill missing or invalid fields with defaults
    pub fn into_state(self) -> BanditArmState {
        BanditArmState {
            trials: self.trials.unwrap_or(0),
            reward_sum: self.reward_sum.filter(|v| v.is_finite()).unwrap_or(0.0),
            alpha: self.alpha.and_then(valid_shape).unwrap_or(DEFAULT_ALPHA),
            beta: self.beta.and_then(valid_shape).unwrap_or(DEFAULT_BETA),
        }
    }
}

impl From<BanditArmState> for PersistedArm {
    fn from(state: BanditArmState) -> Self {
        Self {
            trials: Some(state.trials),
            reward_sum: Some(state.reward_sum),
            alpha: Some(state.alpha),
            beta: Some(state.beta),
        }
    }
}

impl From<ArmSnapshot> for PersistedArm {
    fn from(snapshot: ArmSnapshot) -> Self {
        Self {
            trials: Some(snapshot.trials),
            reward_sum: Some(snapshot.reward_sum),
            alpha: Some(snapshot.alpha),
            beta: Some(snapshot.beta),
        }
    }
}

/// The unit of work a backend performs
#[async_trait]
pub trait Backend: Send + Sync {
    async fn run(&self, args: &serde_json::Value) -> Result<serde_json::Value, BackendError>;
}

/// Adapter turning an async closure into a [`Backend`]
pub struct FnBackend<F>(F);

#[async_trait]
impl<F, Fut> Backend for FnBackend<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, BackendError>> + Send,
{
    async fn run(&self, args: &serde_json::Value) -> Result<serde_json::Value, BackendError> {
        (self.0)(args.clone()).await
    }
}

/// A routable backend: identity, static hints and the call itself
///
/// A descriptor without a runner is still routable; every attempt on it fails
/// immediately.
#[derive(Clone)]
pub struct BackendDescriptor {
    /// Unique backend identifier
    pub id: String,
    /// Static preference weight (multiplies the Thompson sample)
    pub weight: f64,
    /// Expected cost per call, in caller-defined units
    pub cost: f64,
    /// Expected latency in milliseconds
    pub latency_ms: f64,
    /// Class used to pick the arm prior
    pub class: ProviderClass,
    runner: Option<Arc<dyn Backend>>,
}

impl std::fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("id", &self.id)
            .field("weight", &self.weight)
            .field("cost", &self.cost)
            .field("latency_ms", &self.latency_ms)
            .field("class", &self.class)
            .field("runnable", &self.runner.is_some())
            .finish()
    }
}

impl BackendDescriptor {
    /// Create a descriptor with neutral hints and no runner
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            weight: 1.0,
            cost: 0.0,
            latency_ms: 0.0,
            class: ProviderClass::Default,
            runner: None,
        }
    }

    /// Set static weight
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Set expected cost
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Set expected latency
    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Set provider class
    pub fn with_class(mut self, class: ProviderClass) -> Self {
        self.class = class;
        self
    }

    /// Attach the backend call
    pub fn with_runner(mut self, runner: Arc<dyn Backend>) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Attach an async closure as the backend call
    pub fn with_fn<F, Fut>(self, f: F) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, BackendError>> + Send + 'static,
    {
        self.with_runner(Arc::new(FnBackend(f)))
    }

    /// The backend call, if one is attached
    pub fn runner(&self) -> Option<&Arc<dyn Backend>> {
        self.runner.as_ref()
    }
}

/// How static backend hints influence ranking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingPreference {
    /// Mild discount for expensive and slow backends
    #[default]
    Balanced,
    /// Prioritize low latency
    Fast,
    /// Rank on learned reward and weight only
    Quality,
    /// Prioritize low cost
    Cost,
}

impl std::str::FromStr for RoutingPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "balanced" => Ok(Self::Balanced),
            "fast" => Ok(Self::Fast),
            "quality" => Ok(Self::Quality),
            "cost" => Ok(Self::Cost),
            _ => Err(format!("Unknown routing preference: {}", s)),
        }
    }
}

impl std::fmt::Display for RoutingPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Balanced => write!(f, "balanced"),
            Self::Fast => write!(f, "fast"),
            Self::Quality => write!(f, "quality"),
            Self::Cost => write!(f, "cost"),
        }
    }
}
