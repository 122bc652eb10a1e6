//! Adaptive backend routing
//!
//! Learns which backend answers best and degrades gracefully when backends
//! fail. The key components are:
//!
//! - **Bandit engine**: Thompson Sampling over Beta posteriors, one arm per
//!   (context, backend). Rewards are normalized by a fixed ceiling.
//!
//! - **Ranker**: one posterior sample per backend, blended with static cost and
//!   latency hints into a full attempt order.
//!
//! - **Sticky router**: pins a session to the backend that last served it,
//!   with a TTL that grows with the backend's recent success rate.
//!
//! - **Fallback orchestrator**: tries backends one at a time in order until one
//!   succeeds or the attempt budget runs out.
//!
//! - **Health registry**: takes failing backends out of rotation for a
//!   cooldown that expires lazily.
//!
//! - **Bandit stores**: memory, key-value and SQLite persistence for arms.
//!
//! ## How It Works
//!
//! 1. Disabled backends are filtered out
//! 2. A live sticky pin moves its backend to the front; otherwise the ranker
//!    orders the backends by sampled score
//! 3. The fallback orchestrator walks the order
//! 4. The shaped reward of the backend that answered is recorded, written
//!    through to the store, and refreshes the sticky pin
//!
//! ## Example
//!
//! ```rust,ignore
//! use switchboard_core::routing::{BackendDescriptor, RouteRequest, RoutingCoordinator};
//! use serde_json::json;
//!
//! let router = RoutingCoordinator::builder().seed(42).build();
//! let openai = BackendDescriptor::new("openai")
//!     .with_cost(0.02)
//!     .with_fn(|args| async move { Ok(json!({ "echo": args })) });
//!
//! let outcome = router
//!     .route(RouteRequest::new(vec![openai], json!({ "userId": "u1" })))
//!     .await?;
//! println!("answered by {}", outcome.backend_used);
//! ```

mod bandit;
mod fallback;
mod health;
mod ranker;
mod reward;
mod router;
mod sampling;
mod sticky;
pub mod store;
mod types;

pub use bandit::{BanditEngine, DEFAULT_REWARD_CEILING};
pub use fallback::{
    AttemptFailure, DEFAULT_OP, EXHAUSTED_MESSAGE, FallbackOrchestrator, FallbackOutcome,
    FallbackReport,
};
pub use health::{COOLDOWN_EXPIRED, DEFAULT_COOLDOWN, ProviderHealthRegistry, ProviderHealthState};
pub use ranker::{BackendScore, RankedBackend, Ranker, order_of};
pub use reward::{
    FIRST_ATTEMPT_BONUS, LatencyRewardShaper, RewardInput, RewardShaper, ShapedReward,
    relative_delta,
};
pub use router::{RouteDebug, RouteOutcome, RouteRequest, RoutingCoordinator, RoutingCoordinatorBuilder};
pub use sampling::{sample_beta, sample_gamma, standard_normal};
pub use sticky::{
    BackendRef, DEFAULT_STICKY_KEY, DEFAULT_TTL, EVICTION_INTERVAL, FAILURE_DECAY, SMOOTHING,
    StickyAffinityEntry, StickyRouter,
};
pub use store::{
    BanditStore, InMemoryKeyValue, KeyValueBanditStore, KeyValueClient, MemoryBanditStore,
    RedisClient, SqliteBanditStore, StoreSummary, open_store,
};
pub use types::{
    ArmKey, ArmSnapshot, Backend, BackendDescriptor, BanditArmState, DEFAULT_ALPHA, DEFAULT_BETA,
    DEFAULT_CONTEXT, FnBackend, PersistedArm, Priors, ProviderClass, RoutingPreference,
};
