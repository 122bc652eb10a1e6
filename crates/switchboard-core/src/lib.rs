//! Switchboard Core Library
//!
//! This crate provides adaptive multi-backend request routing, including:
//! - Thompson Sampling bandit over per-backend Beta posteriors
//! - Ranking with cost and latency hints
//! - Sticky session affinity with success-scaled TTLs
//! - Ordered fallback with canonical error classification
//! - Backend health with lazily expiring cooldowns
//! - Bandit persistence (memory, key-value, SQLite)
//! - An observability bus for routing telemetry

pub mod classify;
pub mod clock;
pub mod config;
pub mod error;
pub mod observability;
pub mod routing;

pub use error::{CanonicalError, Error, ErrorCode, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::classify::BackendError;
    pub use crate::config::Config;
    pub use crate::error::{CanonicalError, Error, ErrorCode, Result};
    pub use crate::observability::{Event, ObservabilityBus};
    pub use crate::routing::{
        BackendDescriptor, ProviderClass, RouteOutcome, RouteRequest, RoutingCoordinator,
        RoutingPreference,
    };
}
