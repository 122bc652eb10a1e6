//! Provider health registry
//!
//! Tracks which backends are in rotation. A disabled backend carries an
//! optional cooldown deadline; there is no background timer. The first
//! [`ProviderHealthRegistry::is_disabled`] call after the deadline re-enables
//! the backend with reason `cooldown_expired`.
//!
//! Unknown backends are healthy. Nothing here returns an error.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock, deadline_after};
use crate::observability::{Event, ObservabilityBus};

/// Reason recorded when a cooldown lapses
pub const COOLDOWN_EXPIRED: &str = "cooldown_expired";

/// Default cooldown applied by callers that do not choose one
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// Health of one backend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealthState {
    pub enabled: bool,
    /// Set while a cooldown is pending; `None` on a manual indefinite disable
    pub disabled_until: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub last_change: DateTime<Utc>,
}

impl ProviderHealthState {
    fn healthy(now: DateTime<Utc>) -> Self {
        Self {
            enabled: true,
            disabled_until: None,
            reason: None,
            last_change: now,
        }
    }
}

/// Per-backend enable/disable state with lazy cooldown expiry
pub struct ProviderHealthRegistry {
    states: Mutex<HashMap<String, ProviderHealthState>>,
    clock: Arc<dyn Clock>,
    bus: ObservabilityBus,
    default_cooldown: Duration,
}

impl std::fmt::Debug for ProviderHealthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHealthRegistry")
            .field("tracked", &self.lock().len())
            .field("default_cooldown", &self.default_cooldown)
            .finish()
    }
}

impl ProviderHealthRegistry {
    /// Registry on the system clock
    pub fn new(bus: ObservabilityBus) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            clock: Arc::new(SystemClock),
            bus,
            default_cooldown: DEFAULT_COOLDOWN,
        }
    }

    /// Use a different clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the cooldown returned by [`default_cooldown`](Self::default_cooldown)
    pub fn with_default_cooldown(mut self, cooldown: Duration) -> Self {
        self.default_cooldown = cooldown;
        self
    }

    pub fn default_cooldown(&self) -> Duration {
        self.default_cooldown
    }

    /// Take a backend out of rotation until `cooldown` elapses
    pub fn disable(&self, backend_id: &str, reason: &str, cooldown: Duration) {
        self.set_disabled(backend_id, reason, Some(cooldown));
    }

    /// Take a backend out of rotation until it is explicitly enabled
    pub fn disable_indefinitely(&self, backend_id: &str, reason: &str) {
        self.set_disabled(backend_id, reason, None);
    }

    fn set_disabled(&self, backend_id: &str, reason: &str, cooldown: Option<Duration>) {
        let now = self.clock.now();
        {
            let mut states = self.lock();
            states.insert(
                backend_id.to_string(),
                ProviderHealthState {
                    enabled: false,
                    disabled_until: cooldown.map(|c| deadline_after(now, c)),
                    reason: Some(reason.to_string()),
                    last_change: now,
                },
            );
        }

        let cooldown_ms = cooldown.map(|c| u64::try_from(c.as_millis()).unwrap_or(u64::MAX));
        warn!(backend_id = %backend_id, reason = %reason, cooldown_ms, "Backend disabled");
        self.bus.publish(Event::HealthDisabled {
            backend_id: backend_id.to_string(),
            reason: reason.to_string(),
            cooldown_ms,
        });
    }

    /// Put a backend back into rotation
    pub fn enable(&self, backend_id: &str, reason: &str) {
        let now = self.clock.now();
        self.lock().insert(backend_id.to_string(), enabled_state(reason, now));
        self.publish_enabled(backend_id, reason);
    }

    /// Whether the backend is currently out of rotation
    ///
    /// A lapsed cooldown re-enables the backend as a side effect.
    pub fn is_disabled(&self, backend_id: &str) -> bool {
        let now = self.clock.now();
        {
            let mut states = self.lock();
            let Some(state) = states.get_mut(backend_id) else {
                return false;
            };
            if state.enabled {
                return false;
            }
            match state.disabled_until {
                Some(deadline) if now >= deadline => {
                    *state = enabled_state(COOLDOWN_EXPIRED, now);
                }
                _ => return true,
            }
        }

        self.publish_enabled(backend_id, COOLDOWN_EXPIRED);
        false
    }

    /// Copy of one backend's state; unknown backends read as healthy
    pub fn snapshot(&self, backend_id: &str) -> ProviderHealthState {
        self.lock()
            .get(backend_id)
            .cloned()
            .unwrap_or_else(|| ProviderHealthState::healthy(self.clock.now()))
    }

    /// Copy of every tracked backend's state
    pub fn snapshot_all(&self) -> BTreeMap<String, ProviderHealthState> {
        self.lock()
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect()
    }

    /// Forget all tracked state
    pub fn reset(&self) {
        self.lock().clear();
    }

    fn publish_enabled(&self, backend_id: &str, reason: &str) {
        info!(backend_id = %backend_id, reason = %reason, "Backend enabled");
        self.bus.publish(Event::HealthEnabled {
            backend_id: backend_id.to_string(),
            reason: reason.to_string(),
        });
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ProviderHealthState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn enabled_state(reason: &str, now: DateTime<Utc>) -> ProviderHealthState {
    ProviderHealthState {
        enabled: true,
        disabled_until: None,
        reason: Some(reason.to_string()),
        last_change: now,
    }
}
