//! Session affinity
//!
//! A sticky key (user, else intent, else request id) is pinned to the backend
//! that last served it successfully. The pin lives for a TTL that scales with
//! an exponentially decayed success rate:
//!
//! ```text
//! rate' = rate * (1 - 0.2) + 0.2          (first success seeds 1.0)
//! ttl   = base * clamp(0.5 + rate', 0.5, 2.0)
//! ```
//!
//! Resolution only reorders backends that are already available. It never
//! adds one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use super::types::BackendDescriptor;
use crate::clock::{Clock, SystemClock, deadline_after};

/// EWMA smoothing factor for the success rate
pub const SMOOTHING: f64 = 0.2;

/// Multiplier applied to the rate when a pinned backend fails
pub const FAILURE_DECAY: f64 = 0.8;

/// Key used when no user, intent or request id is known
pub const DEFAULT_STICKY_KEY: &str = "default";

/// Default base affinity duration
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Every this many recorded successes, expired entries are swept
pub const EVICTION_INTERVAL: u64 = 64;

/// Something that names a backend
pub trait BackendRef {
    fn backend_id(&self) -> &str;
}

impl BackendRef for BackendDescriptor {
    fn backend_id(&self) -> &str {
        &self.id
    }
}

impl BackendRef for String {
    fn backend_id(&self) -> &str {
        self
    }
}

impl BackendRef for str {
    fn backend_id(&self) -> &str {
        self
    }
}

impl<T: BackendRef + ?Sized> BackendRef for &T {
    fn backend_id(&self) -> &str {
        (**self).backend_id()
    }
}

/// Affinity of one sticky key
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StickyAffinityEntry {
    pub backend_id: String,
    pub decayed_success_rate: f64,
    pub expires_at: DateTime<Utc>,
}

/// Session-affinity override for ranked backend orders
pub struct StickyRouter {
    entries: Mutex<HashMap<String, StickyAffinityEntry>>,
    base_ttl: Duration,
    clock: Arc<dyn Clock>,
    successes: AtomicU64,
}

impl std::fmt::Debug for StickyRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StickyRouter")
            .field("entries", &self.lock().len())
            .field("base_ttl", &self.base_ttl)
            .finish()
    }
}

impl Default for StickyRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl StickyRouter {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            base_ttl: DEFAULT_TTL,
            clock: Arc::new(SystemClock),
            successes: AtomicU64::new(0),
        }
    }

    /// Set the base affinity duration (at least one millisecond)
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.base_ttl = ttl.max(Duration::from_millis(1));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn base_ttl(&self) -> Duration {
        self.base_ttl
    }

    /// Derive the sticky key: user, else intent, else request id
    ///
    /// Empty strings count as absent. The key is lowercased.
    pub fn derive_key(
        user_id: Option<&str>,
        intent: Option<&str>,
        request_id: Option<&str>,
    ) -> String {
        [user_id, intent, request_id]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
            .unwrap_or(DEFAULT_STICKY_KEY)
            .to_lowercase()
    }

    /// Move the pinned backend to the front, or return the input unchanged
    pub fn resolve<B: BackendRef + Clone>(&self, ordered: &[B], sticky_key: &str) -> Vec<B> {
        self.resolve_pin(ordered, sticky_key)
            .unwrap_or_else(|| ordered.to_vec())
    }

    /// Like [`resolve`](Self::resolve), but `None` when no pin applies
    ///
    /// No pin applies when the key has no live entry or when the pinned
    /// backend is not among `ordered`. Expired entries are evicted.
    pub fn resolve_pin<B: BackendRef + Clone>(
        &self,
        ordered: &[B],
        sticky_key: &str,
    ) -> Option<Vec<B>> {
        let pinned = self.live_entry(sticky_key)?.backend_id;
        let position = ordered.iter().position(|b| b.backend_id() == pinned)?;

        let mut result = Vec::with_capacity(ordered.len());
        result.push(ordered[position].clone());
        result.extend(
            ordered
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != position)
                .map(|(_, b)| b.clone()),
        );

        debug!(sticky_key = %sticky_key, backend_id = %pinned, "Applied sticky pin");
        Some(result)
    }

    /// Record a success and refresh the pin
    ///
    /// Every [`EVICTION_INTERVAL`] calls also drop all expired entries, so
    /// keys that are never read again do not accumulate.
    pub fn record_success(&self, sticky_key: &str, backend_id: &str) -> StickyAffinityEntry {
        let now = self.clock.now();
        let mut entries = self.lock();

        let count = self.successes.fetch_add(1, Ordering::Relaxed) + 1;
        if count % EVICTION_INTERVAL == 0 {
            let before = entries.len();
            entries.retain(|_, entry| entry.expires_at >= now);
            let evicted = before - entries.len();
            if evicted > 0 {
                debug!(evicted, remaining = entries.len(), "Swept expired sticky affinities");
            }
        }

        let rate = match entries.get(sticky_key) {
            Some(entry) if entry.backend_id == backend_id && entry.expires_at >= now => {
                entry.decayed_success_rate * (1.0 - SMOOTHING) + SMOOTHING
            }
            _ => 1.0,
        };

        let entry = StickyAffinityEntry {
            backend_id: backend_id.to_string(),
            decayed_success_rate: rate,
            expires_at: deadline_after(now, self.ttl_for(rate)),
        };
        entries.insert(sticky_key.to_string(), entry.clone());

        debug!(
            sticky_key = %sticky_key,
            backend_id = %backend_id,
            rate,
            expires_at = %entry.expires_at,
            "Updated sticky affinity"
        );
        entry
    }

    /// Decay the pin after its backend failed
    ///
    /// Only applies when `backend_id` is the pinned backend. The expiry can
    /// only move earlier.
    pub fn record_failure(&self, sticky_key: &str, backend_id: &str) {
        let now = self.clock.now();
        let mut entries = self.lock();
        let ttl = match entries.get_mut(sticky_key) {
            Some(entry) if entry.backend_id == backend_id => {
                entry.decayed_success_rate *= FAILURE_DECAY;
                self.ttl_for(entry.decayed_success_rate)
            }
            _ => return,
        };

        if let Some(entry) = entries.get_mut(sticky_key) {
            entry.expires_at = entry.expires_at.min(deadline_after(now, ttl));
            debug!(
                sticky_key = %sticky_key,
                backend_id = %backend_id,
                rate = entry.decayed_success_rate,
                "Decayed sticky affinity"
            );
        }
    }

    /// Live entry for a key, if any
    pub fn entry(&self, sticky_key: &str) -> Option<StickyAffinityEntry> {
        let now = self.clock.now();
        self.lock()
            .get(sticky_key)
            .filter(|entry| entry.expires_at >= now)
            .cloned()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at >= now);
        before - entries.len()
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn live_entry(&self, sticky_key: &str) -> Option<StickyAffinityEntry> {
        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries.get(sticky_key)?;
        if entry.expires_at < now {
            entries.remove(sticky_key);
            debug!(sticky_key = %sticky_key, "Evicted expired sticky affinity");
            return None;
        }
        Some(entry.clone())
    }

    fn ttl_for(&self, rate: f64) -> Duration {
        let factor = (0.5 + rate).clamp(0.5, 2.0);
        Duration::try_from_secs_f64(self.base_ttl.as_secs_f64() * factor).unwrap_or(Duration::MAX)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StickyAffinityEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
