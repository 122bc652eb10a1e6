//! Error types for Switchboard
//!
//! Backend failures are normalized into a small set of canonical codes
//! ([`ErrorCode`]) before they are logged or used for routing decisions.
//! Routing-level rejections (no backends, all disabled) and infrastructure
//! failures (store, config) live alongside them in [`Error`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using Switchboard's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Canonical backend-facing failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The backend ran but did not produce a usable result
    ModelFailed,
    /// The backend call timed out
    Timeout,
    /// Quota or rate limit exhausted on the backend side
    QuotaExceeded,
    /// Explicitly rate limited
    RateLimited,
    /// The request was rejected as malformed
    InvalidRequest,
    /// The backend is down or unreachable
    ProviderUnavailable,
    /// Anything that could not be classified
    InternalError,
}

impl ErrorCode {
    /// Every canonical code, in declaration order
    pub const ALL: [ErrorCode; 7] = [
        Self::ModelFailed,
        Self::Timeout,
        Self::QuotaExceeded,
        Self::RateLimited,
        Self::InvalidRequest,
        Self::ProviderUnavailable,
        Self::InternalError,
    ];

    /// Wire name of the code (e.g. `QUOTA_EXCEEDED`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelFailed => "MODEL_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::RateLimited => "RATE_LIMITED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_uppercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|code| code.as_str() == normalized)
            .ok_or_else(|| format!("Unknown error code: {}", s))
    }
}

/// A backend failure expressed in canonical form
///
/// `meta` is free-form diagnostic context. Callers must not branch on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct CanonicalError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}

impl CanonicalError {
    /// Create a canonical error with empty metadata
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            meta: serde_json::Value::Null,
        }
    }

    /// Attach diagnostic metadata
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = meta;
        self
    }
}

/// Switchboard error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Routing errors
    #[error("No backends supplied for routing. Pass at least one backend to route().")]
    NoProviders,

    #[error("All backends are currently disabled. Wait for a cooldown to expire or enable one.")]
    AllProvidersDisabled,

    // Pipeline errors (canonical backend failures)
    #[error(transparent)]
    Pipeline(#[from] CanonicalError),

    // Store errors
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Key-value store error: {0}")]
    KeyValueError(#[from] redis::RedisError),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Config errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable error code string for this error
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoProviders => "NO_PROVIDERS",
            Self::AllProvidersDisabled => "ALL_PROVIDERS_DISABLED",
            Self::Pipeline(err) => err.code.as_str(),
            Self::DatabaseError(_) | Self::KeyValueError(_) | Self::StoreError(_) => "STORE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Canonical code if this error originated from a backend
    pub fn canonical_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Pipeline(err) => Some(err.code),
            _ => None,
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::NoProviders => Some("Register backends before routing".to_string()),
            Self::AllProvidersDisabled => {
                Some("Check `provider.health.disabled` events for the cause".to_string())
            }
            Self::DatabaseError(_) => Some("switchboard config get store.sqlite_path".to_string()),
            Self::KeyValueError(_) => Some("switchboard config get store.redis_url".to_string()),
            Self::ConfigError(_) => Some("switchboard config list".to_string()),
            _ => None,
        }
    }
}
