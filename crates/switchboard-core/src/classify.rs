//! Backend failure classification
//!
//! Backends fail with a [`BackendError`], an opaque carrier that may hold an
//! HTTP-like status, an SDK error name, a free-form message, or an error that
//! is already canonical. [`classify`] is the single place where those are
//! mapped onto [`ErrorCode`]; both telemetry and the fallback exhaustion error
//! go through it.

use thiserror::Error;

use crate::error::{CanonicalError, ErrorCode};

/// Maximum length of a failure message carried in events and error metadata
pub const MAX_SAFE_MESSAGE_CHARS: usize = 500;

/// Raw code attached to a backend failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawCode {
    /// Numeric status (HTTP status or SDK status code)
    Status(u16),
    /// Symbolic code or error name (e.g. `ETIMEDOUT`, `"429"`)
    Name(String),
}

impl RawCode {
    fn is_status(&self, status: u16) -> bool {
        match self {
            Self::Status(s) => *s == status,
            Self::Name(name) => name.trim().parse::<u16>().ok() == Some(status),
        }
    }

    fn is_name(&self, expected: &str) -> bool {
        matches!(self, Self::Name(name) if name.eq_ignore_ascii_case(expected))
    }
}

impl std::fmt::Display for RawCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status(s) => write!(f, "{}", s),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// Failure returned by a backend call
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// Already normalized; classification returns its code unchanged
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
    /// Raw failure as reported by the backend
    #[error("{message}")]
    Raw {
        code: Option<RawCode>,
        message: String,
    },
}

impl BackendError {
    /// Failure with a numeric status
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Raw {
            code: Some(RawCode::Status(status)),
            message: message.into(),
        }
    }

    /// Failure with a symbolic code or error name
    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Raw {
            code: Some(RawCode::Name(name.into())),
            message: message.into(),
        }
    }

    /// Failure with only a message
    pub fn message(message: impl Into<String>) -> Self {
        Self::Raw {
            code: None,
            message: message.into(),
        }
    }

    /// Canonical failure
    pub fn canonical(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Canonical(CanonicalError::new(code, message))
    }

    /// Raw code, if any
    pub fn raw_code(&self) -> Option<&RawCode> {
        match self {
            Self::Raw { code, .. } => code.as_ref(),
            Self::Canonical(_) => None,
        }
    }

    fn text(&self) -> &str {
        match self {
            Self::Canonical(err) => &err.message,
            Self::Raw { message, .. } => message,
        }
    }
}

impl From<String> for BackendError {
    fn from(message: String) -> Self {
        Self::message(message)
    }
}

impl From<&str> for BackendError {
    fn from(message: &str) -> Self {
        Self::message(message)
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        let name = match err.kind() {
            std::io::ErrorKind::TimedOut => "ETIMEDOUT".to_string(),
            kind => format!("{:?}", kind),
        };
        Self::named(name, err.to_string())
    }
}

/// Map a backend failure onto a canonical code
///
/// Rules are evaluated in order and the first match wins. Returns `None` only
/// when no failure is supplied; callers pick their own default in that case.
pub fn classify(err: Option<&BackendError>) -> Option<ErrorCode> {
    let err = err?;

    let (code, message) = match err {
        BackendError::Canonical(canonical) => return Some(canonical.code),
        BackendError::Raw { code, message } => (code.as_ref(), message.to_lowercase()),
    };

    let code_is = |pred: fn(&RawCode) -> bool| code.is_some_and(pred);
    let mentions = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

    if code_is(|c| c.is_name("ETIMEDOUT") || c.is_name("TIMEOUT")) || mentions(&["timeout"]) {
        return Some(ErrorCode::Timeout);
    }

    if code_is(|c| c.is_status(429)) || mentions(&["quota", "rate limit", "too many requests"]) {
        return Some(ErrorCode::QuotaExceeded);
    }

    if code_is(|c| c.is_status(400)) || mentions(&["invalid", "bad request"]) {
        return Some(ErrorCode::InvalidRequest);
    }

    if code_is(|c| c.is_status(503)) || mentions(&["unavailable", "service down"]) {
        return Some(ErrorCode::ProviderUnavailable);
    }

    if mentions(&["failed", "error"]) {
        return Some(ErrorCode::ModelFailed);
    }

    Some(ErrorCode::InternalError)
}

/// Failure message safe to put into telemetry, truncated on a char boundary
pub fn safe_message(err: &BackendError) -> String {
    truncate_chars(err.text(), MAX_SAFE_MESSAGE_CHARS)
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_classifies_to_none() {
        assert_eq!(classify(None), None);
    }

    #[test]
    fn test_canonical_is_returned_as_is() {
        // Message would otherwise match the timeout rule
        let err = BackendError::canonical(ErrorCode::InvalidRequest, "timeout while validating");
        assert_eq!(classify(Some(&err)), Some(ErrorCode::InvalidRequest));
    }

    #[test]
    fn test_status_429_is_quota() {
        let err = BackendError::status(429, "slow down");
        assert_eq!(classify(Some(&err)), Some(ErrorCode::QuotaExceeded));

        let textual = BackendError::named("429", "");
        assert_eq!(classify(Some(&textual)), Some(ErrorCode::QuotaExceeded));
    }

    #[test]
    fn test_timeout_message() {
        let err = BackendError::message("Request timeout exceeded");
        assert_eq!(classify(Some(&err)), Some(ErrorCode::Timeout));

        let named = BackendError::named("ETIMEDOUT", "socket hang up");
        assert_eq!(classify(Some(&named)), Some(ErrorCode::Timeout));
    }

    #[test]
    fn test_rules_apply_in_order() {
        // Timeout wins over the 503 status
        let err = BackendError::status(503, "upstream timeout");
        assert_eq!(classify(Some(&err)), Some(ErrorCode::Timeout));

        // Quota wins over the generic "error" wording
        let err = BackendError::message("Error: too many requests");
        assert_eq!(classify(Some(&err)), Some(ErrorCode::QuotaExceeded));
    }

    #[test]
    fn test_remaining_rules() {
        let cases = [
            (BackendError::status(400, ""), ErrorCode::InvalidRequest),
            (BackendError::message("Invalid API payload"), ErrorCode::InvalidRequest),
            (BackendError::status(503, ""), ErrorCode::ProviderUnavailable),
            (BackendError::message("service down for maintenance"), ErrorCode::ProviderUnavailable),
            (BackendError::message("generation failed"), ErrorCode::ModelFailed),
            (BackendError::status(500, "kaboom"), ErrorCode::InternalError),
        ];
        for (err, expected) in cases {
            assert_eq!(classify(Some(&err)), Some(expected), "{:?}", err);
        }
    }

    #[test]
    fn test_unrecognized_string_is_internal() {
        let err: BackendError = "something odd happened".into();
        assert_eq!(classify(Some(&err)), Some(ErrorCode::InternalError));
    }

    #[test]
    fn test_io_timeout_maps_to_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline");
        let err = BackendError::from(io);
        assert_eq!(err.raw_code(), Some(&RawCode::Name("ETIMEDOUT".to_string())));
        assert_eq!(classify(Some(&err)), Some(ErrorCode::Timeout));
    }

    #[test]
    fn test_safe_message_truncates() {
        let long = "é".repeat(MAX_SAFE_MESSAGE_CHARS + 20);
        let msg = safe_message(&BackendError::message(long));
        assert_eq!(msg.chars().count(), MAX_SAFE_MESSAGE_CHARS);

        let short = safe_message(&BackendError::message("short"));
        assert_eq!(short, "short");
    }
}
