//! Shared error taxonomy for provider-facing API calls.
//!
//! All remote calls (STT providers, document generators) funnel their
//! failures into [`ApiError`] so the retry decorator and circuit breaker can
//! classify them uniformly.

use std::time::Duration;

/// Errors raised by remote API calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// 401/403 from a provider, or a missing key discovered at call time.
    /// Never retried.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// 429 from a provider. May carry a server-supplied retry hint.
    #[error("Rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    /// 5xx, network timeout, connection refused, or an open circuit.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Any other 4xx response.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A payload problem caught before or after the wire call (empty audio,
    /// malformed upload). Never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ApiError {
    /// Map an HTTP error status + response body to the right error kind.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        match status.as_u16() {
            401 | 403 => ApiError::Authentication(body),
            429 => ApiError::RateLimit {
                message: body,
                retry_after: None,
            },
            500..=599 => ApiError::ServiceUnavailable(format!("{}: {}", status, body)),
            code => ApiError::Api {
                status: code,
                message: body,
            },
        }
    }

    /// Whether the retry decorator may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ApiError::Authentication(_) | ApiError::InvalidInput(_)
        )
    }

    /// Server-supplied retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::ServiceUnavailable(format!("Request timed out: {}", err))
        } else {
            // Connection refused, DNS failure, broken transfer: all transient.
            ApiError::ServiceUnavailable(format!("Network error: {}", err))
        }
    }
}

/// Read a `Retry-After` header (seconds form) from a 429 response.
pub fn retry_after_from_headers(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ApiError::from_status(StatusCode::UNAUTHORIZED, "no".into()),
            ApiError::Authentication(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::TOO_MANY_REQUESTS, "slow down".into()),
            ApiError::RateLimit { .. }
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::BAD_GATEWAY, "oops".into()),
            ApiError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            ApiError::from_status(StatusCode::UNPROCESSABLE_ENTITY, "bad".into()),
            ApiError::Api { status: 422, .. }
        ));
    }

    #[test]
    fn test_retryability() {
        assert!(!ApiError::Authentication("x".into()).is_retryable());
        assert!(ApiError::ServiceUnavailable("x".into()).is_retryable());
        assert!(ApiError::RateLimit {
            message: "x".into(),
            retry_after: None
        }
        .is_retryable());
        assert!(ApiError::Api {
            status: 400,
            message: "x".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_retry_after_parsing() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "12".parse().unwrap());
        assert_eq!(
            retry_after_from_headers(&headers),
            Some(Duration::from_secs(12))
        );

        headers.insert(reqwest::header::RETRY_AFTER, "soon".parse().unwrap());
        assert_eq!(retry_after_from_headers(&headers), None);
    }
}
