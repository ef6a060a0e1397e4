use std::error::Error;
use std::time::Duration;

use thiserror::Error;

/// An error that happens while resolving the data of a request.
///
/// Errors are published to every consumer of a request through
/// [`RequestResult::Error`](super::RequestResult::Error) and therefore have to be cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The resource does not exist at the remote location.
    #[error("not found")]
    NotFound,
    /// The authorization carried by the reference is no longer valid.
    ///
    /// The reference is refreshed before the next attempt.
    #[error("authorization expired")]
    Expired,
    /// The remote location refused to hand out the resource.
    ///
    /// The attached string contains the remote location's response.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The resource could not be fetched in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be fetched due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    #[error("fetch failed: {0}")]
    FetchError(String),
    /// The remote location asked us to back off for the given duration.
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
    /// The resource was fetched, but is invalid in some way.
    #[error("malformed: {0}")]
    Malformed(String),
    /// No reference can be derived for the request.
    ///
    /// This is what chained requests report when their upstream data does not lead anywhere.
    #[error("unresolvable: {0}")]
    Unresolvable(String),
    /// The request was released while it was still being resolved.
    #[error("released")]
    Released,
    /// An unexpected error in the request machinery itself.
    #[error("internal error")]
    InternalError,
}

impl RequestError {
    /// Whether trying the same request again could lead to a different outcome.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::NotFound
                | Self::PermissionDenied(_)
                | Self::Malformed(_)
                | Self::Unresolvable(_)
                | Self::Released
        )
    }

    /// The minimum delay the remote asked for before trying again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(after) => Some(*after),
            _ => None,
        }
    }

    #[track_caller]
    pub fn from_std_error<E: Error + 'static>(e: E) -> Self {
        let dynerr: &dyn Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    fn fetch_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        Self::FetchError(error_string)
    }
}

impl From<std::io::Error> for RequestError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            return Self::Malformed(error.to_string());
        }
        Self::fetch_error(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(RequestError::Expired.is_retryable());
        assert!(RequestError::FetchError("503".into()).is_retryable());
        assert!(RequestError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(RequestError::InternalError.is_retryable());

        assert!(!RequestError::NotFound.is_retryable());
        assert!(!RequestError::PermissionDenied("nope".into()).is_retryable());
        assert!(!RequestError::Unresolvable("no export".into()).is_retryable());
        assert!(!RequestError::Released.is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let err = RequestError::RateLimited(Duration::from_secs(7));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert_eq!(RequestError::NotFound.retry_after(), None);
    }

    #[test]
    fn test_json_errors_are_malformed() {
        let err = serde_json::from_str::<u32>("{").unwrap_err();
        assert!(matches!(RequestError::from(err), RequestError::Malformed(_)));
    }
}
