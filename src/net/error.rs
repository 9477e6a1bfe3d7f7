//! Error types for the network layer and download operations.
//!
//! Every variant maps to a stable kind string via [`FetchError::kind`]; those
//! strings are what ends up in `work.json.history` and the run summary.

use std::path::PathBuf;

use thiserror::Error;

use crate::budget::ContentClass;

/// Errors that can occur while searching providers or downloading artifacts.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Non-retriable HTTP error response (4xx other than 429).
    #[error("HTTP {status} from {url}")]
    ClientError {
        /// The URL that returned the error status.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// HTTP 429 that survived the attempt budget.
    #[error("rate limited by {url}")]
    RateLimited {
        /// The URL that rate limited us.
        url: String,
        /// The last Retry-After header value, if any.
        retry_after: Option<String>,
    },

    /// 5xx or network-level failure that survived the attempt budget.
    #[error("transient failure fetching {url}: {detail}")]
    Transient {
        /// The URL that failed.
        url: String,
        /// Short description of the last underlying error.
        detail: String,
    },

    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// The provider's circuit breaker is open; no request was made.
    #[error("circuit open for provider {provider}")]
    CircuitOpen {
        /// The provider key.
        provider: String,
    },

    /// The provider's daily quota is exhausted.
    #[error("daily quota exhausted for provider {provider}")]
    QuotaExhausted {
        /// The provider key.
        provider: String,
    },

    /// A storage budget would be (or was) exceeded.
    #[error("storage budget exceeded for {class} artifacts: {detail}")]
    BudgetExceeded {
        /// The content class whose limit was hit.
        class: ContentClass,
        /// Which limit was hit and by how much.
        detail: String,
    },

    /// TLS certificate verification failed and policy does not allow retry.
    #[error("TLS verification failed for {url}: {detail}")]
    Tls {
        /// The URL whose certificate failed verification.
        url: String,
        detail: String,
    },

    /// The provider returned a payload the adapter cannot interpret.
    #[error("unexpected payload from {url}: {detail}")]
    Protocol {
        /// The URL whose response was malformed.
        url: String,
        detail: String,
    },

    /// The provided URL is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Filesystem failure while writing an artifact.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The operation was cancelled (shutdown or worker deadline).
    #[error("operation cancelled while fetching {url}")]
    Cancelled {
        /// The URL in flight when cancellation hit.
        url: String,
    },
}

impl FetchError {
    /// Creates a client error.
    pub fn client(url: impl Into<String>, status: u16) -> Self {
        Self::ClientError {
            url: url.into(),
            status,
        }
    }

    /// Creates a rate-limited error.
    pub fn rate_limited(url: impl Into<String>, retry_after: Option<String>) -> Self {
        Self::RateLimited {
            url: url.into(),
            retry_after,
        }
    }

    /// Creates a transient error.
    pub fn transient(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Transient {
            url: url.into(),
            detail: detail.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates a protocol error.
    pub fn protocol(url: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Protocol {
            url: url.into(),
            detail: detail.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The stable kind string recorded in `work.json.history`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClientError { .. } | Self::Tls { .. } | Self::Protocol { .. } | Self::InvalidUrl { .. } => {
                "client-error"
            }
            Self::RateLimited { .. } => "rate-limited",
            Self::Transient { .. } | Self::Cancelled { .. } => "transient",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit-open",
            Self::QuotaExhausted { .. } => "quota-exhausted",
            Self::BudgetExceeded { .. } => "budget-exceeded",
            Self::Io { .. } => "io-error",
        }
    }
}
