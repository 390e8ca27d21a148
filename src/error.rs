use eventsource_stream::EventStreamError;
use snafu::Snafu;

use crate::model::Capability;

/// Errors surfaced by the SDK.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid configuration value for '{key}': {reason}"))]
    InvalidConfig {
        key: String,
        reason: String,
    },

    #[snafu(display(
        "no usable credential; provide an access key pair, an application key pair, or an access token"
    ))]
    CredentialsMissing,

    #[snafu(display("authentication rejected by platform: {message}"))]
    AuthFailed {
        message: String,
    },

    #[snafu(display("platform error {code}: {message}"))]
    Api {
        /// Platform-level numeric error code
        code: i64,
        /// Platform-provided description
        message: String,
    },

    #[snafu(display("no endpoint mapping for model '{model}' under capability '{capability}'"))]
    UnsupportedModel {
        capability: Capability,
        model: String,
    },

    #[snafu(display("rate limit exceeded for limit key '{key}'"))]
    RateLimitExceeded {
        key: String,
    },

    #[snafu(display("call budget of {seconds}s elapsed"))]
    Timeout {
        seconds: f64,
    },

    #[snafu(display("call cancelled"))]
    Cancelled,

    #[snafu(display("failed to build HTTP client"))]
    HttpClient {
        source: reqwest::Error,
    },

    #[snafu(display("failed to perform request to '{url}'"))]
    Transport {
        source: reqwest::Error,
        url: String,
    },

    #[snafu(display("failed to obtain stream SSE part"))]
    StreamPart {
        source: EventStreamError<reqwest::Error>,
    },

    #[snafu(display("failed to parse response body"))]
    MalformedResponse {
        source: serde_json::Error,
    },

    #[snafu(display("failed to construct URL from '{suffix}'"))]
    ConstructUrl {
        source: url::ParseError,
        suffix: String,
    },

    InvalidHeaderValue {
        source: reqwest::header::InvalidHeaderValue,
    },

    #[snafu(display("invariant violated: {detail}"))]
    Internal {
        detail: String,
    },
}

impl Error {
    /// Platform error code carried by this error, if any.
    pub fn api_code(&self) -> Option<i64> {
        match self {
            Error::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the pipeline may replay the request after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Api { code, .. } if crate::retry::RETRYABLE_CODES.contains(code))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
