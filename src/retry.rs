//! Error classification and backoff policy.

use std::time::Duration;

use crate::transport::ResponseEnvelope;

/// Platform-level numeric error codes the pipeline reacts to.
pub mod codes {
    pub const NO_ERROR: i64 = 0;
    pub const UNSUPPORTED_METHOD: i64 = 3;
    pub const QPS_LIMIT_REACHED: i64 = 18;
    pub const API_TOKEN_INVALID: i64 = 110;
    pub const API_TOKEN_EXPIRED: i64 = 111;
    pub const INVALID_PARAM: i64 = 336003;
    pub const API_NAME_NOT_EXIST: i64 = 336005;
    pub const SERVER_HIGH_LOAD: i64 = 336100;
    pub const RPM_LIMIT_REACHED: i64 = 336501;
    pub const TPM_LIMIT_REACHED: i64 = 336502;
    pub const CONSOLE_INTERNAL_ERROR: i64 = 500000;
}

/// Codes replayed with exponential backoff.
pub const RETRYABLE_CODES: &[i64] = &[
    codes::QPS_LIMIT_REACHED,
    codes::SERVER_HIGH_LOAD,
    codes::RPM_LIMIT_REACHED,
    codes::TPM_LIMIT_REACHED,
    codes::CONSOLE_INTERNAL_ERROR,
];

const REFRESH_CODES: &[i64] = &[codes::API_TOKEN_INVALID, codes::API_TOKEN_EXPIRED];
const ENDPOINT_CODES: &[i64] = &[codes::UNSUPPORTED_METHOD, codes::API_NAME_NOT_EXIST];

/// Retry parameters resolved from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum replay attempts; 0 means unbounded
    pub count: u32,
    /// Total per-call budget in seconds; 0 means unbounded
    pub timeout: f64,
    pub backoff_factor: f64,
    pub max_wait_interval: f64,
}

impl RetryPolicy {
    /// Wait before replaying `attempt` (0-based): `min(max_wait, factor * 2^attempt)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let wait = self.backoff_factor * 2f64.powi(attempt.min(62) as i32);
        Duration::from_secs_f64(wait.min(self.max_wait_interval).max(0.0))
    }

    /// Whether one more replay fits in the attempt budget.
    pub fn attempts_remaining(&self, attempt: u32) -> bool {
        self.count == 0 || attempt < self.count
    }

    pub(crate) fn deadline(&self) -> Option<tokio::time::Instant> {
        if self.timeout <= 0.0 {
            None
        } else {
            Some(tokio::time::Instant::now() + Duration::from_secs_f64(self.timeout))
        }
    }
}

/// How the pipeline must react to a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Classification {
    Success,
    /// Replay after backoff, consuming a retry slot
    Retryable,
    /// Refresh the bearer token and replay once, without consuming a slot
    TokenExpired,
    /// Refresh the endpoint registry and re-resolve once
    UnsupportedEndpoint,
    Fatal,
}

pub(crate) fn classify(envelope: &ResponseEnvelope) -> Classification {
    match envelope.error_code {
        None | Some(codes::NO_ERROR) => {
            if envelope.status == 401 {
                Classification::TokenExpired
            } else if (200..300).contains(&envelope.status) {
                Classification::Success
            } else {
                Classification::Fatal
            }
        }
        Some(code) if REFRESH_CODES.contains(&code) => Classification::TokenExpired,
        Some(code) if RETRYABLE_CODES.contains(&code) => Classification::Retryable,
        Some(code) if ENDPOINT_CODES.contains(&code) => Classification::UnsupportedEndpoint,
        Some(_) => Classification::Fatal,
    }
}
