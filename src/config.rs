//! Layered runtime configuration.
//!
//! Values resolve, highest precedence first: programmatic override, the
//! `QIANFAN_*` process environment, the dotfile, the built-in default. The
//! dotfile (path from `QIANFAN_DOT_ENV_CONFIG_FILE`, default `.env`) is merged
//! into the process environment once, without overriding variables already
//! set, so the environment lookup covers both layers.
//!
//! [`resolve`] produces an immutable [`Config`] snapshot. A process-wide
//! override set can be updated through [`set`]; snapshots taken afterwards see
//! the change, snapshots already captured do not.

use std::env;
use std::sync::{Arc, LazyLock, RwLock};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

pub(crate) const ENV_PREFIX: &str = "QIANFAN_";

const DEFAULT_BASE_URL: &str = "https://aip.baidubce.com";
const DEFAULT_CONSOLE_BASE_URL: &str = "https://qianfan.baidubce.com";
const DEFAULT_IAM_BASE_URL: &str = "https://iam.bj.baidubce.com";

const DEFAULT_SIGN_EXPIRATION_SEC: u64 = 1800;
const DEFAULT_TOKEN_REFRESH_MIN_INTERVAL: u64 = 3600;
const DEFAULT_RETRY_COUNT: u32 = 1;
const DEFAULT_RETRY_TIMEOUT: f64 = 60.0;
const DEFAULT_RETRY_BACKOFF_FACTOR: f64 = 1.0;
const DEFAULT_RETRY_MAX_WAIT_INTERVAL: f64 = 120.0;

const RECOGNIZED_KEYS: &[&str] = &[
    "ACCESS_KEY",
    "SECRET_KEY",
    "AK",
    "SK",
    "ACCESS_TOKEN",
    "BASE_URL",
    "CONSOLE_API_BASE_URL",
    "IAM_BASE_URL",
    "IAM_SIGN_EXPIRATION_SEC",
    "ACCESS_TOKEN_REFRESH_MIN_INTERVAL",
    "LLM_API_RETRY_COUNT",
    "LLM_API_RETRY_TIMEOUT",
    "LLM_API_RETRY_BACKOFF_FACTOR",
    "LLM_RETRY_MAX_WAIT_INTERVAL",
    "QPS_LIMIT",
    "RPM_LIMIT",
    "TPM_LIMIT",
    "CONSOLE_API_RETRY_COUNT",
    "CONSOLE_API_RETRY_TIMEOUT",
    "CONSOLE_API_RETRY_BACKOFF_FACTOR",
    "CONSOLE_API_RETRY_MAX_WAIT_INTERVAL",
    "DOT_ENV_CONFIG_FILE",
    "ENABLE_STRESS_TEST",
    "CACHE_DIR",
    "NO_AUTH",
];

/// Programmatic overrides, the highest-precedence configuration layer.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub ak: Option<String>,
    pub sk: Option<String>,
    pub access_token: Option<String>,
    pub base_url: Option<String>,
    pub console_base_url: Option<String>,
    pub iam_base_url: Option<String>,
    pub sign_expiration_sec: Option<u64>,
    pub access_token_refresh_min_interval: Option<u64>,
    pub retry_count: Option<u32>,
    pub retry_timeout: Option<f64>,
    pub retry_backoff_factor: Option<f64>,
    pub retry_max_wait_interval: Option<f64>,
    pub console_retry_count: Option<u32>,
    pub console_retry_timeout: Option<f64>,
    pub console_retry_backoff_factor: Option<f64>,
    pub console_retry_max_wait_interval: Option<f64>,
    pub qps_limit: Option<f64>,
    pub rpm_limit: Option<u64>,
    pub tpm_limit: Option<u64>,
    pub no_auth: Option<bool>,
    pub request_source: Option<String>,
}

impl ConfigOverrides {
    /// Layer `other` on top of `self`; fields set in `other` win.
    pub(crate) fn merged_with(&self, other: &ConfigOverrides) -> ConfigOverrides {
        macro_rules! pick {
            ($field:ident) => {
                other.$field.clone().or_else(|| self.$field.clone())
            };
        }
        ConfigOverrides {
            access_key: pick!(access_key),
            secret_key: pick!(secret_key),
            ak: pick!(ak),
            sk: pick!(sk),
            access_token: pick!(access_token),
            base_url: pick!(base_url),
            console_base_url: pick!(console_base_url),
            iam_base_url: pick!(iam_base_url),
            sign_expiration_sec: pick!(sign_expiration_sec),
            access_token_refresh_min_interval: pick!(access_token_refresh_min_interval),
            retry_count: pick!(retry_count),
            retry_timeout: pick!(retry_timeout),
            retry_backoff_factor: pick!(retry_backoff_factor),
            retry_max_wait_interval: pick!(retry_max_wait_interval),
            console_retry_count: pick!(console_retry_count),
            console_retry_timeout: pick!(console_retry_timeout),
            console_retry_backoff_factor: pick!(console_retry_backoff_factor),
            console_retry_max_wait_interval: pick!(console_retry_max_wait_interval),
            qps_limit: pick!(qps_limit),
            rpm_limit: pick!(rpm_limit),
            tpm_limit: pick!(tpm_limit),
            no_auth: pick!(no_auth),
            request_source: pick!(request_source),
        }
    }
}

/// Immutable configuration snapshot captured at a call boundary.
#[derive(Debug, Clone)]
pub struct Config {
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub ak: Option<String>,
    pub sk: Option<String>,
    pub access_token: Option<String>,
    pub base_url: String,
    pub console_base_url: String,
    pub iam_base_url: String,
    pub sign_expiration_sec: u64,
    pub access_token_refresh_min_interval: u64,
    pub retry: RetryPolicy,
    pub console_retry: RetryPolicy,
    pub qps_limit: f64,
    pub rpm_limit: u64,
    pub tpm_limit: u64,
    pub no_auth: bool,
    request_source: String,
}

impl Config {
    /// Version indicator carried in the telemetry header and body field.
    pub fn request_source(&self) -> &str {
        &self.request_source
    }

    /// Whether an admin key pair is configured.
    pub fn has_admin_credentials(&self) -> bool {
        self.access_key.as_deref().is_some_and(|s| !s.is_empty())
            && self.secret_key.as_deref().is_some_and(|s| !s.is_empty())
    }
}

static GLOBAL_OVERRIDES: LazyLock<RwLock<Arc<ConfigOverrides>>> =
    LazyLock::new(|| RwLock::new(Arc::new(ConfigOverrides::default())));

static ENV_SCAN: LazyLock<()> = LazyLock::new(|| {
    let dotfile = env::var(format!("{ENV_PREFIX}DOT_ENV_CONFIG_FILE"))
        .unwrap_or_else(|_| ".env".to_string());
    // dotenvy never overrides variables already present, preserving
    // environment-over-dotfile precedence.
    if let Err(err) = dotenvy::from_filename(&dotfile) {
        if !err.not_found() {
            tracing::warn!(dotfile, %err, "failed to load configuration dotfile");
        }
    }
    for (name, _) in env::vars() {
        if let Some(key) = name.strip_prefix(ENV_PREFIX) {
            if !RECOGNIZED_KEYS.contains(&key) {
                tracing::warn!(key = name, "ignoring unrecognized configuration key");
            }
        }
    }
});

/// Update the process-wide programmatic overrides. Pipelines created (and
/// snapshots taken) afterwards observe the new values.
pub fn set(apply: impl FnOnce(&mut ConfigOverrides)) {
    let mut guard = GLOBAL_OVERRIDES.write().unwrap_or_else(|e| e.into_inner());
    let mut next = (**guard).clone();
    apply(&mut next);
    *guard = Arc::new(next);
}

pub(crate) fn global_overrides() -> Arc<ConfigOverrides> {
    GLOBAL_OVERRIDES.read().unwrap_or_else(|e| e.into_inner()).clone()
}

fn lookup(key: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{key}")).ok().filter(|v| !v.is_empty())
}

fn parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.parse::<T>().map(Some).map_err(|e| Error::InvalidConfig {
            key: format!("{ENV_PREFIX}{key}"),
            reason: format!("cannot parse '{raw}': {e}"),
        }),
    }
}

fn parsed_bool(key: &str) -> Result<Option<bool>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Some(true)),
            "false" | "0" | "no" | "off" => Ok(Some(false)),
            _ => Err(Error::InvalidConfig {
                key: format!("{ENV_PREFIX}{key}"),
                reason: format!("cannot parse '{raw}' as a boolean"),
            }),
        },
    }
}

/// Resolve a configuration snapshot, layering `overrides` on top of the
/// global overrides, the environment, the dotfile, and built-in defaults.
pub fn resolve(overrides: &ConfigOverrides) -> Result<Arc<Config>> {
    LazyLock::force(&ENV_SCAN);
    let merged = global_overrides().merged_with(overrides);

    macro_rules! string_opt {
        ($field:ident, $key:expr) => {
            merged.$field.clone().or_else(|| lookup($key))
        };
    }
    macro_rules! value {
        ($field:ident, $key:expr, $default:expr) => {
            match merged.$field {
                Some(v) => v,
                None => parsed($key)?.unwrap_or($default),
            }
        };
    }

    let retry = RetryPolicy {
        count: value!(retry_count, "LLM_API_RETRY_COUNT", DEFAULT_RETRY_COUNT),
        timeout: value!(retry_timeout, "LLM_API_RETRY_TIMEOUT", DEFAULT_RETRY_TIMEOUT),
        backoff_factor: value!(
            retry_backoff_factor,
            "LLM_API_RETRY_BACKOFF_FACTOR",
            DEFAULT_RETRY_BACKOFF_FACTOR
        ),
        max_wait_interval: value!(
            retry_max_wait_interval,
            "LLM_RETRY_MAX_WAIT_INTERVAL",
            DEFAULT_RETRY_MAX_WAIT_INTERVAL
        ),
    };
    let console_retry = RetryPolicy {
        count: value!(console_retry_count, "CONSOLE_API_RETRY_COUNT", DEFAULT_RETRY_COUNT),
        timeout: value!(console_retry_timeout, "CONSOLE_API_RETRY_TIMEOUT", DEFAULT_RETRY_TIMEOUT),
        backoff_factor: value!(
            console_retry_backoff_factor,
            "CONSOLE_API_RETRY_BACKOFF_FACTOR",
            0.0
        ),
        max_wait_interval: value!(
            console_retry_max_wait_interval,
            "CONSOLE_API_RETRY_MAX_WAIT_INTERVAL",
            DEFAULT_RETRY_MAX_WAIT_INTERVAL
        ),
    };

    Ok(Arc::new(Config {
        access_key: string_opt!(access_key, "ACCESS_KEY"),
        secret_key: string_opt!(secret_key, "SECRET_KEY"),
        ak: string_opt!(ak, "AK"),
        sk: string_opt!(sk, "SK"),
        access_token: string_opt!(access_token, "ACCESS_TOKEN"),
        base_url: string_opt!(base_url, "BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        console_base_url: string_opt!(console_base_url, "CONSOLE_API_BASE_URL")
            .unwrap_or_else(|| DEFAULT_CONSOLE_BASE_URL.to_string()),
        iam_base_url: string_opt!(iam_base_url, "IAM_BASE_URL")
            .unwrap_or_else(|| DEFAULT_IAM_BASE_URL.to_string()),
        sign_expiration_sec: value!(
            sign_expiration_sec,
            "IAM_SIGN_EXPIRATION_SEC",
            DEFAULT_SIGN_EXPIRATION_SEC
        ),
        access_token_refresh_min_interval: value!(
            access_token_refresh_min_interval,
            "ACCESS_TOKEN_REFRESH_MIN_INTERVAL",
            DEFAULT_TOKEN_REFRESH_MIN_INTERVAL
        ),
        retry,
        console_retry,
        qps_limit: value!(qps_limit, "QPS_LIMIT", 0.0),
        rpm_limit: value!(rpm_limit, "RPM_LIMIT", 0),
        tpm_limit: value!(tpm_limit, "TPM_LIMIT", 0),
        no_auth: match merged.no_auth {
            Some(v) => v,
            None => parsed_bool("NO_AUTH")?.unwrap_or(false),
        },
        request_source: merged
            .request_source
            .unwrap_or_else(|| format!("rust_sdk_v{}", env!("CARGO_PKG_VERSION"))),
    }))
}
