//! Credential management: variant selection, request signatures, and the
//! cached bearer token exchanged from an application key pair.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;
use serde::Deserialize;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::signer;
use crate::transport::RequestDescriptor;

/// One of the platform's credential kinds, chosen by precedence: admin key
/// pair, then application key pair, then a preset bearer token.
#[derive(Debug, Clone)]
pub(crate) enum Credential {
    AccessKey { access_key: String, secret_key: String },
    AppKey { ak: String, sk: String },
    Bearer(String),
}

impl Credential {
    pub(crate) fn from_config(config: &Config) -> Option<Credential> {
        if config.has_admin_credentials() {
            return Some(Credential::AccessKey {
                access_key: config.access_key.clone().unwrap_or_default(),
                secret_key: config.secret_key.clone().unwrap_or_default(),
            });
        }
        match (&config.ak, &config.sk) {
            (Some(ak), Some(sk)) if !ak.is_empty() && !sk.is_empty() => {
                return Some(Credential::AppKey { ak: ak.clone(), sk: sk.clone() });
            }
            _ => {}
        }
        config
            .access_token
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|t| Credential::Bearer(t.clone()))
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    refreshed_at: OffsetDateTime,
}

type TokenSlot = Arc<Mutex<Option<CachedToken>>>;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[allow(dead_code)]
    expires_in: Option<i64>,
    error: Option<String>,
    error_description: Option<String>,
}

/// Produces a valid authorization artifact for each outbound request and
/// owns the bearer token cache, keyed by application key pair.
#[derive(Debug)]
pub(crate) struct CredentialManager {
    http: Client,
    // One slot per key pair; the slot mutex serializes exchanges so that
    // concurrent first users all await a single wire call.
    slots: RwLock<HashMap<(String, String), TokenSlot>>,
}

impl CredentialManager {
    pub(crate) fn new(http: Client) -> Self {
        Self { http, slots: RwLock::new(HashMap::new()) }
    }

    /// Attach authorization to `request` according to the credential in
    /// effect. Exactly one of the signed `authorization` header or the
    /// `access_token` query parameter ends up on the wire. Returns the
    /// bearer that was applied, when the credential is refreshable.
    pub(crate) async fn authorize(
        &self,
        request: &mut RequestDescriptor,
        config: &Config,
    ) -> Result<Option<String>> {
        if config.no_auth {
            return Ok(None);
        }
        match Credential::from_config(config) {
            None => Err(Error::CredentialsMissing),
            Some(Credential::AccessKey { access_key, secret_key }) => {
                signer::sign(
                    request,
                    &access_key,
                    &secret_key,
                    config.sign_expiration_sec,
                    OffsetDateTime::now_utc(),
                )?;
                Ok(None)
            }
            Some(Credential::AppKey { ak, sk }) => {
                let token = self.bearer_token(config, &ak, &sk).await?;
                request.set_query_param("access_token", &token);
                Ok(Some(token))
            }
            Some(Credential::Bearer(token)) => {
                request.set_query_param("access_token", &token);
                Ok(None)
            }
        }
    }

    /// Cached bearer for the key pair, exchanging a fresh one when the cache
    /// is older than the minimum refresh interval.
    pub(crate) async fn bearer_token(
        &self,
        config: &Config,
        ak: &str,
        sk: &str,
    ) -> Result<String> {
        let slot = self.slot(ak, sk).await;
        let mut guard = slot.lock().await;
        let now = OffsetDateTime::now_utc();
        if let Some(cached) = guard.as_ref() {
            let min_interval =
                TimeDuration::seconds(config.access_token_refresh_min_interval as i64);
            if now - cached.refreshed_at < min_interval {
                return Ok(cached.token.clone());
            }
        }
        let token = self.exchange(config, ak, sk).await?;
        *guard = Some(CachedToken { token: token.clone(), refreshed_at: now });
        Ok(token)
    }

    /// Force a re-fetch of the cached bearer. Reads within the minimum
    /// refresh interval still return the cached value.
    pub(crate) async fn refresh(&self, config: &Config) -> Result<()> {
        if let Some(Credential::AppKey { ak, sk }) = Credential::from_config(config) {
            self.bearer_token(config, &ak, &sk).await?;
        }
        Ok(())
    }

    /// Refresh after the platform rejected `failed_token`. Skips the
    /// debounce window, but collapses with a refresh another caller already
    /// completed (the cache then holds a different token).
    pub(crate) async fn refresh_after_auth_error(
        &self,
        config: &Config,
        failed_token: Option<&str>,
    ) -> Result<()> {
        let Some(Credential::AppKey { ak, sk }) = Credential::from_config(config) else {
            return Ok(());
        };
        let slot = self.slot(&ak, &sk).await;
        let mut guard = slot.lock().await;
        if let (Some(cached), Some(failed)) = (guard.as_ref(), failed_token) {
            if cached.token != failed {
                return Ok(());
            }
        }
        tracing::debug!(ak, "refreshing bearer token after auth error");
        let token = self.exchange(config, &ak, &sk).await?;
        *guard = Some(CachedToken { token, refreshed_at: OffsetDateTime::now_utc() });
        Ok(())
    }

    async fn slot(&self, ak: &str, sk: &str) -> TokenSlot {
        let key = (ak.to_string(), sk.to_string());
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(&key) {
                return slot.clone();
            }
        }
        let mut slots = self.slots.write().await;
        slots.entry(key).or_default().clone()
    }

    async fn exchange(&self, config: &Config, ak: &str, sk: &str) -> Result<String> {
        let suffix = "oauth/2.0/token";
        let mut url = url::Url::parse(&config.base_url)
            .and_then(|u| u.join(suffix))
            .map_err(|source| Error::ConstructUrl { source, suffix: suffix.to_string() })?;
        url.query_pairs_mut()
            .append_pair("grant_type", "client_credentials")
            .append_pair("client_id", ak)
            .append_pair("client_secret", sk);

        let display_url = format!("{}/oauth/2.0/token", config.base_url);
        let response = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|source| Error::Transport { source, url: display_url.clone() })?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|source| Error::Transport { source, url: display_url })?;

        if let Some(error) = body.error {
            return Err(Error::AuthFailed {
                message: body.error_description.unwrap_or(error),
            });
        }
        body.access_token.filter(|t| !t.is_empty()).ok_or_else(|| Error::AuthFailed {
            message: "token exchange response carried no access_token".to_string(),
        })
    }
}
