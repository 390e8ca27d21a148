//! The request pipeline behind every capability call.
//!
//! Each call captures a configuration snapshot, resolves the endpoint,
//! acquires rate-limit tokens, authorizes, sends, and classifies the
//! response, replaying with backoff or after a credential/endpoint refresh
//! as the classification dictates.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Method;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::{Credential, CredentialManager};
use crate::config::{self, Config, ConfigOverrides};
use crate::console::ConsoleClient;
use crate::endpoints::{self, EndpointRegistry};
use crate::error::{Error, Result};
use crate::limiter::{LimitParams, RateLimiter};
use crate::model::Capability;
use crate::retry::{self, Classification};
use crate::tokens;
use crate::transport::{
    REQUEST_SOURCE_HEADER, RequestDescriptor, ResponseEnvelope, SseStream, StreamOutcome,
    Transport,
};

const INFERENCE_PREFIX: &str = "/rpc/2.0/ai_custom/v1/wenxinworkshop";

#[derive(Debug)]
pub(crate) struct Shared {
    pub overrides: ConfigOverrides,
    pub credentials: CredentialManager,
    pub registry: EndpointRegistry,
    pub limiter: RateLimiter,
    pub transport: Transport,
    pub console: ConsoleClient,
}

/// One capability call, fully described.
#[derive(Debug)]
pub(crate) struct CallSpec {
    pub capability: Capability,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub body: serde_json::Value,
    pub limit_key: Option<String>,
    pub limit_params: Option<LimitParams>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub(crate) struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub(crate) fn snapshot(&self) -> Result<Arc<Config>> {
        config::resolve(&self.shared.overrides)
    }

    pub(crate) fn registry(&self) -> &EndpointRegistry {
        &self.shared.registry
    }

    pub(crate) async fn refresh_credentials(&self) -> Result<()> {
        let config = self.snapshot()?;
        self.shared.credentials.refresh(&config).await
    }

    async fn resolve_path(&self, config: &Config, spec: &CallSpec) -> Result<String> {
        if let Some(endpoint) = &spec.endpoint {
            return Ok(match spec.capability {
                // plugin services are addressed by endpoint alone
                Capability::Plugin => format!("/plugin/{endpoint}/"),
                capability => format!("/{}/{}", capability.api_type(), endpoint),
            });
        }
        let model = spec.model.clone().unwrap_or_default();
        self.shared
            .registry
            .resolve_with_refresh(spec.capability, &model, &self.shared.console, config)
            .await
            .ok_or(Error::UnsupportedModel { capability: spec.capability, model })
    }

    fn inference_url(&self, config: &Config, path: &str) -> Result<Url> {
        let suffix = format!("{INFERENCE_PREFIX}{path}");
        let joined = format!("{}{}", config.base_url.trim_end_matches('/'), suffix);
        Url::parse(&joined).map_err(|source| Error::ConstructUrl { source, suffix })
    }

    fn limit_key(&self, config: &Config, spec: &CallSpec, path: &str) -> String {
        if let Some(key) = &spec.limit_key {
            return key.clone();
        }
        let credential_id = match Credential::from_config(config) {
            Some(Credential::AccessKey { access_key, .. }) => access_key,
            Some(Credential::AppKey { ak, .. }) => ak,
            Some(Credential::Bearer(_)) => "token".to_string(),
            None => "anonymous".to_string(),
        };
        format!("{credential_id}:{path}")
    }

    fn build_request(
        &self,
        config: &Config,
        url: &Url,
        body: &serde_json::Value,
    ) -> Result<RequestDescriptor> {
        let mut request = RequestDescriptor::new(Method::POST, url.clone(), body.clone());
        request.insert_header("content-type", "application/json")?;
        request.insert_header("accept", "application/json")?;
        request.insert_header(REQUEST_SOURCE_HEADER, config.request_source())?;
        Ok(request)
    }

    fn remaining(deadline: Option<Instant>) -> Option<Duration> {
        deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Non-streaming call. Returns the first envelope classified as success.
    pub(crate) async fn execute(&self, spec: CallSpec) -> Result<ResponseEnvelope> {
        let config = self.snapshot()?;
        let policy = config.retry;
        let deadline = policy.deadline();

        let mut attempt: u32 = 0;
        let mut token_refreshed = false;
        let mut endpoint_refreshed = false;

        'resolve: loop {
            let path = self.resolve_path(&config, &spec).await?;
            let url = self.inference_url(&config, &path)?;
            let mut body = spec.body.clone();
            inject_request_source(&mut body, config.request_source());
            truncate_body_messages(&mut body, &path);

            let estimated = estimate_request_tokens(&body);
            let limit_key = self.limit_key(&config, &spec, &path);
            let params = spec.limit_params.unwrap_or_else(|| LimitParams::from_config(&config));
            self.shared
                .limiter
                .acquire(&limit_key, params, estimated, deadline, &spec.cancel)
                .await?;

            loop {
                if let Some(remaining) = Self::remaining(deadline) {
                    if remaining.is_zero() {
                        self.shared.limiter.release(&limit_key, params, estimated).await;
                        return Err(Error::Timeout { seconds: policy.timeout });
                    }
                }

                let mut request = self.build_request(&config, &url, &body)?;
                let used_token =
                    match self.shared.credentials.authorize(&mut request, &config).await {
                        Ok(token) => token,
                        Err(err) => {
                            self.shared.limiter.release(&limit_key, params, estimated).await;
                            return Err(err);
                        }
                    };

                let envelope = match self
                    .shared
                    .transport
                    .send(&request, Self::remaining(deadline), &spec.cancel)
                    .await
                {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        self.shared.limiter.release(&limit_key, params, estimated).await;
                        return Err(err);
                    }
                };

                match retry::classify(&envelope) {
                    Classification::Success => {
                        if let Some(usage) = envelope.usage() {
                            self.shared
                                .limiter
                                .reconcile(&limit_key, params, estimated, usage.total_tokens)
                                .await;
                        }
                        return Ok(envelope);
                    }
                    Classification::Retryable => {
                        if !policy.attempts_remaining(attempt) {
                            self.shared.limiter.release(&limit_key, params, estimated).await;
                            return Err(envelope.api_error());
                        }
                        let wait = policy.backoff(attempt);
                        tracing::debug!(
                            attempt,
                            code = ?envelope.error_code,
                            ?wait,
                            "retryable platform error; backing off"
                        );
                        attempt += 1;
                        tokio::select! {
                            biased;
                            _ = spec.cancel.cancelled() => {
                                self.shared.limiter.release(&limit_key, params, estimated).await;
                                return Err(Error::Cancelled);
                            }
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                    Classification::TokenExpired => {
                        if token_refreshed {
                            self.shared.limiter.release(&limit_key, params, estimated).await;
                            return Err(Error::AuthFailed {
                                message: envelope
                                    .error_msg
                                    .clone()
                                    .unwrap_or_else(|| "token rejected".to_string()),
                            });
                        }
                        token_refreshed = true;
                        if let Err(err) = self
                            .shared
                            .credentials
                            .refresh_after_auth_error(&config, used_token.as_deref())
                            .await
                        {
                            self.shared.limiter.release(&limit_key, params, estimated).await;
                            return Err(err);
                        }
                    }
                    Classification::UnsupportedEndpoint => {
                        if endpoint_refreshed || !config.has_admin_credentials() {
                            self.shared.limiter.release(&limit_key, params, estimated).await;
                            return Err(envelope.api_error());
                        }
                        endpoint_refreshed = true;
                        self.shared.limiter.release(&limit_key, params, estimated).await;
                        self.shared.registry.refresh(&self.shared.console, &config).await;
                        continue 'resolve;
                    }
                    Classification::Fatal => {
                        self.shared.limiter.release(&limit_key, params, estimated).await;
                        return Err(envelope.api_error());
                    }
                }
            }
        }
    }

    /// Streaming call. The first envelope is classified before the stream is
    /// handed to the caller; refresh-class errors restart the stream once.
    pub(crate) async fn stream(&self, spec: CallSpec) -> Result<SseStream> {
        let config = self.snapshot()?;
        let policy = config.retry;
        let deadline = policy.deadline();

        let mut attempt: u32 = 0;
        let mut token_refreshed = false;
        let mut endpoint_refreshed = false;

        'resolve: loop {
            let path = self.resolve_path(&config, &spec).await?;
            let url = self.inference_url(&config, &path)?;
            let mut body = spec.body.clone();
            if let Some(obj) = body.as_object_mut() {
                obj.insert("stream".to_string(), serde_json::Value::Bool(true));
            }
            inject_request_source(&mut body, config.request_source());
            truncate_body_messages(&mut body, &path);

            let estimated = estimate_request_tokens(&body);
            let limit_key = self.limit_key(&config, &spec, &path);
            let params = spec.limit_params.unwrap_or_else(|| LimitParams::from_config(&config));
            self.shared
                .limiter
                .acquire(&limit_key, params, estimated, deadline, &spec.cancel)
                .await?;

            loop {
                let mut request = self.build_request(&config, &url, &body)?;
                let used_token =
                    match self.shared.credentials.authorize(&mut request, &config).await {
                        Ok(token) => token,
                        Err(err) => {
                            self.shared.limiter.release(&limit_key, params, estimated).await;
                            return Err(err);
                        }
                    };

                let outcome = match self
                    .shared
                    .transport
                    .stream(&request, Self::remaining(deadline), &spec.cancel)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        self.shared.limiter.release(&limit_key, params, estimated).await;
                        return Err(err);
                    }
                };

                let (envelope, stream) = match outcome {
                    StreamOutcome::Json(envelope) => (envelope, None),
                    StreamOutcome::Events(mut stream) => match stream.recv().await {
                        None => {
                            return Ok(self.reconciling(stream, limit_key, params, estimated));
                        }
                        Some(Err(err)) => {
                            self.shared.limiter.release(&limit_key, params, estimated).await;
                            return Err(err);
                        }
                        Some(Ok(envelope)) => (envelope, Some(stream)),
                    },
                };

                match retry::classify(&envelope) {
                    Classification::Success => {
                        let mut stream = match stream {
                            Some(stream) => stream,
                            // a JSON body answered the stream request; treat
                            // it as a single-event stream
                            None => SseStream::from_boxed(
                                futures::stream::empty().boxed(),
                                spec.cancel.clone(),
                            ),
                        };
                        stream.prepend(envelope);
                        return Ok(self.reconciling(stream, limit_key, params, estimated));
                    }
                    Classification::Retryable => {
                        if !policy.attempts_remaining(attempt) {
                            self.shared.limiter.release(&limit_key, params, estimated).await;
                            return Err(envelope.api_error());
                        }
                        let wait = policy.backoff(attempt);
                        attempt += 1;
                        tokio::select! {
                            biased;
                            _ = spec.cancel.cancelled() => {
                                self.shared.limiter.release(&limit_key, params, estimated).await;
                                return Err(Error::Cancelled);
                            }
                            _ = tokio::time::sleep(wait) => {}
                        }
                    }
                    Classification::TokenExpired => {
                        if token_refreshed {
                            self.shared.limiter.release(&limit_key, params, estimated).await;
                            return Err(Error::AuthFailed {
                                message: envelope
                                    .error_msg
                                    .clone()
                                    .unwrap_or_else(|| "token rejected".to_string()),
                            });
                        }
                        token_refreshed = true;
                        if let Err(err) = self
                            .shared
                            .credentials
                            .refresh_after_auth_error(&config, used_token.as_deref())
                            .await
                        {
                            self.shared.limiter.release(&limit_key, params, estimated).await;
                            return Err(err);
                        }
                    }
                    Classification::UnsupportedEndpoint => {
                        if endpoint_refreshed || !config.has_admin_credentials() {
                            self.shared.limiter.release(&limit_key, params, estimated).await;
                            return Err(envelope.api_error());
                        }
                        endpoint_refreshed = true;
                        self.shared.limiter.release(&limit_key, params, estimated).await;
                        self.shared.registry.refresh(&self.shared.console, &config).await;
                        continue 'resolve;
                    }
                    Classification::Fatal => {
                        self.shared.limiter.release(&limit_key, params, estimated).await;
                        return Err(envelope.api_error());
                    }
                }
            }
        }
    }

    /// Wrap a stream so the TPM debit reconciles against the usage reported
    /// on the final event once the caller drains it.
    fn reconciling(
        &self,
        mut stream: SseStream,
        limit_key: String,
        params: LimitParams,
        estimated: u64,
    ) -> SseStream {
        let cancel = stream.cancellation();
        let shared = self.shared.clone();
        let wrapped = async_stream::stream! {
            let mut last_usage = None;
            while let Some(item) = stream.recv().await {
                if let Ok(envelope) = &item {
                    if let Some(usage) = envelope.usage() {
                        last_usage = Some(usage);
                    }
                }
                yield item;
            }
            if let Some(usage) = last_usage {
                shared
                    .limiter
                    .reconcile(&limit_key, params, estimated, usage.total_tokens)
                    .await;
            }
        };
        SseStream::from_boxed(wrapped.boxed(), cancel)
    }
}

/// Set `extra_parameters.request_source`, preserving caller-supplied keys.
fn inject_request_source(body: &mut serde_json::Value, source: &str) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let extra = obj
        .entry("extra_parameters".to_string())
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    if let Some(map) = extra.as_object_mut() {
        map.entry("request_source".to_string())
            .or_insert_with(|| serde_json::Value::String(source.to_string()));
    }
}

/// Apply the per-endpoint input budget to a `messages` conversation.
fn truncate_body_messages(body: &mut serde_json::Value, path: &str) {
    let (max_chars, max_tokens) = endpoints::input_limits(path);
    let Some(messages) = body.get_mut("messages").and_then(serde_json::Value::as_array_mut)
    else {
        return;
    };
    let sizes: Vec<(usize, u64)> = messages
        .iter()
        .map(|m| {
            let content = m.get("content").and_then(serde_json::Value::as_str).unwrap_or("");
            (content.chars().count(), tokens::estimate_tokens(content))
        })
        .collect();
    let dropped = tokens::head_drop_count(&sizes, max_chars, max_tokens);
    messages.drain(..dropped);
}

/// Pre-call TPM debit estimate over the textual request fields.
fn estimate_request_tokens(body: &serde_json::Value) -> u64 {
    let mut total = 0;
    if let Some(messages) = body.get("messages").and_then(serde_json::Value::as_array) {
        for message in messages {
            if let Some(content) = message.get("content").and_then(serde_json::Value::as_str) {
                total += tokens::estimate_tokens(content);
            }
        }
    }
    for key in ["prompt", "query", "system"] {
        if let Some(text) = body.get(key).and_then(serde_json::Value::as_str) {
            total += tokens::estimate_tokens(text);
        }
    }
    for key in ["input", "documents"] {
        if let Some(items) = body.get(key).and_then(serde_json::Value::as_array) {
            for item in items {
                if let Some(text) = item.as_str() {
                    total += tokens::estimate_tokens(text);
                }
            }
        }
    }
    total
}
