//! SDK entry point.

use std::sync::Arc;

use reqwest::ClientBuilder;

use crate::auth::CredentialManager;
use crate::chat::ChatCompletion;
use crate::completion::Completion;
use crate::config::{self, ConfigOverrides};
use crate::console::ConsoleClient;
use crate::embedding::Embedding;
use crate::endpoints::EndpointRegistry;
use crate::error::{Error, Result};
use crate::image2text::Image2Text;
use crate::limiter::{RateLimiter, SharedStore};
use crate::pipeline::{Pipeline, Shared};
use crate::plugin::Plugin;
use crate::reranker::Reranker;
use crate::text2image::Text2Image;
use crate::transport::Transport;

/// Builder for a [`Qianfan`] handle, layering programmatic settings over the
/// environment and dotfile.
#[derive(Debug, Default)]
pub struct QianfanBuilder {
    overrides: ConfigOverrides,
    store: Option<Arc<dyn SharedStore>>,
}

impl QianfanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admin access key pair, enabling signed requests and console APIs.
    pub fn with_access_key(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.overrides.access_key = Some(access_key.into());
        self.overrides.secret_key = Some(secret_key.into());
        self
    }

    /// Application key pair, exchanged for a bearer token.
    pub fn with_app_key(mut self, ak: impl Into<String>, sk: impl Into<String>) -> Self {
        self.overrides.ak = Some(ak.into());
        self.overrides.sk = Some(sk.into());
        self
    }

    /// Pre-minted bearer token; disables refresh.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.overrides.access_token = Some(token.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.overrides.base_url = Some(base_url.into());
        self
    }

    pub fn with_console_base_url(mut self, console_base_url: impl Into<String>) -> Self {
        self.overrides.console_base_url = Some(console_base_url.into());
        self
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.overrides.retry_count = Some(count);
        self
    }

    pub fn with_retry_timeout(mut self, seconds: f64) -> Self {
        self.overrides.retry_timeout = Some(seconds);
        self
    }

    pub fn with_retry_backoff_factor(mut self, factor: f64) -> Self {
        self.overrides.retry_backoff_factor = Some(factor);
        self
    }

    pub fn with_retry_max_wait_interval(mut self, seconds: f64) -> Self {
        self.overrides.retry_max_wait_interval = Some(seconds);
        self
    }

    pub fn with_qps_limit(mut self, qps: f64) -> Self {
        self.overrides.qps_limit = Some(qps);
        self
    }

    pub fn with_rpm_limit(mut self, rpm: u64) -> Self {
        self.overrides.rpm_limit = Some(rpm);
        self
    }

    pub fn with_tpm_limit(mut self, tpm: u64) -> Self {
        self.overrides.tpm_limit = Some(tpm);
        self
    }

    pub fn with_access_token_refresh_min_interval(mut self, seconds: u64) -> Self {
        self.overrides.access_token_refresh_min_interval = Some(seconds);
        self
    }

    /// Bypass authorization entirely (mock servers and tests).
    pub fn with_no_auth(mut self, no_auth: bool) -> Self {
        self.overrides.no_auth = Some(no_auth);
        self
    }

    /// Override the version indicator sent with every request.
    pub fn with_request_source(mut self, source: impl Into<String>) -> Self {
        self.overrides.request_source = Some(source.into());
        self
    }

    /// Coordinate rate-limit buckets across processes through `store`.
    pub fn with_shared_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Qianfan> {
        // eager validation of the merged configuration
        config::resolve(&self.overrides)?;

        let http = ClientBuilder::new()
            .build()
            .map_err(|source| Error::HttpClient { source })?;
        let shared = Arc::new(Shared {
            overrides: self.overrides,
            credentials: CredentialManager::new(http.clone()),
            registry: EndpointRegistry::new(),
            limiter: RateLimiter::new(self.store),
            transport: Transport::new(http.clone()),
            console: ConsoleClient::new(http),
        });
        Ok(Qianfan { pipeline: Pipeline::new(shared) })
    }
}

/// Handle to the platform. Cheap to clone; capability clients created from
/// one handle share its credential cache, endpoint registry, and rate-limit
/// buckets.
#[derive(Debug, Clone)]
pub struct Qianfan {
    pipeline: Pipeline,
}

impl Qianfan {
    /// Build a handle from the environment and dotfile alone.
    pub fn new() -> Result<Self> {
        QianfanBuilder::new().build()
    }

    pub fn builder() -> QianfanBuilder {
        QianfanBuilder::new()
    }

    pub fn chat(&self) -> ChatCompletion {
        ChatCompletion::new(self.pipeline.clone())
    }

    pub fn completion(&self) -> Completion {
        Completion::new(self.pipeline.clone())
    }

    pub fn embedding(&self) -> Embedding {
        Embedding::new(self.pipeline.clone())
    }

    pub fn text2image(&self) -> Text2Image {
        Text2Image::new(self.pipeline.clone())
    }

    pub fn image2text(&self) -> Image2Text {
        Image2Text::new(self.pipeline.clone())
    }

    pub fn reranker(&self) -> Reranker {
        Reranker::new(self.pipeline.clone())
    }

    pub fn plugin(&self) -> Plugin {
        Plugin::new(self.pipeline.clone())
    }

    /// Force a re-fetch of the cached bearer token. Calls landing within the
    /// minimum refresh interval still observe the cached value.
    pub async fn refresh_access_token(&self) -> Result<()> {
        self.pipeline.refresh_credentials().await
    }

    pub(crate) fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_capability_clients() {
        let client = Qianfan::builder()
            .with_app_key("test-ak", "test-sk")
            .with_retry_count(2)
            .build()
            .unwrap();
        let _ = client.chat();
        let _ = client.completion();
        let _ = client.embedding();
        let _ = client.text2image();
        let _ = client.image2text();
        let _ = client.reranker();
        let _ = client.plugin();
    }

    #[test]
    fn handle_is_cheaply_cloneable() {
        let client = Qianfan::builder().with_access_token("tok").build().unwrap();
        let clone = client.clone();
        let _ = clone.chat();
    }
}
