//! Plugin capability client.
//!
//! Plugin services have no model catalog; every call addresses a deployed
//! plugin service by its endpoint name.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::limiter::LimitParams;
use crate::model::{Capability, Usage};
use crate::pipeline::{CallSpec, Pipeline};
use crate::transport::ResponseStream;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PluginRequest {
    #[serde(skip)]
    pub endpoint: Option<String>,
    pub query: String,
    /// Plugin names to enable for this call
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verbose: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_parameters: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl PluginRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self { query: query.into(), ..Default::default() }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_plugins(mut self, plugins: Vec<String>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub sentence_id: Option<i64>,
    pub is_end: Option<bool>,
    pub result: String,
    pub usage: Usage,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Plugin {
    pipeline: Pipeline,
    endpoint: Option<String>,
    limit_key: Option<String>,
    limit_params: Option<LimitParams>,
}

impl Plugin {
    pub(crate) fn new(pipeline: Pipeline) -> Self {
        Self { pipeline, endpoint: None, limit_key: None, limit_params: None }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_limit_key(mut self, key: impl Into<String>) -> Self {
        self.limit_key = Some(key.into());
        self
    }

    pub fn with_limit_params(mut self, params: LimitParams) -> Self {
        self.limit_params = Some(params);
        self
    }

    fn spec(&self, request: &PluginRequest) -> Result<CallSpec> {
        let endpoint = request
            .endpoint
            .clone()
            .or_else(|| self.endpoint.clone())
            .ok_or_else(|| Error::InvalidConfig {
                key: "endpoint".to_string(),
                reason: "a plugin call requires a service endpoint".to_string(),
            })?;
        let body = serde_json::to_value(request).map_err(|e| Error::Internal {
            detail: format!("failed to serialize request: {e}"),
        })?;
        Ok(CallSpec {
            capability: Capability::Plugin,
            model: None,
            endpoint: Some(endpoint),
            body,
            limit_key: self.limit_key.clone(),
            limit_params: self.limit_params,
            cancel: request.cancellation.clone().unwrap_or_default(),
        })
    }

    pub async fn execute(&self, request: PluginRequest) -> Result<PluginResponse> {
        let envelope = self.pipeline.execute(self.spec(&request)?).await?;
        envelope.parse()
    }

    pub async fn stream(&self, request: PluginRequest) -> Result<ResponseStream<PluginResponse>> {
        let stream = self.pipeline.stream(self.spec(&request)?).await?;
        Ok(ResponseStream::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_endpoint_is_rejected() {
        let plugin = Plugin {
            pipeline: crate::client::QianfanBuilder::new()
                .with_no_auth(true)
                .build()
                .unwrap()
                .pipeline()
                .clone(),
            endpoint: None,
            limit_key: None,
            limit_params: None,
        };
        let err = plugin.spec(&PluginRequest::new("hi")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
