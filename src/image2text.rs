//! Image understanding capability client.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::limiter::LimitParams;
use crate::model::{Capability, Usage};
use crate::pipeline::{CallSpec, Pipeline};
use crate::transport::ResponseStream;

const DEFAULT_MODEL: &str = "Fuyu-8B";

#[derive(Debug, Clone, Default, Serialize)]
pub struct Image2TextRequest {
    #[serde(skip)]
    pub model: Option<String>,
    #[serde(skip)]
    pub endpoint: Option<String>,
    pub prompt: String,
    /// Base64-encoded image bytes
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_parameters: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl Image2TextRequest {
    /// Build a request from a prompt and already-encoded image data.
    pub fn new(prompt: impl Into<String>, image: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), image: image.into(), ..Default::default() }
    }

    /// Build a request from a prompt and raw image bytes.
    pub fn from_bytes(prompt: impl Into<String>, image: &[u8]) -> Self {
        Self::new(prompt, BASE64.encode(image))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Image2TextResponse {
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
pub struct Image2Text {
    pipeline: Pipeline,
    model: Option<String>,
    endpoint: Option<String>,
    limit_key: Option<String>,
    limit_params: Option<LimitParams>,
}

impl Image2Text {
    pub(crate) fn new(pipeline: Pipeline) -> Self {
        Self { pipeline, model: None, endpoint: None, limit_key: None, limit_params: None }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
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

    pub async fn models(&self) -> Vec<String> {
        self.pipeline.registry().models(Capability::Image2Text).await
    }

    fn spec(&self, request: &Image2TextRequest) -> Result<CallSpec> {
        let body = serde_json::to_value(request).map_err(|e| Error::Internal {
            detail: format!("failed to serialize request: {e}"),
        })?;
        Ok(CallSpec {
            capability: Capability::Image2Text,
            model: request
                .model
                .clone()
                .or_else(|| self.model.clone())
                .or_else(|| Some(DEFAULT_MODEL.to_string())),
            endpoint: request.endpoint.clone().or_else(|| self.endpoint.clone()),
            body,
            limit_key: self.limit_key.clone(),
            limit_params: self.limit_params,
            cancel: request.cancellation.clone().unwrap_or_default(),
        })
    }

    pub async fn execute(&self, request: Image2TextRequest) -> Result<Image2TextResponse> {
        let envelope = self.pipeline.execute(self.spec(&request)?).await?;
        envelope.parse()
    }

    pub async fn stream(
        &self,
        request: Image2TextRequest,
    ) -> Result<ResponseStream<Image2TextResponse>> {
        let stream = self.pipeline.stream(self.spec(&request)?).await?;
        Ok(ResponseStream::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_bytes_encodes_base64() {
        let request = Image2TextRequest::from_bytes("describe", b"\x89PNG");
        assert_eq!(request.image, BASE64.encode(b"\x89PNG"));
    }
}
