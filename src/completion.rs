//! Text completion capability client.
//!
//! Only a handful of hosted models expose a native completion endpoint; for
//! models that only have a chat mapping the prompt is wrapped as a single
//! user message and routed through the chat capability, matching platform
//! behavior.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::limiter::LimitParams;
use crate::model::{Capability, Usage};
use crate::pipeline::{CallSpec, Pipeline};
use crate::transport::ResponseStream;

const DEFAULT_MODEL: &str = "CodeLlama-7b-Instruct";

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionRequest {
    #[serde(skip)]
    pub model: Option<String>,
    #[serde(skip)]
    pub endpoint: Option<String>,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_score: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_parameters: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self { prompt: prompt.into(), ..Default::default() }
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
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub sentence_id: Option<i64>,
    pub is_end: Option<bool>,
    pub is_truncated: Option<bool>,
    pub result: String,
    pub usage: Usage,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pipeline: Pipeline,
    model: Option<String>,
    endpoint: Option<String>,
    limit_key: Option<String>,
    limit_params: Option<LimitParams>,
}

impl Completion {
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
        self.pipeline.registry().models(Capability::Completion).await
    }

    async fn spec(&self, request: &CompletionRequest) -> Result<CallSpec> {
        let endpoint = request.endpoint.clone().or_else(|| self.endpoint.clone());
        let model = request
            .model
            .clone()
            .or_else(|| self.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let mut body = serde_json::to_value(request).map_err(|e| Error::Internal {
            detail: format!("failed to serialize request: {e}"),
        })?;

        let capability = if endpoint.is_some()
            || self.pipeline.registry().resolve(Capability::Completion, &model).await.is_some()
        {
            Capability::Completion
        } else {
            // chat-backed model: rewrite the prompt as a one-message chat
            if let Some(obj) = body.as_object_mut() {
                let prompt = obj
                    .remove("prompt")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                obj.insert(
                    "messages".to_string(),
                    serde_json::json!([{"role": "user", "content": prompt}]),
                );
            }
            Capability::Chat
        };

        Ok(CallSpec {
            capability,
            model: Some(model),
            endpoint,
            body,
            limit_key: self.limit_key.clone(),
            limit_params: self.limit_params,
            cancel: request.cancellation.clone().unwrap_or_default(),
        })
    }

    pub async fn execute(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let spec = self.spec(&request).await?;
        let envelope = self.pipeline.execute(spec).await?;
        envelope.parse()
    }

    pub async fn stream(
        &self,
        request: CompletionRequest,
    ) -> Result<ResponseStream<CompletionResponse>> {
        let spec = self.spec(&request).await?;
        let stream = self.pipeline.stream(spec).await?;
        Ok(ResponseStream::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_serializes_into_body() {
        let request = CompletionRequest::new("SELECT").with_model("SQLCoder-7B");
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["prompt"], "SELECT");
        assert!(body.get("model").is_none());
    }
}
