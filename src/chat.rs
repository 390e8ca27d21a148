//! Chat completion capability client.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::limiter::LimitParams;
use crate::model::{Capability, Function, FunctionCall, Message, SearchInfo, Usage};
use crate::pipeline::{CallSpec, Pipeline};
use crate::transport::ResponseStream;

const DEFAULT_MODEL: &str = "ERNIE-Bot-turbo";

/// Request for a chat completion.
///
/// `model` and `endpoint` route the request and never appear in the body;
/// every other field is serialized as-is.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatRequest {
    #[serde(skip)]
    pub model: Option<String>,
    #[serde(skip)]
    pub endpoint: Option<String>,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub functions: Vec<Function>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub penalty_score: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_search: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_citation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Extra body fields forwarded verbatim; `request_source` is added here
    /// unless already present
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_parameters: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages, ..Default::default() }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }
}

/// Chat completion response; for streams, one event's worth.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    /// Index of this event within a stream
    pub sentence_id: Option<i64>,
    pub is_end: Option<bool>,
    pub is_truncated: Option<bool>,
    pub result: String,
    pub need_clear_history: Option<bool>,
    pub ban_round: Option<i64>,
    pub usage: Usage,
    pub function_call: Option<FunctionCall>,
    pub search_info: Option<SearchInfo>,
    /// Fields this SDK version does not know about yet
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Client for the chat capability. Cheap to clone; per-instance overrides
/// apply to every call made through it.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pipeline: Pipeline,
    model: Option<String>,
    endpoint: Option<String>,
    limit_key: Option<String>,
    limit_params: Option<LimitParams>,
}

impl ChatCompletion {
    pub(crate) fn new(pipeline: Pipeline) -> Self {
        Self { pipeline, model: None, endpoint: None, limit_key: None, limit_params: None }
    }

    /// Pin a model for every call through this instance.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Pin a custom endpoint, bypassing model resolution.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Group this instance's calls under a custom rate-limit key.
    pub fn with_limit_key(mut self, key: impl Into<String>) -> Self {
        self.limit_key = Some(key.into());
        self
    }

    /// Local rate-limit parameters for this instance.
    pub fn with_limit_params(mut self, params: LimitParams) -> Self {
        self.limit_params = Some(params);
        self
    }

    /// Model names the built-in and refreshed catalogs know about.
    pub async fn models(&self) -> Vec<String> {
        self.pipeline.registry().models(Capability::Chat).await
    }

    fn spec(&self, request: &ChatRequest) -> Result<CallSpec> {
        let body = serde_json::to_value(request).map_err(|e| Error::Internal {
            detail: format!("failed to serialize request: {e}"),
        })?;
        Ok(CallSpec {
            capability: Capability::Chat,
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

    /// Send the conversation and wait for the whole response.
    pub async fn execute(&self, request: ChatRequest) -> Result<ChatResponse> {
        let envelope = self.pipeline.execute(self.spec(&request)?).await?;
        envelope.parse()
    }

    /// Send the conversation and stream partial responses.
    pub async fn stream(&self, request: ChatRequest) -> Result<ResponseStream<ChatResponse>> {
        let stream = self.pipeline.stream(self.spec(&request)?).await?;
        Ok(ResponseStream::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_excludes_routing_fields() {
        let request = ChatRequest::new(vec![Message::user("hi")])
            .with_model("ERNIE-Speed")
            .with_temperature(0.5);
        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("model").is_none());
        assert!(body.get("endpoint").is_none());
        assert_eq!(body["temperature"], 0.5);
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn response_tolerates_unknown_fields() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"id": "as-1", "result": "hello", "brand_new_field": {"x": 1}}"#,
        )
        .unwrap();
        assert_eq!(response.result, "hello");
        assert!(response.extra.contains_key("brand_new_field"));
    }
}
