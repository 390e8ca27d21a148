//! Reranker capability client.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::limiter::LimitParams;
use crate::model::{Capability, Usage};
use crate::pipeline::{CallSpec, Pipeline};

const DEFAULT_MODEL: &str = "bce-reranker-base_v1";

#[derive(Debug, Clone, Default, Serialize)]
pub struct RerankerRequest {
    #[serde(skip)]
    pub model: Option<String>,
    #[serde(skip)]
    pub endpoint: Option<String>,
    pub query: String,
    pub documents: Vec<String>,
    /// How many of the highest-scoring documents to return
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_n: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_parameters: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl RerankerRequest {
    pub fn new(query: impl Into<String>, documents: Vec<String>) -> Self {
        Self { query: query.into(), documents, ..Default::default() }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = Some(top_n);
        self
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RerankResult {
    pub document: String,
    pub relevance_score: f64,
    pub index: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RerankerResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub results: Vec<RerankResult>,
    pub usage: Usage,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Reranker {
    pipeline: Pipeline,
    model: Option<String>,
    endpoint: Option<String>,
    limit_key: Option<String>,
    limit_params: Option<LimitParams>,
}

impl Reranker {
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
        self.pipeline.registry().models(Capability::Reranker).await
    }

    pub async fn execute(&self, request: RerankerRequest) -> Result<RerankerResponse> {
        let body = serde_json::to_value(&request).map_err(|e| Error::Internal {
            detail: format!("failed to serialize request: {e}"),
        })?;
        let spec = CallSpec {
            capability: Capability::Reranker,
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
        };
        let envelope = self.pipeline.execute(spec).await?;
        envelope.parse()
    }
}
