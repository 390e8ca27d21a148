//! HTTP transport: JSON requests, SSE streams, response envelopes.

use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::model::Usage;

/// Telemetry header carrying the SDK version indicator.
pub(crate) const REQUEST_SOURCE_HEADER: &str = "request_source";

const SSE_DONE: &str = "[DONE]";

/// A fully resolved outbound request. Built fresh per call; never reused
/// after being signed.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

impl RequestDescriptor {
    pub fn new(method: Method, url: Url, body: serde_json::Value) -> Self {
        Self { method, url, headers: HeaderMap::new(), body }
    }

    pub(crate) fn insert_header(&mut self, name: &'static str, value: &str) -> Result<()> {
        self.headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(value)
                .map_err(|source| Error::InvalidHeaderValue { source })?,
        );
        Ok(())
    }

    /// Replace any existing value of `key` in the query string.
    pub(crate) fn set_query_param(&mut self, key: &str, value: &str) {
        let kept: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(k, _)| k != key)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        self.url.query_pairs_mut().clear();
        for (k, v) in &kept {
            self.url.query_pairs_mut().append_pair(k, v);
        }
        self.url.query_pairs_mut().append_pair(key, value);
        if self.url.query() == Some("") {
            self.url.set_query(None);
        }
    }
}

/// One platform response, either a whole body or a single stream event.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub headers: HeaderMap,
    /// Raw body bytes, kept for forward compatibility with unknown fields
    pub body: Vec<u8>,
    pub json: Option<serde_json::Value>,
    /// Platform-level error code, if the body carried one
    pub error_code: Option<i64>,
    pub error_msg: Option<String>,
}

impl ResponseEnvelope {
    pub(crate) fn from_bytes(status: u16, headers: HeaderMap, body: Vec<u8>) -> Self {
        let json: Option<serde_json::Value> = serde_json::from_slice(&body).ok();
        let (error_code, error_msg) = match &json {
            Some(value) => find_error(value),
            None => (None, None),
        };
        Self { status, headers, body, json, error_code, error_msg }
    }

    /// Deserialize the body into a typed response.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        match &self.json {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|source| Error::MalformedResponse { source }),
            None => serde_json::from_slice(&self.body)
                .map_err(|source| Error::MalformedResponse { source }),
        }
    }

    /// Server-reported token usage, when present.
    pub fn usage(&self) -> Option<Usage> {
        let value = self.json.as_ref()?.get("usage")?;
        serde_json::from_value(value.clone()).ok()
    }

    /// The typed error this envelope represents, assuming it carries one.
    pub(crate) fn api_error(&self) -> Error {
        match self.error_code {
            Some(code) => Error::Api {
                code,
                message: self.error_msg.clone().unwrap_or_default(),
            },
            None => Error::Api {
                code: i64::from(self.status),
                message: format!(
                    "http status {}: {}",
                    self.status,
                    String::from_utf8_lossy(&self.body)
                ),
            },
        }
    }
}

/// Non-zero `error_code`/`error_msg` may appear at the top level or nested
/// one level down (console responses wrap them under `error`).
fn find_error(value: &serde_json::Value) -> (Option<i64>, Option<String>) {
    fn read(obj: &serde_json::Value) -> (Option<i64>, Option<String>) {
        let code = obj.get("error_code").and_then(serde_json::Value::as_i64).filter(|c| *c != 0);
        let msg = obj.get("error_msg").and_then(serde_json::Value::as_str).map(str::to_string);
        (code, msg)
    }
    let (code, msg) = read(value);
    if code.is_some() {
        return (code, msg);
    }
    if let Some(nested) = value.get("error") {
        let (code, msg) = read(nested);
        if code.is_some() {
            return (code, msg);
        }
    }
    (None, None)
}

/// Result of opening a streaming request: servers answer errors with a plain
/// JSON body instead of an event stream.
pub(crate) enum StreamOutcome {
    Json(ResponseEnvelope),
    Events(SseStream),
}

/// Lazy sequence of stream events. Finite, not restartable.
pub struct SseStream {
    inner: BoxStream<'static, Result<ResponseEnvelope>>,
    cancel: CancellationToken,
    done: bool,
}

impl std::fmt::Debug for SseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseStream").field("done", &self.done).finish_non_exhaustive()
    }
}

impl SseStream {
    pub(crate) fn from_boxed(
        inner: BoxStream<'static, Result<ResponseEnvelope>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { inner, cancel, done: false }
    }

    /// Next event, or `None` at end of stream. After an error or the end
    /// marker, every subsequent call returns `None`.
    pub async fn recv(&mut self) -> Option<Result<ResponseEnvelope>> {
        if self.done {
            return None;
        }
        let item = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Some(Err(Error::Cancelled)),
            item = self.inner.next() => item,
        };
        match item {
            None => {
                self.done = true;
                None
            }
            Some(Err(err)) => {
                self.done = true;
                Some(Err(err))
            }
            Some(Ok(envelope)) => Some(Ok(envelope)),
        }
    }

    /// Handle that aborts the stream when fired.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn prepend(&mut self, envelope: ResponseEnvelope) {
        let rest = std::mem::replace(&mut self.inner, futures::stream::empty().boxed());
        self.inner = futures::stream::once(async move { Ok(envelope) }).chain(rest).boxed();
    }
}

/// Typed view over an [`SseStream`], parsing each event into a capability
/// response.
pub struct ResponseStream<T> {
    inner: SseStream,
    _marker: std::marker::PhantomData<T>,
}

impl<T> std::fmt::Debug for ResponseStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream").field("inner", &self.inner).finish()
    }
}

impl<T: serde::de::DeserializeOwned> ResponseStream<T> {
    pub(crate) fn new(inner: SseStream) -> Self {
        Self { inner, _marker: std::marker::PhantomData }
    }

    /// Next parsed event, or `None` at end of stream.
    pub async fn recv(&mut self) -> Option<Result<T>> {
        match self.inner.recv().await? {
            Ok(envelope) => Some(envelope.parse()),
            Err(err) => Some(Err(err)),
        }
    }

    /// Handle that aborts the stream when fired.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancellation()
    }

    /// Collect the remaining events, failing on the first stream error.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut events = Vec::new();
        while let Some(item) = self.recv().await {
            events.push(item?);
        }
        Ok(events)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Transport {
    http: Client,
}

impl Transport {
    pub(crate) fn new(http: Client) -> Self {
        Self { http }
    }

    fn build(&self, request: &RequestDescriptor) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if !request.body.is_null() {
            builder = builder.json(&request.body);
        }
        builder
    }

    /// Send and read the entire response into an envelope.
    pub(crate) async fn send(
        &self,
        request: &RequestDescriptor,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ResponseEnvelope> {
        let url = request.url.to_string();
        let builder = self.build(request);
        let perform = async {
            let response = builder
                .send()
                .await
                .map_err(|source| Error::Transport { source, url: url.clone() })?;
            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|source| Error::Transport { source, url: url.clone() })?;
            Ok(ResponseEnvelope::from_bytes(status, headers, body.to_vec()))
        };
        let guarded = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = perform => result,
            }
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .map_err(|_| Error::Timeout { seconds: limit.as_secs_f64() })?,
            None => guarded.await,
        }
    }

    /// Open a streaming request and parse the response as server-sent events.
    pub(crate) async fn stream(
        &self,
        request: &RequestDescriptor,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome> {
        let url = request.url.to_string();
        let builder = self.build(request);
        let connect = async {
            builder
                .send()
                .await
                .map_err(|source| Error::Transport { source, url: url.clone() })
        };
        let guarded = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                result = connect => result,
            }
        };
        let response = match timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .map_err(|_| Error::Timeout { seconds: limit.as_secs_f64() })?,
            None => guarded.await,
        }?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if !content_type.starts_with("text/event-stream") {
            let body = response
                .bytes()
                .await
                .map_err(|source| Error::Transport { source, url })?;
            return Ok(StreamOutcome::Json(ResponseEnvelope::from_bytes(
                status,
                headers,
                body.to_vec(),
            )));
        }

        let mut events = response.bytes_stream().eventsource();
        let event_headers = headers.clone();
        let inner = async_stream::stream! {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        let data = event.data.trim().to_string();
                        if data == SSE_DONE {
                            break;
                        }
                        if data.is_empty() {
                            continue;
                        }
                        yield Ok(ResponseEnvelope::from_bytes(
                            status,
                            event_headers.clone(),
                            data.into_bytes(),
                        ));
                    }
                    Err(source) => {
                        yield Err(Error::StreamPart { source });
                        break;
                    }
                }
            }
        };
        Ok(StreamOutcome::Events(SseStream {
            inner: inner.boxed(),
            cancel: cancel.clone(),
            done: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_extracts_top_level_error() {
        let env = ResponseEnvelope::from_bytes(
            200,
            HeaderMap::new(),
            br#"{"error_code": 18, "error_msg": "qps limit"}"#.to_vec(),
        );
        assert_eq!(env.error_code, Some(18));
        assert_eq!(env.error_msg.as_deref(), Some("qps limit"));
    }

    #[test]
    fn envelope_extracts_nested_error() {
        let env = ResponseEnvelope::from_bytes(
            200,
            HeaderMap::new(),
            br#"{"error": {"error_code": 500000, "error_msg": "internal"}}"#.to_vec(),
        );
        assert_eq!(env.error_code, Some(500000));
    }

    #[test]
    fn envelope_ignores_zero_error_code() {
        let env = ResponseEnvelope::from_bytes(
            200,
            HeaderMap::new(),
            br#"{"error_code": 0, "result": "ok"}"#.to_vec(),
        );
        assert_eq!(env.error_code, None);
    }

    #[test]
    fn envelope_keeps_raw_body_on_parse_failure() {
        let env = ResponseEnvelope::from_bytes(502, HeaderMap::new(), b"<html>".to_vec());
        assert!(env.json.is_none());
        assert_eq!(env.body, b"<html>");
    }

    #[test]
    fn set_query_param_replaces_existing() {
        let mut req = RequestDescriptor::new(
            Method::POST,
            Url::parse("https://example.com/p?access_token=old&x=1").unwrap(),
            serde_json::Value::Null,
        );
        req.set_query_param("access_token", "new");
        let pairs: Vec<(String, String)> = req
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(pairs.iter().filter(|(k, _)| k == "access_token").count(), 1);
        assert!(pairs.contains(&("access_token".into(), "new".into())));
        assert!(pairs.contains(&("x".into(), "1".into())));
    }
}
