//! Console (management) API client, used to refresh the endpoint registry.

use std::time::Duration;

use reqwest::{Client, Method};
use serde::Deserialize;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::model::Capability;
use crate::retry::{self, Classification};
use crate::signer;
use crate::transport::{RequestDescriptor, Transport};

const SERVICE_LIST_ROUTE: &str = "/wenxinworkshop/service/list";

/// One `(capability, model) → path` mapping learned from the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServiceMapping {
    pub capability: Capability,
    pub model: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct ServiceListResponse {
    #[serde(default)]
    result: ServiceListResult,
}

#[derive(Debug, Default, Deserialize)]
struct ServiceListResult {
    #[serde(default)]
    common: Vec<ServiceItem>,
    #[serde(default)]
    custom: Vec<ServiceItem>,
}

#[derive(Debug, Deserialize)]
struct ServiceItem {
    name: String,
    url: String,
}

/// Admin-signed console caller. All operations require the access key pair.
#[derive(Debug, Clone)]
pub(crate) struct ConsoleClient {
    transport: Transport,
}

impl ConsoleClient {
    pub(crate) fn new(http: Client) -> Self {
        Self { transport: Transport::new(http) }
    }

    /// List hosted services and derive endpoint mappings from their URLs.
    pub(crate) async fn service_list(&self, config: &Config) -> Result<Vec<ServiceMapping>> {
        let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key)
        else {
            return Err(Error::CredentialsMissing);
        };

        let url = Url::parse(&config.console_base_url)
            .and_then(|u| u.join(SERVICE_LIST_ROUTE))
            .map_err(|source| Error::ConstructUrl {
                source,
                suffix: SERVICE_LIST_ROUTE.to_string(),
            })?;

        let policy = config.console_retry;
        let cancel = CancellationToken::new();
        let mut attempt: u32 = 0;
        loop {
            let mut request =
                RequestDescriptor::new(Method::POST, url.clone(), serde_json::json!({}));
            request.insert_header("content-type", "application/json")?;
            signer::sign(
                &mut request,
                access_key,
                secret_key,
                config.sign_expiration_sec,
                OffsetDateTime::now_utc(),
            )?;

            let timeout = (policy.timeout > 0.0).then(|| Duration::from_secs_f64(policy.timeout));
            let envelope = self.transport.send(&request, timeout, &cancel).await?;
            match retry::classify(&envelope) {
                Classification::Success => {
                    let parsed: ServiceListResponse = envelope.parse()?;
                    return Ok(mappings_from(parsed));
                }
                Classification::Retryable if policy.attempts_remaining(attempt) => {
                    let wait = policy.backoff(attempt);
                    tracing::debug!(attempt, ?wait, "console call retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                _ => return Err(envelope.api_error()),
            }
        }
    }
}

fn mappings_from(response: ServiceListResponse) -> Vec<ServiceMapping> {
    response
        .result
        .common
        .into_iter()
        .chain(response.result.custom)
        .filter_map(|item| mapping_from_item(&item.name, &item.url))
        .collect()
}

/// A service URL ends `…/{api-type}/{endpoint}`; everything else is ignored.
fn mapping_from_item(name: &str, url: &str) -> Option<ServiceMapping> {
    let parsed = Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.filter(|s| !s.is_empty()).collect();
    let &[.., api_type, endpoint] = &segments[..] else {
        return None;
    };
    let capability = Capability::from_api_type(api_type)?;
    if endpoint.is_empty() || name.is_empty() {
        return None;
    }
    Some(ServiceMapping {
        capability,
        model: name.to_string(),
        path: format!("/{api_type}/{endpoint}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_parsed_from_service_url() {
        let mapping = mapping_from_item(
            "ERNIE-99",
            "https://aip.baidubce.com/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/eb99",
        )
        .unwrap();
        assert_eq!(mapping.capability, Capability::Chat);
        assert_eq!(mapping.model, "ERNIE-99");
        assert_eq!(mapping.path, "/chat/eb99");
    }

    #[test]
    fn unknown_api_type_is_skipped() {
        assert!(mapping_from_item("X", "https://aip.baidubce.com/v1/wenxin/x").is_none());
        assert!(mapping_from_item("X", "not a url").is_none());
        assert!(mapping_from_item("", "https://a.com/chat/x").is_none());
    }
}
