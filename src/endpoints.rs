//! The `(capability, model) → endpoint path` registry.
//!
//! Seeded from a built-in catalog; refreshed from the console service list
//! when admin credentials are available. A failed refresh never clobbers the
//! existing table.

use std::collections::HashMap;

use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::console::ConsoleClient;
use crate::error::Result;
use crate::model::Capability;

/// The table counts as stale (and a lookup miss may trigger a refresh) after
/// this many seconds.
const STALENESS_SECS: i64 = 3600;

use Capability::*;

/// Built-in model catalog. Aliases pointing at the same path are expected.
const BUILTIN: &[(Capability, &str, &str)] = &[
    (Chat, "ERNIE-Bot", "/chat/completions"),
    (Chat, "ERNIE-Bot-4", "/chat/completions_pro"),
    (Chat, "ERNIE-Bot-turbo", "/chat/eb-instant"),
    (Chat, "ERNIE-Lite-8K", "/chat/eb-instant"),
    (Chat, "ERNIE-3.5-8K", "/chat/completions"),
    (Chat, "ERNIE-4.0-8K", "/chat/completions_pro"),
    (Chat, "ERNIE-Speed", "/chat/ernie_speed"),
    (Chat, "ERNIE-Speed-128K", "/chat/ernie-speed-128k"),
    (Chat, "BLOOMZ-7B", "/chat/bloomz_7b1"),
    (Chat, "Llama-2-7B-Chat", "/chat/llama_2_7b"),
    (Chat, "Llama-2-13B-Chat", "/chat/llama_2_13b"),
    (Chat, "Llama-2-70B-Chat", "/chat/llama_2_70b"),
    (Chat, "Qianfan-Chinese-Llama-2-7B", "/chat/qianfan_chinese_llama_2_7b"),
    (Chat, "ChatGLM2-6B-32K", "/chat/chatglm2_6b_32k"),
    (Chat, "AquilaChat-7B", "/chat/aquilachat_7b"),
    (Chat, "Mixtral-8x7B-Instruct", "/chat/mixtral_8x7b_instruct"),
    (Completion, "SQLCoder-7B", "/completions/sqlcoder_7b"),
    (Completion, "CodeLlama-7b-Instruct", "/completions/codellama_7b_instruct"),
    (Embedding, "Embedding-V1", "/embeddings/embedding-v1"),
    (Embedding, "bge-large-zh", "/embeddings/bge_large_zh"),
    (Embedding, "bge-large-en", "/embeddings/bge_large_en"),
    (Embedding, "tao-8k", "/embeddings/tao_8k"),
    (Text2Image, "Stable-Diffusion-XL", "/text2image/sd_xl"),
    (Image2Text, "Fuyu-8B", "/image2text/fuyu_8b"),
    (Reranker, "bce-reranker-base_v1", "/reranker/bce_reranker_base"),
];

/// Input budgets for chat-style endpoints: (characters, tokens).
pub(crate) fn input_limits(path: &str) -> (usize, u64) {
    if path.contains("128k") {
        (516096, 126976)
    } else {
        (11200, 7168)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    /// Display-cased model name as published by the platform
    model: String,
    path: String,
}

#[derive(Debug, Default)]
struct Table {
    // model keys are lowercased for case-insensitive matching
    by_capability: HashMap<Capability, HashMap<String, Entry>>,
    last_refresh: Option<OffsetDateTime>,
}

#[derive(Debug)]
pub(crate) struct EndpointRegistry {
    table: RwLock<Table>,
    refresh_gate: Mutex<()>,
}

impl EndpointRegistry {
    pub(crate) fn new() -> Self {
        let mut table = Table::default();
        for (capability, model, path) in BUILTIN {
            table.by_capability.entry(*capability).or_default().insert(
                model.to_lowercase(),
                Entry { model: (*model).to_string(), path: (*path).to_string() },
            );
        }
        Self { table: RwLock::new(table), refresh_gate: Mutex::new(()) }
    }

    /// Endpoint path for `model`, matched case-insensitively.
    pub(crate) async fn resolve(&self, capability: Capability, model: &str) -> Option<String> {
        let table = self.table.read().await;
        table
            .by_capability
            .get(&capability)?
            .get(&model.to_lowercase())
            .map(|entry| entry.path.clone())
    }

    /// Resolve, attempting one registry refresh on a miss when admin
    /// credentials are present and the table is stale.
    pub(crate) async fn resolve_with_refresh(
        &self,
        capability: Capability,
        model: &str,
        console: &ConsoleClient,
        config: &Config,
    ) -> Option<String> {
        if let Some(path) = self.resolve(capability, model).await {
            return Some(path);
        }
        if config.has_admin_credentials() && self.is_stale().await {
            self.refresh(console, config).await;
        }
        self.resolve(capability, model).await
    }

    /// Known model names for a capability.
    pub(crate) async fn models(&self, capability: Capability) -> Vec<String> {
        let table = self.table.read().await;
        let mut names: Vec<String> = table
            .by_capability
            .get(&capability)
            .map(|entries| entries.values().map(|e| e.model.clone()).collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    async fn is_stale(&self) -> bool {
        let table = self.table.read().await;
        match table.last_refresh {
            None => true,
            Some(at) => {
                OffsetDateTime::now_utc() - at > TimeDuration::seconds(STALENESS_SECS)
            }
        }
    }

    /// Refresh from the console service list. Concurrent attempts collapse to
    /// one wire call; failures keep the previous table.
    pub(crate) async fn refresh(&self, console: &ConsoleClient, config: &Config) {
        let entered_at = OffsetDateTime::now_utc();
        let _gate = self.refresh_gate.lock().await;
        {
            // another caller finished a refresh while we waited
            let table = self.table.read().await;
            if let Some(at) = table.last_refresh {
                if at >= entered_at {
                    return;
                }
            }
        }
        match console.service_list(config).await {
            Ok(mappings) => {
                let mut table = self.table.write().await;
                for mapping in mappings {
                    if mapping.path.is_empty() || mapping.model.is_empty() {
                        continue;
                    }
                    table.by_capability.entry(mapping.capability).or_default().insert(
                        mapping.model.to_lowercase(),
                        Entry { model: mapping.model, path: mapping.path },
                    );
                }
                table.last_refresh = Some(OffsetDateTime::now_utc());
            }
            Err(err) => {
                tracing::warn!(%err, "endpoint registry refresh failed; keeping current table");
            }
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_builtin_models_case_insensitively() {
        let registry = EndpointRegistry::new();
        assert_eq!(
            registry.resolve(Capability::Chat, "ERNIE-Speed").await.as_deref(),
            Some("/chat/ernie_speed")
        );
        assert_eq!(
            registry.resolve(Capability::Chat, "ernie-speed").await.as_deref(),
            Some("/chat/ernie_speed")
        );
        assert_eq!(registry.resolve(Capability::Chat, "no-such-model").await, None);
    }

    #[tokio::test]
    async fn turbo_and_lite_are_aliases() {
        let registry = EndpointRegistry::new();
        let turbo = registry.resolve(Capability::Chat, "ERNIE-Bot-turbo").await;
        let lite = registry.resolve(Capability::Chat, "ERNIE-Lite-8K").await;
        assert_eq!(turbo.as_deref(), Some("/chat/eb-instant"));
        assert_eq!(turbo, lite);
    }

    #[tokio::test]
    async fn models_lists_display_names() {
        let registry = EndpointRegistry::new();
        let models = registry.models(Capability::Embedding).await;
        assert!(models.contains(&"Embedding-V1".to_string()));
        assert!(models.contains(&"bge-large-zh".to_string()));
    }

    #[test]
    fn input_limits_scale_with_context() {
        assert_eq!(input_limits("/chat/ernie_speed"), (11200, 7168));
        assert_eq!(input_limits("/chat/ernie-speed-128k"), (516096, 126976));
    }
}
