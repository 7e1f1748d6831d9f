use std::sync::Arc;
use std::time::Duration;

use helmsman_core::config::CacheConfig;
use helmsman_core::domain::tool::{ToolDescriptor, ToolParameters, ToolResult};
use helmsman_core::fingerprint::tool_cache_key;
use helmsman_core::store::AtomicStore;
use tracing::{debug, warn};

/// Cache-aside storage for results of cacheable tools. Misses and store
/// failures are indistinguishable to callers.
pub struct ToolCache {
    store: Arc<dyn AtomicStore>,
    enabled: bool,
    default_ttl: Duration,
}

impl ToolCache {
    pub fn new(store: Arc<dyn AtomicStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            enabled: config.enabled,
            default_ttl: Duration::from_secs(config.default_ttl_secs),
        }
    }

    pub fn applies_to(&self, descriptor: &ToolDescriptor) -> bool {
        self.enabled && descriptor.cacheable
    }

    pub async fn get(
        &self,
        descriptor: &ToolDescriptor,
        parameters: &ToolParameters,
    ) -> Option<ToolResult> {
        let key = tool_cache_key(&descriptor.name, parameters);
        let raw = match self.store.get(&key).await {
            Ok(raw) => raw?,
            Err(error) => {
                warn!(
                    event_name = "agent.cache.read_failed",
                    tool = %descriptor.name,
                    error = %error,
                    "cache read failed; executing tool"
                );
                return None;
            }
        };

        match serde_json::from_str::<ToolResult>(&raw) {
            Ok(result) => Some(result),
            Err(error) => {
                debug!(
                    event_name = "agent.cache.corrupt_entry",
                    tool = %descriptor.name,
                    error = %error,
                    "ignoring unreadable cache entry"
                );
                None
            }
        }
    }

    /// Stores successful results only.
    pub async fn put(
        &self,
        descriptor: &ToolDescriptor,
        parameters: &ToolParameters,
        result: &ToolResult,
    ) {
        if !result.success {
            return;
        }

        let encoded = match serde_json::to_string(result) {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(event_name = "agent.cache.encode_failed", tool = %descriptor.name, error = %error, "cache write skipped");
                return;
            }
        };

        let ttl = descriptor.cache_ttl_secs.map(Duration::from_secs).unwrap_or(self.default_ttl);
        let key = tool_cache_key(&descriptor.name, parameters);
        if let Err(error) = self.store.set(&key, &encoded, Some(ttl)).await {
            warn!(
                event_name = "agent.cache.write_failed",
                tool = %descriptor.name,
                error = %error,
                "cache write failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use helmsman_core::config::CacheConfig;
    use helmsman_core::domain::schema::ParameterSchema;
    use helmsman_core::domain::tool::{ToolDescriptor, ToolParameters, ToolResult};
    use helmsman_core::store::InMemoryAtomicStore;
    use serde_json::json;

    use super::ToolCache;

    fn params(branch: &str) -> ToolParameters {
        let mut parameters = ToolParameters::new();
        parameters.insert("branch".to_string(), json!(branch));
        parameters
    }

    #[tokio::test(start_paused = true)]
    async fn successful_results_round_trip_until_ttl() {
        let cache = ToolCache::new(
            Arc::new(InMemoryAtomicStore::new()),
            &CacheConfig { enabled: true, default_ttl_secs: 300 },
        );
        let descriptor =
            ToolDescriptor::new("ci_status", "CI status", ParameterSchema::object()).cacheable(Some(30));
        let result = ToolResult::ok(json!({"state": "green"})).with_display_text("main is green");

        cache.put(&descriptor, &params("main"), &result).await;
        assert_eq!(cache.get(&descriptor, &params("main")).await, Some(result));
        assert_eq!(cache.get(&descriptor, &params("dev")).await, None);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(cache.get(&descriptor, &params("main")).await, None);
    }

    #[tokio::test]
    async fn failures_are_never_cached_and_disabled_cache_never_applies() {
        let store = Arc::new(InMemoryAtomicStore::new());
        let cache = ToolCache::new(store.clone(), &CacheConfig { enabled: true, default_ttl_secs: 300 });
        let descriptor =
            ToolDescriptor::new("ci_status", "CI status", ParameterSchema::object()).cacheable(None);

        cache.put(&descriptor, &params("main"), &ToolResult::failure("boom")).await;
        assert!(store.is_empty().await);

        let disabled = ToolCache::new(store, &CacheConfig { enabled: false, default_ttl_secs: 300 });
        assert!(cache.applies_to(&descriptor));
        assert!(!disabled.applies_to(&descriptor));
        let uncached = ToolDescriptor::new("ping", "Ping", ParameterSchema::object());
        assert!(!cache.applies_to(&uncached));
    }
}
