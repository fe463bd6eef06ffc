use std::time::Duration;

use moka::future::Cache as MokaCache;
use shared::Provider;

/// Short-lived provider lookup cache in front of the registry. Entries are
/// invalidated on every status change, so the TTL only bounds how long an
/// out-of-band edit (e.g. a manual SQL update) can go unnoticed.
#[derive(Clone)]
pub struct Cache {
    pub providers: MokaCache<String, Provider>,
}

impl Cache {
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            providers: MokaCache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn get_provider(&self, provider_id: &str) -> Option<Provider> {
        self.providers.get(provider_id).await
    }

    pub async fn set_provider(&self, provider: Provider) {
        self.providers
            .insert(provider.provider_id.clone(), provider)
            .await;
    }

    pub async fn invalidate_provider(&self, provider_id: &str) {
        self.providers.invalidate(provider_id).await;
    }

    pub async fn get_stats(&self) -> CacheStats {
        self.providers.run_pending_tasks().await;
        CacheStats {
            provider_entries: self.providers.entry_count(),
        }
    }
}

#[derive(Debug, serde::Serialize)]
pub struct CacheStats {
    pub provider_entries: u64,
}
