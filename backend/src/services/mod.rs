pub mod exchange_rate;
pub mod fraud_screen;
pub mod postback;
pub mod provider_monitor;
pub mod settlement;
pub mod verification;
pub mod wallet_reconciler;

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use shared::{Provider, ProviderStatus};

pub use exchange_rate::{ExchangeRateCache, HttpRateSource, RateError, RateSource};
pub use settlement::{SettlementEngine, SettlementError, SettlementRequest};

use fraud_screen::FraudScreen;

use crate::{
    alerts::AlertPublisher,
    cache::Cache,
    clock::Clock,
    config::Config,
    database::Database,
    store::{AlertSink, LedgerStore, ProviderRegistry, StoreError, UserDirectory},
};

pub type PostbackLimiter = DefaultKeyedRateLimiter<IpAddr>;

const PROVIDER_CACHE_CAPACITY: u64 = 1_000;

/// The storage seams, all backed by the same store.
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub providers: Arc<dyn ProviderRegistry>,
    pub alerts: Arc<dyn AlertSink>,
    pub directory: Arc<dyn UserDirectory>,
}

impl Stores {
    pub fn postgres(database: Database) -> Self {
        let database = Arc::new(database);
        Self {
            ledger: database.clone(),
            providers: database.clone(),
            alerts: database.clone(),
            directory: database,
        }
    }

    #[cfg(test)]
    pub fn memory(store: Arc<crate::memory_store::MemoryStore>) -> Self {
        Self {
            ledger: store.clone(),
            providers: store.clone(),
            alerts: store.clone(),
            directory: store,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub cache: Cache,
    pub config: Config,
    pub rates: Arc<ExchangeRateCache>,
    pub settlement: Arc<SettlementEngine>,
    pub alerts: AlertPublisher,
    pub clock: Arc<dyn Clock>,
    pub postback_limiter: Arc<PostbackLimiter>,
}

impl AppState {
    pub fn new(
        config: Config,
        stores: Stores,
        rate_source: Arc<dyn RateSource>,
        alerts: AlertPublisher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rates = Arc::new(ExchangeRateCache::new(
            config.rates.clone(),
            rate_source,
            stores.ledger.clone(),
            alerts.clone(),
            clock.clone(),
        ));

        let screen = FraudScreen::new(
            config.fraud.clone(),
            stores.ledger.clone(),
            stores.directory.clone(),
            clock.clone(),
        );

        let settlement = Arc::new(SettlementEngine::new(
            config.settlement.clone(),
            stores.ledger.clone(),
            stores.directory.clone(),
            screen,
            rates.clone(),
            alerts.clone(),
            clock.clone(),
        ));

        let per_minute = NonZeroU32::new(config.postback_rate_limit_per_minute).unwrap_or(NonZeroU32::MIN);
        let postback_limiter = Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute)));

        let cache = Cache::new(
            PROVIDER_CACHE_CAPACITY,
            Duration::from_secs(config.provider_cache_ttl_seconds.max(1)),
        );

        Self {
            stores,
            cache,
            config,
            rates,
            settlement,
            alerts,
            clock,
            postback_limiter,
        }
    }

    /// Cached provider lookup.
    pub async fn provider(&self, provider_id: &str) -> Result<Option<Provider>, StoreError> {
        if let Some(provider) = self.cache.get_provider(provider_id).await {
            return Ok(Some(provider));
        }
        let provider = self.stores.providers.get_provider(provider_id).await?;
        if let Some(provider) = &provider {
            self.cache.set_provider(provider.clone()).await;
        }
        Ok(provider)
    }

    pub async fn set_provider_status(
        &self,
        provider_id: &str,
        status: ProviderStatus,
        reason: Option<&str>,
    ) -> Result<Provider, StoreError> {
        let provider = self
            .stores
            .providers
            .set_provider_status(provider_id, status, reason, self.clock.now())
            .await;
        self.cache.invalidate_provider(provider_id).await;
        provider
    }
}
