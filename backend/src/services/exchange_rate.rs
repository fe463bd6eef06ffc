//! Exchange rates into the settlement currency.
//!
//! Reads go through a `parking_lot::RwLock` snapshot and never wait on the
//! network while a rate is cached. A refresh holds only the async
//! `refresh_lock` while it talks to the rate source, then swaps the snapshot
//! under a short write lock.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use shared::{convert_to_minor, normalize_currency, round_half_up, AlertSeverity, ExchangeRate, LedgerError};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::alerts::AlertPublisher;
use crate::clock::Clock;
use crate::config::RateConfig;
use crate::monitoring::metrics;
use crate::store::{LedgerStore, StoreError};

const RATE_DECIMALS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum RateError {
    #[error("Exchange rate unavailable for {from} -> {to}")]
    Unavailable { from: String, to: String },
    #[error("Rate source error: {0}")]
    Source(String),
    #[error("Rate source timed out")]
    Timeout,
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Units of each currency per one unit of `base`.
#[derive(Debug, Clone)]
pub struct RateQuote {
    pub base: String,
    pub rates: HashMap<String, Decimal>,
    pub source: String,
}

impl RateQuote {
    fn units_per_base(&self, currency: &str) -> Option<Decimal> {
        if currency == self.base {
            Some(Decimal::ONE)
        } else {
            self.rates.get(currency).copied().filter(|r| *r > Decimal::ZERO)
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn fetch(&self) -> Result<RateQuote, RateError>;
}

#[derive(Deserialize)]
struct LatestRatesResponse {
    base: Option<String>,
    rates: HashMap<String, serde_json::Number>,
}

/// `GET {url}` returning `{"base": "USD", "rates": {"NGN": 1500.0, ...}}`.
pub struct HttpRateSource {
    client: reqwest::Client,
    url: String,
}

impl HttpRateSource {
    pub fn new(url: &str, timeout: std::time::Duration) -> Result<Self, RateError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RateError::Source(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn fetch(&self) -> Result<RateQuote, RateError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| RateError::Source(e.to_string()))?;

        let body: LatestRatesResponse = response
            .json()
            .await
            .map_err(|e| RateError::Source(format!("invalid response: {}", e)))?;

        let mut rates = HashMap::with_capacity(body.rates.len());
        for (currency, number) in body.rates {
            let text = number.to_string();
            let rate = Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .map_err(|_| RateError::Source(format!("unparsable rate {} for {}", text, currency)))?;
            rates.insert(currency.to_ascii_uppercase(), rate);
        }

        Ok(RateQuote {
            base: body.base.unwrap_or_else(|| "USD".to_string()).to_ascii_uppercase(),
            rates,
            source: self.url.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedRate {
    pub rate: Decimal,
    pub observed_at: DateTime<Utc>,
    pub source: String,
}

#[derive(Default)]
struct Snapshot {
    /// Keyed by source currency; every rate is into the settlement currency.
    rates: HashMap<String, CachedRate>,
    last_update: Option<DateTime<Utc>>,
}

/// Result of converting a provider amount into settlement minor units.
#[derive(Debug, Clone, Serialize)]
pub struct Conversion {
    pub rate: Decimal,
    pub converted_amount: i64,
    /// The rate was older than the freshness window and a refresh did not replace it.
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateCacheStatus {
    pub settlement_currency: String,
    pub last_update: Option<DateTime<Utc>>,
    pub is_stale: bool,
    pub minutes_until_refresh: i64,
    pub rates: BTreeMap<String, Decimal>,
}

pub struct ExchangeRateCache {
    config: RateConfig,
    snapshot: RwLock<Snapshot>,
    refresh_lock: Mutex<()>,
    refresh_in_flight: AtomicBool,
    source: Arc<dyn RateSource>,
    store: Arc<dyn LedgerStore>,
    alerts: AlertPublisher,
    clock: Arc<dyn Clock>,
}

impl ExchangeRateCache {
    pub fn new(
        config: RateConfig,
        source: Arc<dyn RateSource>,
        store: Arc<dyn LedgerStore>,
        alerts: AlertPublisher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            snapshot: RwLock::new(Snapshot::default()),
            refresh_lock: Mutex::new(()),
            refresh_in_flight: AtomicBool::new(false),
            source,
            store,
            alerts,
            clock,
        }
    }

    pub fn settlement_currency(&self) -> &str {
        &self.config.settlement_currency
    }

    /// Last known rate, without touching the network.
    pub fn get_rate(&self, from: &str, to: &str) -> Option<Decimal> {
        if from == to {
            return Some(Decimal::ONE);
        }
        if to != self.config.settlement_currency {
            return None;
        }
        self.snapshot.read().rates.get(from).map(|r| r.rate)
    }

    fn freshness(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.config.freshness).unwrap_or_else(|_| ChronoDuration::hours(6))
    }

    pub fn is_stale(&self) -> bool {
        match self.snapshot.read().last_update {
            Some(at) => self.clock.now() - at > self.freshness(),
            None => true,
        }
    }

    /// `amount` in `from` converted to settlement minor units, rounded half-up.
    ///
    /// A cached rate is always used as is; if it is stale a background
    /// refresh is started unless one is already running. Only a missing rate
    /// waits on the source, for at most `fetch_timeout`, and yields
    /// [`RateError::Unavailable`] if that fetch does not produce one.
    pub async fn convert(
        self: &Arc<Self>,
        amount: Decimal,
        from: &str,
    ) -> Result<Conversion, RateError> {
        let from = normalize_currency(from)?;
        let to = self.config.settlement_currency.clone();

        if from == to {
            return Ok(Conversion {
                rate: Decimal::ONE,
                converted_amount: convert_to_minor(amount, Decimal::ONE)?,
                stale: false,
            });
        }

        let rate = match self.get_rate(&from, &to) {
            Some(rate) => {
                if self.is_stale() {
                    self.spawn_refresh();
                }
                rate
            }
            None => {
                match tokio::time::timeout(self.config.fetch_timeout, self.refresh()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("Rate fetch for empty cache failed: {}", e),
                    Err(_) => tracing::warn!("Rate fetch for empty cache timed out"),
                }
                self.get_rate(&from, &to)
                    .ok_or_else(|| RateError::Unavailable { from: from.clone(), to: to.clone() })?
            }
        };

        Ok(Conversion {
            rate,
            converted_amount: convert_to_minor(amount, rate)?,
            stale: self.is_stale(),
        })
    }

    /// Single-flight background refresh.
    fn spawn_refresh(self: &Arc<Self>) {
        if self.refresh_in_flight.swap(true, Ordering::AcqRel) {
            tracing::debug!("Rate refresh already in flight, using cached rate");
            return;
        }

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            {
                let _guard = cache.refresh_lock.lock().await;
                if cache.is_stale() {
                    if let Err(e) = cache.refresh_locked().await {
                        tracing::warn!("Background rate refresh failed, serving cached rates: {}", e);
                    }
                }
            }
            cache.refresh_in_flight.store(false, Ordering::Release);
        });
    }

    /// Fetch fresh rates now, waiting for any refresh already in flight.
    pub async fn refresh(&self) -> Result<usize, RateError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_locked().await
    }

    async fn refresh_locked(&self) -> Result<usize, RateError> {
        let fetched = tokio::time::timeout(self.config.fetch_timeout, self.source.fetch()).await;
        let quote = match fetched {
            Ok(Ok(quote)) => quote,
            Ok(Err(e)) => {
                self.report_refresh_failure(&e);
                return Err(e);
            }
            Err(_) => {
                let e = RateError::Timeout;
                self.report_refresh_failure(&e);
                return Err(e);
            }
        };

        let settlement = self.config.settlement_currency.as_str();
        let settlement_per_base = match quote.units_per_base(settlement) {
            Some(r) => r,
            None => {
                let e = RateError::Source(format!("quote has no {} rate", settlement));
                self.report_refresh_failure(&e);
                return Err(e);
            }
        };

        let now = self.clock.now();
        let previous: HashMap<String, Decimal> = self
            .snapshot
            .read()
            .rates
            .iter()
            .map(|(k, v)| (k.clone(), v.rate))
            .collect();

        let mut observations = Vec::new();
        for currency in &self.config.supported_currencies {
            if currency == settlement {
                continue;
            }
            let Some(units) = quote.units_per_base(currency) else {
                tracing::warn!("Rate quote is missing {}, keeping cached value", currency);
                continue;
            };
            let rate = round_half_up(settlement_per_base / units, RATE_DECIMALS);
            let previous_rate = previous.get(currency).copied();
            let is_fluctuation = previous_rate
                .map(|old| self.check_fluctuation(currency, old, rate))
                .unwrap_or(false);

            observations.push(ExchangeRate {
                id: Uuid::new_v4(),
                from_currency: currency.clone(),
                to_currency: settlement.to_string(),
                rate,
                source: quote.source.clone(),
                is_fluctuation,
                previous_rate,
                observed_at: now,
            });
        }

        if observations.is_empty() {
            let e = RateError::Source("quote contained no supported currencies".to_string());
            self.report_refresh_failure(&e);
            return Err(e);
        }

        if let Err(e) = self.store.save_rates(&observations).await {
            tracing::error!("Failed to persist exchange rates: {}", e);
        }

        let count = observations.len();
        {
            let mut snapshot = self.snapshot.write();
            for obs in observations {
                snapshot.rates.insert(
                    obs.from_currency,
                    CachedRate {
                        rate: obs.rate,
                        observed_at: obs.observed_at,
                        source: obs.source,
                    },
                );
            }
            snapshot.last_update = Some(now);
            metrics::set_cached_rates(snapshot.rates.len());
        }

        tracing::info!("Exchange rates refreshed: {} pairs into {}", count, settlement);
        Ok(count)
    }

    /// Alerts when the relative change exceeds the threshold. The new rate is
    /// accepted either way.
    fn check_fluctuation(&self, currency: &str, old: Decimal, new: Decimal) -> bool {
        if old <= Decimal::ZERO {
            return false;
        }
        let change = ((new - old) / old).abs();
        if change <= self.config.fluctuation_threshold {
            return false;
        }

        let pair = format!("{}_{}", currency, self.config.settlement_currency);
        let percent = round_half_up(change * Decimal::ONE_HUNDRED, 2);
        let direction = if new > old { "increased" } else { "decreased" };

        tracing::warn!(
            "Exchange rate fluctuation for {}: {} -> {} ({}% {})",
            pair,
            old.round_dp(2),
            new.round_dp(2),
            percent,
            direction
        );
        self.alerts.send_alert(
            "exchange_rate_fluctuation",
            AlertSeverity::Warning,
            format!("Exchange Rate Alert: {}", pair),
            format!(
                "{} has {} by {}% (from {} to {})",
                pair,
                direction,
                percent,
                old.round_dp(2),
                new.round_dp(2)
            ),
            serde_json::json!({
                "pair": pair,
                "old_rate": old,
                "new_rate": new,
                "percentage_change": percent,
                "direction": direction,
            }),
        );
        true
    }

    fn report_refresh_failure(&self, error: &RateError) {
        metrics::record_rate_refresh_failure();
        let (has_rates, last_update) = {
            let snapshot = self.snapshot.read();
            (!snapshot.rates.is_empty(), snapshot.last_update)
        };
        tracing::error!("Exchange rate refresh failed: {}", error);

        let severity = if has_rates {
            AlertSeverity::Warning
        } else {
            AlertSeverity::Critical
        };
        self.alerts.send_alert(
            "exchange_rate_update_failed",
            severity,
            "Exchange Rate Update Failed",
            if has_rates {
                format!("Rate refresh failed ({}); serving last good rates", error)
            } else {
                format!("Rate refresh failed ({}); no rates cached, conversions unavailable", error)
            },
            serde_json::json!({
                "error": error.to_string(),
                "last_update": last_update,
            }),
        );
    }

    /// Seeds the cache from the newest persisted observations.
    pub async fn load_from_store(&self) -> Result<usize, RateError> {
        let rates = self.store.latest_rates(&self.config.settlement_currency).await?;
        let mut snapshot = self.snapshot.write();
        for rate in &rates {
            snapshot.rates.insert(
                rate.from_currency.clone(),
                CachedRate {
                    rate: rate.rate,
                    observed_at: rate.observed_at,
                    source: rate.source.clone(),
                },
            );
            if snapshot.last_update.map_or(true, |at| rate.observed_at > at) {
                snapshot.last_update = Some(rate.observed_at);
            }
        }
        metrics::set_cached_rates(snapshot.rates.len());
        Ok(rates.len())
    }

    pub fn current_rates(&self) -> BTreeMap<String, CachedRate> {
        self.snapshot
            .read()
            .rates
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn cache_status(&self) -> RateCacheStatus {
        let now = self.clock.now();
        let snapshot = self.snapshot.read();
        let (is_stale, minutes_until_refresh) = match snapshot.last_update {
            Some(at) => {
                let remaining = self.freshness() - (now - at);
                if remaining > ChronoDuration::zero() {
                    (false, (remaining.num_seconds() + 59) / 60)
                } else {
                    (true, 0)
                }
            }
            None => (true, 0),
        };

        RateCacheStatus {
            settlement_currency: self.config.settlement_currency.clone(),
            last_update: snapshot.last_update,
            is_stale,
            minutes_until_refresh,
            rates: snapshot.rates.iter().map(|(k, v)| (k.clone(), v.rate)).collect(),
        }
    }

    pub async fn history(
        &self,
        from: &str,
        to: &str,
        days: i64,
    ) -> Result<Vec<ExchangeRate>, RateError> {
        let from = normalize_currency(from)?;
        let to = normalize_currency(to)?;
        let since = self.clock.now() - ChronoDuration::days(days.max(0));
        Ok(self.store.rate_history(&from, &to, since).await?)
    }

    /// Deletes observations older than the retention window.
    pub async fn prune_history(&self) -> Result<u64, RateError> {
        let before = self.clock.now() - ChronoDuration::days(self.config.retention_days);
        Ok(self.store.prune_rates(before).await?)
    }
}

/// Refreshes on the freshness cadence and prunes old observations. The first
/// tick only refreshes if the rates loaded at startup are already stale.
pub async fn run_rate_refresher(cache: Arc<ExchangeRateCache>) {
    let mut interval = tokio::time::interval(cache.config.freshness);
    let mut first = true;

    loop {
        interval.tick().await;

        if !first || cache.is_stale() {
            if let Err(e) = cache.refresh().await {
                tracing::warn!("Scheduled rate refresh failed: {}", e);
            }
        }
        first = false;

        match cache.prune_history().await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Pruned {} exchange rate observations", n),
            Err(e) => tracing::warn!("Failed to prune exchange rates: {}", e),
        }
    }
}
