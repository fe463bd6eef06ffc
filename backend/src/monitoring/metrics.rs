use actix_web::{HttpResponse, Responder};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn register<C: prometheus::core::Collector + Clone + 'static>(collector: C) -> C {
    if let Err(e) = REGISTRY.register(Box::new(collector.clone())) {
        tracing::warn!("Failed to register metric: {}", e);
    }
    collector
}

static POSTBACKS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("postbacks_total", "Postbacks handled, by provider and outcome"),
        &["provider", "outcome"],
    )
    .expect("valid metric definition");
    register(counter)
});

static WALLET_CREDITS: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("wallet_credits_total", "Wallet credits committed")
        .expect("valid metric definition");
    register(counter)
});

static WALLET_CREDITED_MINOR: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "wallet_credited_minor_units_total",
        "User earnings credited, in settlement minor units",
    )
    .expect("valid metric definition");
    register(counter)
});

static RATE_REFRESH_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("rate_refresh_failures_total", "Failed exchange rate refreshes")
        .expect("valid metric definition");
    register(counter)
});

static PROVIDERS_DISABLED: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("providers_auto_disabled_total", "Providers disabled by the health monitor")
        .expect("valid metric definition");
    register(counter)
});

static CACHED_RATES: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("exchange_rates_cached", "Currency pairs in the rate cache")
        .expect("valid metric definition");
    register(gauge)
});

pub fn record_postback(provider: &str, outcome: &str) {
    POSTBACKS.with_label_values(&[provider, outcome]).inc();
}

pub fn record_wallet_credit(amount_minor: i64) {
    WALLET_CREDITS.inc();
    WALLET_CREDITED_MINOR.inc_by(amount_minor.max(0) as u64);
}

pub fn record_rate_refresh_failure() {
    RATE_REFRESH_FAILURES.inc();
}

pub fn record_provider_disabled() {
    PROVIDERS_DISABLED.inc();
}

pub fn set_cached_rates(count: usize) {
    CACHED_RATES.set(count as i64);
}

pub async fn metrics() -> impl Responder {
    let encoder = TextEncoder::new();
    let metrics_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metrics_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buffer)
}
