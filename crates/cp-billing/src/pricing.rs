use std::sync::Arc;
use std::time::{Duration, Instant};

use cp_base::{Money, Provider};
use cp_store::{DurableStore, ModelPricing};
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::error::Result;

/// Where a price quote ultimately came from, surfaced for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PricingSource {
    ProcessCache,
    SharedCache,
    Store,
    StaticFallback,
}

#[derive(Debug, Clone, Copy)]
pub struct PriceQuote {
    pub input_per_million: Money,
    pub output_per_million: Money,
    pub source: PricingSource,
}

struct CacheEntry {
    quote: (Money, Money),
    cached_at: Instant,
}

const CACHE_TTL: Duration = Duration::from_secs(3600);

/// Static prices used only when the store has no row and the shared
/// cache is unreachable. Values are USD per million tokens and are
/// intentionally conservative: a last-resort fallback rather than a
/// refusal, so a pricing outage degrades to slightly-stale pricing
/// instead of blocking every call.
fn static_fallback_table(model: &str, provider: Provider) -> (Decimal, Decimal) {
    match (provider, model) {
        (Provider::OpenAi, m) if m.starts_with("gpt-4") => (Decimal::new(30, 0), Decimal::new(60, 0)),
        (Provider::OpenAi, _) => (Decimal::new(1, 0), Decimal::new(2, 0)),
        (Provider::Anthropic, m) if m.contains("opus") => (Decimal::new(15, 0), Decimal::new(75, 0)),
        (Provider::Anthropic, m) if m.contains("sonnet") => (Decimal::new(3, 0), Decimal::new(15, 0)),
        (Provider::Anthropic, _) => (Decimal::new(1, 0).checked_div(Decimal::new(4, 0)).unwrap_or(Decimal::ZERO), Decimal::new(1, 0)),
        (Provider::Google, _) => (Decimal::new(1, 0), Decimal::new(3, 0)),
        (Provider::Other, _) => (Decimal::new(1, 0), Decimal::new(2, 0)),
    }
}

/// A pluggable second-tier cache shared across process instances (a
/// Redis-backed implementation would live alongside `cp-queue`'s; kept
/// abstract here so this crate does not need a direct Redis dependency).
pub trait SharedPricingCache: Send + Sync {
    fn get(&self, key: &str) -> Option<(Money, Money)>;
    fn set(&self, key: &str, value: (Money, Money), ttl: Duration);
}

/// No-op shared cache used when no distributed tier is configured.
pub struct NoSharedCache;

impl SharedPricingCache for NoSharedCache {
    fn get(&self, _key: &str) -> Option<(Money, Money)> {
        None
    }

    fn set(&self, _key: &str, _value: (Money, Money), _ttl: Duration) {}
}

/// Three-tier pricing lookup: in-process cache, shared cache, Durable
/// Store, static fallback table.
pub struct PricingCache {
    store: Arc<dyn DurableStore>,
    shared: Arc<dyn SharedPricingCache>,
    process_cache: RwLock<std::collections::HashMap<String, CacheEntry>>,
}

fn cache_key(model: &str, provider: Provider) -> String {
    format!("{provider}:{model}")
}

impl PricingCache {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            shared: Arc::new(NoSharedCache),
            process_cache: RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub fn with_shared_cache(mut self, shared: Arc<dyn SharedPricingCache>) -> Self {
        self.shared = shared;
        self
    }

    pub async fn quote(&self, model: &str, provider: Provider) -> Result<PriceQuote> {
        let key = cache_key(model, provider);

        if let Some(entry) = self.process_cache.read().get(&key) {
            if entry.cached_at.elapsed() < CACHE_TTL {
                let (input, output) = entry.quote;
                return Ok(PriceQuote {
                    input_per_million: input,
                    output_per_million: output,
                    source: PricingSource::ProcessCache,
                });
            }
        }

        if let Some((input, output)) = self.shared.get(&key) {
            self.process_cache.write().insert(
                key.clone(),
                CacheEntry {
                    quote: (input, output),
                    cached_at: Instant::now(),
                },
            );
            return Ok(PriceQuote {
                input_per_million: input,
                output_per_million: output,
                source: PricingSource::SharedCache,
            });
        }

        if let Some(pricing) = self.store.get_model_pricing(model, provider).await? {
            let quote = (pricing.input_per_million, pricing.output_per_million);
            self.shared.set(&key, quote, CACHE_TTL);
            self.process_cache.write().insert(
                key,
                CacheEntry {
                    quote,
                    cached_at: Instant::now(),
                },
            );
            return Ok(PriceQuote {
                input_per_million: quote.0,
                output_per_million: quote.1,
                source: PricingSource::Store,
            });
        }

        tracing::warn!(model, %provider, "no pricing row found, using static fallback table");
        let (input, output) = static_fallback_table(model, provider);
        Ok(PriceQuote {
            input_per_million: Money::from_decimal(input),
            output_per_million: Money::from_decimal(output),
            source: PricingSource::StaticFallback,
        })
    }

    pub fn invalidate(&self, model: &str, provider: Provider) {
        self.process_cache.write().remove(&cache_key(model, provider));
    }
}

pub fn cost_for_tokens(
    quote: &PriceQuote,
    input_tokens: u64,
    output_tokens: u64,
) -> Money {
    let million = Decimal::new(1_000_000, 0);
    let input_cost = quote.input_per_million.as_decimal() * Decimal::new(input_tokens as i64, 0) / million;
    let output_cost = quote.output_per_million.as_decimal() * Decimal::new(output_tokens as i64, 0) / million;
    Money::from_decimal(input_cost + output_cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_store::InMemoryStore;

    #[tokio::test]
    async fn falls_back_to_static_table_when_store_has_no_row() {
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        let cache = PricingCache::new(store);
        let quote = cache.quote("gpt-4-turbo", Provider::OpenAi).await.unwrap();
        assert_eq!(quote.source, PricingSource::StaticFallback);
    }

    #[tokio::test]
    async fn store_row_is_preferred_and_then_cached() {
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        store
            .set_model_pricing(ModelPricing {
                model: "claude-test".into(),
                provider: Provider::Anthropic,
                input_per_million: Money::from_decimal(Decimal::new(5, 0)),
                output_per_million: Money::from_decimal(Decimal::new(10, 0)),
                effective_from: chrono::Utc::now(),
                effective_until: None,
            })
            .await
            .unwrap();
        let cache = PricingCache::new(store);

        let first = cache.quote("claude-test", Provider::Anthropic).await.unwrap();
        assert_eq!(first.source, PricingSource::Store);

        let second = cache.quote("claude-test", Provider::Anthropic).await.unwrap();
        assert_eq!(second.source, PricingSource::ProcessCache);
    }

    #[test]
    fn cost_computation_scales_with_tokens() {
        let quote = PriceQuote {
            input_per_million: Money::from_decimal(Decimal::new(10, 0)),
            output_per_million: Money::from_decimal(Decimal::new(20, 0)),
            source: PricingSource::StaticFallback,
        };
        let cost = cost_for_tokens(&quote, 1_000_000, 500_000);
        assert_eq!(cost.as_decimal(), Decimal::new(20, 0));
    }
}
