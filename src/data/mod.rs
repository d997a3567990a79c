use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::clock::SharedClock;
use crate::database::{BarSource, SharedStore, StoreError};
use crate::error::EngineError;
use crate::types::{OhlcBar, Timeframe};

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// TTL for cache entries whose window ends in the recent past. Historical
/// windows are immutable and keep a long TTL.
const HOT_TTL: Duration = Duration::from_secs(30);
const COLD_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    symbol: String,
    timeframe: Timeframe,
    from_bucket: i64,
    to_bucket: i64,
}

struct CacheEntry {
    bars: Arc<Vec<OhlcBar>>,
    inserted_at: DateTime<Utc>,
    ttl: Duration,
    last_used: AtomicU64,
}

/// Routes OHLC queries to the cheapest source by window age: the 24h hot
/// view, the 7d warm view, or the cold base table. Falls back to the base
/// table when a view is mid-refresh, retries transient store errors with
/// exponential backoff, and memoizes recent answers in a sharded LRU.
pub struct HybridDataFetcher {
    store: SharedStore,
    clock: SharedClock,
    cache: DashMap<CacheKey, CacheEntry>,
    cache_capacity: usize,
    use_counter: AtomicU64,
}

impl HybridDataFetcher {
    pub fn new(store: SharedStore, clock: SharedClock) -> Self {
        Self::with_capacity(store, clock, 2048)
    }

    pub fn with_capacity(store: SharedStore, clock: SharedClock, cache_capacity: usize) -> Self {
        Self {
            store,
            clock,
            cache: DashMap::new(),
            cache_capacity,
            use_counter: AtomicU64::new(0),
        }
    }

    /// Source by window age. A view is only eligible when it covers the
    /// whole window; a long-lookback query ending now would silently
    /// truncate on the hot view otherwise.
    pub fn route(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> BarSource {
        let now = self.clock.now();
        if now - from <= chrono::Duration::hours(24) && now - to <= chrono::Duration::hours(24) {
            BarSource::Today
        } else if now - from <= chrono::Duration::days(7) {
            BarSource::Recent
        } else {
            BarSource::Base
        }
    }

    pub async fn get_recent(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        lookback_hours: i64,
    ) -> Result<Vec<OhlcBar>, EngineError> {
        if lookback_hours <= 0 {
            return Err(EngineError::DataQuality(format!(
                "lookback_hours must be positive, got {}",
                lookback_hours
            )));
        }
        let to = self.clock.now();
        let from = to - chrono::Duration::hours(lookback_hours);
        self.get_slice(symbol, timeframe, from, to).await
    }

    pub async fn get_slice(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OhlcBar>, EngineError> {
        if from >= to {
            return Err(EngineError::DataQuality(format!(
                "empty window: {} >= {}",
                from, to
            )));
        }

        let key = self.cache_key(symbol, timeframe, from, to);
        if let Some(bars) = self.cache_get(&key) {
            return Ok(bars.as_ref().clone());
        }

        let source = self.route(from, to);
        let bars = self
            .fetch_with_fallback(source, symbol, timeframe, from, to)
            .await?;
        let bars = normalize(bars);

        self.cache_put(key, &bars, to);
        Ok(bars)
    }

    /// Newest single bar for a symbol; used by the exit loop to mark
    /// positions to price.
    pub async fn latest_bar(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<OhlcBar>, EngineError> {
        match self
            .retrying(|| self.store.latest_bar(BarSource::Today, symbol, timeframe))
            .await
        {
            Ok(bar) => Ok(bar),
            Err(e) => {
                warn!(symbol, error = %e, "hot view failed for latest bar; using base table");
                self.retrying(|| self.store.latest_bar(BarSource::Base, symbol, timeframe))
                    .await
                    .map_err(Into::into)
            }
        }
    }

    /// Age of the freshest 1m bar. The supervisor compares this against the
    /// ingestion freshness contract to surface a degraded state.
    pub async fn freshness(&self, symbol: &str) -> Result<Option<chrono::Duration>, EngineError> {
        let bar = self.latest_bar(symbol, Timeframe::M1).await?;
        Ok(bar.map(|b| self.clock.now() - b.timestamp))
    }

    async fn fetch_with_fallback(
        &self,
        source: BarSource,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<OhlcBar>, EngineError> {
        match self
            .retrying(|| self.store.fetch_bars(source, symbol, timeframe, from, to))
            .await
        {
            Ok(bars) => Ok(bars),
            Err(e) if source.is_view() => {
                warn!(
                    symbol,
                    source = source.table(),
                    error = %e,
                    "summary view failed; falling back to base table"
                );
                self.retrying(|| self.store.fetch_bars(BarSource::Base, symbol, timeframe, from, to))
                    .await
                    .map_err(Into::into)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn retrying<T, F, Fut>(&self, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < RETRY_ATTEMPTS => {
                    debug!(attempt, error = %e, "transient store error; backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn cache_key(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CacheKey {
        // Bucket both bounds to the timeframe grid so near-identical windows
        // issued within the same bar share an entry.
        let step = timeframe.minutes() * 60;
        CacheKey {
            symbol: symbol.to_string(),
            timeframe,
            from_bucket: from.timestamp() / step,
            to_bucket: to.timestamp() / step,
        }
    }

    fn cache_get(&self, key: &CacheKey) -> Option<Arc<Vec<OhlcBar>>> {
        let now = self.clock.now();
        if let Some(entry) = self.cache.get(key) {
            let age = (now - entry.inserted_at).to_std().unwrap_or_default();
            if age <= entry.ttl {
                let stamp = self.use_counter.fetch_add(1, Ordering::Relaxed);
                entry.last_used.store(stamp, Ordering::Relaxed);
                return Some(Arc::clone(&entry.bars));
            }
        }
        // Expired or missing; drop a stale entry if present.
        self.cache.remove_if(key, |_, entry| {
            let age = (now - entry.inserted_at).to_std().unwrap_or_default();
            age > entry.ttl
        });
        None
    }

    fn cache_put(&self, key: CacheKey, bars: &[OhlcBar], to: DateTime<Utc>) {
        let now = self.clock.now();
        let ttl = if now - to <= chrono::Duration::minutes(5) {
            HOT_TTL
        } else {
            COLD_TTL
        };
        let stamp = self.use_counter.fetch_add(1, Ordering::Relaxed);
        self.cache.insert(
            key,
            CacheEntry {
                bars: Arc::new(bars.to_vec()),
                inserted_at: now,
                ttl,
                last_used: AtomicU64::new(stamp),
            },
        );
        self.evict_if_over_capacity();
    }

    fn evict_if_over_capacity(&self) {
        while self.cache.len() > self.cache_capacity {
            let mut oldest: Option<(CacheKey, u64)> = None;
            for entry in self.cache.iter() {
                let used = entry.value().last_used.load(Ordering::Relaxed);
                if oldest.as_ref().map_or(true, |(_, best)| used < *best) {
                    oldest = Some((entry.key().clone(), used));
                }
            }
            match oldest {
                Some((key, _)) => {
                    self.cache.remove(&key);
                }
                None => break,
            }
        }
    }
}

/// Ascending order and timestamp de-duplication. The store already sorts;
/// this guards against overlapping view/base results.
fn normalize(mut bars: Vec<OhlcBar>) -> Vec<OhlcBar> {
    bars.sort_by_key(|b| b.timestamp);
    bars.dedup_by_key(|b| b.timestamp);
    bars
}
