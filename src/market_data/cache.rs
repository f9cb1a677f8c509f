// =============================================================================
// Market Data Cache — bounded symbol -> latest snapshot map
// =============================================================================
//
// Insertion order doubles as the eviction order: when the cache is full the
// oldest-inserted symbol is dropped. Re-inserting an existing symbol refreshes
// its snapshot without changing its slot. The scanner is authoritative for
// freshness; there is no background refresh, only a TTL check on read.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use super::MarketData;
use crate::types::now_ms;

struct CacheInner {
    entries: HashMap<String, MarketData>,
    /// Insertion order of keys; front is oldest.
    order: Vec<String>,
}

/// Bounded cache of the latest market-data snapshot per symbol.
pub struct MarketDataCache {
    inner: RwLock<CacheInner>,
    max_size: usize,
    ttl_ms: i64,
}

impl MarketDataCache {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
            max_size: max_size.max(1),
            ttl_ms: (ttl_secs * 1_000) as i64,
        }
    }

    /// Insert or refresh a snapshot. Evicts the oldest-inserted symbol when
    /// the cache is full.
    pub fn insert(&self, data: MarketData) {
        let mut inner = self.inner.write();
        let symbol = data.symbol.clone();

        if inner.entries.insert(symbol.clone(), data).is_none() {
            inner.order.push(symbol);
            while inner.order.len() > self.max_size {
                let evicted = inner.order.remove(0);
                inner.entries.remove(&evicted);
                debug!(symbol = %evicted, "evicted oldest cache entry");
            }
        }
    }

    /// A copy of the cached snapshot, regardless of age.
    pub fn get(&self, symbol: &str) -> Option<MarketData> {
        self.inner.read().entries.get(symbol).cloned()
    }

    /// A copy of the cached snapshot only if it is younger than the TTL.
    pub fn get_fresh(&self, symbol: &str) -> Option<MarketData> {
        let inner = self.inner.read();
        let data = inner.entries.get(symbol)?;
        if now_ms() - data.ts_ms > self.ttl_ms {
            return None;
        }
        Some(data.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn symbols(&self) -> Vec<String> {
        self.inner.read().order.clone()
    }
}

impl std::fmt::Debug for MarketDataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketDataCache")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
