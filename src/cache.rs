//! Read-through cache for computed metrics.
//!
//! Entries are keyed by the immutable request parameters. Computation happens
//! outside any lock, so two callers may compute the same entry; the first
//! insert is kept and both callers get that value back.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

use crate::schema::YearMonth;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source_id: String,
    /// Inclusive month range, or `None` for the full history.
    pub range: Option<(YearMonth, YearMonth)>,
    pub metric: String,
}

impl CacheKey {
    pub fn new(
        source_id: impl Into<String>,
        range: Option<(YearMonth, YearMonth)>,
        metric: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            range,
            metric: metric.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.range {
            Some((start, end)) => write!(f, "{}[{}:{}]/{}", self.source_id, start, end, self.metric),
            None => write!(f, "{}[all]/{}", self.source_id, self.metric),
        }
    }
}

pub struct MetricsCache<V> {
    entries: DashMap<CacheKey, Arc<V>>,
}

impl<V> MetricsCache<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the cached value for `key`, computing and inserting it if absent.
    pub fn get_or_compute(&self, key: CacheKey, compute: impl FnOnce() -> V) -> Arc<V> {
        if let Some(hit) = self.get(&key) {
            return hit;
        }

        debug!("Cache miss for {}", key);
        let computed = Arc::new(compute());
        let entry = self.entries.entry(key).or_insert(computed);
        Arc::clone(entry.value())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry. Called on explicit reload.
    pub fn invalidate_all(&self) {
        debug!("Invalidating {} cached metrics", self.entries.len());
        self.entries.clear();
    }
}

impl<V> Default for MetricsCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
