//! Compiled-query caching.
//!
//! Plans are keyed by the structural fingerprint of the query they came
//! from, so queries that differ only in captured values share one entry.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tessera_core::{DomainModel, Result};

use crate::compiled::{CompiledQuery, compile_analyzed};
use crate::query::Query;
use crate::sites::{Analysis, analyze};

/// A cached compiled query.
#[derive(Debug, Clone)]
pub struct CachedPlan {
    pub compiled: Arc<CompiledQuery>,
    /// Logical time of the last access.
    pub last_used: u64,
    /// Number of times this plan has been reused.
    pub hit_count: u64,
}

/// Hit and miss counters of a [`QueryCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// LRU cache of compiled queries.
///
/// When the cache exceeds `max_size`, the least-recently-used entry is
/// evicted. A capacity of zero disables caching.
///
/// # Example
///
/// ```ignore
/// let mut cache = QueryCache::new(64);
/// let (compiled, analysis) = cache.prepare(&model, &query)?;
/// let bound = compiled.bind_analysis(&analysis, &Args::new(), &caps)?;
/// ```
#[derive(Debug)]
pub struct QueryCache {
    cache: HashMap<String, CachedPlan>,
    max_size: usize,
    clock: u64,
    hits: u64,
    misses: u64,
}

impl QueryCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(256)),
            max_size,
            clock: 0,
            hits: 0,
            misses: 0,
        }
    }

    /// Get a cached plan or compile and insert it.
    ///
    /// The `compile` closure is only called on cache miss; its errors are
    /// not cached.
    #[allow(clippy::result_large_err)]
    pub fn get_or_compile(
        &mut self,
        fingerprint: &str,
        compile: impl FnOnce() -> Result<CompiledQuery>,
    ) -> Result<Arc<CompiledQuery>> {
        self.clock += 1;
        if let Some(entry) = self.cache.get_mut(fingerprint) {
            entry.last_used = self.clock;
            entry.hit_count += 1;
            self.hits += 1;
            return Ok(Arc::clone(&entry.compiled));
        }
        self.misses += 1;
        let compiled = Arc::new(compile()?);
        if self.max_size == 0 {
            return Ok(compiled);
        }
        if self.cache.len() >= self.max_size {
            self.evict_lru();
        }
        self.cache.insert(
            fingerprint.to_string(),
            CachedPlan {
                compiled: Arc::clone(&compiled),
                last_used: self.clock,
                hit_count: 0,
            },
        );
        Ok(compiled)
    }

    /// Analyze `query` and fetch (or compile) its plan.
    #[allow(clippy::result_large_err)]
    pub fn prepare(&mut self, model: &DomainModel, query: &Query) -> Result<(Arc<CompiledQuery>, Analysis)> {
        let analysis = analyze(query);
        let compiled =
            self.get_or_compile(&analysis.fingerprint, || compile_analyzed(model, query, &analysis))?;
        Ok((compiled, analysis))
    }

    /// Check if a plan is cached.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.cache.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            entries: self.cache.len(),
        }
    }

    /// Clear all cached plans.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Evict the least-recently-used entry.
    fn evict_lru(&mut self) {
        if let Some(lru_key) = self
            .cache
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())
        {
            tracing::debug!(fingerprint_len = lru_key.len(), "evicting cached plan");
            self.cache.remove(&lru_key);
        }
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::tests::library;

    fn pages_in(values: Vec<i32>) -> Query {
        Query::all("Book").filter(move |b| b.member("Pages").is_in(values))
    }

    #[test]
    fn test_same_shape_hits() {
        let model = library();
        let mut cache = QueryCache::new(10);
        let (first, _) = cache.prepare(&model, &pages_in(vec![1])).unwrap();
        let (second, analysis) = cache.prepare(&model, &pages_in(vec![2, 3])).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, entries: 1 });
        assert_eq!(analysis.values[0].param_len(), 2);
    }

    #[test]
    fn test_different_shape_misses() {
        let model = library();
        let mut cache = QueryCache::new(10);
        cache.prepare(&model, &Query::all("Book")).unwrap();
        cache.prepare(&model, &Query::all("Tag")).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_lru_ordering() {
        let model = library();
        let mut cache = QueryCache::new(2);
        let (_, a) = cache.prepare(&model, &Query::all("Book")).unwrap();
        let (_, b) = cache.prepare(&model, &Query::all("Tag")).unwrap();
        // touch Book so Tag becomes least recently used
        cache.prepare(&model, &Query::all("Book")).unwrap();
        let (_, c) = cache.prepare(&model, &Query::all("Writer")).unwrap();

        assert!(cache.contains(&a.fingerprint));
        assert!(!cache.contains(&b.fingerprint));
        assert!(cache.contains(&c.fingerprint));
    }

    #[test]
    fn test_errors_are_not_cached() {
        let model = library();
        let mut cache = QueryCache::new(10);
        assert!(cache.prepare(&model, &Query::all("Missing")).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_capacity_disables_caching() {
        let model = library();
        let mut cache = QueryCache::new(0);
        cache.prepare(&model, &Query::all("Book")).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let model = library();
        let mut cache = QueryCache::new(10);
        cache.prepare(&model, &Query::all("Book")).unwrap();
        cache.clear();
        assert!(cache.is_empty());
    }
}
