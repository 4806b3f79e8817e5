//! LRU cache of loaded models keyed by [`ModelTier`].
//!
//! Every miss goes through the [`ResourceAccountant`] before the loader is
//! called. When the accountant refuses, the least recently used model is
//! evicted and admission is retried exactly once.
//!
//! The entry count is capped (3 by default) but in practice memory is the
//! binding limit.

use crate::memory::{ResourceAccountant, MIB};
use crate::metrics;
use crate::model::backend::{BackendError, ModelExecutor, ModelLoader};
use crate::routing::ModelTier;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info};

/// Default number of resident models.
pub const DEFAULT_CACHE_CAPACITY: usize = 3;

/// Errors from [`ModelCache::get_or_load`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelCacheError {
    /// The model does not fit even after evicting the LRU entry.
    #[error("out of memory loading {tier}: need {required_mb}MB, {free_mb}MB free")]
    OutOfMemory {
        /// Tier that could not be admitted.
        tier: ModelTier,
        /// Model size in MiB.
        required_mb: u64,
        /// Free memory at the final check, in MiB.
        free_mb: u64,
    },

    /// The backend failed to load the model.
    #[error(transparent)]
    Load(#[from] BackendError),
}

/// A resident model plus its usage counters.
///
/// Eviction only marks the entry closed. The backend is unloaded when the
/// last `Arc<CachedModel>` is dropped, so a session still decoding on an
/// evicted model keeps a working executor until it finishes.
pub struct CachedModel {
    tier: ModelTier,
    executor: Arc<dyn ModelExecutor>,
    loaded_at: Instant,
    hits: AtomicU64,
    misses: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for CachedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedModel")
            .field("tier", &self.tier)
            .field("hits", &self.hit_count())
            .field("misses", &self.miss_count())
            .finish()
    }
}

impl CachedModel {
    fn new(tier: ModelTier, executor: Arc<dyn ModelExecutor>) -> Self {
        Self {
            tier,
            executor,
            loaded_at: Instant::now(),
            hits: AtomicU64::new(0),
            // The initial load is the first miss.
            misses: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Tier of this model.
    pub fn tier(&self) -> ModelTier {
        self.tier
    }

    /// Execution handle, valid for as long as this entry is held.
    pub fn executor(&self) -> &dyn ModelExecutor {
        self.executor.as_ref()
    }

    /// When the model was loaded.
    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }

    /// Cache hits served by this entry.
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Misses attributed to this entry (1 for the initial load).
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Whether the cache has released this model. The backend may still be
    /// loaded while other handles are alive.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(tier = %self.tier, hits = self.hit_count(), "model closed");
        }
    }
}

impl Drop for CachedModel {
    fn drop(&mut self) {
        self.executor.unload();
        debug!(tier = %self.tier, "model unloaded");
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    /// Resident models.
    pub live: usize,
    /// Entry cap.
    pub capacity: usize,
    /// Cumulative hits.
    pub hits: u64,
    /// Cumulative misses (loads attempted).
    pub misses: u64,
    /// Cumulative evictions.
    pub evictions: u64,
    /// `hits / (hits + misses)`, `0.0` before the first lookup.
    pub hit_rate: f64,
}

/// Memory-aware LRU model cache.
///
/// Safe under concurrent callers. Loading happens under the cache lock, so
/// two requests missing on the same tier load it once.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct ModelCache {
    entries: Mutex<LruCache<ModelTier, Arc<CachedModel>>>,
    capacity: usize,
    accountant: ResourceAccountant,
    loader: Arc<dyn ModelLoader>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("capacity", &self.capacity)
            .field("accountant", &self.accountant)
            .finish()
    }
}

impl ModelCache {
    /// Create a cache holding at most `capacity` models (minimum 1).
    pub fn new(
        capacity: usize,
        accountant: ResourceAccountant,
        loader: Arc<dyn ModelLoader>,
    ) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            capacity: cap.get(),
            accountant,
            loader,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// The accountant consulted on every miss.
    pub fn accountant(&self) -> &ResourceAccountant {
        &self.accountant
    }

    /// Return the resident model for `tier`, loading it on a miss.
    ///
    /// # Errors
    ///
    /// [`ModelCacheError::OutOfMemory`] if the model cannot be admitted
    /// after one eviction; [`ModelCacheError::Load`] if the backend fails.
    pub fn get_or_load(&self, tier: ModelTier) -> Result<Arc<CachedModel>, ModelCacheError> {
        let mut entries = self.entries.lock();

        if let Some(model) = entries.get(&tier) {
            model.record_hit();
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::inc_cache_event("hit");
            debug!(tier = %tier, hits = model.hit_count(), "model cache hit");
            return Ok(Arc::clone(model));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_event("miss");
        info!(tier = %tier, size_mb = tier.size_bytes() / MIB, "model cache miss, loading");

        let size = tier.size_bytes();
        if !self.accountant.can_admit(size) {
            self.evict_lru_locked(&mut entries);
            if !self.accountant.can_admit(size) {
                let free_mb = self.accountant.free_memory() / MIB;
                error!(tier = %tier, free_mb, "cannot admit model even after eviction");
                return Err(ModelCacheError::OutOfMemory {
                    tier,
                    required_mb: size / MIB,
                    free_mb,
                });
            }
        }

        let executor = self.loader.load(tier)?;
        let model = Arc::new(CachedModel::new(tier, executor));
        if let Some((old_tier, old)) = entries.push(tier, Arc::clone(&model)) {
            if old_tier != tier {
                self.record_eviction(&old);
            }
        }
        info!(tier = %tier, live = entries.len(), "model loaded");
        Ok(model)
    }

    /// Whether `tier` is resident. Does not touch recency.
    pub fn is_cached(&self, tier: ModelTier) -> bool {
        self.entries.lock().contains(&tier)
    }

    /// Whether a request for `tier` can be served right now: either it is
    /// already resident or its size is admittable.
    pub fn can_serve(&self, tier: ModelTier) -> bool {
        self.is_cached(tier) || self.accountant.can_admit(tier.size_bytes())
    }

    /// Evict and close the least recently used model. No-op when empty.
    pub fn evict_lru(&self) -> Option<ModelTier> {
        let mut entries = self.entries.lock();
        self.evict_lru_locked(&mut entries)
    }

    fn evict_lru_locked(
        &self,
        entries: &mut LruCache<ModelTier, Arc<CachedModel>>,
    ) -> Option<ModelTier> {
        let (tier, model) = entries.pop_lru()?;
        self.record_eviction(&model);
        Some(tier)
    }

    fn record_eviction(&self, model: &CachedModel) {
        model.close();
        self.evictions.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_event("evict");
        info!(tier = %model.tier(), "model evicted");
    }

    /// Close and remove every model.
    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        let count = entries.len();
        while let Some((_, model)) = entries.pop_lru() {
            model.close();
        }
        if count > 0 {
            info!(count, "model cache cleared");
        }
    }

    /// Resident model count.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resident tiers, most recently used first.
    pub fn resident_tiers(&self) -> Vec<ModelTier> {
        self.entries.lock().iter().map(|(t, _)| *t).collect()
    }

    /// Cumulative counters and derived hit rate.
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            live: self.len(),
            capacity: self.capacity,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FixedMemoryProbe, GIB};
    use crate::model::backend::EchoModelLoader;

    fn cache_with(free: u64, capacity: usize) -> (ModelCache, FixedMemoryProbe, EchoModelLoader) {
        let probe = FixedMemoryProbe::new(16 * GIB, free);
        let loader = EchoModelLoader::new(16);
        let cache = ModelCache::new(
            capacity,
            ResourceAccountant::new(Arc::new(probe.clone())),
            Arc::new(loader.clone()),
        );
        (cache, probe, loader)
    }

    #[test]
    fn test_second_get_returns_same_instance_and_counts_hit() {
        let (cache, _, loader) = cache_with(8 * GIB, 3);
        let a = cache.get_or_load(ModelTier::Small).ok().unwrap();
        let b = cache.get_or_load(ModelTier::Small).ok().unwrap();
        let c = cache.get_or_load(ModelTier::Small).ok().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&b, &c));
        assert_eq!(a.hit_count(), 2);
        assert_eq!(a.miss_count(), 1);
        assert_eq!(loader.loads(), 1);
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let (cache, _, loader) = cache_with(16 * GIB, 2);
        let small = cache.get_or_load(ModelTier::Small).ok().unwrap();
        let _ = cache.get_or_load(ModelTier::Medium).ok().unwrap();
        let _ = cache.get_or_load(ModelTier::Small).ok().unwrap();
        let _ = cache.get_or_load(ModelTier::Large).ok().unwrap();

        assert!(cache.is_cached(ModelTier::Small));
        assert!(!cache.is_cached(ModelTier::Medium));
        assert!(!small.is_closed());
        assert_eq!(loader.unloads(), 1);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_memory_pressure_evicts_then_loads() {
        let (cache, probe, loader) = cache_with(8 * GIB, 3);
        let medium = cache.get_or_load(ModelTier::Medium).ok().unwrap();

        // The fixed probe ignores unloads, so the post-eviction retry fails too.
        probe.set_free(3 * GIB);
        assert!(!cache.accountant().can_admit(ModelTier::Large.size_bytes()));
        let err = cache.get_or_load(ModelTier::Large);
        assert!(matches!(
            err,
            Err(ModelCacheError::OutOfMemory {
                tier: ModelTier::Large,
                ..
            })
        ));
        // The LRU entry was sacrificed on the way.
        assert!(medium.is_closed());
        assert!(cache.is_empty());
        assert_eq!(loader.unloads(), 0);
        drop(medium);
        assert_eq!(loader.unloads(), 1);
    }

    #[test]
    fn test_miss_admitted_without_eviction_keeps_entries() {
        let (cache, _, _) = cache_with(8 * GIB, 3);
        let _ = cache.get_or_load(ModelTier::Small).ok().unwrap();
        let _ = cache.get_or_load(ModelTier::Medium).ok().unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.resident_tiers(), vec![ModelTier::Medium, ModelTier::Small]);
    }

    #[test]
    fn test_evict_lru_on_empty_is_noop() {
        let (cache, _, _) = cache_with(8 * GIB, 3);
        assert_eq!(cache.evict_lru(), None);
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_clear_closes_every_model() {
        let (cache, _, loader) = cache_with(8 * GIB, 3);
        let models: Vec<_> = ModelTier::ALL
            .into_iter()
            .filter_map(|t| cache.get_or_load(t).ok())
            .collect();
        cache.clear();
        assert!(cache.is_empty());
        assert!(models.iter().all(|m| m.is_closed()));
        assert_eq!(loader.unloads(), 0);
        drop(models);
        assert_eq!(loader.unloads(), 3);
    }

    #[test]
    fn test_evicted_model_stays_usable_while_held() {
        let (cache, _, loader) = cache_with(16 * GIB, 1);
        let small = cache.get_or_load(ModelTier::Small).ok().unwrap();
        let _ = cache.get_or_load(ModelTier::Medium).ok().unwrap();

        assert!(small.is_closed());
        assert_eq!(loader.unloads(), 0);
        let hidden = small.executor().encode(&[5, 6, 1]);
        assert!(hidden.is_ok());

        drop(small);
        assert_eq!(loader.unloads(), 1);
    }

    #[test]
    fn test_stats_hit_rate_survives_eviction() {
        let (cache, _, _) = cache_with(8 * GIB, 1);
        assert_eq!(cache.stats().hit_rate, 0.0);
        let _ = cache.get_or_load(ModelTier::Small);
        let _ = cache.get_or_load(ModelTier::Small);
        let _ = cache.get_or_load(ModelTier::Small);
        let _ = cache.get_or_load(ModelTier::Medium);
        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
        assert_eq!(stats.live, 1);
        assert_eq!(stats.capacity, 1);
    }

    #[test]
    fn test_can_serve_resident_tier_under_pressure() {
        let (cache, probe, _) = cache_with(8 * GIB, 3);
        let _ = cache.get_or_load(ModelTier::Large);
        probe.set_free(0);
        assert!(cache.can_serve(ModelTier::Large));
        assert!(!cache.can_serve(ModelTier::Medium));
    }

    #[test]
    fn test_zero_capacity_clamped_to_one() {
        let (cache, _, _) = cache_with(8 * GIB, 0);
        assert_eq!(cache.stats().capacity, 1);
    }
}
