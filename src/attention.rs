//! # Session Attention Cache
//!
//! ## Responsibility
//! Keep the per-layer key/value state produced by earlier decode steps of
//! one generation session, so each step only computes the newest token.
//!
//! ## Guarantees
//! - Bounded: every layer holds at most `max_length` entries; an append past
//!   that bound fails with [`AttentionCacheError::Overflow`] and leaves the
//!   cache untouched.
//! - Isolated: sessions never share state; concurrent sessions only contend
//!   on their own entry lock.
//! - Lockstep length: [`SessionCache::current_length`] reports layer 0's
//!   length. Callers append to every layer once per generated token.
//!
//! ## NOT Responsible For
//! - Admission control (model memory is governed by `model::cache`)
//! - Interpreting tensor contents (payloads are opaque [`TensorBlob`]s)

use crate::model::{LayerKv, TensorBlob};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Default estimated footprint of one token in one layer.
pub const DEFAULT_BYTES_PER_TOKEN_PER_LAYER: usize = 2048;

/// Decode-loop contract violations. These are fatal for the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttentionCacheError {
    /// Layer index outside `0..num_layers`.
    #[error("session {session}: layer {layer} out of range (0..{num_layers})")]
    LayerOutOfRange {
        /// Session id.
        session: String,
        /// Requested layer.
        layer: usize,
        /// Layers in this cache.
        num_layers: usize,
    },

    /// Layer already holds `max_length` entries.
    #[error("session {session}: layer {layer} full at {max_length} tokens")]
    Overflow {
        /// Session id.
        session: String,
        /// Layer that is full.
        layer: usize,
        /// Configured bound.
        max_length: usize,
    },

    /// No cache exists for this session.
    #[error("no attention cache for session {0}")]
    UnknownSession(String),

    /// Zero layers or zero length requested.
    #[error("invalid attention cache shape: {num_layers} layers x {max_length} tokens")]
    InvalidShape {
        /// Requested layers.
        num_layers: usize,
        /// Requested length.
        max_length: usize,
    },
}

/// Attention state for one session.
#[derive(Debug)]
pub struct SessionCache {
    session_id: String,
    layers: Vec<Vec<LayerKv>>,
    max_length: usize,
    bytes_per_token_per_layer: usize,
}

impl SessionCache {
    /// Pre-allocate storage for `num_layers` layers of `max_length` tokens.
    pub fn new(
        session_id: impl Into<String>,
        num_layers: usize,
        max_length: usize,
        bytes_per_token_per_layer: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            layers: (0..num_layers)
                .map(|_| Vec::with_capacity(max_length))
                .collect(),
            max_length,
            bytes_per_token_per_layer,
        }
    }

    /// Append one token's key/value pair to `layer`.
    ///
    /// # Errors
    ///
    /// [`AttentionCacheError::LayerOutOfRange`] for a bad index,
    /// [`AttentionCacheError::Overflow`] when the layer is full.
    pub fn append(
        &mut self,
        layer: usize,
        key: TensorBlob,
        value: TensorBlob,
    ) -> Result<(), AttentionCacheError> {
        let num_layers = self.layers.len();
        let max_length = self.max_length;
        let Some(entries) = self.layers.get_mut(layer) else {
            return Err(AttentionCacheError::LayerOutOfRange {
                session: self.session_id.clone(),
                layer,
                num_layers,
            });
        };
        if entries.len() >= max_length {
            return Err(AttentionCacheError::Overflow {
                session: self.session_id.clone(),
                layer,
                max_length,
            });
        }
        entries.push(LayerKv { key, value });
        Ok(())
    }

    /// Session identifier.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Sequence length, tracked by layer 0.
    pub fn current_length(&self) -> usize {
        self.layers.first().map_or(0, Vec::len)
    }

    /// Number of layers.
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Per-layer bound.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// True once layer 0 reached `max_length`.
    pub fn is_full(&self) -> bool {
        self.current_length() >= self.max_length
    }

    /// Entries for one layer, oldest first.
    pub fn layer(&self, layer: usize) -> Option<&[LayerKv]> {
        self.layers.get(layer).map(Vec::as_slice)
    }

    /// Estimated footprint: `length × layers × bytes_per_token_per_layer`.
    pub fn memory_bytes(&self) -> usize {
        self.current_length()
            .saturating_mul(self.layers.len())
            .saturating_mul(self.bytes_per_token_per_layer)
    }
}

/// Aggregate counters across all sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttentionStats {
    /// Sessions currently cached.
    pub active: usize,
    /// Sessions created since start.
    pub created: u64,
    /// Sessions evicted or replaced since start.
    pub evicted: u64,
    /// Estimated bytes held by active sessions.
    pub total_bytes: usize,
}

/// Owner of every [`SessionCache`]; the only component that mutates them.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug)]
pub struct AttentionCacheManager {
    sessions: DashMap<String, Arc<Mutex<SessionCache>>>,
    bytes_per_token_per_layer: usize,
    created: AtomicU64,
    evicted: AtomicU64,
}

impl Default for AttentionCacheManager {
    fn default() -> Self {
        Self::new(DEFAULT_BYTES_PER_TOKEN_PER_LAYER)
    }
}

impl AttentionCacheManager {
    /// Create an empty manager.
    pub fn new(bytes_per_token_per_layer: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            bytes_per_token_per_layer,
            created: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Create the cache for `session_id`, replacing any existing one.
    ///
    /// # Errors
    ///
    /// [`AttentionCacheError::InvalidShape`] if either dimension is zero.
    pub fn create_cache(
        &self,
        session_id: &str,
        num_layers: usize,
        max_length: usize,
    ) -> Result<(), AttentionCacheError> {
        if num_layers == 0 || max_length == 0 {
            return Err(AttentionCacheError::InvalidShape {
                num_layers,
                max_length,
            });
        }
        let cache = SessionCache::new(
            session_id,
            num_layers,
            max_length,
            self.bytes_per_token_per_layer,
        );
        let previous = self
            .sessions
            .insert(session_id.to_string(), Arc::new(Mutex::new(cache)));
        if previous.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            warn!(session = %session_id, "replacing existing attention cache");
        }
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(session = %session_id, num_layers, max_length, "attention cache created");
        Ok(())
    }

    fn entry(&self, session_id: &str) -> Result<Arc<Mutex<SessionCache>>, AttentionCacheError> {
        self.sessions
            .get(session_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| AttentionCacheError::UnknownSession(session_id.to_string()))
    }

    /// Append one token's key/value pair to `layer` of `session_id`.
    ///
    /// # Errors
    ///
    /// See [`SessionCache::append`], plus
    /// [`AttentionCacheError::UnknownSession`].
    pub fn append(
        &self,
        session_id: &str,
        layer: usize,
        key: TensorBlob,
        value: TensorBlob,
    ) -> Result<(), AttentionCacheError> {
        let entry = self.entry(session_id)?;
        let mut cache = entry.lock();
        cache.append(layer, key, value)
    }

    /// Run `f` with read access to the session's cache.
    ///
    /// The map shard is not held while `f` runs.
    ///
    /// # Errors
    ///
    /// [`AttentionCacheError::UnknownSession`] if no cache exists.
    pub fn with_session<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&SessionCache) -> R,
    ) -> Result<R, AttentionCacheError> {
        let entry = self.entry(session_id)?;
        let cache = entry.lock();
        Ok(f(&cache))
    }

    /// Current sequence length of a session, if it exists.
    pub fn current_length(&self, session_id: &str) -> Option<usize> {
        self.with_session(session_id, SessionCache::current_length)
            .ok()
    }

    /// Remove and release a session's cache. Returns whether one existed.
    pub fn evict(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            self.evicted.fetch_add(1, Ordering::Relaxed);
            debug!(session = %session_id, "attention cache evicted");
        }
        removed
    }

    /// Drop every session. Returns how many were dropped.
    pub fn clear_all(&self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        self.evicted.fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            debug!(count, "all attention caches cleared");
        }
        count
    }

    /// Sessions currently cached.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Aggregate counters and the summed memory estimate.
    pub fn stats(&self) -> AttentionStats {
        let handles: Vec<_> = self
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let total_bytes = handles.iter().map(|h| h.lock().memory_bytes()).sum();
        AttentionStats {
            active: handles.len(),
            created: self.created.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            total_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(b: u8) -> TensorBlob {
        TensorBlob::from_vec(vec![b])
    }

    fn push_token(mgr: &AttentionCacheManager, id: &str, layers: usize, b: u8) {
        for layer in 0..layers {
            assert!(mgr.append(id, layer, blob(b), blob(b)).is_ok());
        }
    }

    #[test]
    fn test_append_advances_length_in_lockstep() {
        let mgr = AttentionCacheManager::default();
        mgr.create_cache("s1", 3, 4).ok().unwrap();
        push_token(&mgr, "s1", 3, 1);
        push_token(&mgr, "s1", 3, 2);
        assert_eq!(mgr.current_length("s1"), Some(2));
    }

    #[test]
    fn test_overflow_fails_and_leaves_length_unchanged() {
        let mgr = AttentionCacheManager::default();
        mgr.create_cache("s1", 2, 2).ok().unwrap();
        push_token(&mgr, "s1", 2, 1);
        push_token(&mgr, "s1", 2, 2);

        let err = mgr.append("s1", 0, blob(3), blob(3));
        assert!(matches!(
            err,
            Err(AttentionCacheError::Overflow {
                layer: 0,
                max_length: 2,
                ..
            })
        ));
        assert_eq!(mgr.current_length("s1"), Some(2));
        let full = mgr.with_session("s1", SessionCache::is_full).ok();
        assert_eq!(full, Some(true));
    }

    #[test]
    fn test_overflow_on_non_zero_layer() {
        let mgr = AttentionCacheManager::default();
        mgr.create_cache("s1", 2, 1).ok().unwrap();
        push_token(&mgr, "s1", 2, 1);
        assert!(matches!(
            mgr.append("s1", 1, blob(0), blob(0)),
            Err(AttentionCacheError::Overflow { layer: 1, .. })
        ));
        assert_eq!(mgr.current_length("s1"), Some(1));
    }

    #[test]
    fn test_layer_out_of_range() {
        let mgr = AttentionCacheManager::default();
        mgr.create_cache("s1", 2, 4).ok().unwrap();
        assert!(matches!(
            mgr.append("s1", 2, blob(0), blob(0)),
            Err(AttentionCacheError::LayerOutOfRange {
                layer: 2,
                num_layers: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_session() {
        let mgr = AttentionCacheManager::default();
        assert_eq!(
            mgr.append("ghost", 0, blob(0), blob(0)),
            Err(AttentionCacheError::UnknownSession("ghost".into()))
        );
        assert_eq!(mgr.current_length("ghost"), None);
    }

    #[test]
    fn test_invalid_shape_rejected() {
        let mgr = AttentionCacheManager::default();
        assert!(mgr.create_cache("s", 0, 4).is_err());
        assert!(mgr.create_cache("s", 4, 0).is_err());
        assert_eq!(mgr.active_sessions(), 0);
    }

    #[test]
    fn test_create_replaces_existing_session() {
        let mgr = AttentionCacheManager::default();
        mgr.create_cache("s1", 1, 4).ok().unwrap();
        push_token(&mgr, "s1", 1, 1);
        mgr.create_cache("s1", 1, 4).ok().unwrap();
        assert_eq!(mgr.current_length("s1"), Some(0));
        assert_eq!(mgr.active_sessions(), 1);
        let stats = mgr.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.created - stats.evicted, mgr.active_sessions() as u64);
    }

    #[test]
    fn test_evict_reports_presence() {
        let mgr = AttentionCacheManager::default();
        mgr.create_cache("s1", 1, 4).ok().unwrap();
        assert!(mgr.evict("s1"));
        assert!(!mgr.evict("s1"));
        assert_eq!(mgr.stats().evicted, 1);
    }

    #[test]
    fn test_clear_all_drops_every_session() {
        let mgr = AttentionCacheManager::default();
        for id in ["a", "b", "c"] {
            mgr.create_cache(id, 1, 2).ok().unwrap();
        }
        assert_eq!(mgr.clear_all(), 3);
        assert_eq!(mgr.active_sessions(), 0);
    }

    #[test]
    fn test_memory_estimate() {
        let mgr = AttentionCacheManager::new(100);
        mgr.create_cache("s1", 4, 10).ok().unwrap();
        push_token(&mgr, "s1", 4, 1);
        push_token(&mgr, "s1", 4, 2);
        assert_eq!(mgr.stats().total_bytes, 2 * 4 * 100);
        let bytes = mgr.with_session("s1", SessionCache::memory_bytes).ok();
        assert_eq!(bytes, Some(800));
    }

    #[test]
    fn test_layer_accessor_returns_appended_payloads() {
        let mut cache = SessionCache::new("s", 2, 4, 8);
        cache.append(1, blob(5), blob(6)).ok().unwrap();
        let layer = cache.layer(1).unwrap_or_default();
        assert_eq!(layer.len(), 1);
        assert_eq!(layer[0].value.as_bytes(), &[6]);
        assert_eq!(cache.current_length(), 0);
        assert!(cache.layer(7).is_none());
    }
}
