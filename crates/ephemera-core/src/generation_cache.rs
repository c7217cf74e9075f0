//! Latest-generation cache for teams and teambots.
//!
//! Remembers which generation is current for a principal so hot paths skip
//! the statement fetch. Entries expire after a TTL and the cache is bounded
//! with LRU eviction.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use parking_lot::Mutex;

use crate::types::{EkGeneration, Principal};

/// A cached "latest generation" decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestGeneration<I> {
    /// Generation handed out
    pub generation: EkGeneration,
    /// When the entry was written
    pub cached_at: I,
    /// A successor is being published in the background
    pub creation_in_progress: bool,
}

/// Result of [`GenerationCache::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// Entry stored
    Stored,
    /// Entry stored and the least recently used one evicted
    Evicted,
}

struct Inner<I> {
    entries: HashMap<Principal, LatestGeneration<I>>,
    /// Most recent at the back
    lru_order: VecDeque<Principal>,
}

/// Bounded TTL cache of latest generations.
pub struct GenerationCache<I> {
    inner: Mutex<Inner<I>>,
    capacity: usize,
    ttl: Duration,
}

impl<I> GenerationCache<I>
where
    I: Copy + Ord + std::ops::Sub<Output = Duration>,
{
    /// Cache holding at most `capacity` principals for `ttl` each.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner { entries: HashMap::new(), lru_order: VecDeque::new() }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Entry for `principal` and whether it outlived the TTL at `now`.
    ///
    /// Touches the LRU order.
    pub fn get(&self, principal: &Principal, now: I) -> Option<(LatestGeneration<I>, bool)> {
        let mut inner = self.inner.lock();
        let entry = *inner.entries.get(principal)?;

        inner.lru_order.retain(|p| p != principal);
        inner.lru_order.push_back(principal.clone());

        let expired = now - entry.cached_at >= self.ttl;
        Some((entry, expired))
    }

    /// Record `generation` as current for `principal`.
    pub fn insert(
        &self,
        principal: &Principal,
        generation: EkGeneration,
        creation_in_progress: bool,
        now: I,
    ) -> InsertResult {
        let mut inner = self.inner.lock();

        let is_new_entry = !inner.entries.contains_key(principal);
        if !is_new_entry {
            inner.lru_order.retain(|p| p != principal);
        }

        let mut result = InsertResult::Stored;
        if is_new_entry && inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.lru_order.pop_front() {
                inner.entries.remove(&oldest);
                result = InsertResult::Evicted;
            }
        }

        inner.entries.insert(
            principal.clone(),
            LatestGeneration { generation, cached_at: now, creation_in_progress },
        );
        inner.lru_order.push_back(principal.clone());
        result
    }

    /// Drop the entry for `principal`.
    pub fn remove(&self, principal: &Principal) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(principal).is_some() {
            inner.lru_order.retain(|p| p != principal);
        }
    }

    /// Drop the entry for `principal` unless it points at `generation`.
    pub fn remove_unless(&self, principal: &Principal, generation: EkGeneration) {
        let mut inner = self.inner.lock();
        let stale = inner.entries.get(principal).is_some_and(|e| e.generation != generation);
        if stale {
            inner.entries.remove(principal);
            inner.lru_order.retain(|p| p != principal);
        }
    }

    /// Drop everything.
    pub fn purge(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru_order.clear();
    }

    /// Number of cached principals.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
