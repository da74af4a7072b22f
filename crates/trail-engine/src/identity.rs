//! Bounded `volatile_id -> stable id` maps, one per object kind.
//!
//! The cache is only a fast path. Every hit is verified against the store
//! by the caller, and an eviction simply sends the next lookup to the store.

use std::num::NonZeroUsize;

use lru::LruCache;
use serde::{Deserialize, Serialize};

use trail_core::ids::{TabId, VolatileId, WindowId};

/// Persistable cache contents, least recently used first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    #[serde(default)]
    pub tabs: Vec<(VolatileId, TabId)>,
    #[serde(default)]
    pub windows: Vec<(VolatileId, WindowId)>,
}

pub struct IdentityCache {
    tabs: LruCache<VolatileId, TabId>,
    windows: LruCache<VolatileId, WindowId>,
}

fn cap(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

impl IdentityCache {
    pub fn new(tab_capacity: usize, window_capacity: usize) -> Self {
        Self {
            tabs: LruCache::new(cap(tab_capacity)),
            windows: LruCache::new(cap(window_capacity)),
        }
    }

    /// Rebuild from a snapshot. Entries beyond capacity drop oldest first.
    pub fn from_snapshot(snapshot: IdentitySnapshot, tab_capacity: usize, window_capacity: usize) -> Self {
        let mut cache = Self::new(tab_capacity, window_capacity);
        for (volatile_id, id) in snapshot.tabs {
            cache.tabs.put(volatile_id, id);
        }
        for (volatile_id, id) in snapshot.windows {
            cache.windows.put(volatile_id, id);
        }
        cache
    }

    pub fn snapshot(&self) -> IdentitySnapshot {
        IdentitySnapshot {
            tabs: self.tabs.iter().rev().map(|(k, v)| (*k, v.clone())).collect(),
            windows: self.windows.iter().rev().map(|(k, v)| (*k, v.clone())).collect(),
        }
    }

    pub fn tab(&mut self, volatile_id: VolatileId) -> Option<TabId> {
        self.tabs.get(&volatile_id).cloned()
    }

    pub fn window(&mut self, volatile_id: VolatileId) -> Option<WindowId> {
        self.windows.get(&volatile_id).cloned()
    }

    /// Registering a stable id also drops any other volatile id still
    /// pointing at it, so one stable id never has two live aliases.
    pub fn put_tab(&mut self, volatile_id: VolatileId, id: TabId) {
        let stale: Vec<VolatileId> = self
            .tabs
            .iter()
            .filter(|(k, v)| **v == id && **k != volatile_id)
            .map(|(k, _)| *k)
            .collect();
        for k in stale {
            self.tabs.pop(&k);
        }
        self.tabs.put(volatile_id, id);
    }

    pub fn put_window(&mut self, volatile_id: VolatileId, id: WindowId) {
        let stale: Vec<VolatileId> = self
            .windows
            .iter()
            .filter(|(k, v)| **v == id && **k != volatile_id)
            .map(|(k, _)| *k)
            .collect();
        for k in stale {
            self.windows.pop(&k);
        }
        self.windows.put(volatile_id, id);
    }

    pub fn remove_tab(&mut self, volatile_id: VolatileId) -> Option<TabId> {
        self.tabs.pop(&volatile_id)
    }

    pub fn remove_window(&mut self, volatile_id: VolatileId) -> Option<WindowId> {
        self.windows.pop(&volatile_id)
    }

    /// Reverse lookup, used when a stable id is deleted outright.
    pub fn forget_tab(&mut self, id: &TabId) {
        let keys: Vec<VolatileId> = self.tabs.iter().filter(|(_, v)| *v == id).map(|(k, _)| *k).collect();
        for k in keys {
            self.tabs.pop(&k);
        }
    }

    pub fn forget_window(&mut self, id: &WindowId) {
        let keys: Vec<VolatileId> = self.windows.iter().filter(|(_, v)| *v == id).map(|(k, _)| *k).collect();
        for k in keys {
            self.windows.pop(&k);
        }
    }

    pub fn clear(&mut self) {
        self.tabs.clear();
        self.windows.clear();
    }

    pub fn len(&self) -> (usize, usize) {
        (self.tabs.len(), self.windows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = IdentityCache::new(2, 2);
        let (a, b, c) = (TabId::new(), TabId::new(), TabId::new());
        cache.put_tab(1, a.clone());
        cache.put_tab(2, b);
        assert_eq!(cache.tab(1), Some(a.clone()));
        cache.put_tab(3, c.clone());

        assert_eq!(cache.tab(2), None);
        assert_eq!(cache.tab(1), Some(a));
        assert_eq!(cache.tab(3), Some(c));
    }

    #[test]
    fn kinds_are_independent() {
        let mut cache = IdentityCache::new(4, 4);
        let w = WindowId::new();
        cache.put_window(1, w.clone());
        assert_eq!(cache.tab(1), None);
        assert_eq!(cache.window(1), Some(w));
    }

    #[test]
    fn snapshot_restores_recency_order() {
        let mut cache = IdentityCache::new(3, 3);
        let ids: Vec<TabId> = (0..3).map(|_| TabId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            cache.put_tab(i as i64, id.clone());
        }
        cache.tab(0);

        let snap = cache.snapshot();
        assert_eq!(snap.tabs.last().map(|(k, _)| *k), Some(0));

        let mut restored = IdentityCache::from_snapshot(snap, 3, 3);
        restored.put_tab(9, TabId::new());
        assert_eq!(restored.tab(1), None, "oldest entry evicted first");
        assert_eq!(restored.tab(0), Some(ids[0].clone()));
    }

    #[test]
    fn restoring_into_smaller_capacity_keeps_newest() {
        let mut cache = IdentityCache::new(5, 5);
        for i in 0..5 {
            cache.put_tab(i, TabId::new());
        }
        let restored = IdentityCache::from_snapshot(cache.snapshot(), 2, 2);
        let keys: Vec<i64> = restored.snapshot().tabs.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![3, 4]);
    }

    #[test]
    fn rebinding_drops_old_alias() {
        let mut cache = IdentityCache::new(4, 4);
        let id = TabId::new();
        cache.put_tab(1, id.clone());
        cache.put_tab(2, id.clone());
        assert_eq!(cache.tab(1), None);
        assert_eq!(cache.tab(2), Some(id.clone()));

        cache.forget_tab(&id);
        assert_eq!(cache.len(), (0, 0));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut cache = IdentityCache::new(0, 0);
        cache.put_tab(1, TabId::new());
        assert_eq!(cache.len().0, 1);
    }
}
