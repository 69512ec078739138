use std::collections::HashMap;

use sqltrie_core::TrieKey;

/// Absolute key to node id, used to skip re-walking known prefixes.
///
/// Never authoritative: every path that removes nodes must call
/// [`IdCache::invalidate`], and a rolled back transaction clears it.
#[derive(Debug, Default)]
pub(crate) struct IdCache {
    ids: HashMap<TrieKey, i64>,
    capacity: Option<usize>,
}

impl IdCache {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self { ids: HashMap::new(), capacity }
    }

    pub(crate) fn get(&self, key: &TrieKey) -> Option<i64> {
        self.ids.get(key).copied()
    }

    pub(crate) fn insert(&mut self, key: TrieKey, id: i64) {
        if let Some(capacity) = self.capacity {
            if capacity == 0 {
                return;
            }
            if self.ids.len() >= capacity && !self.ids.contains_key(&key) {
                self.ids.clear();
            }
        }
        self.ids.insert(key, id);
    }

    /// Forget `key` and every key below it.
    pub(crate) fn invalidate(&mut self, key: &TrieKey) {
        self.ids.retain(|cached, _| !cached.starts_with(key));
    }

    pub(crate) fn clear(&mut self) {
        self.ids.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }
}
