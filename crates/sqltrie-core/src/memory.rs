use std::collections::BTreeMap;
use std::path::Path;

use crate::{Change, Children, Items, Result, Trie, TrieError, TrieKey, TrieNode};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Node {
    value: Option<Vec<u8>>,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn count(&self) -> usize {
        usize::from(self.value.is_some()) + self.children.values().map(Node::count).sum::<usize>()
    }

    fn collect(&self, key: &TrieKey, shallow: bool, out: &mut Items) {
        if let Some(value) = &self.value {
            out.push((key.clone(), value.clone()));
            if shallow {
                return;
            }
        }
        for (name, child) in &self.children {
            child.collect(&key.child(name), shallow, out);
        }
    }
}

/// Pointer-tree trie kept entirely in process memory.
///
/// Serves as the reference the SQL backend is checked against. It has no
/// persistence: `open` and `rollback` are unsupported, and views are detached
/// copies of the subtree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTrie {
    root: Node,
}

impl MemoryTrie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Always `Unsupported`.
    pub fn open(_path: &Path) -> Result<Self> {
        Err(TrieError::Unsupported("open"))
    }

    fn node(&self, key: &TrieKey) -> Option<&Node> {
        key.segments().iter().try_fold(&self.root, |node, name| node.children.get(name))
    }

    fn node_mut(&mut self, key: &TrieKey) -> Option<&mut Node> {
        key.segments().iter().try_fold(&mut self.root, |node, name| node.children.get_mut(name))
    }

    fn flatten(&self, key: &TrieKey) -> BTreeMap<TrieKey, Vec<u8>> {
        let mut items = Vec::new();
        if let Some(node) = self.node(key) {
            node.collect(&TrieKey::root(), false, &mut items);
        }
        items.into_iter().collect()
    }

    fn prefixes(&self, key: &TrieKey) -> Vec<(TrieKey, Vec<u8>)> {
        let mut found = Vec::new();
        let mut node = &self.root;
        if let Some(value) = &node.value {
            found.push((TrieKey::root(), value.clone()));
        }
        for (depth, name) in key.segments().iter().enumerate() {
            let Some(child) = node.children.get(name) else {
                break;
            };
            if let Some(value) = &child.value {
                found.push((key.prefix(depth + 1), value.clone()));
            }
            node = child;
        }
        found
    }

    fn fold<T, F>(node: &Node, key: TrieKey, node_factory: &F) -> Result<T>
    where
        F: Fn(&TrieKey, Children<'_, T>, Option<Vec<u8>>) -> Result<T>,
    {
        let parent = key.clone();
        let children: Children<'_, T> = Box::new(
            node.children
                .iter()
                .map(move |(name, child)| Self::fold(child, parent.child(name), node_factory)),
        );
        node_factory(&key, children, node.value.clone())
    }
}

impl Trie for MemoryTrie {
    fn get(&self, key: &TrieKey) -> Result<Vec<u8>> {
        let node = self.node(key).ok_or_else(|| TrieError::KeyNotFound(key.clone()))?;
        node.value.clone().ok_or_else(|| TrieError::ShortKey(key.clone()))
    }

    fn set(&mut self, key: &TrieKey, value: &[u8]) -> Result<()> {
        let node = key
            .segments()
            .iter()
            .fold(&mut self.root, |node, name| node.children.entry(name.clone()).or_default());
        node.value = Some(value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &TrieKey) -> Result<()> {
        let node = self.node_mut(key).ok_or_else(|| TrieError::KeyNotFound(key.clone()))?;
        match node.value.take() {
            Some(_) => Ok(()),
            None => Err(TrieError::ShortKey(key.clone())),
        }
    }

    fn len(&self) -> Result<usize> {
        Ok(self.root.count())
    }

    fn items(&self, prefix: &TrieKey, shallow: bool) -> Result<Items> {
        let node = self.node(prefix).ok_or_else(|| TrieError::KeyNotFound(prefix.clone()))?;
        let mut items = Vec::new();
        node.collect(prefix, shallow, &mut items);
        Ok(items)
    }

    fn ls_values(&self, key: &TrieKey) -> Result<Vec<TrieNode>> {
        let node = self.node(key).ok_or_else(|| TrieError::KeyNotFound(key.clone()))?;
        Ok(node
            .children
            .iter()
            .map(|(name, child)| TrieNode::new(key.child(name), child.value.clone()))
            .collect())
    }

    fn shortest_prefix(&self, key: &TrieKey) -> Result<Option<(TrieKey, Vec<u8>)>> {
        Ok(self.prefixes(key).into_iter().next())
    }

    fn longest_prefix(&self, key: &TrieKey) -> Result<Option<(TrieKey, Vec<u8>)>> {
        Ok(self.prefixes(key).pop())
    }

    fn has_node(&self, key: &TrieKey) -> Result<bool> {
        Ok(self.node(key).is_some())
    }

    fn view(&self, key: &TrieKey) -> Result<Self> {
        Ok(Self { root: self.node(key).cloned().unwrap_or_default() })
    }

    fn traverse<T, F>(&self, node_factory: &F, prefix: &TrieKey) -> Result<T>
    where
        F: Fn(&TrieKey, Children<'_, T>, Option<Vec<u8>>) -> Result<T>,
    {
        let node = self.node(prefix).ok_or_else(|| TrieError::KeyNotFound(prefix.clone()))?;
        Self::fold(node, prefix.clone(), node_factory)
    }

    fn diff(&self, old: &TrieKey, new: &TrieKey, with_unchanged: bool) -> Result<Vec<Change>> {
        let mut old_items = self.flatten(old);
        let mut new_items = self.flatten(new);
        let mut keys = old_items.keys().cloned().collect::<Vec<_>>();
        keys.extend(new_items.keys().filter(|key| !old_items.contains_key(*key)).cloned());
        keys.sort();

        Ok(keys
            .into_iter()
            .filter_map(|key| {
                let old_value = old_items.remove(&key);
                let new_value = new_items.remove(&key);
                Change::classify(&key, old_value, new_value, with_unchanged)
            })
            .collect())
    }

    fn remove_subtree(&mut self, key: &TrieKey) -> Result<()> {
        let Some(parent_key) = key.parent() else {
            return self.clear();
        };
        let removed = self
            .node_mut(&parent_key)
            .and_then(|parent| key.last().and_then(|name| parent.children.remove(name)));
        match removed {
            Some(_) => Ok(()),
            None => Err(TrieError::KeyNotFound(key.clone())),
        }
    }

    fn clear(&mut self) -> Result<()> {
        self.root = Node::default();
        Ok(())
    }
}
