use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

mod memory;
mod serialized;

pub use memory::MemoryTrie;
pub use serialized::{Codec, JsonCodec, JsonTrie, SerializedTrie};

pub type Result<T, E = TrieError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TrieError {
    #[error("key not found: {0}")]
    KeyNotFound(TrieKey),
    /// The key names an intermediate node that carries no value.
    #[error("key has no value attached: {0}")]
    ShortKey(TrieKey),
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
    #[error("storage engine is locked: {0}")]
    Locked(String),
    #[error("storage engine failure: {0:#}")]
    Engine(anyhow::Error),
    #[error("codec error: {0}")]
    Codec(String),
}

impl TrieError {
    /// True for both an absent key and a value-less intermediate node.
    #[must_use]
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound(_) | Self::ShortKey(_))
    }

    #[must_use]
    pub fn is_short_key(&self) -> bool {
        matches!(self, Self::ShortKey(_))
    }

    /// Lock contention reported by the engine after the bounded retry gave up.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}

/// Ordered sequence of path segments. The empty key addresses the root.
///
/// Segments are joined with [`TrieKey::SEPARATOR`] when a key is handed to the
/// storage engine as a single path, so a segment must not contain it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TrieKey(Vec<String>);

impl TrieKey {
    pub const SEPARATOR: char = '/';

    #[must_use]
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parse a separator-joined path; the empty string is the root key.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        if path.is_empty() {
            return Self::root();
        }
        Self::new(path.split(Self::SEPARATOR))
    }

    #[must_use]
    pub fn to_path(&self) -> String {
        self.0.join("/")
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(self.prefix(self.0.len() - 1))
    }

    /// The first `len` segments (the whole key if `len` exceeds its length).
    #[must_use]
    pub fn prefix(&self, len: usize) -> Self {
        Self(self.0.iter().take(len).cloned().collect())
    }

    #[must_use]
    pub fn child(&self, name: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(name.to_string());
        Self(segments)
    }

    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        let mut segments = self.0.clone();
        segments.extend(other.0.iter().cloned());
        Self(segments)
    }

    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.0.starts_with(&prefix.0)
    }

    #[must_use]
    pub fn strip_prefix(&self, prefix: &Self) -> Option<Self> {
        self.0.strip_prefix(prefix.0.as_slice()).map(|rest| Self(rest.to_vec()))
    }
}

impl Display for TrieKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}", self.to_path())
    }
}

impl<const N: usize> From<[&str; N]> for TrieKey {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

impl From<&[&str]> for TrieKey {
    fn from(segments: &[&str]) -> Self {
        Self::new(segments.iter().copied())
    }
}

impl From<Vec<String>> for TrieKey {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl FromIterator<String> for TrieKey {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A key paired with the value stored at it, if any.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TrieNode {
    pub key: TrieKey,
    pub value: Option<Vec<u8>>,
}

impl TrieNode {
    #[must_use]
    pub fn new(key: TrieKey, value: Option<Vec<u8>>) -> Self {
        Self { key, value }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Add,
    Modify,
    Delete,
    Unchanged,
}

impl ChangeType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Unchanged => "unchanged",
        }
    }
}

/// One entry of a structural diff. `Add` carries no `old`, `Delete` no `new`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Change {
    pub typ: ChangeType,
    pub old: Option<TrieNode>,
    pub new: Option<TrieNode>,
}

impl Change {
    /// Classify one relative key from both sides of a diff.
    ///
    /// Returns `None` when the key is absent on both sides, or unchanged and
    /// `with_unchanged` is off.
    #[must_use]
    pub fn classify(
        key: &TrieKey,
        old: Option<Vec<u8>>,
        new: Option<Vec<u8>>,
        with_unchanged: bool,
    ) -> Option<Self> {
        let typ = match (&old, &new) {
            (None, None) => return None,
            (None, Some(_)) => ChangeType::Add,
            (Some(_), None) => ChangeType::Delete,
            (Some(old_value), Some(new_value)) if old_value != new_value => ChangeType::Modify,
            (Some(_), Some(_)) if with_unchanged => ChangeType::Unchanged,
            (Some(_), Some(_)) => return None,
        };

        Some(Self {
            typ,
            old: old.map(|value| TrieNode::new(key.clone(), Some(value))),
            new: new.map(|value| TrieNode::new(key.clone(), Some(value))),
        })
    }

    /// Key of the entry: the new side for additions, the old side otherwise.
    #[must_use]
    pub fn key(&self) -> Option<&TrieKey> {
        let entry = match self.typ {
            ChangeType::Add => self.new.as_ref(),
            ChangeType::Modify | ChangeType::Delete | ChangeType::Unchanged => self.old.as_ref(),
        };
        entry.map(|node| &node.key)
    }

    #[must_use]
    pub fn is_change(&self) -> bool {
        self.typ != ChangeType::Unchanged
    }
}

/// Already-combined results of a node's children, produced on demand.
pub type Children<'a, T> = Box<dyn Iterator<Item = Result<T>> + 'a>;

/// Key/value pairs produced by [`Trie::items`].
pub type Items = Vec<(TrieKey, Vec<u8>)>;

/// The contract every trie backend satisfies: a mapping from [`TrieKey`] to
/// bytes plus tree-shaped queries.
pub trait Trie {
    /// # Errors
    /// `KeyNotFound` when no node exists at `key`, `ShortKey` when the node has
    /// no value.
    fn get(&self, key: &TrieKey) -> Result<Vec<u8>>;

    /// Store `value` at `key`, creating any missing ancestors as value-less nodes.
    ///
    /// # Errors
    /// Returns an error when the backend fails to persist the value.
    fn set(&mut self, key: &TrieKey, value: &[u8]) -> Result<()>;

    /// Remove the value at `key`. The node itself stays as an intermediate node
    /// unless the backend prunes it.
    ///
    /// # Errors
    /// `KeyNotFound` when no node exists at `key`, `ShortKey` when it has no value.
    fn delete(&mut self, key: &TrieKey) -> Result<()>;

    /// Number of keys carrying a value.
    ///
    /// # Errors
    /// Returns an error when the backend cannot count its nodes.
    fn len(&self) -> Result<usize>;

    /// # Errors
    /// Same as [`Trie::len`].
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// True iff `key` carries a value.
    ///
    /// # Errors
    /// Returns backend failures; absent and value-less keys are `Ok(false)`.
    fn contains(&self, key: &TrieKey) -> Result<bool> {
        match self.get(key) {
            Ok(_) => Ok(true),
            Err(err) if err.is_key_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// All `(key, value)` pairs at or under `prefix`, parents before descendants.
    /// With `shallow`, a valued node is listed but its descendants are not.
    ///
    /// # Errors
    /// `KeyNotFound` when `prefix` has no node.
    fn items(&self, prefix: &TrieKey, shallow: bool) -> Result<Items>;

    /// Keys of the direct children of `key`.
    ///
    /// # Errors
    /// `KeyNotFound` when `key` has no node.
    fn ls(&self, key: &TrieKey) -> Result<Vec<TrieKey>> {
        Ok(self.ls_values(key)?.into_iter().map(|node| node.key).collect())
    }

    /// Direct children of `key` with their values (`None` for intermediate nodes).
    ///
    /// # Errors
    /// `KeyNotFound` when `key` has no node.
    fn ls_values(&self, key: &TrieKey) -> Result<Vec<TrieNode>>;

    /// The valued ancestor of `key` (inclusive) closest to the root.
    ///
    /// # Errors
    /// Returns backend failures only.
    fn shortest_prefix(&self, key: &TrieKey) -> Result<Option<(TrieKey, Vec<u8>)>>;

    /// The valued ancestor of `key` (inclusive) furthest from the root.
    ///
    /// # Errors
    /// Returns backend failures only.
    fn longest_prefix(&self, key: &TrieKey) -> Result<Option<(TrieKey, Vec<u8>)>>;

    /// True iff a node, valued or not, exists at `key`.
    ///
    /// # Errors
    /// Returns backend failures only.
    fn has_node(&self, key: &TrieKey) -> Result<bool>;

    /// A handle on the subtree at `key`, addressed with keys relative to it.
    ///
    /// # Errors
    /// Returns an error when the backend cannot materialize the subtree root.
    fn view(&self, key: &TrieKey) -> Result<Self>
    where
        Self: Sized;

    /// Fold the subtree at `prefix` bottom-up. `node_factory` receives each
    /// node's key, its children's results (computed lazily as the iterator is
    /// consumed) and its value.
    ///
    /// # Errors
    /// `KeyNotFound` when `prefix` has no node, or any error from `node_factory`.
    fn traverse<T, F>(&self, node_factory: &F, prefix: &TrieKey) -> Result<T>
    where
        Self: Sized,
        F: Fn(&TrieKey, Children<'_, T>, Option<Vec<u8>>) -> Result<T>;

    /// Compare the subtree at `old` with the subtree at `new` by relative key.
    /// A key without a node is treated as an empty subtree.
    ///
    /// # Errors
    /// Returns backend failures only.
    fn diff(&self, old: &TrieKey, new: &TrieKey, with_unchanged: bool) -> Result<Vec<Change>>;

    /// Delete the node at `key` together with all its descendants. At the
    /// handle's own root this empties the trie instead.
    ///
    /// # Errors
    /// `KeyNotFound` when `key` has no node.
    fn remove_subtree(&mut self, key: &TrieKey) -> Result<()>;

    /// Remove every node except the root, and the root's value.
    ///
    /// # Errors
    /// Returns backend failures only.
    fn clear(&mut self) -> Result<()>;

    /// # Errors
    /// Returns an error when the backend fails to commit.
    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    /// # Errors
    /// `Unsupported` for backends without transactions.
    fn rollback(&mut self) -> Result<()> {
        Err(TrieError::Unsupported("rollback"))
    }

    /// # Errors
    /// Returns an error when the backend fails to release its resources.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
