use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{Change, Children, Result, Trie, TrieError, TrieKey};

/// Converts logical values to and from the bytes a [`Trie`] stores.
pub trait Codec {
    type Value;

    /// # Errors
    /// `TrieError::Codec` when the value cannot be encoded.
    fn encode(&self, key: &TrieKey, value: &Self::Value) -> Result<Vec<u8>>;

    /// # Errors
    /// `TrieError::Codec` when the bytes are not a valid encoding.
    fn decode(&self, key: &TrieKey, raw: &[u8]) -> Result<Self::Value>;
}

/// UTF-8 JSON encoding through `serde_json`.
pub struct JsonCodec<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> JsonCodec<V> {
    #[must_use]
    pub fn new() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<V> Default for JsonCodec<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for JsonCodec<V> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<V> Codec for JsonCodec<V>
where
    V: Serialize + DeserializeOwned,
{
    type Value = V;

    fn encode(&self, key: &TrieKey, value: &V) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|err| TrieError::Codec(format!("failed to encode value at {key}: {err}")))
    }

    fn decode(&self, key: &TrieKey, raw: &[u8]) -> Result<V> {
        serde_json::from_slice(raw)
            .map_err(|err| TrieError::Codec(format!("failed to decode value at {key}: {err}")))
    }
}

/// Wraps any [`Trie`] and runs every stored value through a [`Codec`].
/// Keys and tree structure pass through untouched.
pub struct SerializedTrie<T, C> {
    trie: T,
    codec: C,
}

pub type JsonTrie<T, V> = SerializedTrie<T, JsonCodec<V>>;

impl<T, C> SerializedTrie<T, C>
where
    T: Trie,
    C: Codec + Clone,
{
    pub fn new(trie: T, codec: C) -> Self {
        Self { trie, codec }
    }

    pub fn inner(&self) -> &T {
        &self.trie
    }

    pub fn into_inner(self) -> T {
        self.trie
    }

    /// # Errors
    /// Errors from the inner trie, or a decode failure.
    pub fn get(&self, key: &TrieKey) -> Result<C::Value> {
        let raw = self.trie.get(key)?;
        self.codec.decode(key, &raw)
    }

    /// # Errors
    /// Errors from the inner trie, or an encode failure.
    pub fn set(&mut self, key: &TrieKey, value: &C::Value) -> Result<()> {
        let raw = self.codec.encode(key, value)?;
        self.trie.set(key, &raw)
    }

    /// # Errors
    /// Errors from the inner trie.
    pub fn delete(&mut self, key: &TrieKey) -> Result<()> {
        self.trie.delete(key)
    }

    /// # Errors
    /// Errors from the inner trie.
    pub fn len(&self) -> Result<usize> {
        self.trie.len()
    }

    /// # Errors
    /// Errors from the inner trie.
    pub fn is_empty(&self) -> Result<bool> {
        self.trie.is_empty()
    }

    /// # Errors
    /// Errors from the inner trie.
    pub fn contains(&self, key: &TrieKey) -> Result<bool> {
        self.trie.contains(key)
    }

    /// # Errors
    /// Errors from the inner trie, or a decode failure.
    pub fn items(&self, prefix: &TrieKey, shallow: bool) -> Result<Vec<(TrieKey, C::Value)>> {
        self.trie
            .items(prefix, shallow)?
            .into_iter()
            .map(|(key, raw)| {
                let value = self.codec.decode(&key, &raw)?;
                Ok((key, value))
            })
            .collect()
    }

    /// # Errors
    /// Errors from the inner trie.
    pub fn ls(&self, key: &TrieKey) -> Result<Vec<TrieKey>> {
        self.trie.ls(key)
    }

    /// # Errors
    /// Errors from the inner trie.
    pub fn has_node(&self, key: &TrieKey) -> Result<bool> {
        self.trie.has_node(key)
    }

    /// # Errors
    /// Errors from the inner trie, or a decode failure.
    pub fn shortest_prefix(&self, key: &TrieKey) -> Result<Option<(TrieKey, C::Value)>> {
        self.decode_prefix(self.trie.shortest_prefix(key)?)
    }

    /// # Errors
    /// Errors from the inner trie, or a decode failure.
    pub fn longest_prefix(&self, key: &TrieKey) -> Result<Option<(TrieKey, C::Value)>> {
        self.decode_prefix(self.trie.longest_prefix(key)?)
    }

    /// # Errors
    /// Errors from the inner trie.
    pub fn view(&self, key: &TrieKey) -> Result<Self> {
        Ok(Self { trie: self.trie.view(key)?, codec: self.codec.clone() })
    }

    /// Like [`Trie::traverse`], with each value decoded before it reaches
    /// `node_factory`.
    ///
    /// # Errors
    /// Errors from the inner trie, a decode failure, or `node_factory`.
    pub fn traverse<R, F>(&self, node_factory: &F, prefix: &TrieKey) -> Result<R>
    where
        F: Fn(&TrieKey, Children<'_, R>, Option<C::Value>) -> Result<R>,
    {
        self.trie.traverse(
            &|key: &TrieKey, children: Children<'_, R>, raw: Option<Vec<u8>>| {
                let value = raw.map(|raw| self.codec.decode(key, &raw)).transpose()?;
                node_factory(key, children, value)
            },
            prefix,
        )
    }

    /// Diff of the raw stored bytes.
    ///
    /// # Errors
    /// Errors from the inner trie.
    pub fn diff(&self, old: &TrieKey, new: &TrieKey, with_unchanged: bool) -> Result<Vec<Change>> {
        self.trie.diff(old, new, with_unchanged)
    }

    /// # Errors
    /// Errors from the inner trie.
    pub fn clear(&mut self) -> Result<()> {
        self.trie.clear()
    }

    /// # Errors
    /// Errors from the inner trie.
    pub fn commit(&mut self) -> Result<()> {
        self.trie.commit()
    }

    /// # Errors
    /// Errors from the inner trie.
    pub fn rollback(&mut self) -> Result<()> {
        self.trie.rollback()
    }

    /// # Errors
    /// Errors from the inner trie.
    pub fn close(&mut self) -> Result<()> {
        self.trie.close()
    }

    fn decode_prefix(
        &self,
        found: Option<(TrieKey, Vec<u8>)>,
    ) -> Result<Option<(TrieKey, C::Value)>> {
        found
            .map(|(key, raw)| {
                let value = self.codec.decode(&key, &raw)?;
                Ok((key, value))
            })
            .transpose()
    }
}
