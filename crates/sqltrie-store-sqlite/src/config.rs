use serde::{Deserialize, Serialize};

/// What happens to value-less nodes once a delete leaves them without
/// children.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PrunePolicy {
    /// Keep them as intermediate nodes until a subtree removal or clear.
    #[default]
    Retain,
    /// Remove them, walking up towards the trie root.
    Prune,
}

/// Connection and engine settings for [`crate::SqliteTrie`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SqliteTrieConfig {
    pub busy_timeout_ms: u64,
    /// Use WAL journaling for file-backed stores.
    pub wal: bool,
    /// Retries of a single operation that hit a busy or locked database.
    pub lock_retries: u32,
    /// Linear backoff step between lock retries.
    pub retry_backoff_ms: u64,
    pub id_cache_capacity: Option<usize>,
    pub prune: PrunePolicy,
}

impl Default for SqliteTrieConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5000,
            wal: true,
            lock_retries: 3,
            retry_backoff_ms: 25,
            id_cache_capacity: None,
            prune: PrunePolicy::Retain,
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;

    #[test]
    fn partial_config_falls_back_to_defaults() -> Result<()> {
        let config: SqliteTrieConfig =
            serde_json::from_str(r#"{"prune": "prune", "lock_retries": 0}"#)?;
        assert_eq!(config.prune, PrunePolicy::Prune);
        assert_eq!(config.lock_retries, 0);
        assert_eq!(config.busy_timeout_ms, 5000);
        assert!(config.wal);
        assert_eq!(config.id_cache_capacity, None);
        Ok(())
    }
}
