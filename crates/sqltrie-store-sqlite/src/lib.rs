use std::fmt::{Debug, Formatter};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, DatabaseName};
use serde::{Deserialize, Serialize};
use sqltrie_core::{Change, Children, Items, Result, Trie, TrieError, TrieKey, TrieNode};

mod cache;
mod config;
mod schema;
mod sql;
mod store;

pub use config::{PrunePolicy, SqliteTrieConfig};
pub use schema::SchemaStatus;

use schema::ROOT_ID;
use store::{engine_error, is_foreign_key_violation, EngineContext, NodeRow, NodeStore, Session};

/// One row reported by `PRAGMA foreign_key_check`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

/// Outcome of [`SqliteTrie::integrity_check`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Trie persisted in a `SQLite` `nodes` table.
///
/// Cloning a handle is cheap and yields another handle on the same store.
/// Each thread using a store gets its own connection, opened lazily; writes
/// accumulate in a transaction on that connection until [`Trie::commit`].
#[derive(Clone)]
pub struct SqliteTrie {
    store: Arc<NodeStore>,
    root_id: i64,
    // Absolute key of `root_id`; id cache entries are keyed absolutely so
    // views of one store can share them.
    base: TrieKey,
}

impl Debug for SqliteTrie {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteTrie")
            .field("store", &self.store.describe())
            .field("root_id", &self.root_id)
            .field("base", &self.base)
            .finish()
    }
}

impl SqliteTrie {
    /// Open (or create) a durable store at `path`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened, configured, or
    /// migrated to the current schema.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_config(path, SqliteTrieConfig::default())
    }

    /// # Errors
    /// Same as [`SqliteTrie::open`].
    pub fn open_with_config(path: &Path, config: SqliteTrieConfig) -> Result<Self> {
        Ok(Self::with_store(NodeStore::file(path, config)?))
    }

    /// A private in-memory store that lives as long as any handle onto it.
    ///
    /// # Errors
    /// Returns an error when the in-memory database cannot be initialized.
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_config(SqliteTrieConfig::default())
    }

    /// # Errors
    /// Same as [`SqliteTrie::in_memory`].
    pub fn in_memory_with_config(config: SqliteTrieConfig) -> Result<Self> {
        Ok(Self::with_store(NodeStore::memory(config)?))
    }

    fn with_store(store: NodeStore) -> Self {
        Self { store: Arc::new(store), root_id: ROOT_ID, base: TrieKey::root() }
    }

    #[must_use]
    pub fn config(&self) -> &SqliteTrieConfig {
        self.store.config()
    }

    /// Absolute key of this handle's root; empty unless the handle is a view.
    #[must_use]
    pub fn base(&self) -> &TrieKey {
        &self.base
    }

    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.store.with_session(|session| schema::schema_status(&session.conn))
    }

    /// Apply pending schema migrations. Opening a store already does this;
    /// when something is pending, the calling thread must not have an open
    /// transaction.
    ///
    /// # Errors
    /// Returns an error when a migration fails or the database records a
    /// schema version newer than this crate knows.
    pub fn migrate(&self) -> Result<SchemaStatus> {
        self.store.with_session(|session| {
            schema::migrate(&mut session.conn)?;
            schema::schema_status(&session.conn)
        })
    }

    /// Run quick-check, foreign-key-check, and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.store.with_session(|session| {
            let quick_check_message: String = session
                .conn
                .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
                .engine_context("failed to run PRAGMA quick_check")?;

            let mut stmt = session
                .conn
                .prepare("PRAGMA foreign_key_check")
                .engine_context("failed to prepare PRAGMA foreign_key_check")?;
            let foreign_key_violations = stmt
                .query_map([], |row| {
                    Ok(ForeignKeyViolation {
                        table: row.get(0)?,
                        rowid: row.get(1)?,
                        parent: row.get(2)?,
                        fk_index: row.get(3)?,
                    })
                })
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .engine_context("failed to run PRAGMA foreign_key_check")?;

            Ok(IntegrityReport {
                quick_check_ok: quick_check_message == "ok",
                quick_check_message,
                foreign_key_violations,
                schema_status: schema::schema_status(&session.conn)?,
            })
        })
    }

    /// Write an online backup of the database to `out_file`, as seen from the
    /// calling thread's connection.
    ///
    /// # Errors
    /// Returns an error when the parent directory cannot be created or the
    /// backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                TrieError::Engine(anyhow::Error::new(err).context(format!(
                    "failed to create parent directory for backup file {}",
                    out_file.display()
                )))
            })?;
        }

        self.store.with_session(|session| {
            session
                .conn
                .backup(DatabaseName::Main, out_file, None)
                .engine_context("failed to create sqlite backup")
        })
    }

    fn absolute(&self, key: &TrieKey) -> TrieKey {
        self.base.join(key)
    }

    /// Root row followed by the rows matched along `key`; shorter than
    /// `key.len() + 1` when the key does not fully resolve.
    fn walk(&self, session: &Session, key: &TrieKey) -> Result<Vec<NodeRow>> {
        let mut stmt =
            session.conn.prepare_cached(sql::WALK_SQL).engine_context("failed to prepare walk")?;
        let rows = stmt
            .query_map(params![self.root_id, key.to_path()], NodeRow::from_row)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .engine_context("failed to walk key")?;
        Ok(rows)
    }

    fn resolve(&self, session: &Session, key: &TrieKey) -> Result<NodeRow> {
        let mut rows = self.walk(session, key)?;
        if rows.len() != key.len() + 1 {
            return Err(TrieError::KeyNotFound(key.clone()));
        }
        rows.pop().ok_or_else(|| TrieError::KeyNotFound(key.clone()))
    }

    fn children(session: &Session, id: i64) -> Result<Vec<NodeRow>> {
        let mut stmt = session
            .conn
            .prepare_cached(sql::CHILDREN_SQL)
            .engine_context("failed to prepare child listing")?;
        let rows = stmt
            .query_map(params![id], NodeRow::from_row)
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .engine_context("failed to list children")?;
        Ok(rows)
    }

    /// Id of the node at `key`, creating it and any missing ancestors.
    fn create_node(&self, session: &mut Session, key: &TrieKey) -> Result<i64> {
        if key.is_root() {
            return Ok(self.root_id);
        }
        if let Some(id) = session.ids.get(&self.absolute(key)) {
            return Ok(id);
        }

        if let Some(id) = self.insert_missing(session, key, true)? {
            return Ok(id);
        }
        tracing::warn!(key = %self.absolute(key), "cached parent id is stale, rebuilding path");
        session.ids.clear();
        self.insert_missing(session, key, false)?
            .ok_or_else(|| TrieError::KeyNotFound(key.clone()))
    }

    /// Starting from the longest known prefix, insert one node per remaining
    /// segment. Returns `None` when a cached parent id turned out to be gone.
    fn insert_missing(
        &self,
        session: &mut Session,
        key: &TrieKey,
        use_cache: bool,
    ) -> Result<Option<i64>> {
        let parent = key.prefix(key.len().saturating_sub(1));
        let cached_parent = if use_cache && !parent.is_root() {
            session.ids.get(&self.absolute(&parent))
        } else {
            None
        };

        let (mut depth, mut pid) = if let Some(pid) = cached_parent {
            (parent.len(), pid)
        } else {
            let rows = self.walk(session, key)?;
            let matched = rows.len().saturating_sub(1);
            let Some(last) = rows.last() else {
                return Err(TrieError::KeyNotFound(self.base.clone()));
            };
            if matched > 0 {
                session.ids.insert(self.absolute(&key.prefix(matched)), last.id);
            }
            (matched, last.id)
        };

        for name in &key.segments()[depth..] {
            let inserted = session
                .conn
                .prepare_cached(sql::INSERT_NODE_SQL)
                .and_then(|mut stmt| {
                    stmt.query_row(params![pid, name], |row| row.get::<_, i64>(0))
                });
            pid = match inserted {
                Ok(id) => id,
                Err(err) if cached_parent.is_some() && is_foreign_key_violation(&err) => {
                    return Ok(None);
                }
                Err(err) => return Err(engine_error(err, "failed to insert node")),
            };
            depth += 1;
            session.ids.insert(self.absolute(&key.prefix(depth)), pid);
        }

        Ok(Some(pid))
    }

    fn update_value(session: &Session, id: i64, value: &[u8]) -> Result<bool> {
        let updated = session
            .conn
            .prepare_cached(sql::SET_VALUE_SQL)
            .and_then(|mut stmt| stmt.execute(params![id, value]))
            .engine_context("failed to update value")?;
        Ok(updated == 1)
    }

    fn upsert_value(
        session: &Session,
        pid: i64,
        name: &str,
        value: &[u8],
    ) -> rusqlite::Result<i64> {
        session
            .conn
            .prepare_cached(sql::UPSERT_VALUE_SQL)?
            .query_row(params![pid, name, value], |row| row.get::<_, i64>(0))
    }

    fn store_value(&self, session: &mut Session, key: &TrieKey, value: &[u8]) -> Result<()> {
        let (Some(parent), Some(name)) = (key.parent(), key.last()) else {
            if Self::update_value(session, self.root_id, value)? {
                return Ok(());
            }
            return Err(TrieError::KeyNotFound(self.base.clone()));
        };

        let absolute = self.absolute(key);
        if let Some(id) = session.ids.get(&absolute) {
            if Self::update_value(session, id, value)? {
                return Ok(());
            }
            tracing::warn!(key = %absolute, "cached node id is stale, rebuilding path");
            session.ids.clear();
        }

        let pid = self.create_node(session, &parent)?;
        let id = match Self::upsert_value(session, pid, name, value) {
            Ok(id) => id,
            Err(err) if is_foreign_key_violation(&err) => {
                tracing::warn!(key = %absolute, "cached parent id is stale, rebuilding path");
                session.ids.clear();
                let pid = self.create_node(session, &parent)?;
                Self::upsert_value(session, pid, name, value)
                    .engine_context("failed to store value")?
            }
            Err(err) => return Err(engine_error(err, "failed to store value")),
        };
        session.ids.insert(absolute, id);
        Ok(())
    }

    /// Remove value-less, childless nodes along `rows`, deepest first, never
    /// touching this handle's root.
    fn prune(&self, session: &mut Session, key: &TrieKey, rows: &[NodeRow]) -> Result<()> {
        for depth in (1..rows.len()).rev() {
            let removed = session
                .conn
                .prepare_cached(sql::DELETE_EMPTY_LEAF_SQL)
                .and_then(|mut stmt| stmt.execute(params![rows[depth].id]))
                .engine_context("failed to prune empty node")?;
            if removed == 0 {
                break;
            }
            session.ids.invalidate(&self.absolute(&key.prefix(depth)));
            tracing::debug!(key = %self.absolute(&key.prefix(depth)), "pruned empty node");
        }
        Ok(())
    }

    fn delete_descendants(session: &Session, id: i64) -> Result<usize> {
        session
            .conn
            .prepare_cached(sql::DELETE_DESCENDANTS_SQL)
            .and_then(|mut stmt| stmt.execute(params![id]))
            .engine_context("failed to delete subtree")
    }

    fn prefixes(&self, key: &TrieKey) -> Result<Vec<(TrieKey, Vec<u8>)>> {
        let rows = self.store.with_session(|session| self.walk(session, key))?;
        Ok(rows
            .into_iter()
            .enumerate()
            .filter_map(|(depth, row)| row.value.map(|value| (key.prefix(depth), value)))
            .collect())
    }

    fn fold<T, F>(&self, key: TrieKey, node: NodeRow, node_factory: &F) -> Result<T>
    where
        F: Fn(&TrieKey, Children<'_, T>, Option<Vec<u8>>) -> Result<T>,
    {
        let child_rows = self.store.with_session(|session| Self::children(session, node.id))?;
        let parent = key.clone();
        let children: Children<'_, T> = Box::new(child_rows.into_iter().map(move |child| {
            let child_key = parent.child(child.name.as_deref().unwrap_or_default());
            self.fold(child_key, child, node_factory)
        }));
        node_factory(&key, children, node.value)
    }

    fn resolve_optional(&self, session: &Session, key: &TrieKey) -> Result<Option<i64>> {
        match self.resolve(session, key) {
            Ok(node) => Ok(Some(node.id)),
            Err(TrieError::KeyNotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Trie for SqliteTrie {
    fn get(&self, key: &TrieKey) -> Result<Vec<u8>> {
        let node = self.store.with_session(|session| self.resolve(session, key))?;
        node.value.ok_or_else(|| TrieError::ShortKey(key.clone()))
    }

    fn set(&mut self, key: &TrieKey, value: &[u8]) -> Result<()> {
        self.store.with_session(|session| {
            session.begin()?;
            self.store_value(session, key, value)
        })
    }

    fn delete(&mut self, key: &TrieKey) -> Result<()> {
        self.store.with_session(|session| {
            let rows = self.walk(session, key)?;
            let Some(node) = rows.get(key.len()) else {
                return Err(TrieError::KeyNotFound(key.clone()));
            };
            if node.value.is_none() {
                return Err(TrieError::ShortKey(key.clone()));
            }

            session.begin()?;
            session
                .conn
                .prepare_cached(sql::CLEAR_VALUE_SQL)
                .and_then(|mut stmt| stmt.execute(params![node.id]))
                .engine_context("failed to clear value")?;

            if self.store.config().prune == PrunePolicy::Prune {
                self.prune(session, key, &rows)?;
            }
            Ok(())
        })
    }

    fn len(&self) -> Result<usize> {
        let count = self.store.with_session(|session| {
            session
                .conn
                .prepare_cached(sql::COUNT_SQL)
                .and_then(|mut stmt| {
                    stmt.query_row(params![self.root_id], |row| row.get::<_, i64>(0))
                })
                .engine_context("failed to count values")
        })?;
        usize::try_from(count)
            .map_err(|err| TrieError::Engine(anyhow::Error::new(err).context("negative count")))
    }

    fn items(&self, prefix: &TrieKey, shallow: bool) -> Result<Items> {
        self.store.with_session(|session| {
            let node = self.resolve(session, prefix)?;
            let mut stmt = session
                .conn
                .prepare_cached(sql::ITEMS_SQL)
                .engine_context("failed to prepare item listing")?;
            let rows = stmt
                .query_map(params![node.id, shallow], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, Option<Vec<u8>>>(1)?))
                })
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .engine_context("failed to list items")?;

            Ok(rows
                .into_iter()
                .map(|(path, value)| {
                    (prefix.join(&TrieKey::from_path(&path)), value.unwrap_or_default())
                })
                .collect())
        })
    }

    fn ls_values(&self, key: &TrieKey) -> Result<Vec<TrieNode>> {
        let rows = self.store.with_session(|session| {
            let node = self.resolve(session, key)?;
            Self::children(session, node.id)
        })?;
        Ok(rows
            .into_iter()
            .map(|row| TrieNode::new(key.child(row.name.as_deref().unwrap_or_default()), row.value))
            .collect())
    }

    fn shortest_prefix(&self, key: &TrieKey) -> Result<Option<(TrieKey, Vec<u8>)>> {
        Ok(self.prefixes(key)?.into_iter().next())
    }

    fn longest_prefix(&self, key: &TrieKey) -> Result<Option<(TrieKey, Vec<u8>)>> {
        Ok(self.prefixes(key)?.pop())
    }

    fn has_node(&self, key: &TrieKey) -> Result<bool> {
        let rows = self.store.with_session(|session| self.walk(session, key))?;
        Ok(rows.len() == key.len() + 1)
    }

    fn view(&self, key: &TrieKey) -> Result<Self> {
        if key.is_root() {
            return Ok(self.clone());
        }

        let root_id = self.store.with_session(|session| {
            if let Some(id) = self.resolve_optional(session, key)? {
                return Ok(id);
            }
            // The walk just missed, so a cached id for `key` names a deleted row.
            session.ids.invalidate(&self.absolute(key));
            session.begin()?;
            self.create_node(session, key)
        })?;

        Ok(Self { store: Arc::clone(&self.store), root_id, base: self.absolute(key) })
    }

    fn traverse<T, F>(&self, node_factory: &F, prefix: &TrieKey) -> Result<T>
    where
        F: Fn(&TrieKey, Children<'_, T>, Option<Vec<u8>>) -> Result<T>,
    {
        let node = self.store.with_session(|session| self.resolve(session, prefix))?;
        self.fold(prefix.clone(), node, node_factory)
    }

    fn diff(&self, old: &TrieKey, new: &TrieKey, with_unchanged: bool) -> Result<Vec<Change>> {
        self.store.with_session(|session| {
            let old_id = self.resolve_optional(session, old)?;
            let new_id = self.resolve_optional(session, new)?;

            let mut stmt = session
                .conn
                .prepare_cached(sql::DIFF_SQL)
                .engine_context("failed to prepare diff")?;
            let rows = stmt
                .query_map(params![old_id, new_id, with_unchanged], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, bool>(1)?,
                        row.get::<_, Option<Vec<u8>>>(2)?,
                        row.get::<_, bool>(3)?,
                        row.get::<_, Option<Vec<u8>>>(4)?,
                    ))
                })
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
                .engine_context("failed to diff subtrees")?;

            Ok(rows
                .into_iter()
                .filter_map(|(path, in_old, old_value, in_new, new_value)| {
                    let old_value = in_old.then(|| old_value.unwrap_or_default());
                    let new_value = in_new.then(|| new_value.unwrap_or_default());
                    let key = TrieKey::from_path(&path);
                    Change::classify(&key, old_value, new_value, with_unchanged)
                })
                .collect())
        })
    }

    fn remove_subtree(&mut self, key: &TrieKey) -> Result<()> {
        if key.is_root() {
            return self.clear();
        }

        self.store.with_session(|session| {
            let node = self.resolve(session, key)?;
            session.begin()?;
            let removed = Self::delete_descendants(session, node.id)?;
            session
                .conn
                .prepare_cached(sql::DELETE_NODE_SQL)
                .and_then(|mut stmt| stmt.execute(params![node.id]))
                .engine_context("failed to delete node")?;
            session.ids.invalidate(&self.absolute(key));
            tracing::debug!(key = %self.absolute(key), descendants = removed, "removed subtree");
            Ok(())
        })
    }

    fn clear(&mut self) -> Result<()> {
        self.store.with_session(|session| {
            session.begin()?;
            let removed = Self::delete_descendants(session, self.root_id)?;
            session
                .conn
                .prepare_cached(sql::CLEAR_VALUE_SQL)
                .and_then(|mut stmt| stmt.execute(params![self.root_id]))
                .engine_context("failed to clear root value")?;
            session.ids.invalidate(&self.base);
            tracing::debug!(key = %self.base, removed, "cleared trie");
            Ok(())
        })
    }

    fn commit(&mut self) -> Result<()> {
        self.store.with_session(|session| {
            if !session.conn.is_autocommit() {
                session.conn.execute_batch("COMMIT").engine_context("failed to commit")?;
                tracing::debug!(store = %self.store.describe(), "committed transaction");
            }
            Ok(())
        })
    }

    fn rollback(&mut self) -> Result<()> {
        self.store.with_session(|session| {
            if !session.conn.is_autocommit() {
                session.conn.execute_batch("ROLLBACK").engine_context("failed to roll back")?;
                tracing::debug!(store = %self.store.describe(), "rolled back transaction");
            }
            session.ids.clear();
            Ok(())
        })
    }

    fn close(&mut self) -> Result<()> {
        self.store.close_session()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::thread;

    use anyhow::{anyhow, Result};
    use sqltrie_core::ChangeType;
    use ulid::Ulid;

    use super::*;

    fn key(segments: &[&str]) -> TrieKey {
        TrieKey::from(segments)
    }

    fn seeded() -> Result<SqliteTrie> {
        let mut trie = SqliteTrie::in_memory()?;
        trie.set(&key(&["foo"]), b"foo-value")?;
        trie.set(&key(&["foo", "bar", "baz"]), b"baz-value")?;
        Ok(trie)
    }

    fn temp_db(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("sqltrie-{label}-{}.sqlite3", Ulid::new()))
    }

    fn remove_db_files(path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let file = std::path::PathBuf::from(format!("{}{}", path.display(), suffix));
            if file.exists() {
                fs::remove_file(&file)?;
            }
        }
        Ok(())
    }

    fn node_count(trie: &SqliteTrie) -> Result<i64> {
        Ok(trie.store.with_session(|session| {
            session
                .conn
                .query_row("SELECT COUNT(*) FROM nodes", [], |row| row.get::<_, i64>(0))
                .engine_context("count nodes")
        })?)
    }

    #[test]
    fn walk_stops_at_first_unmatched_segment() -> Result<()> {
        let trie = seeded()?;
        let rows = trie
            .store
            .with_session(|session| trie.walk(session, &key(&["foo", "nope", "baz"])))?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, ROOT_ID);
        assert_eq!(rows[1].name.as_deref(), Some("foo"));
        assert_eq!(rows[1].value.as_deref(), Some(&b"foo-value"[..]));

        let root_only = trie.store.with_session(|session| trie.walk(session, &TrieKey::root()))?;
        assert_eq!(root_only.len(), 1);
        Ok(())
    }

    #[test]
    fn shared_prefixes_reuse_nodes() -> Result<()> {
        let mut trie = SqliteTrie::in_memory()?;
        trie.set(&key(&["a", "b", "c"]), b"1")?;
        trie.set(&key(&["a", "b", "d"]), b"2")?;
        trie.set(&key(&["a", "e"]), b"3")?;
        assert_eq!(node_count(&trie)?, 6);
        assert_eq!(trie.get(&key(&["a", "b", "d"]))?, b"2");
        Ok(())
    }

    #[test]
    fn empty_value_is_not_absence() -> Result<()> {
        let mut trie = SqliteTrie::in_memory()?;
        trie.set(&key(&["empty"]), b"")?;
        assert_eq!(trie.get(&key(&["empty"]))?, Vec::<u8>::new());
        assert_eq!(trie.len()?, 1);
        assert_eq!(trie.items(&TrieKey::root(), false)?, vec![(key(&["empty"]), Vec::new())]);
        Ok(())
    }

    #[test]
    fn root_key_can_carry_a_value() -> Result<()> {
        let mut trie = seeded()?;
        assert!(matches!(trie.get(&TrieKey::root()), Err(TrieError::ShortKey(_))));
        trie.set(&TrieKey::root(), b"root")?;
        assert_eq!(trie.get(&TrieKey::root())?, b"root");
        assert_eq!(
            trie.shortest_prefix(&key(&["foo", "bar"]))?,
            Some((TrieKey::root(), b"root".to_vec()))
        );
        assert_eq!(trie.len()?, 3);
        Ok(())
    }

    #[test]
    fn stale_cached_ids_are_rebuilt() -> Result<()> {
        let mut trie = SqliteTrie::in_memory()?;
        trie.set(&key(&["a", "b"]), b"1")?;
        // Delete behind the cache's back.
        trie.store.with_session(|session| {
            session.conn.execute_batch("DELETE FROM nodes WHERE id <> 1").engine_context("wipe")
        })?;

        // "a" is still cached, "a/c" is not: the insert trips the foreign key.
        trie.set(&key(&["a", "c"]), b"3")?;
        trie.set(&key(&["a", "b"]), b"2")?;
        assert_eq!(trie.get(&key(&["a", "b"]))?, b"2");
        assert_eq!(trie.get(&key(&["a", "c"]))?, b"3");
        assert_eq!(trie.integrity_check()?.foreign_key_violations, Vec::new());
        Ok(())
    }

    #[test]
    fn rollback_discards_writes_and_cached_ids() -> Result<()> {
        let mut trie = SqliteTrie::in_memory()?;
        trie.set(&key(&["kept"]), b"1")?;
        trie.commit()?;

        trie.set(&key(&["dropped", "child"]), b"2")?;
        trie.rollback()?;
        assert!(!trie.has_node(&key(&["dropped"]))?);

        trie.set(&key(&["dropped", "other"]), b"3")?;
        assert_eq!(trie.get(&key(&["dropped", "other"]))?, b"3");
        assert_eq!(trie.get(&key(&["kept"]))?, b"1");
        assert!(trie.rollback().is_ok());
        Ok(())
    }

    #[test]
    fn prune_policy_removes_empty_ancestors() -> Result<()> {
        let config = SqliteTrieConfig { prune: PrunePolicy::Prune, ..Default::default() };
        let mut trie = SqliteTrie::in_memory_with_config(config)?;
        trie.set(&key(&["a"]), b"1")?;
        trie.set(&key(&["a", "b", "c", "d"]), b"2")?;
        trie.set(&key(&["a", "x"]), b"3")?;

        trie.delete(&key(&["a", "b", "c", "d"]))?;
        assert!(!trie.has_node(&key(&["a", "b"]))?);
        assert!(trie.has_node(&key(&["a"]))?);
        assert_eq!(node_count(&trie)?, 3);

        trie.set(&key(&["a", "b", "c", "d"]), b"4")?;
        assert_eq!(trie.get(&key(&["a", "b", "c", "d"]))?, b"4");
        Ok(())
    }

    #[test]
    fn retain_policy_keeps_empty_nodes() -> Result<()> {
        let mut trie = SqliteTrie::in_memory()?;
        trie.set(&key(&["a", "b"]), b"1")?;
        trie.delete(&key(&["a", "b"]))?;
        assert!(trie.has_node(&key(&["a", "b"]))?);
        assert!(matches!(trie.get(&key(&["a", "b"])), Err(TrieError::ShortKey(_))));
        assert_eq!(trie.len()?, 0);
        Ok(())
    }

    #[test]
    fn remove_subtree_deletes_rows_and_cache_entries() -> Result<()> {
        let mut trie = seeded()?;
        trie.set(&key(&["other"]), b"o")?;
        trie.remove_subtree(&key(&["foo", "bar"]))?;
        assert_eq!(node_count(&trie)?, 3);
        assert!(!trie.has_node(&key(&["foo", "bar"]))?);

        trie.set(&key(&["foo", "bar", "new"]), b"n")?;
        assert_eq!(trie.get(&key(&["foo", "bar", "new"]))?, b"n");
        assert!(matches!(
            trie.remove_subtree(&key(&["missing"])),
            Err(TrieError::KeyNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn clear_keeps_only_the_root() -> Result<()> {
        let mut trie = seeded()?;
        trie.set(&TrieKey::root(), b"r")?;
        trie.clear()?;
        assert_eq!(node_count(&trie)?, 1);
        assert_eq!(trie.len()?, 0);
        assert!(trie.has_node(&TrieKey::root())?);

        trie.set(&key(&["foo"]), b"again")?;
        assert_eq!(trie.get(&key(&["foo"]))?, b"again");
        Ok(())
    }

    #[test]
    fn view_writes_land_in_parent_store() -> Result<()> {
        let mut trie = seeded()?;
        let mut view = trie.view(&key(&["foo", "bar"]))?;
        assert_eq!(view.base(), &key(&["foo", "bar"]));
        view.set(&key(&["qux"]), b"qux-value")?;
        assert_eq!(trie.get(&key(&["foo", "bar", "qux"]))?, b"qux-value");
        assert_eq!(view.len()?, 2);

        view.clear()?;
        assert!(trie.has_node(&key(&["foo", "bar"]))?);
        assert!(!trie.has_node(&key(&["foo", "bar", "baz"]))?);
        assert_eq!(trie.len()?, 1);

        view.commit()?;
        trie.rollback()?;
        assert!(!trie.has_node(&key(&["foo", "bar", "baz"]))?);
        Ok(())
    }

    #[test]
    fn view_of_missing_key_creates_structural_root() -> Result<()> {
        let trie = SqliteTrie::in_memory()?;
        let view = trie.view(&key(&["a", "b", "c"]))?;
        assert!(view.items(&TrieKey::root(), false)?.is_empty());
        assert!(trie.has_node(&key(&["a", "b", "c"]))?);
        assert!(matches!(trie.get(&key(&["a", "b", "c"])), Err(TrieError::ShortKey(_))));
        Ok(())
    }

    #[test]
    fn diff_across_different_subtrees() -> Result<()> {
        let mut trie = SqliteTrie::in_memory()?;
        trie.set(&key(&["v1", "same"]), b"1")?;
        trie.set(&key(&["v1", "dir", "changed"]), b"1")?;
        trie.set(&key(&["v1", "gone"]), b"1")?;
        trie.set(&key(&["v2", "same"]), b"1")?;
        trie.set(&key(&["v2", "dir", "changed"]), b"2")?;
        trie.set(&key(&["v2", "fresh"]), b"")?;

        let changes = trie.diff(&key(&["v1"]), &key(&["v2"]), false)?;
        let summary = changes
            .iter()
            .filter_map(|change| change.key().map(|key| (key.to_path(), change.typ)))
            .collect::<BTreeSet<_>>();
        assert_eq!(
            summary,
            BTreeSet::from([
                ("dir/changed".to_string(), ChangeType::Modify),
                ("fresh".to_string(), ChangeType::Add),
                ("gone".to_string(), ChangeType::Delete),
            ])
        );

        let all = trie.diff(&key(&["v1"]), &key(&["v2"]), true)?;
        assert_eq!(all.len(), 4);

        let from_nothing = trie.diff(&key(&["missing"]), &key(&["v1"]), false)?;
        assert_eq!(from_nothing.len(), 3);
        assert!(from_nothing.iter().all(|change| change.typ == ChangeType::Add));
        Ok(())
    }

    #[test]
    fn traverse_visits_every_node() -> Result<()> {
        let trie = seeded()?;
        let keys = trie.traverse(
            &|key: &TrieKey, children: Children<'_, Vec<String>>, _value: Option<Vec<u8>>| {
                let mut keys = vec![key.to_path()];
                for child in children {
                    keys.extend(child?);
                }
                Ok(keys)
            },
            &TrieKey::root(),
        )?;
        assert_eq!(keys, vec!["", "foo", "foo/bar", "foo/bar/baz"]);
        assert!(matches!(
            trie.traverse(
                &|_key: &TrieKey, _children: Children<'_, ()>, _value: Option<Vec<u8>>| Ok(()),
                &key(&["nope"]),
            ),
            Err(TrieError::KeyNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn committed_data_survives_reopen() -> Result<()> {
        let path = temp_db("reopen");
        {
            let mut trie = SqliteTrie::open(&path)?;
            assert_eq!(trie.len()?, 0);
            trie.set(&key(&["foo"]), b"foo-value")?;
            trie.set(&key(&["foo", "bar", "baz"]), b"baz-value")?;
            trie.commit()?;
            trie.close()?;
        }

        let trie = SqliteTrie::open(&path)?;
        assert_eq!(trie.len()?, 2);
        assert_eq!(trie.get(&key(&["foo"]))?, b"foo-value");
        assert_eq!(trie.get(&key(&["foo", "bar", "baz"]))?, b"baz-value");
        drop(trie);

        remove_db_files(&path)
    }

    #[test]
    fn uncommitted_writes_are_lost_on_close() -> Result<()> {
        let path = temp_db("uncommitted");
        let mut trie = SqliteTrie::open(&path)?;
        trie.set(&key(&["kept"]), b"1")?;
        trie.commit()?;
        trie.set(&key(&["lost"]), b"2")?;
        trie.close()?;

        assert!(trie.contains(&key(&["kept"]))?);
        assert!(!trie.has_node(&key(&["lost"]))?);
        drop(trie);

        remove_db_files(&path)
    }

    #[test]
    fn threads_share_an_in_memory_store() -> Result<()> {
        let mut trie = SqliteTrie::in_memory()?;
        trie.set(&key(&["main"]), b"m")?;
        trie.commit()?;

        let mut worker = trie.clone();
        let handle = thread::spawn(move || -> sqltrie_core::Result<Vec<u8>> {
            let value = worker.get(&key(&["main"]))?;
            worker.set(&key(&["worker"]), b"w")?;
            worker.commit()?;
            worker.close()?;
            Ok(value)
        });
        let Ok(from_worker) = handle.join() else {
            return Err(anyhow!("worker thread panicked"));
        };
        assert_eq!(from_worker?, b"m");
        assert_eq!(trie.get(&key(&["worker"]))?, b"w");
        Ok(())
    }

    #[test]
    fn concurrent_writers_on_one_file() -> Result<()> {
        let path = temp_db("concurrency");
        SqliteTrie::open(&path)?;

        let mut handles = Vec::new();
        for writer in 0..4 {
            let writer_path = path.clone();
            handles.push(thread::spawn(move || -> sqltrie_core::Result<()> {
                let mut trie = SqliteTrie::open(&writer_path)?;
                for index in 0..10 {
                    let key =
                        TrieKey::new(["shared".to_string(), format!("w{writer}"), index.to_string()]);
                    trie.set(&key, b"x")?;
                    trie.commit()?;
                }
                trie.close()
            }));
        }
        for handle in handles {
            let Ok(result) = handle.join() else {
                return Err(anyhow!("writer thread panicked"));
            };
            result?;
        }

        let trie = SqliteTrie::open(&path)?;
        assert_eq!(trie.len()?, 40);
        assert_eq!(trie.ls(&key(&["shared"]))?.len(), 4);
        let report = trie.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        drop(trie);

        remove_db_files(&path)
    }

    #[test]
    fn view_ignores_ids_cached_before_another_writer_removed_them() -> Result<()> {
        let path = temp_db("stale-view");
        let mut first = SqliteTrie::open(&path)?;
        let mut second = SqliteTrie::open(&path)?;

        first.set(&key(&["x", "y"]), b"1")?;
        first.commit()?;
        second.remove_subtree(&key(&["x"]))?;
        second.commit()?;

        let mut view = first.view(&key(&["x", "y"]))?;
        assert!(view.items(&TrieKey::root(), false)?.is_empty());
        view.set(&key(&["z"]), b"2")?;
        view.commit()?;
        assert_eq!(second.get(&key(&["x", "y", "z"]))?, b"2");
        assert!(first.integrity_check()?.foreign_key_violations.is_empty());
        drop((first, second, view));

        remove_db_files(&path)
    }

    #[test]
    fn worker_exit_releases_uncommitted_write_lock() -> Result<()> {
        let mut trie = SqliteTrie::in_memory()?;
        let mut worker = trie.clone();
        let handle = thread::spawn(move || worker.set(&key(&["w"]), b"w"));
        let Ok(result) = handle.join() else {
            return Err(anyhow!("worker thread panicked"));
        };
        result?;

        trie.set(&key(&["m"]), b"m")?;
        trie.commit()?;
        assert!(!trie.has_node(&key(&["w"]))?);
        assert_eq!(trie.get(&key(&["m"]))?, b"m");
        Ok(())
    }

    #[test]
    fn new_reader_thread_opens_while_a_writer_holds_the_lock() -> Result<()> {
        let path = temp_db("reader");
        let mut trie = SqliteTrie::open(&path)?;
        trie.set(&key(&["kept"]), b"1")?;
        trie.commit()?;
        trie.set(&key(&["pending"]), b"2")?;

        let reader = trie.clone();
        let handle = thread::spawn(move || {
            let kept = reader.get(&key(&["kept"]));
            let pending = reader.has_node(&key(&["pending"]));
            (kept, pending)
        });
        let Ok((kept, pending)) = handle.join() else {
            return Err(anyhow!("reader thread panicked"));
        };
        assert_eq!(kept?, b"1");
        assert!(!pending?);

        trie.commit()?;
        drop(trie);
        remove_db_files(&path)
    }

    #[test]
    fn backup_copies_committed_nodes() -> Result<()> {
        let mut trie = seeded()?;
        trie.commit()?;
        let backup = temp_db("backup");
        trie.backup_database(&backup)?;

        let restored = SqliteTrie::open(&backup)?;
        assert_eq!(restored.get(&key(&["foo", "bar", "baz"]))?, b"baz-value");
        assert_eq!(restored.schema_status()?.current_version, schema::LATEST_SCHEMA_VERSION);
        assert!(restored.migrate()?.pending_versions.is_empty());
        drop(restored);

        remove_db_files(&backup)
    }
}
