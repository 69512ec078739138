use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OpenFlags, Row};
use sqltrie_core::{Result, TrieError};
use ulid::Ulid;

use crate::cache::IdCache;
use crate::config::SqliteTrieConfig;
use crate::schema;

pub(crate) trait EngineContext<T> {
    fn engine_context(self, context: &'static str) -> Result<T>;
}

impl<T> EngineContext<T> for rusqlite::Result<T> {
    fn engine_context(self, context: &'static str) -> Result<T> {
        self.map_err(|err| engine_error(err, context))
    }
}

/// Busy and locked failures become the retryable [`TrieError::Locked`].
pub(crate) fn engine_error(err: rusqlite::Error, context: &'static str) -> TrieError {
    if is_lock_contention(&err) {
        return TrieError::Locked(format!("{context}: {err}"));
    }
    TrieError::Engine(anyhow::Error::new(err).context(context))
}

fn is_lock_contention(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(failure.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

pub(crate) fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
    )
}

/// One row of the `nodes` table. `value` is `Some` exactly when the row's
/// `has_value` flag is set, so an empty value never reads as absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeRow {
    pub(crate) id: i64,
    pub(crate) name: Option<String>,
    pub(crate) value: Option<Vec<u8>>,
}

impl NodeRow {
    /// Decodes `id, pid, name, has_value, value`.
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let has_value: bool = row.get(3)?;
        let value: Option<Vec<u8>> = row.get(4)?;
        Ok(Self {
            id: row.get(0)?,
            name: row.get(2)?,
            value: has_value.then(|| value.unwrap_or_default()),
        })
    }
}

/// A thread's connection plus the id cache that is valid for it.
pub(crate) struct Session {
    pub(crate) conn: Connection,
    pub(crate) ids: IdCache,
}

impl Session {
    /// Open a write transaction unless one is already running.
    pub(crate) fn begin(&self) -> Result<()> {
        if self.conn.is_autocommit() {
            self.conn
                .execute_batch("BEGIN IMMEDIATE")
                .engine_context("failed to begin transaction")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory(String),
}

impl Location {
    fn describe(&self) -> String {
        match self {
            Self::File(path) => path.display().to_string(),
            Self::Memory(uri) => uri.clone(),
        }
    }

    fn open(&self, config: &SqliteTrieConfig) -> Result<Connection> {
        let mut conn = match self {
            Self::File(path) => {
                Connection::open(path).engine_context("failed to open sqlite database")?
            }
            Self::Memory(uri) => Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .engine_context("failed to open in-memory sqlite database")?,
        };

        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .engine_context("failed to configure busy timeout")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .engine_context("failed to configure sqlite pragmas")?;
        if config.wal && matches!(self, Self::File(_)) {
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .engine_context("failed to read journal mode")?;
            if !mode.eq_ignore_ascii_case("wal") {
                conn.execute_batch("PRAGMA journal_mode = WAL;")
                    .engine_context("failed to enable WAL journaling")?;
            }
        }

        schema::migrate(&mut conn)?;
        tracing::debug!(
            store = %self.describe(),
            thread = ?thread::current().id(),
            "opened sqltrie connection"
        );
        Ok(conn)
    }
}

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// A session registered by the thread that opened it.
struct ThreadSession {
    // Dead once the owning store is dropped; such entries are swept lazily.
    store: Weak<()>,
    session: Rc<RefCell<Session>>,
}

thread_local! {
    // Owned by the thread, so an exiting thread closes its connections and the
    // engine rolls back whatever transaction they left open.
    static SESSIONS: RefCell<HashMap<u64, ThreadSession>> = RefCell::new(HashMap::new());
}

/// Owns the location of one physical store. Every handle and view onto the
/// store shares one `NodeStore`; each thread reaches it through its own
/// session.
pub(crate) struct NodeStore {
    id: u64,
    alive: Arc<()>,
    location: Location,
    config: SqliteTrieConfig,
    // Keeps a shared-cache in-memory database alive while no thread has a session.
    _anchor: Option<Mutex<Connection>>,
}

impl NodeStore {
    fn new(location: Location, config: SqliteTrieConfig, anchor: Option<Connection>) -> Self {
        Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
            location,
            config,
            _anchor: anchor.map(Mutex::new),
        }
    }

    pub(crate) fn file(path: &Path, config: SqliteTrieConfig) -> Result<Self> {
        let store = Self::new(Location::File(path.to_path_buf()), config, None);
        store.session()?;
        Ok(store)
    }

    pub(crate) fn memory(config: SqliteTrieConfig) -> Result<Self> {
        let location =
            Location::Memory(format!("file:sqltrie-{}?mode=memory&cache=shared", Ulid::new()));
        let anchor = location.open(&config)?;
        Ok(Self::new(location, config, Some(anchor)))
    }

    pub(crate) fn config(&self) -> &SqliteTrieConfig {
        &self.config
    }

    pub(crate) fn describe(&self) -> String {
        self.location.describe()
    }

    /// The calling thread's session, opened on first use.
    fn session(&self) -> Result<Rc<RefCell<Session>>> {
        let existing = SESSIONS.with(|sessions| {
            let mut sessions = sessions.borrow_mut();
            sessions.retain(|_, entry| entry.store.strong_count() > 0);
            sessions.get(&self.id).map(|entry| Rc::clone(&entry.session))
        });
        if let Some(session) = existing {
            return Ok(session);
        }

        let conn = self.location.open(&self.config)?;
        let session = Rc::new(RefCell::new(Session {
            conn,
            ids: IdCache::new(self.config.id_cache_capacity),
        }));
        SESSIONS.with(|sessions| {
            sessions.borrow_mut().insert(
                self.id,
                ThreadSession { store: Arc::downgrade(&self.alive), session: Rc::clone(&session) },
            );
        });
        Ok(session)
    }

    /// Run `op` on the calling thread's session. Lock contention, including
    /// while the session itself is being opened, is retried up to
    /// `lock_retries` times with linear backoff before it surfaces.
    pub(crate) fn with_session<T>(
        &self,
        mut op: impl FnMut(&mut Session) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 0_u32;
        loop {
            let result = self.session().and_then(|cell| {
                let mut session = cell.try_borrow_mut().map_err(|_| {
                    TrieError::Engine(anyhow::anyhow!(
                        "sqltrie session is already in use on this thread"
                    ))
                })?;
                op(&mut *session)
            });
            match result {
                Err(TrieError::Locked(message)) if attempt < self.config.lock_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, %message, "sqlite store locked, retrying");
                    let backoff = self.config.retry_backoff_ms.saturating_mul(u64::from(attempt));
                    thread::sleep(Duration::from_millis(backoff));
                }
                result => return result,
            }
        }
    }

    /// Drop the calling thread's session. Uncommitted changes are rolled back
    /// by the engine when the connection closes.
    pub(crate) fn close_session(&self) -> Result<()> {
        let removed = SESSIONS.with(|sessions| sessions.borrow_mut().remove(&self.id));
        if removed.is_none() {
            return Ok(());
        }
        drop(removed);
        tracing::debug!(store = %self.describe(), "closed sqltrie session");
        Ok(())
    }
}

impl Drop for NodeStore {
    fn drop(&mut self) {
        // Other threads sweep their entries on next use or at exit.
        let _ = SESSIONS.try_with(|sessions| {
            if let Ok(mut sessions) = sessions.try_borrow_mut() {
                sessions.remove(&self.id);
            }
        });
    }
}
