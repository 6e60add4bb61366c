//! Durable state: isolation sessions, exceptions and the attempt audit log.
//!
//! A single writer connection guarded by a `Mutex` serializes every
//! mutation; mutations run synchronously under the Control API's
//! mutator lock so that "write then publish a new Policy Index
//! snapshot" is one atomic step. A `r2d2` pool of read-only connections
//! serves `list_*`/`history`/`attempts`/`statistics` without contending
//! with the writer; WAL mode makes that safe.

mod migrate;
mod queries;
pub mod queue;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use thiserror::Error;

use crate::model::ChannelId;

pub use queries::NewAttempt;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("channel {0} is already isolated")]
    AlreadyActive(String),

    #[error("channel {0} is not isolated")]
    NotActive(String),

    #[error("session {0} is not active")]
    SessionNotActive(String),

    #[error("exception already exists: {0}")]
    DuplicateException(String),

    #[error("no such exception: {0}")]
    ExceptionNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    fn duplicate_exception(session_id: i64, allowed: ChannelId) -> Self {
        StoreError::DuplicateException(format!("session {session_id}, allowed channel {allowed}"))
    }

    fn exception_not_found(session_id: i64, allowed: ChannelId) -> Self {
        StoreError::ExceptionNotFound(format!("session {session_id}, allowed channel {allowed}"))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

pub struct Store {
    write_conn: Mutex<Connection>,
    read_pool: Pool<SqliteConnectionManager>,
    attempts_dropped: AtomicU64,
}

impl Store {
    /// Opens (creating if necessary) the database at `path`, applies WAL
    /// pragmas and runs any pending schema migrations.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Storage(format!("creating {}: {e}", parent.display())))?;
        }

        let write_conn = Connection::open(path)?;
        configure_pragmas(&write_conn)?;
        migrate::run(&write_conn)?;

        let manager = SqliteConnectionManager::file(path).with_init(|c| {
            c.execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA busy_timeout=5000;
                 PRAGMA query_only=ON;",
            )
        });
        let read_pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(Store {
            write_conn: Mutex::new(write_conn),
            read_pool,
            attempts_dropped: AtomicU64::new(0),
        })
    }

    /// An in-memory database for tests. SQLite's in-memory databases are
    /// private per-connection unless opened through a shared-cache URI, so
    /// the writer and the read pool must agree on the same name.
    pub fn in_memory() -> Result<Self, StoreError> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let name = format!(
            "file:channel-isolator-test-{}?mode=memory&cache=shared",
            COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let uri_flags = rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            | rusqlite::OpenFlags::SQLITE_OPEN_URI;

        let write_conn = Connection::open_with_flags(&name, uri_flags)?;
        configure_pragmas(&write_conn)?;
        migrate::run(&write_conn)?;

        let manager = SqliteConnectionManager::file(&name).with_flags(uri_flags);
        let read_pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(Store {
            write_conn: Mutex::new(write_conn),
            read_pool,
            attempts_dropped: AtomicU64::new(0),
        })
    }

    fn writer(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.write_conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reader(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, StoreError> {
        Ok(self.read_pool.get()?)
    }

    pub fn create_session(
        &self,
        channel_id: ChannelId,
        alias: Option<String>,
    ) -> Result<i64, StoreError> {
        queries::create_session(&self.writer(), channel_id, alias)
    }

    pub fn end_session(&self, channel_id: ChannelId) -> Result<i64, StoreError> {
        queries::end_session(&self.writer(), channel_id)
    }

    pub fn add_exception(
        &self,
        session_id: i64,
        allowed_channel_id: ChannelId,
        alias: Option<String>,
    ) -> Result<(), StoreError> {
        queries::add_exception(&self.writer(), session_id, allowed_channel_id, alias)
    }

    pub fn remove_exception(
        &self,
        session_id: i64,
        allowed_channel_id: ChannelId,
    ) -> Result<(), StoreError> {
        queries::remove_exception(&self.writer(), session_id, allowed_channel_id)
    }

    /// Resolves the active session id for a channel, if any. Used by the
    /// Control API to translate channel-addressed CLI commands into the
    /// session-id-addressed operations above.
    pub fn active_session_for_channel(
        &self,
        channel_id: ChannelId,
    ) -> Result<Option<i64>, StoreError> {
        queries::active_session_for_channel(&self.reader()?, channel_id)
    }

    pub fn list_active_sessions(&self) -> Result<Vec<crate::model::Session>, StoreError> {
        queries::list_active_sessions(&self.reader()?)
    }

    pub fn list_exceptions(&self, session_id: i64) -> Result<Vec<crate::model::Exception>, StoreError> {
        queries::list_exceptions(&self.reader()?, session_id)
    }

    pub fn session_history(
        &self,
        channel_id: Option<ChannelId>,
    ) -> Result<Vec<crate::model::Session>, StoreError> {
        queries::session_history(&self.reader()?, channel_id)
    }

    pub fn attempts_for_session(
        &self,
        session_id: i64,
        limit: Option<u32>,
    ) -> Result<Vec<crate::model::Attempt>, StoreError> {
        queries::attempts_for_session(&self.reader()?, session_id, limit)
    }

    pub fn statistics(&self) -> Result<crate::model::Statistics, StoreError> {
        queries::statistics(&self.reader()?)
    }

    /// Returns the data needed to rebuild a `PolicyIndex` snapshot: every
    /// active session keyed by its isolated channel, and every exception
    /// keyed by (isolated, allowed) pair.
    pub fn policy_snapshot_data(
        &self,
    ) -> Result<(Vec<crate::model::Session>, Vec<crate::model::Exception>), StoreError> {
        let conn = self.reader()?;
        let sessions = queries::list_active_sessions(&conn)?;
        let mut exceptions = Vec::new();
        for s in &sessions {
            exceptions.extend(queries::list_exceptions(&conn, s.session_id)?);
        }
        Ok((sessions, exceptions))
    }

    /// Appends an attempt row. This is the one write path that must never
    /// block or fail the caller (the Intercept Engine's hot path): errors
    /// are logged, counted and the row is dropped, never propagated.
    pub fn append_attempt(&self, attempt: NewAttempt) {
        if let Err(e) = queries::insert_attempt(&self.writer(), &attempt) {
            self.attempts_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "dropping attempt audit row");
        }
    }

    /// Count of attempt rows dropped due to a storage I/O error, distinct
    /// from `AttemptQueue::dropped_count`'s bounded-queue overflow count.
    pub fn attempts_dropped(&self) -> u64 {
        self.attempts_dropped.load(Ordering::Relaxed)
    }
}

fn configure_pragmas(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;
         PRAGMA foreign_keys=ON;",
    )?;
    Ok(())
}
