//! # SQLite Schema for Partition Storage
//!
//! Every partition persists its committed state in its own SQLite database
//! (`partition-NNNN.db`). One database per partition keeps the single-writer
//! rule trivial: the partition actor is the only connection.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Partition Schema                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  usages                 pages                      elements             │
//! │  ┌──────────────┐       ┌─────────────────┐        ┌─────────────────┐  │
//! │  │ channel (PK) │◄──────│ channel, page   │◄───────│ channel, page,  │  │
//! │  │ head/tail/max│       │ tail, byte_size │        │ offset (PK)     │  │
//! │  │ waiting      │       │ sealed, refs    │        │ timestamp_ms    │  │
//! │  │ anon BLOB    │       │ prev, next      │        │ value BLOB      │  │
//! │  └──────────────┘       └─────────────────┘        └─────────────────┘  │
//! │                                                                         │
//! │  subscriptions                         topic_metadata                   │
//! │  ┌──────────────────────────────┐      ┌─────────────────┐              │
//! │  │ channel, group, member (PK)  │      │ key (PK)        │              │
//! │  │ cursor, anchor, committed    │      │ value           │              │
//! │  │ rollback, head, owner        │      └─────────────────┘              │
//! │  │ filter, transform, alloc     │                                       │
//! │  └──────────────────────────────┘                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## What Is Not Stored
//!
//! Notifier lists and notifier registrations. A waiter that outlives a
//! restart re-registers on its next poll or offer.

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. A mismatch on open is an error.
const SCHEMA_VERSION: i32 = 1;

/// Metadata key holding the topic's current channel count.
pub const CHANNEL_COUNT_KEY: &str = "channel_count";

// =============================================================================
// DDL Statements
// =============================================================================

/// Per-channel usage. Optional page ids use -1 for NULL.
const CREATE_USAGES: &str = r#"
CREATE TABLE IF NOT EXISTS usages (
    channel     INTEGER PRIMARY KEY,
    head        INTEGER NOT NULL,
    tail        INTEGER NOT NULL,
    max_page    INTEGER NOT NULL,
    waiting     INTEGER NOT NULL,
    anonymous   BLOB NOT NULL
)
"#;

/// Pages. `tail` is -1 for an empty page.
const CREATE_PAGES: &str = r#"
CREATE TABLE IF NOT EXISTS pages (
    channel     INTEGER NOT NULL,
    page        INTEGER NOT NULL,
    tail        INTEGER NOT NULL,
    byte_size   INTEGER NOT NULL,
    sealed      INTEGER NOT NULL,
    ref_count   INTEGER NOT NULL,
    prev        INTEGER NOT NULL,
    next        INTEGER NOT NULL,
    head_ms     INTEGER NOT NULL,
    tail_ms     INTEGER NOT NULL,
    PRIMARY KEY (channel, page)
)
"#;

/// Stored elements. Decorated once, at write time.
const CREATE_ELEMENTS: &str = r#"
CREATE TABLE IF NOT EXISTS elements (
    channel      INTEGER NOT NULL,
    page         INTEGER NOT NULL,
    offset       INTEGER NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    expiry_ms    INTEGER,
    value        BLOB NOT NULL,
    PRIMARY KEY (channel, page, offset)
)
"#;

/// Subscriptions. `committed_*`/`rollback_*` are NULL until the first commit;
/// `owner` is NULL when ownership is not enforced.
const CREATE_SUBSCRIPTIONS: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    channel          INTEGER NOT NULL,
    group_name       TEXT NOT NULL,
    member           INTEGER NOT NULL,
    page             INTEGER NOT NULL,
    position         INTEGER NOT NULL,
    anchor           INTEGER NOT NULL,
    committed_page   INTEGER,
    committed_offset INTEGER,
    rollback_page    INTEGER,
    rollback_offset  INTEGER,
    head             INTEGER NOT NULL,
    owner            INTEGER,
    filter           TEXT,
    transform        TEXT,
    allocations      BLOB,
    PRIMARY KEY (channel, group_name, member)
)
"#;

/// Key/value metadata: schema version and channel count.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS topic_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the partition schema applied.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a partition database file, creating it if necessary.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize(true)?;
        Ok(db)
    }

    /// Creates an in-memory database. State is lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize(false)?;
        Ok(db)
    }

    fn initialize(&mut self, wal: bool) -> Result<()> {
        if wal {
            // WAL: the actor commits every step, readers never block it.
            self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        }
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_METADATA)?;
        self.conn.execute_batch(CREATE_USAGES)?;
        self.conn.execute_batch(CREATE_PAGES)?;
        self.conn.execute_batch(CREATE_ELEMENTS)?;
        self.conn.execute_batch(CREATE_SUBSCRIPTIONS)?;

        self.verify_or_set_version()
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        match read_metadata(&self.conn, "schema_version")? {
            None => {
                write_metadata(&self.conn, "schema_version", &SCHEMA_VERSION.to_string())?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "schema version mismatch: database has version {v}, expected {SCHEMA_VERSION}"
                )));
            }
        }
        Ok(())
    }

    /// Hands the connection to its single owner (the partition store).
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Reads a metadata value.
pub fn read_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare_cached("SELECT value FROM topic_metadata WHERE key = ?1")?;
    let mut rows = stmt.query([key])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Writes (or replaces) a metadata value.
pub fn write_metadata(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO topic_metadata (key, value) VALUES (?1, ?2)",
        [key, value],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
