//! The transactional index store (spec §4.2): chunks, mailboxes,
//! mailbox-messages and messages, behind named transactions so an append
//! and its index updates nest under one logical unit.
//!
//! Grounded on the rusqlite usage pattern in `other_examples`' CLI index
//! (`Connection::open`, `execute_batch` for schema, `params!`/
//! `OptionalExtension` for queries) - the closest available reference for
//! "structured, transactional store" in this pack, since `pbs-datastore`'s
//! own indexes (`fixed_index.rs`) are mmap'd files rather than a relational
//! store. Named transactions are implemented as sqlite `SAVEPOINT`s, driven
//! directly with raw SQL rather than rusqlite's typed `Savepoint` guard, so
//! the open transaction does not have to be threaded through the session
//! as a borrow with its own lifetime.

pub mod queries;
pub mod read_api;
mod schema;

use std::path::Path;

use cbs_types::Error;
use rusqlite::Connection;

pub use read_api::ReadApi;

/// A handle to one user's index database.
pub struct IndexStore {
    conn: Connection,
}

impl IndexStore {
    /// Opens (creating if absent) the index at `path` and runs any pending
    /// schema upgrades.
    pub fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::upgrade(&conn)?;
        Ok(Self { conn })
    }

    /// True if the index has not recorded a single chunk yet (spec §4.4
    /// step 3's "index is missing or empty").
    pub fn is_empty(&self) -> Result<bool, Error> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM chunk", [], |row| row.get(0))?;
        Ok(count == 0)
    }

    /// Begins a named transaction (spec §4.2 `begin(name)`).
    pub fn begin(&self, name: &str) -> Result<(), Error> {
        self.conn
            .execute_batch(&format!("SAVEPOINT {name}"))
            .map_err(Error::from)
    }

    /// Commits a named transaction (spec §4.2 `commit(name)`).
    pub fn commit(&self, name: &str) -> Result<(), Error> {
        self.conn
            .execute_batch(&format!("RELEASE {name}"))
            .map_err(Error::from)
    }

    /// Rolls back a named transaction, undoing every statement executed
    /// since the matching `begin` (spec §4.2 `rollback(name)`).
    pub fn rollback(&self, name: &str) -> Result<(), Error> {
        self.conn
            .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
            .map_err(Error::from)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Closes the underlying connection explicitly so a failure surfaces to
    /// the caller instead of being swallowed by a plain `Drop`.
    pub fn close(self) -> Result<(), Error> {
        self.conn.close().map_err(|(_, err)| Error::from(err))
    }
}
