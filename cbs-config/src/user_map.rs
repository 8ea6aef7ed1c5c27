use std::path::Path;

use cbs_types::Error;
use rusqlite::{params, Connection, OptionalExtension};

/// The persistent `userid -> data_fname` mapping (spec §6.3).
///
/// Backed by a small sqlite database, opened and closed around each
/// lookup (spec §5: "opened briefly by the resolver and closed after each
/// lookup"), the way the teacher's config layer treats its section-config
/// files as short-lived handles rather than long-lived shared state.
pub struct UserPathMap {
    conn: Connection,
}

impl UserPathMap {
    /// Opens the mapping database, creating its schema if this is the
    /// first use.
    pub fn open(path: &Path) -> Result<Self, Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS user_path (
                userid TEXT PRIMARY KEY,
                data_fname TEXT NOT NULL
             );",
        )?;
        Ok(Self { conn })
    }

    /// Looks up the data-file path recorded for `userid`, if any.
    pub fn fetch(&self, userid: &str) -> Result<Option<String>, Error> {
        self.conn
            .query_row(
                "SELECT data_fname FROM user_path WHERE userid = ?1",
                params![userid],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::from)
    }

    /// Records a new `userid -> data_fname` mapping in its own
    /// transaction. Fails with [`Error::Conflict`] if `userid` is already
    /// mapped (a race the caller resolves by unlinking the file it just
    /// created and retrying the lookup, per spec §4.3).
    pub fn create(&mut self, userid: &str, data_fname: &str) -> Result<(), Error> {
        let tx = self.conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO user_path (userid, data_fname) VALUES (?1, ?2)",
            params![userid, data_fname],
        )?;
        if inserted == 0 {
            return Err(Error::conflict(format!(
                "user '{userid}' already has a backup path mapped"
            )));
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_returns_none_for_unknown_user() {
        let dir = tempfile::tempdir().unwrap();
        let map = UserPathMap::open(&dir.path().join("backups.db")).unwrap();
        assert_eq!(map.fetch("nobody").unwrap(), None);
    }

    #[test]
    fn create_then_fetch_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = UserPathMap::open(&dir.path().join("backups.db")).unwrap();
        map.create("alice", "/backups/al/alice_abcdef").unwrap();
        assert_eq!(
            map.fetch("alice").unwrap().as_deref(),
            Some("/backups/al/alice_abcdef")
        );
    }

    #[test]
    fn create_is_transactional_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut map = UserPathMap::open(&dir.path().join("backups.db")).unwrap();
        map.create("alice", "/backups/al/alice_abcdef").unwrap();
        assert!(map.create("alice", "/backups/al/alice_other").is_err());
    }
}
