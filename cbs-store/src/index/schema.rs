//! Schema versioning for the index store (spec §4.2: "a schema version
//! stamped in a metadata table and an in-tree upgrade script list").
//!
//! Versions are tracked with sqlite's own `PRAGMA user_version` rather than
//! a hand-rolled metadata table - it is exactly the "metadata table"
//! mechanism the spec describes, already transactional with the rest of the
//! schema. Upgrades are idempotent `CREATE TABLE IF NOT EXISTS` scripts run
//! under the session's exclusive lock (spec §4.2), so no separate
//! migration lock is needed.

use cbs_types::Error;
use rusqlite::Connection;

pub const CURRENT_VERSION: i64 = 1;

/// One upgrade script per schema version, applied in order starting just
/// above the database's current `user_version`. Only version 1 exists
/// today; a version 2 would be appended here without touching callers.
const UPGRADES: &[(i64, &str)] = &[(1, SCHEMA_V1)];

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS chunk (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_start        INTEGER NOT NULL,
    ts_end          INTEGER,
    offset          INTEGER NOT NULL,
    length          INTEGER,
    file_sha1       BLOB NOT NULL,
    data_sha1       BLOB
);
CREATE UNIQUE INDEX IF NOT EXISTS chunk_offset_idx ON chunk(offset);

CREATE TABLE IF NOT EXISTS message (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    guid            TEXT NOT NULL UNIQUE,
    partition       TEXT NOT NULL,
    chunk_id        INTEGER NOT NULL REFERENCES chunk(id),
    offset          INTEGER NOT NULL,
    length          INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS mailbox (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    last_chunk_id       INTEGER NOT NULL REFERENCES chunk(id),
    uniqueid            TEXT NOT NULL UNIQUE,
    mboxname            TEXT NOT NULL,
    mboxtype            TEXT NOT NULL DEFAULT '',
    last_uid            INTEGER NOT NULL DEFAULT 0,
    highestmodseq       INTEGER NOT NULL DEFAULT 0,
    recentuid           INTEGER NOT NULL DEFAULT 0,
    recenttime          INTEGER NOT NULL DEFAULT 0,
    last_appenddate     INTEGER NOT NULL DEFAULT 0,
    pop3_last_login     INTEGER NOT NULL DEFAULT 0,
    pop3_show_after     INTEGER NOT NULL DEFAULT 0,
    uidvalidity         INTEGER NOT NULL DEFAULT 0,
    partition           TEXT NOT NULL DEFAULT '',
    acl                 TEXT NOT NULL DEFAULT '',
    options             TEXT NOT NULL DEFAULT '',
    sync_crc            INTEGER NOT NULL DEFAULT 0,
    sync_crc_annot       INTEGER NOT NULL DEFAULT 0,
    quotaroot           TEXT NOT NULL DEFAULT '',
    xconvmodseq         INTEGER NOT NULL DEFAULT 0,
    annotations         TEXT NOT NULL DEFAULT '',
    deleted             INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS mailbox_mboxname_idx ON mailbox(mboxname);

CREATE TABLE IF NOT EXISTS mailbox_message (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    mailbox_id          INTEGER NOT NULL REFERENCES mailbox(id),
    mailbox_uniqueid    TEXT NOT NULL,
    -- NULL when the record's guid has not been carried by a MESSAGE
    -- command yet (RECORD entries can precede or omit the message body).
    message_id          INTEGER REFERENCES message(id),
    last_chunk_id       INTEGER NOT NULL REFERENCES chunk(id),
    uid                 INTEGER NOT NULL,
    modseq              INTEGER NOT NULL DEFAULT 0,
    last_updated        INTEGER NOT NULL DEFAULT 0,
    flags               TEXT NOT NULL DEFAULT '',
    internaldate        INTEGER NOT NULL DEFAULT 0,
    guid                TEXT NOT NULL DEFAULT '',
    size                INTEGER NOT NULL DEFAULT 0,
    annotations         TEXT NOT NULL DEFAULT '',
    expunged            INTEGER NOT NULL DEFAULT 0,
    UNIQUE(mailbox_id, uid)
);
";

/// Runs every upgrade script above the database's current `user_version`,
/// in order, then stamps the new version. A fresh database starts at
/// version 0 and runs every script, landing on [`CURRENT_VERSION`].
pub fn upgrade(conn: &Connection) -> Result<(), Error> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    for (version, script) in UPGRADES {
        if *version > current {
            conn.execute_batch(script)?;
            conn.pragma_update(None, "user_version", version)?;
        }
    }
    Ok(())
}
