//! Row-level CRUD against the index schema. Every function takes a
//! `&Connection` so callers can pass either the store's own connection or
//! an open savepoint (which derefs to `Connection`) - the append engine
//! calls these while a `"backup_index"` savepoint is open, reindex while a
//! fresh one is.

use cbs_types::{Chunk, Mailbox, MailboxMessage, Message};
use cbs_types::Error;
use rusqlite::{params, Connection, OptionalExtension};

fn to_digest(bytes: Vec<u8>) -> Result<[u8; 20], Error> {
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| Error::internal(format!("corrupt sha1 digest, {} bytes", v.len())))
}

// ---- chunk -----------------------------------------------------------

pub fn insert_chunk_start(
    conn: &Connection,
    offset: u64,
    file_sha1: &[u8; 20],
    ts_start: i64,
) -> Result<i64, Error> {
    conn.execute(
        "INSERT INTO chunk (ts_start, offset, file_sha1) VALUES (?1, ?2, ?3)",
        params![ts_start, offset as i64, &file_sha1[..]],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn finalize_chunk(
    conn: &Connection,
    chunk_id: i64,
    ts_end: i64,
    length: u64,
    data_sha1: &[u8; 20],
) -> Result<(), Error> {
    conn.execute(
        "UPDATE chunk SET ts_end = ?1, length = ?2, data_sha1 = ?3 WHERE id = ?4",
        params![ts_end, length as i64, &data_sha1[..], chunk_id],
    )?;
    Ok(())
}

const CHUNK_COLUMNS: &str = "id, ts_start, ts_end, offset, length, file_sha1, data_sha1";

type ChunkRow = (
    i64,
    i64,
    Option<i64>,
    i64,
    Option<i64>,
    Vec<u8>,
    Option<Vec<u8>>,
);

fn chunk_from_row(row: ChunkRow) -> Result<Chunk, Error> {
    let (id, ts_start, ts_end, offset, length, file_sha1, data_sha1) = row;
    Ok(Chunk {
        id,
        ts_start,
        ts_end,
        offset: offset as u64,
        length: length.map(|l| l as u64),
        file_sha1: to_digest(file_sha1)?,
        data_sha1: data_sha1.map(to_digest).transpose()?,
    })
}

pub fn get_chunk(conn: &Connection, id: i64) -> Result<Option<Chunk>, Error> {
    let row: Option<ChunkRow> = conn
        .query_row(
            &format!("SELECT {CHUNK_COLUMNS} FROM chunk WHERE id = ?1"),
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?)),
        )
        .optional()?;
    row.map(chunk_from_row).transpose()
}

pub fn get_latest_chunk(conn: &Connection) -> Result<Option<Chunk>, Error> {
    let row: Option<ChunkRow> = conn
        .query_row(
            &format!("SELECT {CHUNK_COLUMNS} FROM chunk ORDER BY id DESC LIMIT 1"),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?)),
        )
        .optional()?;
    row.map(chunk_from_row).transpose()
}

pub fn get_chunks(conn: &Connection) -> Result<Vec<Chunk>, Error> {
    let mut stmt = conn.prepare(&format!("SELECT {CHUNK_COLUMNS} FROM chunk ORDER BY id ASC"))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(chunk_from_row(row?)?);
    }
    Ok(out)
}

// ---- message -----------------------------------------------------------

const MESSAGE_COLUMNS: &str = "id, guid, partition, chunk_id, offset, length";

type MessageRow = (i64, String, String, i64, i64, i64);

fn message_from_row(row: MessageRow) -> Message {
    let (id, guid, partition, chunk_id, offset, length) = row;
    Message {
        id,
        guid,
        partition,
        chunk_id,
        offset: offset as u64,
        length: length as u64,
    }
}

pub fn get_message_by_guid(conn: &Connection, guid: &str) -> Result<Option<Message>, Error> {
    let row: Option<MessageRow> = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM message WHERE guid = ?1"),
            params![guid],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?)),
        )
        .optional()?;
    Ok(row.map(message_from_row))
}

/// Inserts a message row unless `guid` is already known (spec §4.5.1:
/// "known guids are idempotent no-ops"). Returns `true` if a row was
/// inserted.
pub fn insert_message_if_absent(
    conn: &Connection,
    guid: &str,
    partition: &str,
    chunk_id: i64,
    offset: u64,
    length: u64,
) -> Result<bool, Error> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO message (guid, partition, chunk_id, offset, length)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![guid, partition, chunk_id, offset as i64, length as i64],
    )?;
    if inserted > 0 {
        // A RECORD may have been indexed before its MESSAGE counterpart
        // arrived, leaving `mailbox_message.message_id` NULL; backfill it
        // now that the message row exists (matched by the guid already
        // carried on the mailbox_message row).
        conn.execute(
            "UPDATE mailbox_message SET message_id = (SELECT id FROM message WHERE guid = ?1)
             WHERE guid = ?1 AND message_id IS NULL",
            params![guid],
        )?;
    }
    Ok(inserted > 0)
}

pub fn message_foreach(
    conn: &Connection,
    chunk_id: Option<i64>,
    mut cb: impl FnMut(Message) -> i32,
) -> Result<i32, Error> {
    let mut stmt = match chunk_id {
        Some(_) => conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM message WHERE chunk_id = ?1 ORDER BY id ASC"
        ))?,
        None => conn.prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM message ORDER BY id ASC"))?,
    };
    let map_row = |row: &rusqlite::Row| -> rusqlite::Result<MessageRow> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
    };
    let rows = match chunk_id {
        Some(id) => stmt.query_map(params![id], map_row)?,
        None => stmt.query_map([], map_row)?,
    };
    for row in rows {
        let rc = cb(message_from_row(row?));
        if rc != 0 {
            return Ok(rc);
        }
    }
    Ok(0)
}

// ---- mailbox -----------------------------------------------------------

const MAILBOX_COLUMNS: &str = "id, last_chunk_id, uniqueid, mboxname, mboxtype, last_uid, \
    highestmodseq, recentuid, recenttime, last_appenddate, pop3_last_login, pop3_show_after, \
    uidvalidity, partition, acl, options, sync_crc, sync_crc_annot, quotaroot, xconvmodseq, \
    annotations, deleted";

#[allow(clippy::type_complexity)]
type MailboxRow = (
    i64,
    i64,
    String,
    String,
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    i64,
    String,
    String,
    String,
    i64,
    i64,
    String,
    i64,
    String,
    i64,
);

fn mailbox_from_row(row: MailboxRow) -> Mailbox {
    Mailbox {
        id: row.0,
        last_chunk_id: row.1,
        uniqueid: row.2,
        mboxname: row.3,
        mboxtype: row.4,
        last_uid: row.5 as u32,
        highestmodseq: row.6 as u64,
        recentuid: row.7 as u32,
        recenttime: row.8,
        last_appenddate: row.9,
        pop3_last_login: row.10,
        pop3_show_after: row.11,
        uidvalidity: row.12 as u32,
        partition: row.13,
        acl: row.14,
        options: row.15,
        sync_crc: row.16 as u32,
        sync_crc_annot: row.17 as u32,
        quotaroot: row.18,
        xconvmodseq: row.19 as u64,
        annotations: row.20,
        deleted: row.21,
    }
}

fn mailbox_row_mapper(row: &rusqlite::Row) -> rusqlite::Result<MailboxRow> {
    Ok((
        row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?,
        row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?, row.get(10)?, row.get(11)?,
        row.get(12)?, row.get(13)?, row.get(14)?, row.get(15)?, row.get(16)?, row.get(17)?,
        row.get(18)?, row.get(19)?, row.get(20)?, row.get(21)?,
    ))
}

/// Upserts a mailbox row keyed by `uniqueid`, mirroring every listed
/// metadata field and setting `last_chunk_id` (spec §4.5.1 `MAILBOX`).
pub fn upsert_mailbox(conn: &Connection, m: &Mailbox) -> Result<i64, Error> {
    conn.execute(
        "INSERT INTO mailbox (
            last_chunk_id, uniqueid, mboxname, mboxtype, last_uid, highestmodseq,
            recentuid, recenttime, last_appenddate, pop3_last_login, pop3_show_after,
            uidvalidity, partition, acl, options, sync_crc, sync_crc_annot,
            quotaroot, xconvmodseq, annotations, deleted
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21)
         ON CONFLICT(uniqueid) DO UPDATE SET
            last_chunk_id = excluded.last_chunk_id,
            mboxname = excluded.mboxname,
            mboxtype = excluded.mboxtype,
            last_uid = excluded.last_uid,
            highestmodseq = excluded.highestmodseq,
            recentuid = excluded.recentuid,
            recenttime = excluded.recenttime,
            last_appenddate = excluded.last_appenddate,
            pop3_last_login = excluded.pop3_last_login,
            pop3_show_after = excluded.pop3_show_after,
            uidvalidity = excluded.uidvalidity,
            partition = excluded.partition,
            acl = excluded.acl,
            options = excluded.options,
            sync_crc = excluded.sync_crc,
            sync_crc_annot = excluded.sync_crc_annot,
            quotaroot = excluded.quotaroot,
            xconvmodseq = excluded.xconvmodseq,
            annotations = excluded.annotations,
            deleted = excluded.deleted",
        params![
            m.last_chunk_id,
            m.uniqueid,
            m.mboxname,
            m.mboxtype,
            m.last_uid,
            m.highestmodseq as i64,
            m.recentuid,
            m.recenttime,
            m.last_appenddate,
            m.pop3_last_login,
            m.pop3_show_after,
            m.uidvalidity,
            m.partition,
            m.acl,
            m.options,
            m.sync_crc,
            m.sync_crc_annot,
            m.quotaroot,
            m.xconvmodseq as i64,
            m.annotations,
            m.deleted,
        ],
    )?;
    get_mailbox_id(conn, &m.uniqueid)?.ok_or_else(|| Error::internal("mailbox upsert vanished"))
}

pub fn get_mailbox_id(conn: &Connection, uniqueid: &str) -> Result<Option<i64>, Error> {
    conn.query_row(
        "SELECT id FROM mailbox WHERE uniqueid = ?1",
        params![uniqueid],
        |row| row.get(0),
    )
    .optional()
    .map_err(Error::from)
}

pub fn get_mailbox(conn: &Connection, id: i64) -> Result<Option<Mailbox>, Error> {
    let row: Option<MailboxRow> = conn
        .query_row(
            &format!("SELECT {MAILBOX_COLUMNS} FROM mailbox WHERE id = ?1"),
            params![id],
            |row| mailbox_row_mapper(row),
        )
        .optional()?;
    Ok(row.map(mailbox_from_row))
}

pub fn get_mailbox_by_name(conn: &Connection, mboxname: &str) -> Result<Option<Mailbox>, Error> {
    let row: Option<MailboxRow> = conn
        .query_row(
            &format!("SELECT {MAILBOX_COLUMNS} FROM mailbox WHERE mboxname = ?1"),
            params![mboxname],
            |row| mailbox_row_mapper(row),
        )
        .optional()?;
    Ok(row.map(mailbox_from_row))
}

pub fn mailbox_foreach(
    conn: &Connection,
    chunk_id: Option<i64>,
    mut cb: impl FnMut(Mailbox) -> i32,
) -> Result<i32, Error> {
    let mut stmt = match chunk_id {
        Some(_) => conn.prepare(&format!(
            "SELECT {MAILBOX_COLUMNS} FROM mailbox WHERE last_chunk_id = ?1 ORDER BY id ASC"
        ))?,
        None => conn.prepare(&format!("SELECT {MAILBOX_COLUMNS} FROM mailbox ORDER BY id ASC"))?,
    };
    let rows = match chunk_id {
        Some(id) => stmt.query_map(params![id], mailbox_row_mapper)?,
        None => stmt.query_map([], mailbox_row_mapper)?,
    };
    for row in rows {
        let rc = cb(mailbox_from_row(row?));
        if rc != 0 {
            return Ok(rc);
        }
    }
    Ok(0)
}

/// `UNMAILBOX`: stamps the mailbox's `deleted` timestamp and advances
/// `last_chunk_id`.
pub fn mark_mailbox_deleted(
    conn: &Connection,
    uniqueid: &str,
    last_chunk_id: i64,
    deleted_ts: i64,
) -> Result<(), Error> {
    conn.execute(
        "UPDATE mailbox SET deleted = ?1, last_chunk_id = ?2 WHERE uniqueid = ?3",
        params![deleted_ts, last_chunk_id, uniqueid],
    )?;
    Ok(())
}

/// `RENAME`: updates `mboxname` in place and advances `last_chunk_id`.
pub fn rename_mailbox(
    conn: &Connection,
    uniqueid: &str,
    new_mboxname: &str,
    last_chunk_id: i64,
) -> Result<(), Error> {
    conn.execute(
        "UPDATE mailbox SET mboxname = ?1, last_chunk_id = ?2 WHERE uniqueid = ?3",
        params![new_mboxname, last_chunk_id, uniqueid],
    )?;
    Ok(())
}

// ---- mailbox_message ---------------------------------------------------

const MAILBOX_MESSAGE_COLUMNS: &str = "id, mailbox_id, mailbox_uniqueid, message_id, \
    last_chunk_id, uid, modseq, last_updated, flags, internaldate, guid, size, annotations, \
    expunged";

#[allow(clippy::type_complexity)]
type MailboxMessageRow = (
    i64,
    i64,
    String,
    Option<i64>,
    i64,
    i64,
    i64,
    i64,
    String,
    i64,
    String,
    i64,
    String,
    i64,
);

fn mailbox_message_from_row(row: MailboxMessageRow) -> MailboxMessage {
    MailboxMessage {
        id: row.0,
        mailbox_id: row.1,
        mailbox_uniqueid: row.2,
        message_id: row.3,
        last_chunk_id: row.4,
        uid: row.5 as u32,
        modseq: row.6 as u64,
        last_updated: row.7,
        flags: row.8,
        internaldate: row.9,
        guid: row.10,
        size: row.11 as u32,
        annotations: row.12,
        expunged: row.13 != 0,
    }
}

fn mailbox_message_row_mapper(row: &rusqlite::Row) -> rusqlite::Result<MailboxMessageRow> {
    Ok((
        row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?,
        row.get(6)?, row.get(7)?, row.get(8)?, row.get(9)?, row.get(10)?, row.get(11)?,
        row.get(12)?, row.get(13)?,
    ))
}

/// Upserts a mailbox-message row keyed by `(mailbox_id, uid)` (spec §4.5.1
/// `MAILBOX` RECORD entries, and the per-record mutations of `EXPUNGE`).
#[allow(clippy::too_many_arguments)]
pub fn upsert_mailbox_message(conn: &Connection, row: &MailboxMessage) -> Result<(), Error> {
    conn.execute(
        "INSERT INTO mailbox_message (
            mailbox_id, mailbox_uniqueid, message_id, last_chunk_id, uid, modseq,
            last_updated, flags, internaldate, guid, size, annotations, expunged
         ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
         ON CONFLICT(mailbox_id, uid) DO UPDATE SET
            mailbox_uniqueid = excluded.mailbox_uniqueid,
            message_id = COALESCE(excluded.message_id, mailbox_message.message_id),
            last_chunk_id = excluded.last_chunk_id,
            modseq = excluded.modseq,
            last_updated = excluded.last_updated,
            flags = excluded.flags,
            internaldate = excluded.internaldate,
            guid = excluded.guid,
            size = excluded.size,
            annotations = excluded.annotations,
            expunged = excluded.expunged",
        params![
            row.mailbox_id,
            row.mailbox_uniqueid,
            row.message_id,
            row.last_chunk_id,
            row.uid,
            row.modseq as i64,
            row.last_updated,
            row.flags,
            row.internaldate,
            row.guid,
            row.size,
            row.annotations,
            row.expunged as i64,
        ],
    )?;
    Ok(())
}

/// `EXPUNGE`: marks an existing mailbox-message row expunged.
pub fn mark_expunged(
    conn: &Connection,
    mailbox_id: i64,
    uid: u32,
    last_chunk_id: i64,
) -> Result<(), Error> {
    conn.execute(
        "UPDATE mailbox_message SET expunged = 1, last_chunk_id = ?1
         WHERE mailbox_id = ?2 AND uid = ?3",
        params![last_chunk_id, mailbox_id, uid],
    )?;
    Ok(())
}

pub fn get_mailbox_messages(
    conn: &Connection,
    mailbox_id: i64,
    chunk_id: Option<i64>,
) -> Result<Vec<MailboxMessage>, Error> {
    let mut stmt = match chunk_id {
        Some(_) => conn.prepare(&format!(
            "SELECT {MAILBOX_MESSAGE_COLUMNS} FROM mailbox_message
             WHERE mailbox_id = ?1 AND last_chunk_id = ?2 ORDER BY uid ASC"
        ))?,
        None => conn.prepare(&format!(
            "SELECT {MAILBOX_MESSAGE_COLUMNS} FROM mailbox_message
             WHERE mailbox_id = ?1 ORDER BY uid ASC"
        ))?,
    };
    let rows = match chunk_id {
        Some(cid) => stmt.query_map(params![mailbox_id, cid], mailbox_message_row_mapper)?,
        None => stmt.query_map(params![mailbox_id], mailbox_message_row_mapper)?,
    };
    let mut out = Vec::new();
    for row in rows {
        out.push(mailbox_message_from_row(row?));
    }
    Ok(out)
}

/// All mailbox-message rows, optionally restricted to one chunk (spec
/// §4.7 `get_mailbox_messages(chunk_id?)`, `chunk_id == 0` meaning "all").
pub fn get_all_mailbox_messages(
    conn: &Connection,
    chunk_id: Option<i64>,
) -> Result<Vec<MailboxMessage>, Error> {
    let mut stmt = match chunk_id {
        Some(_) => conn.prepare(&format!(
            "SELECT {MAILBOX_MESSAGE_COLUMNS} FROM mailbox_message
             WHERE last_chunk_id = ?1 ORDER BY id ASC"
        ))?,
        None => conn.prepare(&format!(
            "SELECT {MAILBOX_MESSAGE_COLUMNS} FROM mailbox_message ORDER BY id ASC"
        ))?,
    };
    let rows = match chunk_id {
        Some(cid) => stmt.query_map(params![cid], mailbox_message_row_mapper)?,
        None => stmt.query_map([], mailbox_message_row_mapper)?,
    };
    let mut out = Vec::new();
    for row in rows {
        out.push(mailbox_message_from_row(row?));
    }
    Ok(out)
}

pub fn get_mailbox_message_by_uid(
    conn: &Connection,
    mailbox_id: i64,
    uid: u32,
) -> Result<Option<MailboxMessage>, Error> {
    let row: Option<MailboxMessageRow> = conn
        .query_row(
            &format!(
                "SELECT {MAILBOX_MESSAGE_COLUMNS} FROM mailbox_message
                 WHERE mailbox_id = ?1 AND uid = ?2"
            ),
            params![mailbox_id, uid],
            mailbox_message_row_mapper,
        )
        .optional()?;
    Ok(row.map(mailbox_message_from_row))
}
