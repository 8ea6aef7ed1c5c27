//! The append engine (spec §4.5): the only writer path, driving the gzip
//! stream and the index update as one logical unit. Mechanics (running
//! hash, flush discipline) are grounded on
//! `pbs-datastore::checksum_writer::ChecksumWriter`; the per-command
//! indexing policy (§4.5.1) is this crate's own.

use std::fs::File;

use cbs_replication::{format_atom, format_command, Atom, KvList};
use cbs_types::{Mailbox, MailboxMessage};
use cbs_types::Error;
use rusqlite::Connection;

use crate::checksum::{sha1_prefix, RunningSha1};
use crate::gzlog::ChunkWriter;
use crate::index::queries;

/// Whether to issue a full gzip flush after a command line. A full flush
/// guarantees a crash after the call loses no earlier commands (spec §4.5
/// append step 2); `NoFlush` trades that guarantee for throughput.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    Full,
    NoFlush,
}

/// State of one open chunk. Owned by [`crate::session::Session`] between a
/// `start` and its matching `end`/`abort`.
pub struct OpenAppend {
    pub chunk_id: i64,
    pub chunk_offset: u64,
    pub file_sha1: [u8; 20],
    pub wrote: u64,
    writer: Option<ChunkWriter>,
    hasher: RunningSha1,
}

impl OpenAppend {
    /// Chunk-start mechanics (spec §4.5 start, steps 1-4): seek-to-EOF is
    /// represented by `file`'s current length, `file_sha1` covers
    /// everything before it, and - unless `index_only` - a new gzip member
    /// is opened on a duplicated fd and the header line written and
    /// flushed. Index row insertion (step 5) is the caller's job, since it
    /// needs a transaction the engine itself does not own.
    pub fn start(file: &mut File, index_only: bool, ts_start: i64) -> Result<Self, Error> {
        let offset = file.metadata()?.len();
        let file_sha1 = sha1_prefix(file, offset)?;

        let writer = if index_only {
            None
        } else {
            let dup = file.try_clone()?;
            Some(ChunkWriter::start(dup))
        };

        let mut open = OpenAppend {
            chunk_id: -1,
            chunk_offset: offset,
            file_sha1,
            wrote: 0,
            writer,
            hasher: RunningSha1::new(),
        };

        let header = format!("# cyrus backup: chunk start {ts_start}\r\n");
        open.write_raw(header.as_bytes(), true)?;
        Ok(open)
    }

    /// Reindex variant: the member already exists on disk at `offset`, so
    /// there is no gzip writer to open - this call only sets up the
    /// running hash that will be checked against the chunk's `data_sha1`
    /// once the member has been fully replayed.
    pub fn start_index_only_at(offset: u64, file_sha1: [u8; 20]) -> Self {
        OpenAppend {
            chunk_id: -1,
            chunk_offset: offset,
            file_sha1,
            wrote: 0,
            writer: None,
            hasher: RunningSha1::new(),
        }
    }

    fn write_raw(&mut self, bytes: &[u8], flush: bool) -> Result<(), Error> {
        if let Some(w) = self.writer.as_mut() {
            w.write_line(bytes, flush)?;
        }
        self.hasher.update(bytes);
        self.wrote += bytes.len() as u64;
        Ok(())
    }

    /// Writes one command line and returns its byte offset within the
    /// chunk's decompressed stream (spec §4.5 append steps 1-3).
    pub fn write_command(&mut self, line: &[u8], flush: Flush) -> Result<u64, Error> {
        let start_offset = self.wrote;
        self.write_raw(line, flush == Flush::Full)?;
        Ok(start_offset)
    }

    /// Closes the gzip writer (if any) and finalizes the running hash.
    /// Returns `data_sha1` and the total decompressed length written.
    pub fn finish(self) -> Result<([u8; 20], u64), Error> {
        let OpenAppend { writer, hasher, wrote, .. } = self;
        if let Some(w) = writer {
            let (_file, _gz_digest, gz_wrote) = w.finish()?;
            debug_assert_eq!(gz_wrote, wrote, "running hash length disagrees with gzip writer");
        }
        Ok((hasher.finish(), wrote))
    }
}

/// Builds the on-disk line for one command (spec §4.5 append: `"<ts> <VERB>
/// <kvlist>\r\n"`; historically always `APPLY` for routine per-message
/// applies, generalized here to whatever verb the caller is indexing so a
/// single code path serves `MAILBOX`/`MESSAGE`/`UNMAILBOX`/`EXPUNGE`/
/// `RENAME` alike, per §4.5.1's dispatch).
pub fn build_command_line(ts: i64, verb: &str, kvlist: &KvList) -> Vec<u8> {
    format_command(ts, verb, kvlist)
}

/// Per-command indexing policy (spec §4.5.1). `line_offset`/`line_len` are
/// the command line's byte range inside the chunk's decompressed stream;
/// for `MESSAGE`, that range is recorded directly as the message's
/// offset/length (a deliberate simplification noted in `DESIGN.md`: the
/// spec does not pin down a sub-line byte range for the literal payload,
/// and nothing in this exercise's inputs resolves the ambiguity).
pub fn index_command(
    conn: &Connection,
    chunk_id: i64,
    ts: i64,
    verb: &str,
    kvlist: &KvList,
    line_offset: u64,
    line_len: u64,
) -> Result<(), Error> {
    match verb.to_ascii_uppercase().as_str() {
        "MAILBOX" => index_mailbox(conn, chunk_id, kvlist),
        "MESSAGE" => index_message(conn, chunk_id, kvlist, line_offset, line_len),
        "UNMAILBOX" => index_unmailbox(conn, chunk_id, ts, kvlist),
        "EXPUNGE" => index_expunge(conn, chunk_id, kvlist),
        "RENAME" => index_rename(conn, chunk_id, kvlist),
        _ => Ok(()), // preserved in the log, not indexed
    }
}

fn index_mailbox(conn: &Connection, chunk_id: i64, kvlist: &KvList) -> Result<(), Error> {
    let uniqueid = kvlist
        .get_str("UNIQUEID")
        .ok_or_else(|| Error::data_err("MAILBOX command missing UNIQUEID"))?
        .to_owned();
    let mboxname = kvlist.get_str("MBOXNAME").unwrap_or_default().to_owned();

    let mailbox = Mailbox {
        id: 0,
        last_chunk_id: chunk_id,
        uniqueid,
        mboxname,
        mboxtype: kvlist.get_str("MBOXTYPE").unwrap_or_default().to_owned(),
        last_uid: kvlist.get_u32("LAST_UID").unwrap_or(0),
        highestmodseq: kvlist.get_u64("HIGHESTMODSEQ").unwrap_or(0),
        recentuid: kvlist.get_u32("RECENTUID").unwrap_or(0),
        recenttime: kvlist.get_i64("RECENTTIME").unwrap_or(0),
        last_appenddate: kvlist.get_i64("LAST_APPENDDATE").unwrap_or(0),
        pop3_last_login: kvlist.get_i64("POP3_LAST_LOGIN").unwrap_or(0),
        pop3_show_after: kvlist.get_i64("POP3_SHOW_AFTER").unwrap_or(0),
        uidvalidity: kvlist.get_u32("UIDVALIDITY").unwrap_or(0),
        partition: kvlist.get_str("PARTITION").unwrap_or_default().to_owned(),
        acl: kvlist.get_str("ACL").unwrap_or_default().to_owned(),
        options: kvlist.get_str("OPTIONS").unwrap_or_default().to_owned(),
        sync_crc: kvlist.get_u32("SYNC_CRC").unwrap_or(0),
        sync_crc_annot: kvlist.get_u32("SYNC_CRC_ANNOT").unwrap_or(0),
        quotaroot: kvlist.get_str("QUOTAROOT").unwrap_or_default().to_owned(),
        xconvmodseq: kvlist.get_u64("XCONVMODSEQ").unwrap_or(0),
        annotations: kvlist.get_str("ANNOTATIONS").unwrap_or_default().to_owned(),
        deleted: 0,
    };

    let mailbox_id = queries::upsert_mailbox(conn, &mailbox)?;

    if let Some(records) = kvlist.get_array("RECORD") {
        for record in records {
            let rec_kv = record
                .as_kvlist()
                .ok_or_else(|| Error::data_err("MAILBOX RECORD entry is not a kvlist"))?;
            index_record(conn, mailbox_id, &mailbox.uniqueid, chunk_id, rec_kv)?;
        }
    }

    Ok(())
}

fn index_record(
    conn: &Connection,
    mailbox_id: i64,
    mailbox_uniqueid: &str,
    chunk_id: i64,
    rec: &KvList,
) -> Result<(), Error> {
    let uid = rec
        .get_u32("UID")
        .ok_or_else(|| Error::data_err("MAILBOX RECORD missing UID"))?;
    let guid = rec.get_str("GUID").unwrap_or_default().to_owned();

    let expunged = rec
        .get_array("FLAGS")
        .map(|flags| {
            flags
                .iter()
                .any(|a| matches!(a.as_str(), Some(s) if s.eq_ignore_ascii_case("\\Expunged")))
        })
        .unwrap_or(false);

    let flags = rec
        .get("FLAGS")
        .map(|a| String::from_utf8_lossy(&format_atom(a)).into_owned())
        .unwrap_or_default();
    let annotations = rec
        .get("ANNOTATIONS")
        .map(|a| String::from_utf8_lossy(&format_atom(a)).into_owned())
        .unwrap_or_default();

    let message_id = if !guid.is_empty() {
        queries::get_message_by_guid(conn, &guid)?.map(|m| m.id)
    } else {
        None
    };

    let row = MailboxMessage {
        id: 0,
        mailbox_id,
        mailbox_uniqueid: mailbox_uniqueid.to_owned(),
        message_id,
        last_chunk_id: chunk_id,
        uid,
        modseq: rec.get_u64("MODSEQ").unwrap_or(0),
        last_updated: rec.get_i64("LAST_UPDATED").unwrap_or(0),
        flags,
        internaldate: rec.get_i64("INTERNALDATE").unwrap_or(0),
        guid,
        size: rec.get_u32("SIZE").unwrap_or(0),
        annotations,
        expunged,
    };
    queries::upsert_mailbox_message(conn, &row)
}

fn index_message(
    conn: &Connection,
    chunk_id: i64,
    kvlist: &KvList,
    line_offset: u64,
    line_len: u64,
) -> Result<(), Error> {
    let guid = kvlist
        .get_str("GUID")
        .ok_or_else(|| Error::data_err("MESSAGE command missing GUID"))?;
    let partition = kvlist.get_str("PARTITION").unwrap_or_default();
    // Idempotent: a known guid is a no-op (spec §4.5.1), even though the
    // raw bytes are written to the log again verbatim either way.
    queries::insert_message_if_absent(conn, guid, partition, chunk_id, line_offset, line_len)?;
    Ok(())
}

fn index_unmailbox(conn: &Connection, chunk_id: i64, ts: i64, kvlist: &KvList) -> Result<(), Error> {
    let uniqueid = kvlist
        .get_str("UNIQUEID")
        .ok_or_else(|| Error::data_err("UNMAILBOX command missing UNIQUEID"))?;
    queries::mark_mailbox_deleted(conn, uniqueid, chunk_id, ts)
}

fn index_expunge(conn: &Connection, chunk_id: i64, kvlist: &KvList) -> Result<(), Error> {
    let uniqueid = kvlist
        .get_str("UNIQUEID")
        .ok_or_else(|| Error::data_err("EXPUNGE command missing UNIQUEID"))?;
    let mailbox_id = queries::get_mailbox_id(conn, uniqueid)?
        .ok_or_else(|| Error::data_err(format!("EXPUNGE for unknown mailbox {uniqueid}")))?;

    let uids: Vec<u32> = match kvlist.get("UID") {
        Some(Atom::Array(items)) => items.iter().filter_map(Atom::as_num).map(|n| n as u32).collect(),
        Some(atom) => atom.as_num().into_iter().map(|n| n as u32).collect(),
        None => Vec::new(),
    };
    for uid in uids {
        queries::mark_expunged(conn, mailbox_id, uid, chunk_id)?;
    }
    Ok(())
}

fn index_rename(conn: &Connection, chunk_id: i64, kvlist: &KvList) -> Result<(), Error> {
    let uniqueid = kvlist
        .get_str("UNIQUEID")
        .ok_or_else(|| Error::data_err("RENAME command missing UNIQUEID"))?;
    let new_name = kvlist
        .get_str("NEWMBOXNAME")
        .ok_or_else(|| Error::data_err("RENAME command missing NEWMBOXNAME"))?;
    queries::rename_mailbox(conn, uniqueid, new_name, chunk_id)
}
