//! Typed read queries over the index (spec §4.7). All methods are
//! idempotent and return owned values rather than borrowing the
//! connection - the teacher's `IndexFile` trait (`pbs-datastore::index`)
//! is the model for "a read-only typed view bolted onto a store that also
//! has a writer side".
//!
//! Iterator callbacks return a non-zero value to abort traversal; that
//! value is surfaced to the caller, mirroring the source's
//! `(callback, rock)` convention generalized into a plain closure (spec §9
//! "Row callbacks").

use cbs_replication::{Atom, KvList};
use cbs_types::{Chunk, Mailbox, MailboxMessage, MailboxWithRecords, Message};
use cbs_types::Error;

use super::{queries, IndexStore};

/// Borrows an [`IndexStore`] to answer read queries.
pub struct ReadApi<'a> {
    store: &'a IndexStore,
}

impl<'a> ReadApi<'a> {
    pub fn new(store: &'a IndexStore) -> Self {
        Self { store }
    }

    pub fn get_mailbox_id(&self, uniqueid: &str) -> Result<Option<i64>, Error> {
        queries::get_mailbox_id(self.store.conn(), uniqueid)
    }

    /// `want_records = true` eagerly loads the mailbox's live message
    /// occurrences alongside it.
    pub fn get_mailbox_by_name(
        &self,
        mboxname: &str,
        want_records: bool,
    ) -> Result<Option<MailboxWithRecords>, Error> {
        let mailbox = match queries::get_mailbox_by_name(self.store.conn(), mboxname)? {
            Some(m) => m,
            None => return Ok(None),
        };
        let records = if want_records {
            queries::get_mailbox_messages(self.store.conn(), mailbox.id, None)?
                .into_iter()
                .filter(|r| !r.expunged)
                .collect()
        } else {
            Vec::new()
        };
        Ok(Some(MailboxWithRecords { mailbox, records }))
    }

    /// Visits every mailbox, or only those last touched by `chunk_id` when
    /// given (`chunk_id == Some(0)` is treated the same as `None`: all
    /// chunks, per spec §4.7).
    pub fn mailbox_foreach(
        &self,
        chunk_id: Option<i64>,
        want_records: bool,
        mut cb: impl FnMut(MailboxWithRecords) -> i32,
    ) -> Result<i32, Error> {
        let chunk_id = normalize_chunk_filter(chunk_id);
        let conn = self.store.conn();
        // A failed per-mailbox records sub-query must surface as a typed
        // error, not a silently half-populated row (spec §9 open question
        // 3) - captured here since the inner closure cannot itself return
        // a `Result` through `queries::mailbox_foreach`'s `i32` callback.
        let mut first_err: Option<Error> = None;
        let rc = queries::mailbox_foreach(conn, chunk_id, |mailbox| {
            let records = if want_records {
                match queries::get_mailbox_messages(conn, mailbox.id, None) {
                    Ok(rows) => rows.into_iter().filter(|r| !r.expunged).collect(),
                    Err(err) => {
                        first_err = Some(err);
                        return i32::MIN;
                    }
                }
            } else {
                Vec::new()
            };
            cb(MailboxWithRecords { mailbox, records })
        })?;
        match first_err {
            Some(err) => Err(err),
            None => Ok(rc),
        }
    }

    pub fn get_message_id(&self, guid: &str) -> Result<Option<i64>, Error> {
        Ok(queries::get_message_by_guid(self.store.conn(), guid)?.map(|m| m.id))
    }

    pub fn get_message(&self, guid: &str) -> Result<Option<Message>, Error> {
        queries::get_message_by_guid(self.store.conn(), guid)
    }

    pub fn message_foreach(
        &self,
        chunk_id: Option<i64>,
        cb: impl FnMut(Message) -> i32,
    ) -> Result<i32, Error> {
        queries::message_foreach(self.store.conn(), normalize_chunk_filter(chunk_id), cb)
    }

    pub fn get_mailbox_messages(&self, chunk_id: Option<i64>) -> Result<Vec<MailboxMessage>, Error> {
        queries::get_all_mailbox_messages(self.store.conn(), normalize_chunk_filter(chunk_id))
    }

    pub fn get_chunks(&self) -> Result<Vec<Chunk>, Error> {
        queries::get_chunks(self.store.conn())
    }

    pub fn get_latest_chunk(&self) -> Result<Option<Chunk>, Error> {
        queries::get_latest_chunk(self.store.conn())
    }

    /// Rebuilds a replication `MAILBOX` kvlist from an index mailbox row,
    /// the way restore tooling (out of scope itself) would reconstruct a
    /// command to resend (spec §4.7 `mailbox_to_dlist`).
    pub fn mailbox_to_dlist(&self, mailbox: &MailboxWithRecords) -> KvList {
        let mut kv = KvList::new();
        let m = &mailbox.mailbox;
        kv.push("UNIQUEID", Atom::Str(m.uniqueid.clone()));
        kv.push("MBOXNAME", Atom::Str(m.mboxname.clone()));
        kv.push("MBOXTYPE", Atom::Str(m.mboxtype.clone()));
        kv.push("LAST_UID", Atom::Num(m.last_uid as i64));
        kv.push("HIGHESTMODSEQ", Atom::Num(m.highestmodseq as i64));
        kv.push("RECENTUID", Atom::Num(m.recentuid as i64));
        kv.push("RECENTTIME", Atom::Num(m.recenttime));
        kv.push("LAST_APPENDDATE", Atom::Num(m.last_appenddate));
        kv.push("POP3_LAST_LOGIN", Atom::Num(m.pop3_last_login));
        kv.push("POP3_SHOW_AFTER", Atom::Num(m.pop3_show_after));
        kv.push("UIDVALIDITY", Atom::Num(m.uidvalidity as i64));
        kv.push("PARTITION", Atom::Str(m.partition.clone()));
        kv.push("ACL", Atom::Str(m.acl.clone()));
        kv.push("OPTIONS", Atom::Str(m.options.clone()));
        kv.push("SYNC_CRC", Atom::Num(m.sync_crc as i64));
        kv.push("SYNC_CRC_ANNOT", Atom::Num(m.sync_crc_annot as i64));
        kv.push("QUOTAROOT", Atom::Str(m.quotaroot.clone()));
        kv.push("XCONVMODSEQ", Atom::Num(m.xconvmodseq as i64));
        kv.push("ANNOTATIONS", Atom::Str(m.annotations.clone()));

        if !mailbox.records.is_empty() {
            let records = mailbox
                .records
                .iter()
                .map(|r| {
                    let mut rec = KvList::new();
                    rec.push("UID", Atom::Num(r.uid as i64));
                    rec.push("MODSEQ", Atom::Num(r.modseq as i64));
                    rec.push("LAST_UPDATED", Atom::Num(r.last_updated));
                    rec.push("FLAGS", Atom::Str(r.flags.clone()));
                    rec.push("INTERNALDATE", Atom::Num(r.internaldate));
                    rec.push("GUID", Atom::Str(r.guid.clone()));
                    rec.push("SIZE", Atom::Num(r.size as i64));
                    rec.push("ANNOTATIONS", Atom::Str(r.annotations.clone()));
                    if r.expunged {
                        rec.push("EXPUNGED", Atom::Num(1));
                    }
                    Atom::KvList(rec)
                })
                .collect();
            kv.push("RECORD", Atom::Array(records));
        }

        kv
    }
}

fn normalize_chunk_filter(chunk_id: Option<i64>) -> Option<i64> {
    match chunk_id {
        Some(0) | None => None,
        some => some,
    }
}
