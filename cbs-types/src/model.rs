//! Logical entities of spec §3. These mirror index rows one-to-one; the
//! index store (`cbs-store::index`) is the only place that knows how they
//! are physically laid out in the schema.

/// One gzip member ("chunk") in the data file; the unit of atomic append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: i64,
    pub ts_start: i64,
    /// `None` until the chunk is finalized.
    pub ts_end: Option<i64>,
    /// Byte offset of the gzip member in the data file.
    pub offset: u64,
    /// Decompressed byte length of the chunk's content; `None` until finalized.
    pub length: Option<u64>,
    /// SHA-1 of data-file bytes `[0, offset)`.
    pub file_sha1: [u8; 20],
    /// SHA-1 of the chunk's decompressed content; `None` until finalized.
    pub data_sha1: Option<[u8; 20]>,
}

impl Chunk {
    pub fn is_finalized(&self) -> bool {
        self.ts_end.is_some() && self.length.is_some() && self.data_sha1.is_some()
    }
}

/// A message row, unique by `guid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: i64,
    pub guid: String,
    pub partition: String,
    /// Chunk that first carried the message's bytes.
    pub chunk_id: i64,
    pub offset: u64,
    pub length: u64,
}

/// Replicated mailbox metadata (spec §3 `Mailbox`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Mailbox {
    pub id: i64,
    pub last_chunk_id: i64,
    pub uniqueid: String,
    pub mboxname: String,
    pub mboxtype: String,
    pub last_uid: u32,
    pub highestmodseq: u64,
    pub recentuid: u32,
    pub recenttime: i64,
    pub last_appenddate: i64,
    pub pop3_last_login: i64,
    pub pop3_show_after: i64,
    pub uidvalidity: u32,
    pub partition: String,
    pub acl: String,
    pub options: String,
    pub sync_crc: u32,
    pub sync_crc_annot: u32,
    pub quotaroot: String,
    pub xconvmodseq: u64,
    pub annotations: String,
    /// 0 while live.
    pub deleted: i64,
}

impl Mailbox {
    pub fn is_deleted(&self) -> bool {
        self.deleted != 0
    }
}

/// The per-mailbox occurrence of a message (spec §3 `Mailbox-message`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MailboxMessage {
    pub id: i64,
    pub mailbox_id: i64,
    pub mailbox_uniqueid: String,
    /// `None` until a `MESSAGE` command carrying this record's guid has
    /// been indexed.
    pub message_id: Option<i64>,
    pub last_chunk_id: i64,
    pub uid: u32,
    pub modseq: u64,
    pub last_updated: i64,
    pub flags: String,
    pub internaldate: i64,
    pub guid: String,
    pub size: u32,
    pub annotations: String,
    pub expunged: bool,
}

/// A mailbox row together with its live (non-expunged) messages, the shape
/// `get_mailbox_by_name(.., want_records = true)` returns (spec §4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxWithRecords {
    pub mailbox: Mailbox,
    pub records: Vec<MailboxMessage>,
}
