//! Per-user backup storage core for a replication-style mail server: a
//! compressed append-only data log paired with a transactional index that
//! can always be rebuilt from the log alone.
//!
//! This crate is the thin top-level façade over the workspace's `cbs-*`
//! crates, the way `proxmox-backup`'s root crate pulls in `pbs-datastore`.
//! Most callers only need [`Session`] and the read API it exposes.

pub use cbs_config::{Config, PathResolver, UserPaths};
pub use cbs_replication::{format_atom, format_command, Atom, Command, KvList};
pub use cbs_store::{chunk_integrity, reindex, Flush, ReadApi, Session};
pub use cbs_types::{
    Chunk, Error, Mailbox, MailboxMessage, MailboxWithRecords, Message, Result,
};
