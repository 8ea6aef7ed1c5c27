//! The replication command vocabulary (spec §6.5): a key/value list
//! serialization with typed atoms, plus the 160-bit GUID codec. Treated by
//! the backup core as an external collaborator; this crate is its concrete
//! implementation.

pub mod guid;
pub mod kvlist;

pub use kvlist::{format_atom, format_command, parse_chunk_header, parse_command_complete, Atom, Command, KvList};
