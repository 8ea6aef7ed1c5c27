//! The reindex engine (spec §4.6): rebuilds the index from the data log
//! alone by scanning gzip members sequentially and replaying their command
//! lines through the same indexing policy [`crate::append`] uses for live
//! appends.

use std::path::Path;

use cbs_replication::{next_record_end, parse_chunk_header, parse_command_complete};
use cbs_types::Error;

use crate::gzlog::GzLogReader;
use crate::session::Session;

/// Walks every gzip member in `data_path` and rebuilds `index_path` from
/// scratch. On success the rebuilt session is closed and the original
/// index (preserved as `<index>.old` for the duration) is discarded.
///
/// On a mid-member failure, the offset of the last successfully reindexed
/// member is reported so an external tool can truncate the data file there
/// and retry (spec §4.6 step 3); this core does not perform that
/// truncation itself.
pub fn reindex(data_path: &Path, index_path: &Path) -> Result<(), Error> {
    let mut session = Session::open_reindex(data_path.to_path_buf(), index_path.to_path_buf())?;
    let mut reader = GzLogReader::open(session.dup_file()?);

    let mut last_good_offset: u64 = 0;
    let mut previous_ts_start: Option<i64> = None;

    let result = (|| -> Result<(), Error> {
        while !reader.eof()? {
            let member_offset = reader.offset();
            reader.member_start_from(member_offset)?;
            replay_member(&mut session, &mut reader, member_offset, &mut previous_ts_start)?;
            last_good_offset = reader.offset();
        }
        Ok(())
    })();

    match result {
        Ok(()) => session
            .close()
            .map_err(|err| Error::internal(format!("reindex: {err}"))),
        Err(err) => {
            let _ = session.close();
            log::error!(
                "reindex failed after the member ending at offset {last_good_offset}: {err}"
            );
            Err(err)
        }
    }
}

fn replay_member(
    session: &mut Session,
    reader: &mut GzLogReader,
    member_offset: u64,
    previous_ts_start: &mut Option<i64>,
) -> Result<(), Error> {
    let content = reader.read_to_end()?;

    let (rest, ts_start) = parse_chunk_header(&content)
        .map_err(|_| Error::data_err(format!("chunk at offset {member_offset}: missing header line")))?;
    let header_len = content.len() - rest.len();

    if let Some(prev) = *previous_ts_start {
        if ts_start < prev {
            return Err(Error::data_err(format!(
                "chunk at offset {member_offset}: ts_start {ts_start} precedes previous chunk's {prev}"
            )));
        }
    }
    *previous_ts_start = Some(ts_start);

    let file_sha1 = crate::checksum::sha1_prefix(&mut session.dup_file()?, member_offset)?;
    session.append_start_index_only_at(ts_start, member_offset, file_sha1)?;
    session.reindex_account_header(&content[..header_len])?;

    let mut buf = &content[header_len..];
    let mut last_ts = ts_start;

    while !buf.is_empty() {
        let end = next_record_end(buf)
            .ok_or_else(|| Error::data_err(format!("chunk at offset {member_offset}: truncated command line")))?;
        let line = &buf[..end];
        buf = &buf[end..];

        if cbs_replication::is_comment_line(line) {
            // Comment lines are decompressed bytes too (spec §6.1: "tolerated
            // by the parser and skipped") - they still count towards
            // `data_sha1`/`length`, just not towards the index, or the next
            // `open`'s `verify_chunk` sees a length mismatch against a chunk
            // that reindexed cleanly.
            session.reindex_account_header(line)?;
            continue;
        }

        let command = parse_command_complete(line)
            .map_err(|err| Error::data_err(format!("chunk at offset {member_offset}: {err}")))?;
        if command.ts < last_ts {
            return Err(Error::data_err(format!(
                "chunk at offset {member_offset}: command timestamp {} precedes {last_ts}",
                command.ts
            )));
        }
        last_ts = command.ts;

        let verb = command.verb.to_ascii_uppercase();
        session.reindex_replay_command(&verb, &command.kvlist, command.ts, line)?;
    }

    reader.member_end()?;
    session.append_end(last_ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::append::Flush;
    use cbs_replication::{Atom, KvList};

    #[test]
    fn rebuilds_an_index_from_the_data_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("user.bak");
        let index = dir.path().join("user.bak.index");

        {
            let mut session = Session::open_paths(data.clone(), index.clone()).unwrap();
            session.append_start(1000).unwrap();
            let mut kv = KvList::new();
            kv.push("UNIQUEID", Atom::Str("U1".into()));
            kv.push("MBOXNAME", Atom::Str("INBOX".into()));
            session.append("MAILBOX", kv, 1001, Flush::Full).unwrap();
            session.append_end(1002).unwrap();
            session.close().unwrap();
        }

        std::fs::remove_file(&index).unwrap();
        reindex(&data, &index).unwrap();

        let session = Session::open_paths(data, index).unwrap();
        let mailbox = session
            .read_api()
            .get_mailbox_by_name("INBOX", false)
            .unwrap()
            .expect("mailbox recovered by reindex");
        assert_eq!(mailbox.mailbox.uniqueid, "U1");
        session.close().unwrap();
    }
}
