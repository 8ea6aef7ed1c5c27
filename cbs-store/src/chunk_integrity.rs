//! End-to-end chunk validation (spec §4.4.1), generalized into a reusable
//! check so it can run both inline at `open` and as a standalone sweep over
//! every finalized chunk - invariant §3.2 made into something independently
//! callable instead of being inlined once.

use std::fs::File;
use std::path::Path;

use cbs_types::{Chunk, Error};

use crate::checksum::sha1_prefix;
use crate::gzlog::GzLogReader;
use crate::index::{queries, IndexStore};

/// Verifies one chunk: `file_sha1` over the bytes preceding it, then the
/// gzip member's decompressed length and `data_sha1`. `chunk` must already
/// be finalized (non-NULL `length`/`data_sha1`); an un-finalized chunk is
/// rejected without reading the file, since there is nothing yet to check
/// it against.
pub fn verify_chunk(file: &mut File, chunk: &Chunk) -> Result<(), Error> {
    let (length, data_sha1) = match (chunk.length, chunk.data_sha1) {
        (Some(l), Some(d)) => (l, d),
        _ => {
            return Err(Error::corrupt(format!(
                "chunk {} is not finalized, cannot validate",
                chunk.id
            )))
        }
    };

    let file_sha1 = sha1_prefix(file, chunk.offset)?;
    if file_sha1 != chunk.file_sha1 {
        return Err(Error::corrupt(format!(
            "chunk {}: file_sha1 mismatch (prefix bytes do not match recorded checksum)",
            chunk.id
        )));
    }

    let dup = file.try_clone()?;
    let mut reader = GzLogReader::open(dup);
    reader.member_start_from(chunk.offset)?;
    let content = reader.read_to_end()?;

    if content.len() as u64 != length {
        return Err(Error::corrupt(format!(
            "chunk {}: decompressed length {} does not match recorded length {}",
            chunk.id,
            content.len(),
            length
        )));
    }

    let mut hasher = openssl::sha::Sha1::new();
    hasher.update(&content);
    if hasher.finish() != data_sha1 {
        return Err(Error::corrupt(format!(
            "chunk {}: data_sha1 mismatch",
            chunk.id
        )));
    }

    Ok(())
}

/// Walks every finalized chunk recorded in `index_path` and recomputes its
/// checksums against `data_path`, stopping at the first mismatch. Exposed
/// for integrity sweeps; the core itself only ever calls [`verify_chunk`]
/// on the latest chunk during open (spec §4.4.1).
pub fn verify_all_chunks(data_path: &Path, index_path: &Path) -> Result<(), Error> {
    let index = IndexStore::open(index_path)?;
    let chunks = queries::get_chunks(index.conn())?;
    let mut file = File::open(data_path)?;
    for chunk in &chunks {
        if !chunk.is_finalized() {
            continue;
        }
        verify_chunk(&mut file, chunk)?;
    }
    Ok(())
}
