//! Running and one-shot SHA-1 helpers, in the style of
//! `pbs-datastore::checksum_writer::ChecksumWriter` (which wraps a `Write`
//! with a running `crc32fast::Hasher`). Here the running hash is SHA-1,
//! computed with `openssl::sha::Sha1` the way `fixed_index.rs` computes its
//! header checksum with `openssl::sha::Sha256`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use cbs_types::Error;
use openssl::sha::Sha1;

/// SHA-1 of the first `len` bytes of `file`, restoring the file's seek
/// position afterwards. Used both for a chunk's `file_sha1` at append-start
/// and for end-to-end validation on open (spec §4.4.1).
pub fn sha1_prefix(file: &mut File, len: u64) -> Result<[u8; 20], Error> {
    let saved_pos = file.stream_position()?;
    file.seek(SeekFrom::Start(0))?;

    let mut hasher = Sha1::new();
    let mut buf = [0u8; 65536];
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let got = file.read(&mut buf[..want])?;
        if got == 0 {
            file.seek(SeekFrom::Start(saved_pos))?;
            return Err(Error::corrupt(format!(
                "data file shorter than expected prefix ({len} bytes)"
            )));
        }
        hasher.update(&buf[..got]);
        remaining -= got as u64;
    }

    file.seek(SeekFrom::Start(saved_pos))?;
    Ok(hasher.finish())
}

/// A running SHA-1 accumulator driven a line at a time, mirroring the
/// append engine's "update the running SHA-1 with the full line" steps
/// (spec §4.5 start/append/end).
#[derive(Default)]
pub struct RunningSha1 {
    hasher: Sha1,
}

impl RunningSha1 {
    pub fn new() -> Self {
        Self { hasher: Sha1::new() }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    pub fn finish(self) -> [u8; 20] {
        self.hasher.finish()
    }
}

/// Reads the decompressed content of a reader fully, returning its bytes
/// together with a freshly computed SHA-1 - used by validation and
/// `chunk_integrity` to recompute `data_sha1` independently of the append
/// engine's running hash.
pub fn sha1_of_reader(mut r: impl Read) -> io::Result<(Vec<u8>, [u8; 20])> {
    let mut out = Vec::new();
    r.read_to_end(&mut out)?;
    let mut hasher = Sha1::new();
    hasher.update(&out);
    Ok((out, hasher.finish()))
}
