//! The chunked-gzip log ("gzuncat", spec §4.1): the data file is a
//! concatenation of independent gzip members, one per chunk. Each member is
//! independently decodable, so a reader can seek to any chunk's recorded
//! offset and decompress from there without touching earlier chunks.
//!
//! Grounded on `pbs-datastore`'s habit of wrapping a plain `Write` in a
//! running-hash adapter (`checksum_writer.rs`); here the adapter wraps a
//! `flate2::write::GzEncoder` instead of a passthrough writer, because the
//! hash must cover the same raw bytes that are being compressed.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};

use cbs_types::Error;
use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use openssl::sha::Sha1;

/// Sequential (or seeking) reader over the gzip members of a data file.
pub struct GzLogReader {
    file: File,
    /// Byte offset of the member that `member_start`/`member_start_from`
    /// will begin at, or - while a member is open - the offset it began at.
    pos: u64,
    decoder: Option<GzDecoder<BufReader<File>>>,
    at_member_eof: bool,
}

impl GzLogReader {
    pub fn open(file: File) -> Self {
        Self {
            file,
            pos: 0,
            decoder: None,
            at_member_eof: false,
        }
    }

    /// Begins decoding the member immediately following the previous one
    /// (or the first member, if none has been read yet).
    pub fn member_start(&mut self) -> Result<(), Error> {
        self.member_start_from(self.pos)
    }

    /// Begins decoding the member starting at `offset`.
    pub fn member_start_from(&mut self, offset: u64) -> Result<(), Error> {
        let mut dup = self.file.try_clone()?;
        dup.seek(SeekFrom::Start(offset))?;
        self.decoder = Some(GzDecoder::new(BufReader::new(dup)));
        self.pos = offset;
        self.at_member_eof = false;
        Ok(())
    }

    /// Offset of the member currently being decoded (or about to be, if
    /// `member_start` has not yet been called).
    pub fn offset(&self) -> u64 {
        self.pos
    }

    /// Reads decompressed bytes from the current member only; returns `0`
    /// at member EOF without crossing into the next member.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| Error::internal("gzlog reader: no member started"))?;
        match decoder.read(buf) {
            Ok(0) => {
                self.at_member_eof = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(Error::corrupt(
                format!("truncated gzip member at offset {}", self.pos),
            )),
            Err(err) if err.kind() == io::ErrorKind::InvalidData => Err(Error::corrupt(format!(
                "invalid gzip member at offset {} - {err}",
                self.pos
            ))),
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Reads the whole current member to the end.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        let mut buf = [0u8; 65536];
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }

    pub fn member_eof(&self) -> bool {
        self.at_member_eof
    }

    /// Resets the reader to the start of the next member. If the member was
    /// not read to completion, the remainder is drained first so the
    /// underlying file position lands exactly on the next member's gzip
    /// header.
    pub fn member_end(&mut self) -> Result<(), Error> {
        if !self.at_member_eof {
            let mut buf = [0u8; 65536];
            while self.read(&mut buf)? != 0 {}
        }
        let decoder = self
            .decoder
            .take()
            .ok_or_else(|| Error::internal("gzlog reader: no member started"))?;
        let reader = decoder.into_inner();
        let buffered = reader.buffer().len() as u64;
        let dup = reader.into_inner();
        let absolute = dup.stream_position()?;
        self.pos = absolute - buffered;
        Ok(())
    }

    /// True if there is no further member to start (the file has been
    /// consumed up to its current length).
    pub fn eof(&mut self) -> Result<bool, Error> {
        let len = self.file.metadata()?.len();
        Ok(self.pos >= len)
    }
}

/// The write side of one chunk: a `GzEncoder` appended to the data file,
/// plus the running SHA-1 that covers the same raw (uncompressed) bytes.
/// Constructed by [`crate::append`] at chunk start, consumed at chunk end.
pub struct ChunkWriter {
    encoder: GzEncoder<File>,
    hasher: Sha1,
    wrote: u64,
}

impl ChunkWriter {
    /// Opens a new gzip member appended to `file`, which must already be
    /// positioned at EOF (the caller duplicates the session's fd for this,
    /// per spec §4.5 start step 3).
    pub fn start(file: File) -> Self {
        Self {
            encoder: GzEncoder::new(file, Compression::default()),
            hasher: Sha1::new(),
            wrote: 0,
        }
    }

    /// Writes `line` to the gzip stream and updates the running hash,
    /// looping over short writes. Optionally issues a full flush so that a
    /// crash after this call loses no earlier bytes (spec §4.5 append step 2).
    pub fn write_line(&mut self, line: &[u8], flush: bool) -> Result<(), Error> {
        self.hasher.update(line);
        if let Err(err) = self.encoder.write_all(line) {
            return Err(classify_gzip_error(err));
        }
        self.wrote += line.len() as u64;
        if flush {
            self.encoder.flush().map_err(|err| classify_gzip_error(err))?;
        }
        Ok(())
    }

    pub fn wrote(&self) -> u64 {
        self.wrote
    }

    /// Flushes and closes the gzip stream, returning the underlying file
    /// and the finalized SHA-1 of everything written.
    pub fn finish(self) -> Result<(File, [u8; 20], u64), Error> {
        let ChunkWriter { encoder, hasher, wrote } = self;
        let file = encoder.finish().map_err(classify_gzip_error)?;
        Ok((file, hasher.finish(), wrote))
    }
}

/// `flate2`'s public `Write` impl does not expose the underlying zlib
/// return code, so a stream-level failure (the spec's `Z_STREAM_ERROR` /
/// `Z_MEM_ERROR`) cannot be distinguished from an ordinary I/O error at this
/// layer with full fidelity. We treat any error whose kind is not a plain
/// I/O kind (i.e. zlib surfaced it via `ErrorKind::Other`/`InvalidInput`) as
/// the catastrophic case the spec says is fatal, and abort the process
/// rather than return a value callers might treat as recoverable.
fn classify_gzip_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::Other | io::ErrorKind::InvalidInput => {
            log::error!("fatal gzip stream error, compressed stream cannot be safely continued: {err}");
            std::process::abort();
        }
        _ => Error::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn reads_back_a_single_member() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)
                .unwrap();
            let writer = ChunkWriter::start(file);
            let mut writer = writer;
            writer.write_line(b"hello ", false).unwrap();
            writer.write_line(b"world\n", true).unwrap();
            let (mut file, _digest, wrote) = writer.finish().unwrap();
            assert_eq!(wrote, 12);
            file.flush().unwrap();
        }

        let file = std::fs::File::open(&path).unwrap();
        let mut reader = GzLogReader::open(file);
        reader.member_start().unwrap();
        let content = reader.read_to_end().unwrap();
        assert_eq!(content, b"hello world\n");
        assert!(reader.member_eof());
        reader.member_end().unwrap();
        assert!(reader.eof().unwrap());
    }

    #[test]
    fn seeks_to_the_second_member() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let first_end;
        {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&path)
                .unwrap();
            let mut writer = ChunkWriter::start(file);
            writer.write_line(b"first\n", true).unwrap();
            let (file, _d, _w) = writer.finish().unwrap();
            first_end = file.metadata().unwrap().len();

            let mut writer = ChunkWriter::start(file);
            writer.write_line(b"second\n", true).unwrap();
            writer.finish().unwrap();
        }

        let file = std::fs::File::open(&path).unwrap();
        let mut reader = GzLogReader::open(file);
        reader.member_start_from(first_end).unwrap();
        let content = reader.read_to_end().unwrap();
        assert_eq!(content, b"second\n");
    }
}
