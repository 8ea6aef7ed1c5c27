//! The single-writer guarantee (spec §5): an exclusive, blocking POSIX
//! advisory lock on the data file.
//!
//! `pbs-datastore::process_locker` layers a richer shared/exclusive lock
//! with in-process bookkeeping on top of `fcntl` record locks, because it
//! needs to track many in-process readers. This core only ever has one
//! writer per process and the spec calls for the simpler `flock(2)`
//! exclusive lock, so we call `nix::fcntl::flock` directly. A `flock` lock
//! belongs to the open file description, not to any particular `fd` value,
//! so it is released automatically when every descriptor referring to it
//! is closed - pairing the lock with the fd (spec §9) falls out of that for
//! free, without a separate guard object tied to the `File`'s lifetime.

use std::fs::File;
use std::os::unix::io::AsRawFd;

use cbs_types::Error;
use nix::fcntl::{flock, FlockArg};

/// Blocks until an exclusive lock on `file` is acquired.
pub fn acquire_exclusive(file: &File) -> Result<(), Error> {
    flock(file.as_raw_fd(), FlockArg::LockExclusive).map_err(|err| Error::Io(err.into()))
}

/// Releases the lock early, ahead of closing the fd (spec §4.4 `close`:
/// "release the lock; close the fd" as two explicit steps).
pub fn release(file: &File) -> Result<(), Error> {
    flock(file.as_raw_fd(), FlockArg::Unlock).map_err(|err| Error::Io(err.into()))
}
