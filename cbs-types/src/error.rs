use std::path::PathBuf;

/// Error kinds surfaced by the backup core (spec §7).
///
/// Library code returns this type directly; binaries and higher-level
/// orchestration (out of scope here) are free to wrap it in `anyhow::Error`
/// the way the teacher workspace's server code wraps `pbs-datastore`
/// errors at the API boundary.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File open/read/write/lock/rename/stat failures.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum mismatch on open, or a truncated/invalid gzip member.
    #[error("corrupt backup store: {0}")]
    Corrupt(String),

    /// Non-empty data file with a missing or empty index.
    #[error("index missing or empty for data file {0:?}, reindex required")]
    ReindexRequired(PathBuf),

    /// The command parser rejected a line, or reindex saw a timestamp go backwards.
    #[error("data error: {0}")]
    DataErr(String),

    /// Required configuration missing or unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// A unique-key violation inside an append that is not the documented no-op case.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Index store failure that should not occur in a correctly functioning system.
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corrupt(msg.into())
    }

    pub fn data_err(msg: impl Into<String>) -> Self {
        Error::DataErr(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Error::Conflict(msg.into())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Internal(format!("index store failure - {err}"))
    }
}
