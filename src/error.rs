use std::path::PathBuf;

/// Errors returned by the store. Every fallible operation in this crate
/// returns one of these variants instead of panicking.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An underlying filesystem operation failed.
    #[error("{op} {path}: {source}")]
    Io { op: &'static str, path: PathBuf, #[source] source: std::io::Error },

    /// The directory is already locked by another store instance.
    #[error("{path}: already open by another instance")]
    AlreadyOpen { path: PathBuf },

    /// The store path exists but is not a directory.
    #[error("{path}: not a directory")]
    NotADirectory { path: PathBuf },

    /// A data file's name does not match the expected `bc<16 hex>.d` pattern.
    #[error("{path}: not a valid data file name")]
    BadFilename { path: PathBuf },

    /// A key exceeded `MAX_KSZ` bytes.
    #[error("key length {len} exceeds limit of {max}")]
    KeyTooLong { len: u64, max: u64 },

    /// A value exceeded `MAX_VSZ` bytes.
    #[error("value length {len} exceeds limit of {max}")]
    ValueTooLong { len: u64, max: u64 },

    /// A record's CRC did not match its contents while scanning.
    #[error("{path}: CRC mismatch in record at offset {offset}")]
    CorruptRecord { path: PathBuf, offset: u64 },

    /// The key index referenced a file id that is not open. Indicates a bug
    /// or external tampering with the store directory.
    #[error("{path}: index references unknown file id {file_id:#018x}")]
    DanglingReference { path: PathBuf, file_id: u64 },

    /// A record's header or body was truncated partway through, distinct
    /// from a clean end-of-file.
    #[error("{path}: unexpected end of file at offset {offset}")]
    UnexpectedEof { path: PathBuf, offset: u64 },
}

impl Error {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Error {
        Error::Io { op, path: path.into(), source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
