use std::fmt::Display;

/// KilnDB errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// CRC-32 mismatch on a segment or index record.
    Checksum(String),
    /// A malformed fixed-width field, kind byte, or value payload.
    Codec(String),
    /// Invalid option at construction time.
    Config(String),
    /// The entry exists but its expiry has elapsed; the index entry is
    /// evicted as a side effect.
    Expired(String),
    /// Invalid user input, typically a type-mismatched value operation.
    InvalidInput(String),
    /// A lease-lock release or renewal presented the wrong token.
    InvalidToken,
    /// An IO error.
    Io(String),
    /// A lease lock is already held for the requested name, or the
    /// store directory is held by another process.
    Locked(String),
    /// No inode exists for a key, or a referenced region is gone.
    NotFound(String),
    /// The mvcc counter saturated at u64::MAX.
    Overflow,
    /// Decryption or decompression failure, or reading transformed data
    /// with a mismatched pipeline configuration.
    Pipeline(String),
    /// Premature EOF, or size fields pointing past the end of a file.
    Truncated(String),
    /// A compare-and-swap update lost to a concurrent writer.
    VersionConflict,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Checksum(msg) => write!(f, "checksum mismatch: {msg}"),
            Error::Codec(msg) => write!(f, "codec error: {msg}"),
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::Expired(msg) => write!(f, "entry expired: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::InvalidToken => write!(f, "invalid lock token"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Locked(msg) => write!(f, "resource already locked: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::Overflow => write!(f, "mvcc version counter overflow"),
            Error::Pipeline(msg) => write!(f, "pipeline error: {msg}"),
            Error::Truncated(msg) => write!(f, "truncated data: {msg}"),
            Error::VersionConflict => write!(f, "version conflict, retry update"),
        }
    }
}

/// A KilnDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Truncated(err.to_string())
        } else {
            Error::Io(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}
