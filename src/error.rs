use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    Open(PathBuf, io::Error),
    Decode(&'static str, io::Error),
    Encode(&'static str, io::Error),
    /// A decoded key or value exceeded the length declared for the job.
    SchemaViolation {
        kind: &'static str,
        len: usize,
        max: usize,
    },
    UnknownOperation(String),
    UnknownCodec(String),
    /// An in-memory key/group table grew past the configured budget.
    MemoryBudget { used: usize, limit: usize },
    /// Sorted group emission requires keys that pack into a u64.
    SortedKeyTooLong { len: usize },
    TraceMismatch(String),
    JoinMismatch(String),
    InvalidOperation(String),
    InvalidState(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Open(path, err) => write!(f, "Failed to open {}: {}", path.display(), err),
            Error::Decode(field, err) => write!(f, "Failed to decode {}: {}", field, err),
            Error::Encode(field, err) => write!(f, "Failed to encode {}: {}", field, err),
            Error::SchemaViolation { kind, len, max } => {
                write!(f, "{} of {} bytes exceeds declared maximum of {}", kind, len, max)
            }
            Error::UnknownOperation(name) => write!(f, "Unknown operation: {}", name),
            Error::UnknownCodec(name) => write!(f, "Unknown codec: {}", name),
            Error::MemoryBudget { used, limit } => {
                write!(f, "Table of {} bytes exceeds memory budget of {}", used, limit)
            }
            Error::SortedKeyTooLong { len } => {
                write!(f, "Key of {} bytes cannot be packed for sorted grouping", len)
            }
            Error::TraceMismatch(msg) => write!(f, "Trace mismatch: {}", msg),
            Error::JoinMismatch(msg) => write!(f, "Join mismatch: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
