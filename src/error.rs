use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// Malformed log address or log file name.
    InvalidAddress(String),
    /// Unexpected page or record tag while loading a tree.
    StructureCorruption(String),
    /// A record header or checksum in the log is not well-formed.
    CorruptedLog(String),
    /// A commit raced with another writer. Transient, the caller retries.
    ConcurrencyConflict,
    /// A file could not be removed because something still holds it.
    ResourceBusy(String),
    InvalidInput(String),
    InvalidState(String),
    Encoding(String),
    MutexPoisoned,
    Locked(io::Error),
}

impl Error {
    /// Transient errors are absorbed by retry loops and never reach users.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::InvalidAddress(msg) => write!(f, "Invalid address: {}", msg),
            Error::StructureCorruption(msg) => write!(f, "Structure corruption: {}", msg),
            Error::CorruptedLog(msg) => write!(f, "Corrupted log: {}", msg),
            Error::ConcurrencyConflict => write!(f, "Transaction conflicts with a concurrent commit"),
            Error::ResourceBusy(msg) => write!(f, "Resource busy: {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::Encoding(msg) => write!(f, "Encoding error: {}", msg),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::Locked(err) => write!(f, "Environment is locked by another process: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) | Error::Locked(err) => Some(err),
            _ => None,
        }
    }
}
