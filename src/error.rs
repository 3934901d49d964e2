use std::fmt::Display;

/// emberdb errors.
#[derive(Debug)]
pub enum Error {
    /// The key does not exist after all tiers (memtables, index) were consulted.
    KeyNotFound,
    /// Another process holds the directory lock.
    DatabaseIsUsing,
    /// The configured database directory path is empty.
    DirectoryIsEmpty,
    /// The flush pipeline could not free memtable space within the configured timeout.
    WaitMemtableSpaceTimeout,
    /// The database has been closed; no further operations are allowed.
    DatabaseClosed,
    /// The batch has already been committed.
    BatchCommitted,
    /// The batch has already been rolled back.
    BatchRolledBack,
    /// A write operation was attempted on a read-only batch.
    ReadOnlyBatch,
    /// A single entry is larger than the memtable can ever hold.
    ValueTooBig,
    /// An IO error from the filesystem or a collaborator.
    Io(String),
    /// On-disk data failed checksum or framing validation.
    Corruption(String),
    /// Invalid data, typically decoding errors or unexpected internal values.
    InvalidData(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::KeyNotFound => write!(f, "key not found in database"),
            Error::DatabaseIsUsing => write!(f, "the database directory is used by another process"),
            Error::DirectoryIsEmpty => write!(f, "database directory path is empty"),
            Error::WaitMemtableSpaceTimeout => {
                write!(f, "timed out waiting for memtable space, try again later")
            }
            Error::DatabaseClosed => write!(f, "the database is closed"),
            Error::BatchCommitted => write!(f, "the batch has been committed"),
            Error::BatchRolledBack => write!(f, "the batch has been rolled back"),
            Error::ReadOnlyBatch => write!(f, "write attempted on a read-only batch"),
            Error::ValueTooBig => write!(f, "value is too big to fit into the memtable"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption detected: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
        }
    }
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}
