use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// ReefDB errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid on-disk data: checksum mismatch, bad footer, unreadable
    /// manifest. Corruption during manifest replay is fatal to open.
    Corruption(String),
    /// Invalid user input: bad score, bad index, empty keys list.
    InvalidArgument(String),
    /// An IO error from the underlying filesystem.
    Io(String),
    /// The requested feature is not supported.
    NotSupported(String),
    /// A write was attempted on a read-only structure (frozen memtable,
    /// finished table builder).
    ReadOnly,
    /// A sorted-set score was NaN, or an increment produced NaN.
    ScoreNan,
    /// The database is shutting down and no longer accepts work.
    Shutdown,
    /// A Redis operation addressed a key that holds a different type.
    TypeMismatch(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::ScoreNan => write!(f, "score is not a number"),
            Error::Shutdown => write!(f, "database is shutting down"),
            Error::TypeMismatch(msg) => write!(f, "wrong type: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidArgument for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)).into() };
}

/// A ReefDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

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
