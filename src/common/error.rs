use serde_derive::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    Closed,
    Config(String),
    Corrupt(String),
    Eof,
    IndexFull,
    Internal(String),
    Io(String),
    OutOfRange(u64),
}

impl Error {
    /// Whether the error means "no record at this offset (yet)".
    ///
    /// A tailing reader should back off and retry on this rather than give up.
    pub fn is_out_of_range(&self) -> bool {
        matches!(self, Error::OutOfRange(_))
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> fmt::Result {
        match self {
            Error::Config(s) | Error::Internal(s) | Error::Io(s) => write!(f, "{}", s),
            Error::Corrupt(s) => write!(f, "Corrupt record: {}", s),
            Error::Closed => write!(f, "File is already closed"),
            Error::Eof => write!(f, "Read past the end of the index"),
            Error::IndexFull => write!(f, "Index capacity exhausted"),
            Error::OutOfRange(off) => write!(f, "Offset out of range: {}", off),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
