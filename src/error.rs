use std::fmt::Display;
use std::io;

/// Errors surfaced by the storage core.
#[derive(Debug)]
pub enum Error {
    /// The key does not exist, or was shadowed by a deletion tombstone.
    NotFound,
    /// On-disk data failed validation: checksum mismatch, truncated record,
    /// bad varint or handle, wrong magic number.
    Corruption(String),
    /// A well-formed request the engine cannot serve, e.g. an unknown block
    /// compression type.
    NotSupported(String),
    /// Invalid caller input, e.g. swapping comparators mid-build.
    InvalidArgument(String),
    /// An IO error from the underlying file.
    Io(io::Error),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::NotSupported(msg) => write!(f, "not supported: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl Error {
    /// Clones the error for sticky-status bookkeeping. `io::Error` is not
    /// `Clone`, so its kind and message are preserved textually.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::NotFound => Error::NotFound,
            Error::Corruption(msg) => Error::Corruption(msg.clone()),
            Error::NotSupported(msg) => Error::NotSupported(msg.clone()),
            Error::InvalidArgument(msg) => Error::InvalidArgument(msg.clone()),
            Error::Io(err) => Error::Io(io::Error::new(err.kind(), err.to_string())),
        }
    }
}

/// Constructs an `Err(Error::Corruption)` for the given format string.
#[macro_export]
macro_rules! corruption {
    ($($args:tt)*) => {
        Err($crate::error::Error::Corruption(format!($($args)*)))
    };
}

/// A cinderdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
