use std::fmt::Display;

/// CaptureFile errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The handle was closed (or never opened) and cannot serve requests.
    NotOpen(String),
    /// Another handle already holds the capture file open for write.
    AlreadyOpen(String),
    /// A mutating operation was attempted on a read-only handle.
    NotOpenForWrite(String),
    /// Bad magic, unsupported version, or corruption that cannot be recovered
    /// from (for example both master nodes failing their CRC).
    InvalidCaptureFile(String),
    /// A record number outside 1..=record_count was requested.
    OutOfRange(String),
    /// A record or metadata payload exceeded the 2^32 - 1 byte limit.
    RecordTooLarge(u64),
    /// An IO error from the underlying file.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotOpen(msg) => write!(f, "not open: {msg}"),
            Error::AlreadyOpen(msg) => write!(f, "already open: {msg}"),
            Error::NotOpenForWrite(msg) => write!(f, "not open for write: {msg}"),
            Error::InvalidCaptureFile(msg) => write!(f, "invalid capture file: {msg}"),
            Error::OutOfRange(msg) => write!(f, "out of range: {msg}"),
            Error::RecordTooLarge(len) => {
                write!(f, "record of {len} bytes exceeds the 2^32 - 1 byte limit")
            }
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// A CaptureFile Result returning Error.
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
