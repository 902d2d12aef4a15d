use std::fmt;

/// Error kinds surfaced by this crate's public API.
///
/// Propagation policy follows the spec: `MappedWindow`/`frame` never retry
/// and always surface failures to the caller; `Publisher::open` treats
/// segment and semaphore construction failures as fatal; destructor paths
/// log and swallow unmap/close errors instead of returning them.
#[derive(Debug)]
pub enum Error {
    NotFound,
    Empty,
    PermissionDenied,
    AlreadyOpen,
    InvalidArgument(&'static str),
    MmapFailed(std::io::Error),
    IoFailed(std::io::Error),
    MalformedFrame,
    QueueGone,
    Exhausted,
    Timeout,
    Corrupt(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::Empty => write!(f, "empty"),
            Error::PermissionDenied => write!(f, "permission denied"),
            Error::AlreadyOpen => write!(f, "queue already has an active publisher"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::MmapFailed(err) => write!(f, "mmap failed: {err}"),
            Error::IoFailed(err) => write!(f, "io failed: {err}"),
            Error::MalformedFrame => write!(f, "malformed frame"),
            Error::QueueGone => write!(f, "queue gone"),
            Error::Exhausted => write!(f, "window exhausted"),
            Error::Timeout => write!(f, "timed out"),
            Error::Corrupt(msg) => write!(f, "corrupt: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::MmapFailed(err) | Error::IoFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound,
            std::io::ErrorKind::PermissionDenied => Error::PermissionDenied,
            _ => Error::IoFailed(value),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
