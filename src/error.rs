use std::fmt;
use std::io;

/// Closed set of failure categories a [`crate::Journal`] operation can report.
///
/// Mirrors the error taxonomy of the on-disk protocol: most variants name the
/// file (index vs. data vs. metastore) and the operation (open/seek/read/write)
/// that failed, so callers can tell a transient I/O error from structural
/// corruption without downcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    IllegalInit,
    IllegalOpen,
    IllegalWrite,
    IllegalCheckpoint,
    Open,
    NotADirectory,
    PathTooLong,
    AlreadyExists,
    Mkdir,
    CreateMeta,
    Lock,
    IndexOpen,
    IndexSeek,
    IndexRead,
    IndexWrite,
    IndexCorrupt,
    FileOpen,
    FileSeek,
    FileRead,
    FileWrite,
    FileCorrupt,
    MetaOpen,
    InvalidSubscriber,
    SubscriberExists,
    IllegalLogId,
    Checkpoint,
    NotSupported,
    /// Pseudo-error: the marker read back is the closed-index sentinel, not a
    /// real record. Not a failure on its own — callers are expected to stop
    /// reading the segment.
    CloseLogId,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::IllegalInit => "illegal init",
            ErrorKind::IllegalOpen => "illegal open",
            ErrorKind::IllegalWrite => "illegal write",
            ErrorKind::IllegalCheckpoint => "illegal checkpoint",
            ErrorKind::Open => "open failed",
            ErrorKind::NotADirectory => "not a directory",
            ErrorKind::PathTooLong => "path too long",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Mkdir => "mkdir failed",
            ErrorKind::CreateMeta => "create metastore failed",
            ErrorKind::Lock => "lock failed",
            ErrorKind::IndexOpen => "index open failed",
            ErrorKind::IndexSeek => "index seek failed",
            ErrorKind::IndexRead => "index read failed",
            ErrorKind::IndexWrite => "index write failed",
            ErrorKind::IndexCorrupt => "index corrupt",
            ErrorKind::FileOpen => "data file open failed",
            ErrorKind::FileSeek => "data file seek failed",
            ErrorKind::FileRead => "data file read failed",
            ErrorKind::FileWrite => "data file write failed",
            ErrorKind::FileCorrupt => "data file corrupt",
            ErrorKind::MetaOpen => "metastore open failed",
            ErrorKind::InvalidSubscriber => "invalid subscriber",
            ErrorKind::SubscriberExists => "subscriber exists",
            ErrorKind::IllegalLogId => "illegal log id",
            ErrorKind::Checkpoint => "checkpoint error",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::CloseLogId => "read past closed segment",
        }
    }
}

/// Last-error-code-plus-last-errno, as a normal Rust error type instead of a
/// sentinel-and-global-state pair.
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
    pub detail: Option<String>,
    source: Option<io::Error>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            detail: None,
            source: None,
        }
    }

    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: Some(detail.into()),
            source: None,
        }
    }

    pub fn from_io(kind: ErrorKind, source: io::Error) -> Self {
        Self {
            kind,
            detail: None,
            source: Some(source),
        }
    }

    /// The OS errno captured at the point of failure, if this error wraps an
    /// I/O error.
    pub fn errno(&self) -> Option<i32> {
        self.source.as_ref().and_then(io::Error::raw_os_error)
    }

    /// An owned copy for the "last error" cache a [`crate::Journal`] keeps
    /// alongside each call's own `Result`. `io::Error` isn't `Clone`, so this
    /// rebuilds the source from its errno rather than cloning it directly.
    pub fn snapshot(&self) -> Error {
        Error {
            kind: self.kind,
            detail: self.detail.clone(),
            source: self.errno().map(io::Error::from_raw_os_error),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        if let Some(source) = &self.source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
