//! Error types for mp4frag-media.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for mp4frag-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mp4frag-media operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// A stream or track has no more samples.
    #[error("end of stream")]
    EndOfStream,

    /// An index or position lies outside the valid range.
    #[error("out of range")]
    OutOfRange,

    /// Malformed box structure or payload.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// The caller-supplied output buffer is too small.
    #[error("buffer too small: {required} bytes required")]
    BufferTooSmall { required: usize },

    /// Unsupported feature, codec or box layout.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// An input or output file could not be opened.
    #[error("cannot open file {path:?}: {source}")]
    CannotOpenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A referenced item (track, box) does not exist.
    #[error("no such item: {0}")]
    NoSuchItem(String),

    /// An operation was attempted in the wrong state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The interleaving buffer is full.
    #[error("not enough space in sample buffer")]
    NotEnoughSpace,

    /// Invalid arguments passed to an operation.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// A progress listener asked to stop.
    #[error("processing cancelled")]
    Cancelled,
}

/// Fieldless discriminant of [`Error`], handy for matching in callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    EndOfStream,
    OutOfRange,
    InvalidFormat,
    BufferTooSmall,
    NotSupported,
    CannotOpenFile,
    NoSuchItem,
    InvalidState,
    NotEnoughSpace,
    InvalidParameters,
    Cancelled,
}

impl Error {
    /// Create an invalid format error.
    pub fn invalid_format(msg: impl Into<String>) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a not supported error.
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an invalid parameters error.
    pub fn invalid_parameters(msg: impl Into<String>) -> Self {
        Self::InvalidParameters(msg.into())
    }

    /// Get the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::EndOfStream => ErrorKind::EndOfStream,
            Self::OutOfRange => ErrorKind::OutOfRange,
            Self::InvalidFormat(_) => ErrorKind::InvalidFormat,
            Self::BufferTooSmall { .. } => ErrorKind::BufferTooSmall,
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::CannotOpenFile { .. } => ErrorKind::CannotOpenFile,
            Self::NoSuchItem(_) => ErrorKind::NoSuchItem,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::NotEnoughSpace => ErrorKind::NotEnoughSpace,
            Self::InvalidParameters(_) => ErrorKind::InvalidParameters,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::InvalidFormat(format!("truncated data: {err}"))
        } else {
            Self::Io(err)
        }
    }
}
