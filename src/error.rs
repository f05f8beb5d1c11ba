//! Error type shared by the codec, the client and the server.

use std::io;

/// Crate-wide error.
///
/// The `Display` text of a server-side error is what travels back to the
/// requester inside an error response.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("short buffer")]
    ShortBuffer,
    #[error("invalid utf8")]
    InvalidUtf8,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("unexpected message type {got}, expected {expected}")]
    UnexpectedType { got: u8, expected: u8 },
    #[error("string of {0} bytes does not fit a frame")]
    StringTooLong(usize),
    #[error("frame of {size} bytes exceeds negotiated maximum {limit}")]
    FrameTooLarge { size: usize, limit: u32 },
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("tag {0} already in flight")]
    DuplicateTag(u16),
    #[error("no free tags")]
    TagsExhausted,
    #[error("unknown descriptor {0}")]
    InvalidDescriptor(u32),
    #[error("descriptor {0} already in use")]
    DescriptorInUse(u32),
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("file exists: {0}")]
    Exists(String),
    #[error("not a directory")]
    NotADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("cannot write to a directory")]
    WriteToDirectory,
    #[error("{0} not supported")]
    NotSupported(&'static str),
    #[error("session not attached")]
    NotAttached,
    #[error("version not negotiated")]
    NotVersioned,
    #[error("descriptor already open")]
    AlreadyOpen,
    #[error("descriptor not open for {0}")]
    WrongMode(&'static str),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("unknown namespace {0:?}")]
    UnknownNamespace(String),
    #[error("length {0} exceeds the largest file")]
    FileTooLarge(u64),
    #[error("invalid resource")]
    InvalidResource,
    #[error("rpc: {0}")]
    Rpc(String),
    #[error("{0}")]
    Remote(String),
    #[error("connection reset: {0}")]
    ConnectionReset(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the error tears down the connection it occurred on.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ConnectionReset(_))
    }

    /// Whether the error came from the codec.
    pub fn is_decode(&self) -> bool {
        matches!(
            self,
            Error::ShortBuffer
                | Error::InvalidUtf8
                | Error::UnknownType(_)
                | Error::UnexpectedType { .. }
                | Error::StringTooLong(_)
                | Error::Malformed(_)
        )
    }

    /// Whether a lookup failed because the name does not exist, locally or
    /// as reported by the server.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Remote(msg) => msg.starts_with("file not found"),
            _ => false,
        }
    }

    /// Copy of the error suitable for fanning out to several waiters.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::ConnectionReset(msg) => Error::ConnectionReset(msg.clone()),
            Error::Remote(msg) => Error::Remote(msg.clone()),
            other => Error::ConnectionReset(other.to_string()),
        }
    }
}
