use std::io;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Host unreachable: {0}")]
    HostUnreachable(String),

    #[error("Name resolution failed: {0}")]
    NameResolutionFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Invalid connection descriptor: {0}")]
    InvalidDescriptor(String),

    /// The transport was dropped by the server. Clients retry once on this
    /// before surfacing anything.
    #[error("Session expired")]
    SessionExpired,

    #[error("Unknown error: {0}")]
    UnknownError(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }

    #[must_use]
    pub fn surfaced(self) -> Self {
        match self {
            Self::SessionExpired => Self::ProtocolError("session expired after reconnect".into()),
            other => other,
        }
    }

    pub fn into_io(self) -> io::Error {
        let kind = match &self {
            Self::NotFound(_) => io::ErrorKind::NotFound,
            Self::AlreadyExists(_) => io::ErrorKind::AlreadyExists,
            Self::PermissionDenied(_) | Self::AuthenticationFailed => io::ErrorKind::PermissionDenied,
            Self::Timeout => io::ErrorKind::TimedOut,
            Self::Cancelled => io::ErrorKind::Interrupted,
            Self::HostUnreachable(_) => io::ErrorKind::ConnectionRefused,
            Self::SessionExpired => io::ErrorKind::ConnectionAborted,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        // Errors that already carry a StorageError round-trip unchanged.
        if err.get_ref().is_some_and(|inner| inner.is::<StorageError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(storage) = inner.downcast::<StorageError>() {
                    return *storage;
                }
            }
            return Self::IoError("stream failed".into());
        }

        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            io::ErrorKind::AlreadyExists => Self::AlreadyExists(err.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::ConnectionRefused => Self::HostUnreachable(err.to_string()),
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => Self::SessionExpired,
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Self::Cancelled
        } else {
            Self::UnknownError(format!("worker task panicked: {err}"))
        }
    }
}

impl From<tokio::time::error::Elapsed> for StorageError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}
