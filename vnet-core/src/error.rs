//! Error taxonomy for the engine and its socket layer.
//!
//! Every fallible call returns its own [`Error`]. Socket failures carry an
//! [`ErrorCode`] so callers can tell transient conditions (`WouldBlock`,
//! `InProgress`, `Already`) from terminal ones without consulting any shared
//! state.

use std::fmt;

use crate::storage::StorageError;

/// Low-level socket condition carried by [`Error::Socket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Non-blocking call could not complete immediately.
    WouldBlock,
    /// Non-blocking connect has started and is still in progress.
    InProgress,
    /// A connect is already pending on this handle.
    Already,
    ConnectionReset,
    ConnectionRefused,
    /// The operation was aborted locally, e.g. the handle was closed while a
    /// call was blocked on it.
    ConnectionAborted,
    TimedOut,
    /// The handle is closed or was never opened.
    InvalidHandle,
    InvalidArgument,
    AddressInUse,
    AddressNotAvailable,
    NotConnected,
    IsConnected,
    NotListening,
    HostUnreachable,
    NetworkUnreachable,
    /// The virtual network this socket lived on was left.
    NetworkLeft,
    /// Write side has been shut down.
    Shutdown,
    MessageTooLong,
}

impl ErrorCode {
    /// Whether a caller may retry the same operation later.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::WouldBlock | Self::InProgress | Self::Already)
    }

    /// errno-style numeric value (Linux numbering).
    pub fn raw(self) -> i32 {
        match self {
            Self::WouldBlock => 11,
            Self::InProgress => 115,
            Self::Already => 114,
            Self::ConnectionReset => 104,
            Self::ConnectionRefused => 111,
            Self::ConnectionAborted => 103,
            Self::TimedOut => 110,
            Self::InvalidHandle => 9,
            Self::InvalidArgument => 22,
            Self::AddressInUse => 98,
            Self::AddressNotAvailable => 99,
            Self::NotConnected => 107,
            Self::IsConnected => 106,
            Self::NotListening => 22,
            Self::HostUnreachable => 113,
            Self::NetworkUnreachable => 101,
            Self::NetworkLeft => 100,
            Self::Shutdown => 32,
            Self::MessageTooLong => 90,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::WouldBlock => "operation would block",
            Self::InProgress => "operation in progress",
            Self::Already => "operation already in progress",
            Self::ConnectionReset => "connection reset by peer",
            Self::ConnectionRefused => "connection refused",
            Self::ConnectionAborted => "connection aborted",
            Self::TimedOut => "timed out",
            Self::InvalidHandle => "invalid socket handle",
            Self::InvalidArgument => "invalid argument",
            Self::AddressInUse => "address in use",
            Self::AddressNotAvailable => "address not available",
            Self::NotConnected => "socket is not connected",
            Self::IsConnected => "socket is already connected",
            Self::NotListening => "socket is not listening",
            Self::HostUnreachable => "host unreachable",
            Self::NetworkUnreachable => "network unreachable",
            Self::NetworkLeft => "network left",
            Self::Shutdown => "socket is shut down for writing",
            Self::MessageTooLong => "message too long",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the engine refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceFault {
    /// `stop` was called; the node is permanently torn down.
    Stopped,
    /// The network transport needed by the call is not ready yet.
    NotReady,
}

impl fmt::Display for ServiceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("node is stopped"),
            Self::NotReady => f.write_str("network transport not ready"),
        }
    }
}

/// Engine errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket error: {0}")]
    Socket(ErrorCode),

    #[error("service error: {0}")]
    Service(ServiceFault),

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("{0}")]
    General(String),
}

impl Error {
    pub(crate) fn argument(msg: impl Into<String>) -> Self {
        Self::Argument(msg.into())
    }

    /// The low-level socket code, if this is a socket error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Socket(code) => Some(*code),
            _ => None,
        }
    }

    /// Best low-level code describing this error, for `connect_ex`-style
    /// callers that want a single number.
    pub fn low_level_code(&self) -> ErrorCode {
        match self {
            Self::Socket(code) => *code,
            Self::Service(ServiceFault::NotReady) => ErrorCode::NetworkUnreachable,
            Self::Service(ServiceFault::Stopped) => ErrorCode::ConnectionAborted,
            Self::Argument(_) => ErrorCode::InvalidArgument,
            Self::Storage(_) | Self::General(_) => ErrorCode::ConnectionAborted,
        }
    }

    /// Whether the same call may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Socket(code) => code.is_transient(),
            Self::Service(fault) => *fault == ServiceFault::NotReady,
            _ => false,
        }
    }

    pub fn is_invalid_handle(&self) -> bool {
        matches!(self, Self::Socket(ErrorCode::InvalidHandle))
    }
}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Self::Socket(code)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
