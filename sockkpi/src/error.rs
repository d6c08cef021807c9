//! # Socket Error Taxonomy
//!
//! ## Purpose
//!
//! Every operation of the socket layer, and every entry point of a protocol handler, reports
//! failures through one shared set of error kinds. Callers match on the kind rather than on
//! protocol-private codes.
//!
//! ## How it works
//!
//! `SockError` is a plain enum. Each kind has a POSIX errno equivalent (taken from `libc`), so
//! errors can cross into the `std::io` world with `?` and come back out of it when a protocol
//! handler surfaces an `io::Error`.
//!
//! ## Main components
//!
//! - `SockError`: the error kinds.
//! - `SockResult<T>`: the result alias used throughout the crate.

use std::io;
use thiserror::Error;

/// Result alias used by every socket operation.
pub type SockResult<T> = Result<T, SockError>;

/// Error kinds shared by the socket layer and protocol handlers.
#[derive(Debug, Error)]
pub enum SockError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation would block")]
    WouldBlock,
    #[error("operation now in progress")]
    InProgress,
    #[error("operation already in progress")]
    AlreadyInProgress,
    #[error("socket is already connected")]
    AlreadyConnected,
    #[error("socket is not connected")]
    NotConnected,
    #[error("connection aborted")]
    ConnectionAborted,
    #[error("address not available")]
    AddressUnavailable,
    #[error("address already in use")]
    AddressInUse,
    #[error("address family not supported by socket domain")]
    AddressFamilyUnsupported,
    #[error("no buffer space available")]
    ResourceExhausted,
    #[error("interrupted")]
    Interrupted,
    #[error("operation timed out")]
    TimedOut,
    #[error("operation not supported")]
    Unsupported,
    #[error("permission denied")]
    PermissionDenied,
    #[error("broken pipe")]
    BrokenPipe,
    #[error("socket has been destroyed")]
    NotSocket,
    /// A protocol handler failure that has no generic kind.
    #[error("protocol error: {0}")]
    ProtocolError(#[source] io::Error),
    #[error("socket is defunct")]
    Defunct,
}

impl SockError {
    /// Returns the errno value for this kind.
    pub fn errno(&self) -> i32 {
        match self {
            SockError::InvalidArgument => libc::EINVAL,
            SockError::WouldBlock => libc::EWOULDBLOCK,
            SockError::InProgress => libc::EINPROGRESS,
            SockError::AlreadyInProgress => libc::EALREADY,
            SockError::AlreadyConnected => libc::EISCONN,
            SockError::NotConnected => libc::ENOTCONN,
            SockError::ConnectionAborted => libc::ECONNABORTED,
            SockError::AddressUnavailable => libc::EADDRNOTAVAIL,
            SockError::AddressInUse => libc::EADDRINUSE,
            SockError::AddressFamilyUnsupported => libc::EAFNOSUPPORT,
            SockError::ResourceExhausted => libc::ENOBUFS,
            SockError::Interrupted => libc::EINTR,
            SockError::TimedOut => libc::ETIMEDOUT,
            SockError::Unsupported => libc::EOPNOTSUPP,
            SockError::PermissionDenied => libc::EPERM,
            SockError::BrokenPipe => libc::EPIPE,
            SockError::NotSocket => libc::EBADF,
            SockError::ProtocolError(e) => e.raw_os_error().unwrap_or(libc::EPROTO),
            SockError::Defunct => libc::ENODEV,
        }
    }

    /// Maps an errno value back to a kind. Codes without a kind become `ProtocolError`.
    pub fn from_errno(code: i32) -> Self {
        match code {
            libc::EINVAL => SockError::InvalidArgument,
            libc::EWOULDBLOCK => SockError::WouldBlock,
            libc::EINPROGRESS => SockError::InProgress,
            libc::EALREADY => SockError::AlreadyInProgress,
            libc::EISCONN => SockError::AlreadyConnected,
            libc::ENOTCONN => SockError::NotConnected,
            libc::ECONNABORTED => SockError::ConnectionAborted,
            libc::EADDRNOTAVAIL => SockError::AddressUnavailable,
            libc::EADDRINUSE => SockError::AddressInUse,
            libc::EAFNOSUPPORT => SockError::AddressFamilyUnsupported,
            libc::ENOBUFS => SockError::ResourceExhausted,
            libc::EINTR => SockError::Interrupted,
            libc::ETIMEDOUT => SockError::TimedOut,
            libc::EOPNOTSUPP => SockError::Unsupported,
            libc::EPERM => SockError::PermissionDenied,
            libc::EPIPE => SockError::BrokenPipe,
            libc::EBADF => SockError::NotSocket,
            libc::ENODEV => SockError::Defunct,
            code => SockError::ProtocolError(io::Error::from_raw_os_error(code)),
        }
    }

    /// `true` for outcomes a caller may retry: `WouldBlock` and `Interrupted`.
    pub fn is_transient(&self) -> bool {
        matches!(self, SockError::WouldBlock | SockError::Interrupted)
    }
}

impl From<SockError> for io::Error {
    fn from(error: SockError) -> Self {
        match error {
            SockError::ProtocolError(e) => e,
            other => io::Error::from_raw_os_error(other.errno()),
        }
    }
}

impl From<io::Error> for SockError {
    fn from(error: io::Error) -> Self {
        if let Some(code) = error.raw_os_error() {
            return SockError::from_errno(code);
        }
        match error.kind() {
            io::ErrorKind::WouldBlock => SockError::WouldBlock,
            io::ErrorKind::Interrupted => SockError::Interrupted,
            io::ErrorKind::TimedOut => SockError::TimedOut,
            io::ErrorKind::PermissionDenied => SockError::PermissionDenied,
            io::ErrorKind::AddrInUse => SockError::AddressInUse,
            io::ErrorKind::AddrNotAvailable => SockError::AddressUnavailable,
            io::ErrorKind::BrokenPipe => SockError::BrokenPipe,
            io::ErrorKind::NotConnected => SockError::NotConnected,
            io::ErrorKind::ConnectionAborted => SockError::ConnectionAborted,
            io::ErrorKind::InvalidInput => SockError::InvalidArgument,
            io::ErrorKind::Unsupported => SockError::Unsupported,
            _ => SockError::ProtocolError(error),
        }
    }
}
