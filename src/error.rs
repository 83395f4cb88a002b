//! Crate-wide error type.
//!
//! Every subsystem has its own narrow error enum (URL parsing, disks, the
//! guest wire protocol) which converts into [`Error`] at the module
//! boundary. `Error` carries one variant per failure kind the control plane
//! distinguishes, so HTTP handlers and the VIX dispatcher can map kinds to
//! their own codes without string matching.

use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Path, image, store, container or session id absent.
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A task submitted to the virtualization fabric failed.
    #[error("fabric task failed: {0}")]
    Fabric(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Wrap an I/O error, keeping `NotFound` and `AlreadyExists` as their
    /// own kinds so callers can branch on them.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        let context = context.into();
        match source.kind() {
            io::ErrorKind::NotFound => Error::NotFound(context),
            io::ErrorKind::AlreadyExists => Error::AlreadyExists(context),
            io::ErrorKind::PermissionDenied => Error::PermissionDenied(context),
            _ => Error::Io { context, source },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
    }

    /// HTTP status code for the control-plane API.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::AlreadyExists(_) => 409,
            Error::InvalidArgument(_) => 400,
            Error::Fabric(_) => 503,
            _ => 500,
        }
    }

    /// `VIX_E_*` code reported to guest-operations clients.
    pub fn vix_error(&self) -> u32 {
        use crate::toolbox::vix::rc;

        match self {
            Error::NotFound(_) => rc::FILE_NOT_FOUND,
            Error::AlreadyExists(_) => rc::FILE_ALREADY_EXISTS,
            Error::InvalidArgument(_) => rc::INVALID_ARG,
            Error::PermissionDenied(_) => rc::FILE_ACCESS_ERROR,
            Error::Unsupported(_) => rc::NOT_SUPPORTED,
            _ => rc::FAIL,
        }
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::io("i/o error", source)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_their_kind() {
        let err = Error::io("stat foo", io::Error::from(io::ErrorKind::NotFound));
        assert!(err.is_not_found(), "expected NotFound, got: {err:?}");

        let err = Error::io("mkdir foo", io::Error::from(io::ErrorKind::AlreadyExists));
        assert!(err.is_already_exists(), "expected AlreadyExists, got: {err:?}");

        let err = Error::io("read foo", io::Error::other("disk on fire"));
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(err.to_string(), "read foo: disk on fire");
    }

    #[test]
    fn status_codes_follow_the_api_contract() {
        assert_eq!(Error::NotFound("x".into()).status_code(), 404);
        assert_eq!(Error::AlreadyExists("x".into()).status_code(), 409);
        assert_eq!(Error::InvalidArgument("x".into()).status_code(), 400);
        assert_eq!(Error::Fabric("x".into()).status_code(), 503);
        assert_eq!(Error::Cancelled.status_code(), 500);
    }

    #[test]
    fn vix_codes_follow_error_kind() {
        assert_eq!(Error::NotFound("x".into()).vix_error(), 4);
        assert_eq!(Error::AlreadyExists("x".into()).vix_error(), 12);
        assert_eq!(Error::Fabric("x".into()).vix_error(), 1);
    }
}
