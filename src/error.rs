//! Crate-wide error type and the exit-code mapping used by the CLI.
//!
//! Store and Policy Index raise their own narrower `thiserror` types;
//! this is the widened type the Control API and CLI actually see.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("already active: {0}")]
    AlreadyActive(String),

    #[error("not active: {0}")]
    NotActive(String),

    #[error("duplicate exception: {0}")]
    DuplicateException(String),

    #[error("exception not found: {0}")]
    ExceptionNotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("shutdown")]
    Shutdown,
}

impl Error {
    /// Exit code surfaced by the CLI's command dispatch.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::BadRequest(_) => 2,
            Error::NotActive(_) | Error::ExceptionNotFound(_) => 3,
            Error::AlreadyActive(_) | Error::DuplicateException(_) => 4,
            Error::Storage(_) => 5,
            Error::Transport(_) | Error::Shutdown => 1,
        }
    }
}

impl From<crate::store::StoreError> for Error {
    fn from(e: crate::store::StoreError) -> Self {
        use crate::store::StoreError as S;
        match e {
            S::AlreadyActive(msg) => Error::AlreadyActive(msg),
            // A session that isn't active is "not found" from the operator's
            // perspective whether the caller named a channel (end_session) or
            // a session id (add_exception on an ended session).
            S::NotActive(msg) | S::SessionNotActive(msg) => Error::NotActive(msg),
            S::DuplicateException(msg) => Error::DuplicateException(msg),
            S::ExceptionNotFound(msg) => Error::ExceptionNotFound(msg),
            S::Storage(msg) => Error::Storage(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
