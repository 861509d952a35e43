use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Error kinds surfaced at the HTTP engine / session controller boundary.
///
/// The engine itself never propagates a bare `io::Error` past a connection
/// task boundary; every I/O failure is classified into one of these before
/// the task logs it and tears the connection down (see the error handling
/// design notes).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient I/O failure")]
    TransientIo(#[source] io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("no mock matched and no bypass rule applied")]
    MatchNotFound,

    #[error("promote lost the race, restart the match loop")]
    StoreConflict,

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Classifies an I/O error as transient (expected peer disconnect) or a
    /// hard failure, by walking the error's source chain.
    ///
    /// Keep-alive peers routinely close the socket without warning; treating
    /// every `ConnectionReset`/`UnexpectedEof` as a loud failure would drown
    /// real problems in noise.
    pub fn from_io(error: io::Error) -> Self {
        EngineError::TransientIo(error)
    }

    pub fn is_expected_disconnect(&self) -> bool {
        match self {
            EngineError::TransientIo(error) => is_expected_disconnect(error),
            _ => false,
        }
    }
}

fn is_expected_disconnect(error: &io::Error) -> bool {
    fn walk(error: &(dyn StdError + 'static)) -> bool {
        if let Some(io_error) = error.downcast_ref::<io::Error>() {
            if matches!(
                io_error.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionAborted
            ) {
                return true;
            }
        }

        error.source().is_some_and(walk)
    }

    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionAborted
    ) || error.source().is_some_and(walk)
}

/// Error kinds at the connection tracker boundary (C1).
///
/// Both variants resolve to the same effect downstream (drop the record,
/// log at debug); they are split only so the log line names the actual
/// cause.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("per-direction buffer exceeded its cap")]
    BufferOverflow,

    #[error("kernel-reported byte count does not match bytes delivered to user space")]
    ByteCountMismatch,
}
