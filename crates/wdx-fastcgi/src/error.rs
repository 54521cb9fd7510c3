//! Errors of the FastCGI request/response machinery.

use std::io;

use thiserror::Error;

/// Protocol and phase-machine errors.
#[derive(Debug, Error)]
pub enum FcgiError {
    /// I/O failure on the connection.
    #[error("i/o failure on the FastCGI connection: {0}")]
    Io(#[from] io::Error),
    /// The peer speaks a protocol version other than 1.
    #[error("unsupported FastCGI protocol version {0}")]
    UnsupportedVersion(u8),
    /// A record type outside the known range.
    #[error("unknown FastCGI record type {0}")]
    UnknownRecordType(u8),
    /// A record that has no place in the accept handshake.
    #[error("unexpected {0} record during the accept handshake")]
    UnexpectedRecord(&'static str),
    /// The connection closed in the middle of a record.
    #[error("connection closed in the middle of a record")]
    UnexpectedEof,
    /// A name-value pair extends past the end of the parameter stream.
    #[error("truncated name-value pair in the parameter stream")]
    TruncatedPairs,
    /// The accumulated parameter stream exceeds the sanity bound.
    #[error("parameter stream exceeds the size bound")]
    OversizedParams,
    /// The operation is illegal in the request's current phase.
    #[error("request is in the wrong phase for {operation}")]
    Phase {
        /// The operation that was attempted.
        operation: &'static str,
    },
    /// The body stream was already handed out once.
    #[error("cannot get the content stream more than once")]
    ContentConsumed,
    /// `finish` on an already finished request.
    #[error("request already finished")]
    AlreadyFinished,
}
