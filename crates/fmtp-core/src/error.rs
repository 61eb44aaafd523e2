use std::io;

use thiserror::Error;

use crate::{FmtpIdentifier, FmtpType};

/// Errors produced by the FMTP protocol engine.
///
/// Framing errors and transport failures are fatal to the connection they
/// occur on, see [`Error::is_fatal`]. Deadline errors are kept distinct from
/// protocol errors so callers can tell "peer rejected" from "gave up waiting".
#[derive(Debug, Error)]
pub enum Error {
    /// The 5 byte header could not be decoded.
    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    /// A body exceeds the maximum the header length field can express.
    #[error("body of {size} bytes exceeds the maximum of {max} bytes")]
    BodyTooLarge {
        /// Size of the offending body (a lower bound for unsized readers)
        size: usize,
        /// Maximum allowed body size
        max: usize,
    },

    /// The stream ended before the body announced by the header was read.
    #[error("truncated body: expected {expected} bytes, got {got}")]
    TruncatedBody {
        /// Body length announced by the header
        expected: usize,
        /// Bytes actually available
        got: usize,
    },

    /// The stream ended in the middle of a header.
    #[error("unexpected end of stream after {got} header bytes")]
    UnexpectedEof {
        /// Header bytes read before the stream ended
        got: usize,
    },

    /// An identifier does not satisfy the FMTP identifier rules.
    #[error("invalid FMTP identifier: {0}")]
    InvalidIdentifier(&'static str),

    /// An ID Request body is not `<sender>-<receiver>`.
    #[error("malformed identification request")]
    MalformedIdRequest,

    /// An ID Response body is neither `ACCEPT` nor `REJECT`.
    #[error("malformed identification response")]
    MalformedIdResponse,

    /// A system message body is not exactly 2 bytes.
    #[error("malformed system signal of {len} bytes")]
    MalformedSystemSignal {
        /// Length of the received body
        len: usize,
    },

    /// The header carries a type byte outside of 1..=4.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// A non identification message arrived during the handshake.
    #[error("unexpected message of type {typ} during identification")]
    UnexpectedMessage {
        /// Raw type byte of the message
        typ: u8,
    },

    /// Operational or Operator data arrived outside of an association.
    #[error("{0:?} data received while not associated")]
    DataWhileUnassociated(FmtpType),

    /// Only Operational and Operator messages can be sent by the user.
    #[error("message type {0:?} cannot carry user data")]
    NotUserData(FmtpType),

    /// Timer Ti expired during the identification handshake.
    #[error("connection deadline (Ti) exceeded")]
    ConnectionDeadlineExceeded,

    /// The remote party identified itself with unexpected values.
    #[error("connection rejected for invalid credentials")]
    RejectedByLocal,

    /// The remote party answered the identification with REJECT.
    #[error("connection rejected by remote party")]
    RejectedByRemote,

    /// A connection with the same remote identifier is already registered.
    #[error("a connection with {0} is already registered")]
    DuplicateConnection(FmtpIdentifier),

    /// The remote party did not confirm a STARTUP in time.
    #[error("association timeout exceeded")]
    AssociationTimeoutExceeded,

    /// The remote party answered a STARTUP with SHUTDOWN.
    #[error("association refused by remote party")]
    AssociationRefused,

    /// A pending association was abandoned by the local user.
    #[error("association aborted locally")]
    AssociationAborted,

    /// Writing a frame failed with a non transient error or too many times.
    #[error("send failed after {attempts} attempt(s)")]
    SendFailed {
        /// Number of write attempts made
        attempts: usize,
        /// Error of the last attempt
        #[source]
        source: io::Error,
    },

    /// The deadline fired after part of a frame was written.
    #[error("send interrupted by deadline after {written} of {total} bytes")]
    SendInterrupted {
        /// Bytes of the frame already on the wire
        written: usize,
        /// Size of the whole frame
        total: usize,
    },

    /// The caller's deadline fired before the operation completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The connection is closed or closing.
    #[error("connection closed")]
    ConnectionClosed,

    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns `true` if the error leaves the stream in a state that cannot
    /// carry further frames, so the connection has to be torn down.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MalformedHeader(_)
                | Error::TruncatedBody { .. }
                | Error::UnexpectedEof { .. }
                | Error::MalformedSystemSignal { .. }
                | Error::UnknownType(_)
                | Error::DataWhileUnassociated(_)
                | Error::SendFailed { .. }
                | Error::SendInterrupted { .. }
                | Error::ConnectionClosed
                | Error::Io(_)
        )
    }
}

/// Result type alias using [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
