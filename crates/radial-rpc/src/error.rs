//! Connection and protocol error types.

use core::fmt;

/// Errors surfaced by a [`Connection`](crate::Connection).
///
/// `Eof`, `Io` and `Truncated` terminate the decode loop. `Protocol` errors
/// are reported to the error handler and the loop keeps running.
#[derive(Debug)]
pub enum RpcError {
    /// The peer closed the stream cleanly.
    Eof,
    /// Reading or writing the underlying stream failed.
    Io(std::io::Error),
    /// The stream ended in the middle of a MessagePack value.
    Truncated,
    /// The top-level value could not be decoded as MessagePack.
    Decode(rmpv::decode::Error),
    /// A well-formed MessagePack value violated the envelope contract.
    Protocol(ProtocolError),
    /// The connection was closed locally.
    Closed,
    /// An outbound request was cancelled by the caller.
    Cancelled,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => write!(f, "end of stream"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Truncated => write!(f, "stream ended inside a packet"),
            Self::Decode(e) => write!(f, "can't read packet: {e}"),
            Self::Protocol(e) => write!(f, "{e}"),
            Self::Closed => write!(f, "connection closed"),
            Self::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RpcError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ProtocolError> for RpcError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Violations of the MessagePack-RPC envelope contract.
///
/// These are recoverable: the offending frame is dropped and the connection
/// keeps decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Top-level value was not an array.
    NotAnArray { kind: &'static str },
    /// Envelope array shorter than the minimal three elements.
    ShortEnvelope { len: usize },
    /// First element was not an integer.
    BadMessageType { kind: &'static str },
    /// Message-type discriminator outside 0..=2.
    UnknownMessageType { ty: i64 },
    /// Wrong arity or field type inside a known envelope kind.
    BadEnvelope { detail: &'static str },
    /// A request arrived with an id that is still in flight.
    DuplicateRequestId { id: u32 },
    /// A response arrived for an id with no outstanding request.
    UnknownResponseId { id: u32 },
    /// `$/cancelRequest` params were not a single msgid.
    BadCancelParams,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnArray { kind } => {
                write!(f, "invalid packet, expected array, got {kind}")
            }
            Self::ShortEnvelope { len } => {
                write!(
                    f,
                    "invalid packet, expected array with at least 3 elements, got {len}"
                )
            }
            Self::BadMessageType { kind } => {
                write!(f, "invalid packet, expected int as first element, got {kind}")
            }
            Self::UnknownMessageType { ty } => {
                write!(
                    f,
                    "invalid packet, expected request, response or notification, got type {ty}"
                )
            }
            Self::BadEnvelope { detail } => write!(f, "invalid {detail}"),
            Self::DuplicateRequestId { id } => {
                write!(f, "request id {id} already active: previous handler cancelled")
            }
            Self::UnknownResponseId { id } => {
                write!(
                    f,
                    "invalid ID in request response '{id}': double answer or request not sent"
                )
            }
            Self::BadCancelParams => {
                write!(f, "invalid cancelRequest, expected array with 1 msgid element")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
