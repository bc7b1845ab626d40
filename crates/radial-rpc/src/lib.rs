//! radial-rpc: MessagePack-RPC connections over byte streams.
//!
//! This crate implements the peer-facing half of the radial router:
//! - Envelope codec ([`Message`], [`FrameReader`], [`FrameWriter`])
//! - Full-duplex connection state machine ([`Connection`])
//! - Wire integer coercion ([`to_int`], [`to_uint`], [`to_u32`])
//! - Error taxonomy ([`RpcError`], [`ProtocolError`])
//!
//! The wire format is the MessagePack-RPC envelope: `[0, msgid, method,
//! params]` requests, `[1, msgid, error, result]` responses, `[2, method,
//! params]` notifications, plus the `$/cancelRequest` notification extension.

mod codec;
mod connection;
mod error;
mod value;

pub use codec::{FrameReader, FrameWriter, Message};
pub use connection::{
    BoxFuture, CANCEL_METHOD, Connection, ErrorHandler, NotificationHandler, RequestHandler,
};
pub use error::{ProtocolError, RpcError};
pub use value::{kind, to_int, to_u32, to_uint};

// Re-exported so downstream crates name the same Value type without taking
// their own rmpv dependency pin.
pub use rmpv::Value;
