//! Stream codec for MessagePack-RPC envelopes.
//!
//! The reader side decodes successive top-level MessagePack values out of a
//! byte stream, distinguishing clean end-of-stream from a stream that dies
//! mid-value. The writer side encodes one envelope into a scratch buffer and
//! emits it with a single `write_all`, so a frame is never interleaved with
//! another writer's bytes.

use std::io;

use bytes::{Buf, BytesMut};
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, RpcError};
use crate::value::{kind, to_int, to_u32};

const MSG_TYPE_REQUEST: i64 = 0;
const MSG_TYPE_RESPONSE: i64 = 1;
const MSG_TYPE_NOTIFICATION: i64 = 2;

const READ_CHUNK: usize = 4096;

/// A decoded MessagePack-RPC envelope.
///
/// `error` and `result` are carried verbatim: by convention exactly one is
/// non-nil, but the codec transmits whatever the handler produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: u32,
        method: String,
        params: Vec<Value>,
    },
    Response {
        id: u32,
        error: Value,
        result: Value,
    },
    Notification {
        method: String,
        params: Vec<Value>,
    },
}

impl Message {
    /// Parse a top-level value into an envelope, enforcing the array shape.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let data = match value {
            Value::Array(items) => items,
            other => return Err(ProtocolError::NotAnArray { kind: kind(&other) }),
        };
        if data.len() < 3 {
            return Err(ProtocolError::ShortEnvelope { len: data.len() });
        }
        let msg_type = to_int(&data[0]).ok_or(ProtocolError::BadMessageType {
            kind: kind(&data[0]),
        })?;

        match msg_type {
            MSG_TYPE_REQUEST => {
                let [_, id, method, params]: [Value; 4] =
                    data.try_into().map_err(|_| ProtocolError::BadEnvelope {
                        detail: "request, expected array with 4 elements",
                    })?;
                Ok(Message::Request {
                    id: to_u32(&id).ok_or(ProtocolError::BadEnvelope {
                        detail: "request, expected msgid (uint32) as second element",
                    })?,
                    method: into_method(method).ok_or(ProtocolError::BadEnvelope {
                        detail: "request, expected method (string) as third element",
                    })?,
                    params: into_params(params).ok_or(ProtocolError::BadEnvelope {
                        detail: "request, expected params (array) as fourth element",
                    })?,
                })
            }
            MSG_TYPE_RESPONSE => {
                let [_, id, error, result]: [Value; 4] =
                    data.try_into().map_err(|_| ProtocolError::BadEnvelope {
                        detail: "response, expected array with 4 elements",
                    })?;
                Ok(Message::Response {
                    id: to_u32(&id).ok_or(ProtocolError::BadEnvelope {
                        detail: "response, expected msgid (uint32) as second element",
                    })?,
                    error,
                    result,
                })
            }
            MSG_TYPE_NOTIFICATION => {
                let [_, method, params]: [Value; 3] =
                    data.try_into().map_err(|_| ProtocolError::BadEnvelope {
                        detail: "notification, expected array with 3 elements",
                    })?;
                Ok(Message::Notification {
                    method: into_method(method).ok_or(ProtocolError::BadEnvelope {
                        detail: "notification, expected method (string) as second element",
                    })?,
                    params: into_params(params).ok_or(ProtocolError::BadEnvelope {
                        detail: "notification, expected params (array) as third element",
                    })?,
                })
            }
            ty => Err(ProtocolError::UnknownMessageType { ty }),
        }
    }

    /// Build the wire array for this envelope.
    pub fn into_value(self) -> Value {
        match self {
            Message::Request { id, method, params } => Value::Array(vec![
                Value::from(MSG_TYPE_REQUEST),
                Value::from(id),
                Value::from(method),
                Value::Array(params),
            ]),
            Message::Response { id, error, result } => Value::Array(vec![
                Value::from(MSG_TYPE_RESPONSE),
                Value::from(id),
                error,
                result,
            ]),
            Message::Notification { method, params } => Value::Array(vec![
                Value::from(MSG_TYPE_NOTIFICATION),
                Value::from(method),
                Value::Array(params),
            ]),
        }
    }
}

fn into_method(value: Value) -> Option<String> {
    match value {
        Value::String(s) => s.into_str(),
        _ => None,
    }
}

fn into_params(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(params) => Some(params),
        _ => None,
    }
}

/// Incremental decoder over an async byte stream.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Decode the next top-level value.
    ///
    /// `Ok(None)` means the stream ended cleanly on a value boundary.
    /// `Err(RpcError::Truncated)` means it ended inside a value.
    pub async fn next_value(&mut self) -> Result<Option<Value>, RpcError> {
        loop {
            if !self.buf.is_empty() {
                let mut cursor = io::Cursor::new(&self.buf[..]);
                match rmpv::decode::read_value(&mut cursor) {
                    Ok(value) => {
                        let consumed = cursor.position() as usize;
                        self.buf.advance(consumed);
                        return Ok(Some(value));
                    }
                    Err(err) if is_incomplete(&err) => {}
                    Err(err) => return Err(RpcError::Decode(err)),
                }
            }
            let read = self.reader.read_buf(&mut self.buf).await?;
            if read == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(RpcError::Truncated)
                };
            }
        }
    }
}

/// The decoder hit the end of the buffered bytes mid-value; more input may
/// complete it.
fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(io) | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

/// Frame encoder over an async byte stream.
///
/// Callers serialize access (the [`Connection`](crate::Connection) keeps it
/// behind an async mutex), and each value goes out as one `write_all`.
pub struct FrameWriter<W> {
    writer: W,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            scratch: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Encode and transmit one value as a single frame.
    pub async fn write_value(&mut self, value: &Value) -> Result<(), RpcError> {
        self.scratch.clear();
        rmpv::encode::write_value(&mut self.scratch, value)
            .map_err(|e| RpcError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        self.writer.write_all(&self.scratch).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
