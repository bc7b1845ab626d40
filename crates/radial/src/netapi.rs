//! TCP networking methods served in-process.
//!
//! Peers on constrained hardware delegate socket I/O to the router through
//! these methods. Sockets and listeners live in one table keyed by
//! router-assigned ids; the ids share a space so a connection id can never
//! collide with a listener id.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use rmpv::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

use radial_router::{InternalCall, Router, envelope};
use radial_rpc::{kind, to_u32, to_uint};

const ERR_INVALID_PARAMS: i64 = 1;
const ERR_CONNECT: i64 = 2;
const ERR_IO: i64 = 3;
const ERR_UNKNOWN_ID: i64 = 4;

struct LiveConnection {
    reader: tokio::sync::Mutex<OwnedReadHalf>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

#[derive(Default)]
struct NetTable {
    connections: HashMap<u32, Arc<LiveConnection>>,
    listeners: HashMap<u32, Arc<TcpListener>>,
}

struct NetApi {
    table: Mutex<NetTable>,
    next_id: AtomicU32,
}

/// Register the networking methods on the router.
pub fn register(router: &Router) {
    let api = Arc::new(NetApi {
        table: Mutex::new(NetTable::default()),
        next_id: AtomicU32::new(0),
    });

    macro_rules! method {
        ($name:literal, $f:ident) => {{
            let api = api.clone();
            let _ = router.register_method($name, move |call: InternalCall| {
                let api = api.clone();
                async move { api.$f(call).await }
            });
        }};
    }

    method!("tcp/connect", connect);
    method!("tcp/listen", listen);
    method!("tcp/closeListener", close_listener);
    method!("tcp/accept", accept);
    method!("tcp/read", read);
    method!("tcp/write", write);
    method!("tcp/close", close);
}

fn invalid(message: impl Into<String>) -> (Value, Value) {
    (Value::Nil, envelope(ERR_INVALID_PARAMS, message))
}

impl NetApi {
    fn store_connection(&self, stream: TcpStream) -> u32 {
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(LiveConnection {
            reader: tokio::sync::Mutex::new(read_half),
            writer: tokio::sync::Mutex::new(write_half),
        });
        let mut table = self.table.lock();
        let id = self.free_id(&table);
        table.connections.insert(id, conn);
        id
    }

    fn store_listener(&self, listener: TcpListener) -> u32 {
        let mut table = self.table.lock();
        let id = self.free_id(&table);
        table.listeners.insert(id, Arc::new(listener));
        id
    }

    /// Pick an id free in both maps. The counter wraps; the loop skips ids
    /// still alive.
    fn free_id(&self, table: &NetTable) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if !table.connections.contains_key(&id) && !table.listeners.contains_key(&id) {
                return id;
            }
        }
    }

    async fn connect(&self, call: InternalCall) -> (Value, Value) {
        let (addr, port) = match host_port(&call.params) {
            Ok(pair) => pair,
            Err(err) => return err,
        };
        tracing::debug!(addr = %addr, port, "tcp/connect");
        match TcpStream::connect((addr.as_str(), port)).await {
            Ok(stream) => (Value::from(self.store_connection(stream)), Value::Nil),
            Err(err) => (
                Value::Nil,
                envelope(ERR_CONNECT, format!("Failed to connect to server: {err}")),
            ),
        }
    }

    async fn listen(&self, call: InternalCall) -> (Value, Value) {
        let (addr, port) = match host_port(&call.params) {
            Ok(pair) => pair,
            Err(err) => return err,
        };
        tracing::debug!(addr = %addr, port, "tcp/listen");
        match TcpListener::bind((addr.as_str(), port)).await {
            Ok(listener) => (Value::from(self.store_listener(listener)), Value::Nil),
            Err(err) => (
                Value::Nil,
                envelope(ERR_CONNECT, format!("Failed to listen: {err}")),
            ),
        }
    }

    async fn close_listener(&self, call: InternalCall) -> (Value, Value) {
        let id = match single_id(&call.params) {
            Ok(id) => id,
            Err(err) => return err,
        };
        match self.table.lock().listeners.remove(&id) {
            Some(_) => (Value::Boolean(true), Value::Nil),
            None => (
                Value::Nil,
                envelope(ERR_UNKNOWN_ID, format!("Unknown listener id: {id}")),
            ),
        }
    }

    async fn accept(&self, call: InternalCall) -> (Value, Value) {
        let id = match single_id(&call.params) {
            Ok(id) => id,
            Err(err) => return err,
        };
        let listener = match self.table.lock().listeners.get(&id) {
            Some(listener) => listener.clone(),
            None => {
                return (
                    Value::Nil,
                    envelope(ERR_UNKNOWN_ID, format!("Unknown listener id: {id}")),
                );
            }
        };
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(listener = id, peer = %peer, "tcp/accept");
                    (Value::from(self.store_connection(stream)), Value::Nil)
                }
                Err(err) => (
                    Value::Nil,
                    envelope(ERR_IO, format!("Failed to accept connection: {err}")),
                ),
            },
            _ = call.cancel.cancelled() => {
                (Value::Nil, envelope(ERR_IO, "Accept cancelled"))
            }
        }
    }

    async fn read(&self, call: InternalCall) -> (Value, Value) {
        let (id, max_bytes) = match call.params.as_slice() {
            [id, max] => match (to_u32(id), to_uint(max)) {
                (Some(id), Some(max)) => (id, max as usize),
                _ => {
                    return invalid(
                        "Invalid parameter type, expected connection id and max bytes to read",
                    );
                }
            },
            _ => {
                return invalid(
                    "Invalid number of parameters, expected connection id and max bytes to read",
                );
            }
        };
        let Some(conn) = self.connection(id) else {
            return (
                Value::Nil,
                envelope(ERR_UNKNOWN_ID, format!("Unknown connection id: {id}")),
            );
        };

        let mut buffer = vec![0u8; max_bytes];
        let mut reader = conn.reader.lock().await;
        tokio::select! {
            read = reader.read(&mut buffer) => match read {
                Ok(n) => {
                    buffer.truncate(n);
                    (Value::Binary(buffer), Value::Nil)
                }
                Err(err) => {
                    self.drop_connection(id);
                    (
                        Value::Nil,
                        envelope(ERR_IO, format!("Failed to read from connection: {err}")),
                    )
                }
            },
            _ = call.cancel.cancelled() => {
                (Value::Nil, envelope(ERR_IO, "Read cancelled"))
            }
        }
    }

    async fn write(&self, call: InternalCall) -> (Value, Value) {
        let (id, data) = match call.params.as_slice() {
            [id, data] => {
                let Some(id) = to_u32(id) else {
                    return invalid("Invalid parameter type, expected connection id");
                };
                let data = match data {
                    Value::Binary(bytes) => bytes.clone(),
                    Value::String(s) => s.as_bytes().to_vec(),
                    other => {
                        return invalid(format!(
                            "Invalid parameter type, expected binary or string for data to write, got {}",
                            kind(other)
                        ));
                    }
                };
                (id, data)
            }
            _ => {
                return invalid("Invalid number of parameters, expected connection id and data");
            }
        };
        let Some(conn) = self.connection(id) else {
            return (
                Value::Nil,
                envelope(ERR_UNKNOWN_ID, format!("Unknown connection id: {id}")),
            );
        };

        let mut writer = conn.writer.lock().await;
        match writer.write_all(&data).await {
            Ok(()) => (Value::from(data.len() as u64), Value::Nil),
            Err(err) => {
                self.drop_connection(id);
                (
                    Value::Nil,
                    envelope(ERR_IO, format!("Failed to write to connection: {err}")),
                )
            }
        }
    }

    async fn close(&self, call: InternalCall) -> (Value, Value) {
        let id = match single_id(&call.params) {
            Ok(id) => id,
            Err(err) => return err,
        };
        match self.table.lock().connections.remove(&id) {
            Some(_) => (Value::Boolean(true), Value::Nil),
            None => (
                Value::Nil,
                envelope(ERR_UNKNOWN_ID, format!("Unknown connection id: {id}")),
            ),
        }
    }

    fn connection(&self, id: u32) -> Option<Arc<LiveConnection>> {
        self.table.lock().connections.get(&id).cloned()
    }

    fn drop_connection(&self, id: u32) {
        self.table.lock().connections.remove(&id);
    }
}

fn host_port(params: &[Value]) -> Result<(String, u16), (Value, Value)> {
    match params {
        [addr, port] => {
            let Some(addr) = addr.as_str() else {
                return Err(invalid("Invalid parameter type, expected string for address"));
            };
            let port = to_uint(port)
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| invalid("Invalid parameter type, expected uint16 for port"))?;
            Ok((addr.to_owned(), port))
        }
        _ => Err(invalid(
            "Invalid number of parameters, expected address and port",
        )),
    }
}

fn single_id(params: &[Value]) -> Result<u32, (Value, Value)> {
    match params {
        [id] => {
            to_u32(id).ok_or_else(|| invalid("Invalid parameter type, expected connection id"))
        }
        _ => Err(invalid("Invalid number of parameters, expected an id")),
    }
}
