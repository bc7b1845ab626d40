//! Monitor byte pipe.
//!
//! A TCP listener holds at most one monitor connection at a time; peers poll
//! it through `mon/read` / `mon/write`. Reads are non-blocking so an embedded
//! peer can poll from a tight loop without parking a request.

use std::sync::Arc;

use parking_lot::Mutex;
use rmpv::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use radial_router::{InternalCall, Router, envelope};
use radial_rpc::{kind, to_uint};

const ERR_INVALID_PARAMS: i64 = 1;
const ERR_IO: i64 = 3;

#[derive(Default)]
struct MonitorState {
    socket: Mutex<Option<Arc<TcpStream>>>,
    /// Signalled when the active socket is dropped, so the accept loop can
    /// take the next connection.
    connection_lost: Notify,
}

impl MonitorState {
    fn active(&self) -> Option<Arc<TcpStream>> {
        self.socket.lock().clone()
    }

    fn close(&self) {
        let mut socket = self.socket.lock();
        if socket.take().is_some() {
            self.connection_lost.notify_waiters();
        }
    }
}

/// Bind the monitor listener and register the `mon/*` methods.
pub async fn register(router: &Router, addr: &str) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(listen_addr = addr, "monitor listening");
    let state = Arc::new(MonitorState::default());

    tokio::spawn(connection_handler(listener, state.clone()));

    macro_rules! method {
        ($name:literal, $f:ident) => {{
            let state = state.clone();
            let _ = router.register_method($name, move |call: InternalCall| {
                let state = state.clone();
                async move { $f(&state, call).await }
            });
        }};
    }

    method!("mon/connected", connected);
    method!("mon/read", read);
    method!("mon/write", write);
    method!("mon/reset", reset);
    Ok(())
}

async fn connection_handler(listener: TcpListener, state: Arc<MonitorState>) {
    loop {
        let conn = match listener.accept().await {
            Ok((conn, peer)) => {
                tracing::info!(from = %peer, "accepted monitor connection");
                conn
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to accept monitor connection");
                return;
            }
        };

        let lost = state.connection_lost.notified();
        tokio::pin!(lost);
        // Register for the wakeup before the socket becomes visible, so a
        // reset arriving immediately after cannot be missed.
        lost.as_mut().enable();
        *state.socket.lock() = Some(Arc::new(conn));
        // Hold the next accept until the current connection is discarded.
        lost.await;
    }
}

async fn connected(state: &MonitorState, call: InternalCall) -> (Value, Value) {
    if !call.params.is_empty() {
        return (
            Value::Nil,
            envelope(ERR_INVALID_PARAMS, "Invalid number of parameters, expected no parameters"),
        );
    }
    (Value::Boolean(state.active().is_some()), Value::Nil)
}

async fn read(state: &MonitorState, call: InternalCall) -> (Value, Value) {
    let max_bytes = match call.params.as_slice() {
        [max] => match to_uint(max) {
            Some(max) => max as usize,
            None => {
                return (
                    Value::Nil,
                    envelope(
                        ERR_INVALID_PARAMS,
                        "Invalid parameter type, expected positive int for max bytes to read",
                    ),
                );
            }
        },
        _ => {
            return (
                Value::Nil,
                envelope(
                    ERR_INVALID_PARAMS,
                    "Invalid number of parameters, expected max bytes to read",
                ),
            );
        }
    };

    // No active connection: an empty read.
    let Some(conn) = state.active() else {
        return (Value::Binary(Vec::new()), Value::Nil);
    };

    let mut buffer = vec![0u8; max_bytes];
    match conn.try_read(&mut buffer) {
        Ok(n) => {
            buffer.truncate(n);
            if n == 0 {
                // Orderly shutdown from the monitor side.
                tracing::info!("monitor connection closed");
                state.close();
            }
            (Value::Binary(buffer), Value::Nil)
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            (Value::Binary(Vec::new()), Value::Nil)
        }
        Err(err) => {
            tracing::error!(error = %err, "monitor connection lost, closing connection");
            state.close();
            (
                Value::Nil,
                envelope(ERR_IO, format!("Failed to read from connection: {err}")),
            )
        }
    }
}

async fn write(state: &MonitorState, call: InternalCall) -> (Value, Value) {
    let data = match call.params.as_slice() {
        [Value::Binary(bytes)] => bytes.clone(),
        [Value::String(s)] => s.as_bytes().to_vec(),
        [other] => {
            return (
                Value::Nil,
                envelope(
                    ERR_INVALID_PARAMS,
                    format!(
                        "Invalid parameter type, expected binary or string for data to write, got {}",
                        kind(other)
                    ),
                ),
            );
        }
        _ => {
            return (
                Value::Nil,
                envelope(ERR_INVALID_PARAMS, "Invalid number of parameters, expected data to write"),
            );
        }
    };

    // No active connection: the data is dropped.
    let Some(conn) = state.active() else {
        return (Value::from(data.len() as u64), Value::Nil);
    };

    let mut written = 0usize;
    while written < data.len() {
        if conn.writable().await.is_err() {
            break;
        }
        match conn.try_write(&data[written..]) {
            Ok(n) => written += n,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(err) => {
                tracing::error!(error = %err, "monitor connection lost, closing connection");
                state.close();
                return (
                    Value::Nil,
                    envelope(ERR_IO, format!("Failed to write to connection: {err}")),
                );
            }
        }
    }
    (Value::from(written as u64), Value::Nil)
}

async fn reset(state: &MonitorState, call: InternalCall) -> (Value, Value) {
    if !call.params.is_empty() {
        return (
            Value::Nil,
            envelope(ERR_INVALID_PARAMS, "Invalid number of parameters, expected no parameters"),
        );
    }
    state.close();
    tracing::info!("monitor connection reset");
    (Value::Boolean(true), Value::Nil)
}
