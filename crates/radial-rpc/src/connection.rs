//! Per-peer MessagePack-RPC connection.
//!
//! A [`Connection`] owns both halves of a byte stream and multiplexes three
//! traffics over it: requests we answer, responses we are waiting for, and
//! notifications. Only [`Connection::run`] reads the stream; every inbound
//! request is dispatched on its own task, and outbound frames go through one
//! writer mutex so they are never interleaved.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::codec::{FrameReader, FrameWriter, Message};
use crate::error::{ProtocolError, RpcError};
use crate::value::to_u32;

/// Notification method used to propagate cancellation of an in-flight
/// request, carrying `[msgid]`.
pub const CANCEL_METHOD: &str = "$/cancelRequest";

/// Boxed future alias used by the handler types.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Handles a request from the peer: `(method, params, cancel)` resolving to
/// the `(result, error)` pair that becomes the response. Either side of the
/// pair may be [`Value::Nil`].
pub type RequestHandler =
    Box<dyn Fn(String, Vec<Value>, CancellationToken) -> BoxFuture<(Value, Value)> + Send + Sync>;

/// Handles a notification from the peer. Runs on its own task.
pub type NotificationHandler = Box<dyn Fn(String, Vec<Value>) -> BoxFuture<()> + Send + Sync>;

/// Receives every error the connection encounters, fatal or not.
pub type ErrorHandler = Box<dyn Fn(&RpcError) + Send + Sync>;

type ResponseCallback = Box<dyn FnOnce(Value, Value) + Send>;

type BoxReader = FrameReader<Box<dyn AsyncRead + Send + Unpin>>;
type BoxWriter = FrameWriter<Box<dyn AsyncWrite + Send + Unpin>>;

struct InboundRequest {
    cancel: CancellationToken,
    /// Distinguishes this handler from one that superseded it after a
    /// duplicate-id violation: completion only removes and answers when the
    /// epoch still matches.
    epoch: u64,
}

struct OutboundRequest {
    complete: ResponseCallback,
    method: String,
}

/// A full-duplex MessagePack-RPC connection over a byte stream.
pub struct Connection {
    reader: AsyncMutex<Option<BoxReader>>,
    writer: AsyncMutex<BoxWriter>,

    request_handler: Mutex<Option<RequestHandler>>,
    notification_handler: Mutex<Option<NotificationHandler>>,
    error_handler: Mutex<Option<ErrorHandler>>,

    in_requests: Mutex<HashMap<u32, InboundRequest>>,
    in_epoch: AtomicU64,

    out_requests: Mutex<HashMap<u32, OutboundRequest>>,
    next_request_id: AtomicU32,

    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap separate read and write halves.
    pub fn new<R, W>(reader: R, writer: W) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        let writer: Box<dyn AsyncWrite + Send + Unpin> = Box::new(writer);
        Arc::new(Self {
            reader: AsyncMutex::new(Some(FrameReader::new(reader))),
            writer: AsyncMutex::new(FrameWriter::new(writer)),
            request_handler: Mutex::new(None),
            notification_handler: Mutex::new(None),
            error_handler: Mutex::new(None),
            in_requests: Mutex::new(HashMap::new()),
            in_epoch: AtomicU64::new(0),
            out_requests: Mutex::new(HashMap::new()),
            next_request_id: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Wrap a bidirectional stream, splitting it internally.
    pub fn over_stream<S>(stream: S) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }

    /// Install the request handler. Call before [`run`](Self::run); requests
    /// arriving without one are answered with a "method not implemented"
    /// error.
    pub fn set_request_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Vec<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (Value, Value)> + Send + 'static,
    {
        let boxed: RequestHandler =
            Box::new(move |method, params, cancel| Box::pin(handler(method, params, cancel)));
        *self.request_handler.lock() = Some(boxed);
    }

    /// Install the notification handler. Notifications arriving without one
    /// are dropped.
    pub fn set_notification_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: NotificationHandler =
            Box::new(move |method, params| Box::pin(handler(method, params)));
        *self.notification_handler.lock() = Some(boxed);
    }

    /// Install the error handler.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: Fn(&RpcError) + Send + Sync + 'static,
    {
        *self.error_handler.lock() = Some(Box::new(handler));
    }

    /// Drive the decode loop until end-of-stream, a fatal error, or
    /// [`close`](Self::close).
    ///
    /// Malformed envelopes are reported to the error handler and skipped;
    /// I/O and truncation errors are reported and terminate the loop. On
    /// return every pending outbound request has been dropped, which surfaces
    /// as [`RpcError::Closed`] to its caller. A clean end-of-stream leaves the
    /// write side open (a peer may half-close and still collect responses);
    /// the owner decides when to [`close`](Self::close).
    pub async fn run(self: Arc<Self>) -> Result<(), RpcError> {
        let mut reader = match self.reader.lock().await.take() {
            Some(reader) => reader,
            None => return Err(RpcError::Closed),
        };

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break Ok(()),
                next = reader.next_value() => next,
            };
            match next {
                Ok(Some(value)) => match Message::from_value(value) {
                    Ok(message) => self.dispatch(message),
                    Err(violation) => self.report_error(&RpcError::Protocol(violation)),
                },
                Ok(None) => {
                    self.report_error(&RpcError::Eof);
                    break Ok(());
                }
                Err(err) => {
                    self.report_error(&err);
                    self.close();
                    break Err(err);
                }
            }
        };

        // The reader is gone, so no outstanding outbound request can ever
        // complete.
        self.fail_pending_requests();
        result
    }

    /// Close the connection: further writes fail, a running
    /// [`run`](Self::run) loop unblocks, and the underlying streams are
    /// released once the last handle drops. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
    }

    /// Send a request and await the peer's response as a `(result, error)`
    /// pair.
    ///
    /// Cancelling `cancel` emits a [`CANCEL_METHOD`] notification carrying
    /// the id and returns [`RpcError::Cancelled`]; the outstanding entry is
    /// kept so the late response is consumed silently instead of being
    /// reported as an unknown id.
    pub async fn send_request(
        &self,
        method: &str,
        params: Vec<Value>,
        cancel: &CancellationToken,
    ) -> Result<(Value, Value), RpcError> {
        let (tx, rx) = oneshot::channel();
        let id = self.register_outbound(
            method,
            Box::new(move |result, error| {
                let _ = tx.send((result, error));
            }),
        );

        tracing::debug!(id, method, "outgoing request");
        if let Err(err) = self
            .write(Message::Request {
                id,
                method: method.to_owned(),
                params,
            })
            .await
        {
            self.out_requests.lock().remove(&id);
            return Err(err);
        }

        tokio::select! {
            response = rx => match response {
                Ok((result, error)) => Ok((result, error)),
                Err(_) => Err(RpcError::Closed),
            },
            _ = cancel.cancelled() => {
                if self.out_requests.lock().contains_key(&id) {
                    tracing::debug!(id, method, "cancelling outgoing request");
                    let _ = self
                        .send_notification(CANCEL_METHOD, vec![Value::from(id)])
                        .await;
                }
                Err(RpcError::Cancelled)
            }
        }
    }

    /// Send a request and return as soon as the frame is written; `on_result`
    /// fires when the response arrives. If the connection closes first the
    /// callback is dropped unfired.
    pub async fn send_request_async<F>(
        &self,
        method: &str,
        params: Vec<Value>,
        on_result: F,
    ) -> Result<(), RpcError>
    where
        F: FnOnce(Value, Value) + Send + 'static,
    {
        let id = self.register_outbound(method, Box::new(on_result));
        tracing::debug!(id, method, "outgoing request");
        if let Err(err) = self
            .write(Message::Request {
                id,
                method: method.to_owned(),
                params,
            })
            .await
        {
            self.out_requests.lock().remove(&id);
            return Err(err);
        }
        Ok(())
    }

    /// Send a one-shot notification.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<(), RpcError> {
        tracing::debug!(method, "outgoing notification");
        self.write(Message::Notification {
            method: method.to_owned(),
            params,
        })
        .await
    }

    fn dispatch(self: &Arc<Self>, message: Message) {
        match message {
            Message::Request { id, method, params } => self.handle_request(id, method, params),
            Message::Response { id, error, result } => self.handle_response(id, error, result),
            Message::Notification { method, params } => self.handle_notification(method, params),
        }
    }

    fn handle_request(self: &Arc<Self>, id: u32, method: String, params: Vec<Value>) {
        let cancel = CancellationToken::new();
        let epoch = self.in_epoch.fetch_add(1, Ordering::Relaxed);
        let prior = self.in_requests.lock().insert(
            id,
            InboundRequest {
                cancel: cancel.clone(),
                epoch,
            },
        );
        if let Some(prior) = prior {
            // The peer reused an id that is still in flight. The old handler
            // is cancelled and its eventual result discarded; the new request
            // owns the response.
            prior.cancel.cancel();
            self.report_error(&RpcError::Protocol(ProtocolError::DuplicateRequestId { id }));
        }

        tracing::debug!(id, method = %method, "incoming request");
        let handler_future = {
            let guard = self.request_handler.lock();
            guard
                .as_ref()
                .map(|handler| handler(method.clone(), params, cancel))
        };

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            // A panicking handler must still produce a response, or the peer
            // hangs forever waiting on this id.
            let (result, error) = match handler_future {
                Some(future) => match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(pair) => pair,
                    Err(panic) => {
                        let message = if let Some(s) = panic.downcast_ref::<&str>() {
                            format!("panic in request handler: {s}")
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            format!("panic in request handler: {s}")
                        } else {
                            "panic in request handler".to_owned()
                        };
                        (Value::Nil, Value::from(message))
                    }
                },
                None => (
                    Value::Nil,
                    Value::from(format!("method not implemented: {method}")),
                ),
            };

            let current = {
                let mut in_requests = conn.in_requests.lock();
                match in_requests.get(&id) {
                    Some(entry) if entry.epoch == epoch => {
                        in_requests.remove(&id);
                        true
                    }
                    _ => false,
                }
            };
            if !current {
                return;
            }

            tracing::debug!(id, method = %method, "outgoing response");
            if let Err(err) = conn.write(Message::Response { id, error, result }).await {
                conn.report_error(&err);
                conn.close();
            }
        });
    }

    fn handle_notification(self: &Arc<Self>, method: String, params: Vec<Value>) {
        if method == CANCEL_METHOD {
            let id = match params.as_slice() {
                [id] => to_u32(id),
                _ => None,
            };
            match id {
                Some(id) => self.cancel_inbound(id),
                None => {
                    self.report_error(&RpcError::Protocol(ProtocolError::BadCancelParams));
                }
            }
            return;
        }

        tracing::debug!(method = %method, "incoming notification");
        let handler_future = {
            let guard = self.notification_handler.lock();
            guard.as_ref().map(|handler| handler(method, params))
        };
        if let Some(future) = handler_future {
            tokio::spawn(future);
        }
    }

    fn handle_response(&self, id: u32, error: Value, result: Value) {
        let entry = self.out_requests.lock().remove(&id);
        match entry {
            Some(request) => {
                tracing::debug!(id, method = %request.method, "incoming response");
                // Invoked outside the lock: the callback may send frames.
                (request.complete)(result, error);
            }
            None => {
                self.report_error(&RpcError::Protocol(ProtocolError::UnknownResponseId { id }));
            }
        }
    }

    /// Fire the cancellation handle of an in-flight inbound request. The
    /// entry stays in the table; the handler's completion removes it. Unknown
    /// ids are a no-op.
    fn cancel_inbound(&self, id: u32) {
        let in_requests = self.in_requests.lock();
        if let Some(entry) = in_requests.get(&id) {
            tracing::debug!(id, "incoming cancel request");
            entry.cancel.cancel();
        }
    }

    fn register_outbound(&self, method: &str, complete: ResponseCallback) -> u32 {
        let mut out_requests = self.out_requests.lock();
        // The counter wraps at u32::MAX; skip any id still in flight so a
        // wrapped counter cannot collide with an active request.
        let id = loop {
            let id = self
                .next_request_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if !out_requests.contains_key(&id) {
                break id;
            }
        };
        out_requests.insert(
            id,
            OutboundRequest {
                complete,
                method: method.to_owned(),
            },
        );
        id
    }

    async fn write(&self, message: Message) -> Result<(), RpcError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_value(&message.into_value()).await
    }

    fn report_error(&self, err: &RpcError) {
        let guard = self.error_handler.lock();
        if let Some(handler) = guard.as_ref() {
            handler(err);
        }
    }

    fn fail_pending_requests(&self) {
        let pending = {
            let mut out_requests = self.out_requests.lock();
            std::mem::take(&mut *out_requests)
        };
        if !pending.is_empty() {
            tracing::debug!(
                count = pending.len(),
                "dropping outbound requests on closed connection"
            );
        }
        // Dropping the callbacks closes their completion channels; awaiting
        // callers observe RpcError::Closed.
        drop(pending);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .field("in_requests", &self.in_requests.lock().len())
            .field("out_requests", &self.out_requests.lock().len())
            .finish()
    }
}
