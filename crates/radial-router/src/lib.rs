//! radial-router: the method router at the center of a star of
//! MessagePack-RPC peers.
//!
//! Peers connect over any byte stream and bind method names with
//! `$/register`; from then on any peer can invoke any registered method and
//! the router forwards the request, remapping message ids into the target's
//! own id space. In-process methods registered through
//! [`Router::register_method`] are dispatched the same way and shadow
//! external routes.

mod errors;

pub use errors::{ErrorCode, RouteError, encoded, envelope};

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use radial_rpc::{BoxFuture, Connection, RpcError, kind};

/// Intrinsic method binding a method name to the calling connection.
pub const REGISTER_METHOD: &str = "$/register";
/// Intrinsic method dropping every route owned by the calling connection.
pub const RESET_METHOD: &str = "$/reset";

/// An invocation of an in-process method.
pub struct InternalCall {
    /// The connection the request came in on.
    pub conn: Arc<Connection>,
    pub params: Vec<Value>,
    /// Fires if the caller cancels the request. Honoring it is the handler's
    /// choice; the returned pair is transmitted either way.
    pub cancel: CancellationToken,
}

type InternalHandler = Arc<dyn Fn(InternalCall) -> BoxFuture<(Value, Value)> + Send + Sync>;

/// A registered peer, as stored in the routing table. The forwarding
/// semaphore bounds requests *targeting* this peer.
#[derive(Clone)]
struct PeerHandle {
    conn: Arc<Connection>,
    forwards: Option<Arc<Semaphore>>,
}

/// Non-owning view of a peer, captured by its own dispatch closures. The
/// connection reference is weak so the handler does not keep its connection
/// alive; it is upgradable for as long as a request is in flight.
#[derive(Clone)]
struct PeerRef {
    conn: Weak<Connection>,
    forwards: Option<Arc<Semaphore>>,
}

impl PeerRef {
    fn upgrade(&self) -> Option<PeerHandle> {
        Some(PeerHandle {
            conn: self.conn.upgrade()?,
            forwards: self.forwards.clone(),
        })
    }
}

#[derive(Default)]
struct RouteTable {
    external: HashMap<String, PeerHandle>,
    internal: HashMap<String, InternalHandler>,
}

impl RouteTable {
    fn owns(&self, method: &str) -> bool {
        self.external.contains_key(method) || self.internal.contains_key(method)
    }
}

/// The router. Cheap to clone; all clones share one routing table.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    routes: Mutex<RouteTable>,
    /// Cap on in-flight forwarded requests per target connection; 0 means
    /// unbounded.
    per_conn_max_forwards: usize,
}

impl Router {
    pub fn new(per_conn_max_forwards: usize) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                routes: Mutex::new(RouteTable::default()),
                per_conn_max_forwards,
            }),
        }
    }

    /// Register an in-process method. Fails if the name is already owned by
    /// any route, external or internal.
    pub fn register_method<F, Fut>(&self, method: &str, handler: F) -> Result<(), RouteError>
    where
        F: Fn(InternalCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = (Value, Value)> + Send + 'static,
    {
        let mut table = self.inner.routes.lock();
        if table.owns(method) {
            tracing::error!(method, "route already exists");
            return Err(RouteError::already_exists(method));
        }
        let handler: InternalHandler = Arc::new(move |call| Box::pin(handler(call)));
        table.internal.insert(method.to_owned(), handler);
        tracing::info!(method, "registered internal method");
        Ok(())
    }

    /// Adopt a peer stream: spawn its connection loop and return the handle
    /// that resolves when the peer is gone and its routes are evicted.
    pub fn accept<S>(&self, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let conn = Connection::over_stream(stream);
            inner.connection_loop(conn).await;
        })
    }
}

impl RouterInner {
    async fn connection_loop(self: Arc<Self>, conn: Arc<Connection>) {
        let peer = PeerRef {
            conn: Arc::downgrade(&conn),
            forwards: match self.per_conn_max_forwards {
                0 => None,
                bound => Some(Arc::new(Semaphore::new(bound))),
            },
        };

        {
            let router = Arc::clone(&self);
            let peer = peer.clone();
            conn.set_request_handler(move |method, params, cancel| {
                let router = router.clone();
                let peer = peer.clone();
                async move { router.dispatch_request(peer, method, params, cancel).await }
            });
        }
        {
            let router = Arc::clone(&self);
            let peer = peer.clone();
            conn.set_notification_handler(move |method, params| {
                let router = router.clone();
                let peer = peer.clone();
                async move { router.dispatch_notification(peer, method, params).await }
            });
        }
        conn.set_error_handler(|err| match err {
            RpcError::Eof => tracing::info!("connection closed by peer"),
            err => tracing::error!(error = %err, "error in connection"),
        });

        let _ = conn.clone().run().await;

        // Unregister the methods when the connection is terminated.
        self.remove_routes_for(&conn);
        conn.close();
    }

    async fn dispatch_request(
        self: Arc<Self>,
        caller: PeerRef,
        method: String,
        params: Vec<Value>,
        cancel: CancellationToken,
    ) -> (Value, Value) {
        tracing::debug!(method = %method, "received request");

        match method.as_str() {
            REGISTER_METHOD => return self.handle_register(&caller, params),
            RESET_METHOD => return self.handle_reset(&caller, params),
            _ => {}
        }

        let internal = self.routes.lock().internal.get(&method).cloned();
        if let Some(handler) = internal {
            let Some(conn) = caller.conn.upgrade() else {
                return (
                    Value::Nil,
                    encoded(ErrorCode::Generic, "calling connection is gone"),
                );
            };
            return handler(InternalCall {
                conn,
                params,
                cancel,
            })
            .await;
        }

        let target = self.routes.lock().external.get(&method).cloned();
        let Some(target) = target else {
            return (
                Value::Nil,
                encoded(
                    ErrorCode::MethodNotAvailable,
                    format!("method {method} not available"),
                ),
            );
        };

        // Backpressure: at most per_conn_max_forwards requests in flight
        // toward this target; the permit spans the whole round trip.
        let _permit = match &target.forwards {
            Some(semaphore) => semaphore.clone().acquire_owned().await.ok(),
            None => None,
        };

        // The forwarded request gets a fresh id from the target's own id
        // space; the original id never leaves the caller's connection.
        match target.conn.send_request(&method, params, &cancel).await {
            Ok((result, error)) => (result, error),
            Err(err) => {
                tracing::error!(method = %method, error = %err, "failed to send request");
                (
                    Value::Nil,
                    encoded(
                        ErrorCode::FailedToSendRequest,
                        format!("failed to send request: {err}"),
                    ),
                )
            }
        }
    }

    async fn dispatch_notification(
        self: Arc<Self>,
        caller: PeerRef,
        method: String,
        params: Vec<Value>,
    ) {
        tracing::debug!(method = %method, "received notification");

        let internal = self.routes.lock().internal.get(&method).cloned();
        if let Some(handler) = internal {
            let Some(conn) = caller.conn.upgrade() else {
                return;
            };
            // Notification: the handler's result is discarded.
            let _ = handler(InternalCall {
                conn,
                params,
                cancel: CancellationToken::new(),
            })
            .await;
            return;
        }

        let target = self.routes.lock().external.get(&method).cloned();
        let Some(target) = target else {
            // No route: the notification is lost.
            return;
        };
        if let Err(err) = target.conn.send_notification(&method, params).await {
            tracing::error!(method = %method, error = %err, "failed to send notification");
        }
    }

    fn handle_register(&self, caller: &PeerRef, params: Vec<Value>) -> (Value, Value) {
        let name = match params.as_slice() {
            [value] => match value.as_str() {
                Some(name) => name.to_owned(),
                None => {
                    return (
                        Value::Nil,
                        encoded(
                            ErrorCode::InvalidParams,
                            format!("invalid params: expected string, got {}", kind(value)),
                        ),
                    );
                }
            },
            _ => {
                return (
                    Value::Nil,
                    encoded(
                        ErrorCode::InvalidParams,
                        format!(
                            "invalid params: only one param is expected, got {}",
                            params.len()
                        ),
                    ),
                );
            }
        };
        let Some(peer) = caller.upgrade() else {
            return (
                Value::Nil,
                encoded(ErrorCode::Generic, "calling connection is gone"),
            );
        };

        let mut table = self.routes.lock();
        if table.owns(&name) {
            return (Value::Nil, RouteError::already_exists(&name).to_encoded());
        }
        table.external.insert(name.clone(), peer);
        tracing::info!(method = %name, "registered route");
        // The route is visible before the response frame is written.
        (Value::Boolean(true), Value::Nil)
    }

    fn handle_reset(&self, caller: &PeerRef, params: Vec<Value>) -> (Value, Value) {
        if !params.is_empty() {
            return (
                Value::Nil,
                encoded(ErrorCode::InvalidParams, "invalid params: no params are expected"),
            );
        }
        if let Some(conn) = caller.conn.upgrade() {
            self.remove_routes_for(&conn);
        }
        (Value::Boolean(true), Value::Nil)
    }

    fn remove_routes_for(&self, conn: &Arc<Connection>) {
        let mut table = self.routes.lock();
        let before = table.external.len();
        table
            .external
            .retain(|_, peer| !Arc::ptr_eq(&peer.conn, conn));
        let removed = before - table.external.len();
        if removed > 0 {
            tracing::info!(removed, "dropped routes for closed connection");
        }
    }
}
