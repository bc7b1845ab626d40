//! Router behavior with real peers over in-memory streams.
//!
//! Every test builds a router and connects peers through duplex pipes, so
//! the full stack runs: client connection, router connection, forwarding,
//! and cleanup.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rmpv::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use radial_router::{ErrorCode, InternalCall, Router, encoded};
use radial_rpc::{Connection, RpcError, Value as RpcValue};

struct TestPeer {
    conn: Arc<Connection>,
    notifications: Arc<Mutex<Vec<(String, Vec<Value>)>>>,
    cancel_observed: Arc<AtomicBool>,
    run: JoinHandle<Result<(), RpcError>>,
    router_task: JoinHandle<()>,
}

/// Connect a peer that serves `ping` (echo), `slow` (100 ms echo) and
/// `tocancel` (waits for cancellation).
fn connect(router: &Router) -> TestPeer {
    let (client_side, router_side) = tokio::io::duplex(16 * 1024);
    let router_task = router.accept(router_side);

    let conn = Connection::over_stream(client_side);
    let notifications = Arc::new(Mutex::new(Vec::new()));
    let cancel_observed = Arc::new(AtomicBool::new(false));

    let observed = cancel_observed.clone();
    conn.set_request_handler(move |method, params, cancel| {
        let observed = observed.clone();
        async move {
            match method.as_str() {
                "ping" => (Value::Array(params), Value::Nil),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    (Value::Array(params), Value::Nil)
                }
                "tocancel" => {
                    tokio::select! {
                        _ = cancel.cancelled() => observed.store(true, Ordering::SeqCst),
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                    (Value::Nil, Value::from("cancelled"))
                }
                _ => (Value::Nil, Value::from(format!("unknown method: {method}"))),
            }
        }
    });
    let recorded = notifications.clone();
    conn.set_notification_handler(move |method, params| {
        let recorded = recorded.clone();
        async move {
            recorded.lock().push((method, params));
        }
    });

    let run = tokio::spawn(conn.clone().run());
    TestPeer {
        conn,
        notifications,
        cancel_observed,
        run,
        router_task,
    }
}

impl TestPeer {
    async fn call(&self, method: &str, params: Vec<Value>) -> (Value, Value) {
        let cancel = CancellationToken::new();
        self.conn
            .send_request(method, params, &cancel)
            .await
            .expect("request failed at the transport level")
    }

    async fn register(&self, method: &str) -> (Value, Value) {
        self.call("$/register", vec![Value::from(method)]).await
    }

    /// Tear the peer down and wait until the router has evicted its routes.
    async fn disconnect(self) {
        self.conn.close();
        let _ = self.run.await;
        drop(self.conn);
        self.router_task.await.expect("router connection loop");
    }
}

fn ok(result: Value) -> (Value, Value) {
    (result, Value::Nil)
}

fn err(code: ErrorCode, message: &str) -> (Value, Value) {
    (Value::Nil, encoded(code, message))
}

#[tokio::test]
async fn basic_router_functionality() {
    let router = Router::new(0);
    let cl1 = connect(&router);
    let cl2 = connect(&router);

    // Register a method on the first client.
    assert_eq!(cl1.register("ping").await, ok(Value::Boolean(true)));
    // Re-registering the same method fails.
    assert_eq!(
        cl1.register("ping").await,
        err(ErrorCode::RouteAlreadyExists, "route already exists: ping")
    );
    // Register a method on the second client.
    assert_eq!(cl2.register("temperature").await, ok(Value::Boolean(true)));

    // Call the first client's method from the second.
    let params = vec![Value::from("1"), Value::from(2), Value::Boolean(true)];
    assert_eq!(
        cl2.call("ping", params.clone()).await,
        ok(Value::Array(params))
    );

    // Self-call: a peer can invoke its own registered method.
    let params = vec![Value::from("c"), Value::from(12), Value::Boolean(false)];
    assert_eq!(
        cl1.call("ping", params.clone()).await,
        ok(Value::Array(params))
    );

    // Unknown method.
    assert_eq!(
        cl2.call("not-existent-method", vec![Value::from(1)]).await,
        err(
            ErrorCode::MethodNotAvailable,
            "method not-existent-method not available"
        )
    );

    // Notifications: routed one is delivered to the route owner, unrouted
    // one is lost, and a self-notification loops back.
    cl2.conn
        .send_notification("ping", vec![Value::from("a"), Value::from(4), Value::Boolean(false)])
        .await
        .unwrap();
    cl2.conn
        .send_notification("notexistent", vec![Value::from("a")])
        .await
        .unwrap();
    cl1.conn
        .send_notification("ping", vec![Value::from("b"), Value::from(14), Value::Boolean(true)])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = cl1.notifications.lock().clone();
    assert!(seen.contains(&(
        "ping".to_owned(),
        vec![Value::from("a"), Value::from(4), Value::Boolean(false)]
    )));
    assert!(seen.contains(&(
        "ping".to_owned(),
        vec![Value::from("b"), Value::from(14), Value::Boolean(true)]
    )));
    assert_eq!(seen.len(), 2);
    assert!(cl2.notifications.lock().is_empty());
}

#[tokio::test]
async fn reset_frees_owned_routes() {
    let router = Router::new(0);
    let peer = connect(&router);

    assert_eq!(peer.register("m").await, ok(Value::Boolean(true)));
    assert_eq!(
        peer.register("m").await,
        err(ErrorCode::RouteAlreadyExists, "route already exists: m")
    );

    assert_eq!(peer.call("$/reset", vec![]).await, ok(Value::Boolean(true)));
    // The name is free again.
    assert_eq!(peer.register("m").await, ok(Value::Boolean(true)));
}

#[tokio::test]
async fn intrinsic_params_are_validated() {
    let router = Router::new(0);
    let peer = connect(&router);

    assert_eq!(
        peer.call("$/register", vec![]).await,
        err(
            ErrorCode::InvalidParams,
            "invalid params: only one param is expected, got 0"
        )
    );
    assert_eq!(
        peer.call("$/register", vec![Value::from(3)]).await,
        err(
            ErrorCode::InvalidParams,
            "invalid params: expected string, got integer"
        )
    );
    assert_eq!(
        peer.call("$/reset", vec![Value::from(1)]).await,
        err(ErrorCode::InvalidParams, "invalid params: no params are expected")
    );
}

#[tokio::test]
async fn routes_are_evicted_on_disconnect() {
    let router = Router::new(0);
    let owner = connect(&router);
    let caller = connect(&router);

    assert_eq!(owner.register("ping").await, ok(Value::Boolean(true)));
    assert_eq!(
        caller.call("ping", vec![Value::from(1)]).await,
        ok(Value::Array(vec![Value::from(1)]))
    );

    owner.disconnect().await;

    // The route died with its owner.
    assert_eq!(
        caller.call("ping", vec![Value::from(1)]).await,
        err(ErrorCode::MethodNotAvailable, "method ping not available")
    );
    // And the name can be taken again.
    assert_eq!(caller.register("ping").await, ok(Value::Boolean(true)));
}

#[tokio::test]
async fn forward_failure_during_disconnect_maps_to_send_error() {
    let router = Router::new(0);
    let owner = connect(&router);
    let caller = connect(&router);

    assert_eq!(owner.register("slow").await, ok(Value::Boolean(true)));

    let in_flight = {
        let conn = caller.conn.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            conn.send_request("slow", vec![], &cancel).await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    owner.disconnect().await;

    let (result, error) = in_flight.await.unwrap().unwrap();
    assert_eq!(result, Value::Nil);
    let items = error.as_array().expect("error envelope");
    assert_eq!(items[0], Value::from(3));
    assert!(
        items[1]
            .as_str()
            .is_some_and(|m| m.starts_with("failed to send request")),
        "unexpected error payload: {error:?}"
    );
}

#[tokio::test]
async fn congestion_bound_limits_in_flight_forwards() {
    let router = Router::new(5);
    let target = connect(&router);
    let source = connect(&router);

    assert_eq!(target.register("slow").await, ok(Value::Boolean(true)));

    let started = std::time::Instant::now();
    let mut calls = Vec::new();
    for i in 0..20u32 {
        let conn = source.conn.clone();
        calls.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            conn.send_request("slow", vec![Value::from(i)], &cancel)
                .await
        }));
    }
    for (i, call) in calls.into_iter().enumerate() {
        let (result, error) = call.await.unwrap().unwrap();
        assert_eq!(error, Value::Nil);
        assert_eq!(result, Value::Array(vec![Value::from(i as u32)]));
    }

    // 20 requests through 5 slots of a 100 ms handler: at least 4 batches.
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(400),
        "forwards were not throttled: {elapsed:?}"
    );
}

#[tokio::test]
async fn cancellation_propagates_to_the_route_owner() {
    let router = Router::new(0);
    let owner = connect(&router);
    let caller = connect(&router);

    assert_eq!(owner.register("tocancel").await, ok(Value::Boolean(true)));

    let cancel = CancellationToken::new();
    let call = {
        let conn = caller.conn.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { conn.send_request("tocancel", vec![], &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    assert!(matches!(call.await.unwrap(), Err(RpcError::Cancelled)));

    // The cancellation crossed both hops and reached the serving handler.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !owner.cancel_observed.load(Ordering::SeqCst) {
        assert!(
            std::time::Instant::now() < deadline,
            "route owner never observed the cancellation"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn internal_methods_dispatch_and_stay_unique() {
    let router = Router::new(0);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorded = seen.clone();
    router
        .register_method("sys/info", move |call: InternalCall| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().push(call.params.clone());
                (Value::from("radial"), Value::Nil)
            }
        })
        .unwrap();

    // Duplicate in-process registration fails.
    assert!(
        router
            .register_method("sys/info", |_call| async { (Value::Nil, Value::Nil) })
            .is_err()
    );

    let peer = connect(&router);

    // Internal methods are callable like any route.
    assert_eq!(
        peer.call("sys/info", vec![Value::from(1)]).await,
        ok(Value::from("radial"))
    );

    // The name is reserved against external registration.
    assert_eq!(
        peer.register("sys/info").await,
        err(ErrorCode::RouteAlreadyExists, "route already exists: sys/info")
    );

    // Notifications reach internal handlers too; the result is discarded.
    peer.conn
        .send_notification("sys/info", vec![Value::from("notified")])
        .await
        .unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if seen.lock().len() == 2 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "notification lost");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        seen.lock().as_slice(),
        &[vec![Value::from(1)], vec![Value::from("notified")]]
    );
}

#[tokio::test]
async fn forwarding_remaps_message_ids() {
    use radial_rpc::{FrameReader, FrameWriter, Message};

    let router = Router::new(0);

    // Two hand-driven peers, so both sides of the id spaces are visible.
    let (owner_side, router_side) = tokio::io::duplex(4096);
    router.accept(router_side);
    let (owner_read, owner_write) = tokio::io::split(owner_side);
    let mut owner_reader = FrameReader::new(owner_read);
    let mut owner_writer = FrameWriter::new(owner_write);

    let (caller_side, router_side) = tokio::io::duplex(4096);
    router.accept(router_side);
    let (caller_read, caller_write) = tokio::io::split(caller_side);
    let mut caller_reader = FrameReader::new(caller_read);
    let mut caller_writer = FrameWriter::new(caller_write);

    async fn next_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Message {
        Message::from_value(reader.next_value().await.unwrap().expect("stream ended")).unwrap()
    }

    // Owner registers `ping` under its own id 7.
    owner_writer
        .write_value(
            &Message::Request {
                id: 7,
                method: "$/register".into(),
                params: vec![Value::from("ping")],
            }
            .into_value(),
        )
        .await
        .unwrap();
    assert_eq!(
        next_message(&mut owner_reader).await,
        Message::Response {
            id: 7,
            error: Value::Nil,
            result: Value::Boolean(true),
        }
    );

    // Caller invokes `ping` with id 50.
    let params = vec![Value::from(1), Value::Boolean(true)];
    caller_writer
        .write_value(
            &Message::Request {
                id: 50,
                method: "ping".into(),
                params: params.clone(),
            }
            .into_value(),
        )
        .await
        .unwrap();

    // The forwarded request carries a fresh id from the owner connection's
    // space, not the caller's 50.
    let forwarded = next_message(&mut owner_reader).await;
    let Message::Request {
        id: forwarded_id,
        method,
        params: forwarded_params,
    } = forwarded
    else {
        panic!("expected a forwarded request, got {forwarded:?}");
    };
    assert_eq!(method, "ping");
    assert_eq!(forwarded_params, params);
    assert_eq!(forwarded_id, 1, "first id in the owner connection's space");

    // Answer under the forwarded id; the caller sees its own id back.
    owner_writer
        .write_value(
            &Message::Response {
                id: forwarded_id,
                error: Value::Nil,
                result: Value::Array(params.clone()),
            }
            .into_value(),
        )
        .await
        .unwrap();
    assert_eq!(
        next_message(&mut caller_reader).await,
        Message::Response {
            id: 50,
            error: Value::Nil,
            result: Value::Array(params),
        }
    );
}

#[tokio::test]
async fn external_registration_blocks_internal_name() {
    let router = Router::new(0);
    let peer = connect(&router);

    assert_eq!(peer.register("claimed").await, ok(Value::Boolean(true)));
    assert!(
        router
            .register_method("claimed", |_call| async { (Value::Nil, Value::Nil) })
            .is_err()
    );

    // RpcValue is the same type radial-rpc re-exports; spot-check the alias.
    let _: RpcValue = Value::Nil;
}
