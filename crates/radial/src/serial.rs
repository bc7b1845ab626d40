//! Serial-port peer control.
//!
//! The configured serial port is not opened until a peer asks for it with
//! `$/serial/open`; `$/serial/close` drops it again. While open, the port's
//! byte stream is routed exactly like any accepted socket, with the far end
//! expected to speak MessagePack-RPC (an embedded device).

use std::time::Duration;

use rmpv::Value;
use tokio::sync::watch;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};

use radial_router::{InternalCall, Router, RouteError, envelope};

const ERR_INVALID_PARAMS: i64 = 1;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Register `$/serial/open` / `$/serial/close` and spawn the port loop.
pub fn register(router: &Router, port: String, baud_rate: u32) -> Result<(), RouteError> {
    let (requested_tx, requested_rx) = watch::channel(false);

    {
        let expected = port.clone();
        let requested = requested_tx.clone();
        router.register_method("$/serial/open", move |call: InternalCall| {
            let expected = expected.clone();
            let requested = requested.clone();
            async move {
                if let Some(err) = check_address(&call.params, &expected) {
                    return err;
                }
                tracing::info!(serial = %expected, "request for opening serial port");
                // Already open is fine; the port stays up.
                let _ = requested.send(true);
                (Value::Boolean(true), Value::Nil)
            }
        })?;
    }
    {
        let expected = port.clone();
        let requested = requested_tx.clone();
        router.register_method("$/serial/close", move |call: InternalCall| {
            let expected = expected.clone();
            let requested = requested.clone();
            async move {
                if let Some(err) = check_address(&call.params, &expected) {
                    return err;
                }
                tracing::info!(serial = %expected, "request for closing serial port");
                let _ = requested.send(false);
                (Value::Boolean(true), Value::Nil)
            }
        })?;
    }

    tokio::spawn(port_loop(router.clone(), port, baud_rate, requested_rx));
    Ok(())
}

fn check_address(params: &[Value], expected: &str) -> Option<(Value, Value)> {
    match params {
        [address] => match address.as_str() {
            Some(address) if address == expected => None,
            Some(_) => Some((
                Value::Nil,
                envelope(ERR_INVALID_PARAMS, "Invalid serial port address"),
            )),
            None => Some((
                Value::Nil,
                envelope(ERR_INVALID_PARAMS, "Invalid parameter type"),
            )),
        },
        _ => Some((
            Value::Nil,
            envelope(ERR_INVALID_PARAMS, "Invalid number of parameters"),
        )),
    }
}

async fn port_loop(
    router: Router,
    port: String,
    baud_rate: u32,
    mut requested: watch::Receiver<bool>,
) {
    loop {
        // Park until a peer asks for the port.
        while !*requested.borrow_and_update() {
            if requested.changed().await.is_err() {
                return;
            }
        }

        tracing::info!(serial = %port, "opening serial connection");
        let stream = match tokio_serial::new(&port, baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .open_native_async()
        {
            Ok(stream) => stream,
            Err(err) => {
                tracing::error!(serial = %port, error = %err, "failed to open serial port, retrying in 5 seconds");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };
        tracing::info!(serial = %port, "opened serial connection");

        // The router owns its end of a local pipe; the pumps tie the pipe to
        // the port. Dropping the pumps closes the pipe, which ends the
        // router-side connection and evicts its routes.
        let (router_side, pipe_side) = tokio::io::duplex(4096);
        let mut router_exit = router.accept(router_side);

        let (mut port_read, mut port_write) = tokio::io::split(stream);
        let (mut pipe_read, mut pipe_write) = tokio::io::split(pipe_side);
        let mut pump_in =
            tokio::spawn(async move { tokio::io::copy(&mut port_read, &mut pipe_write).await });
        let mut pump_out =
            tokio::spawn(async move { tokio::io::copy(&mut pipe_read, &mut port_write).await });

        // Wait for a close command or for the port to fail.
        let closed_by_request = loop {
            tokio::select! {
                changed = requested.changed() => {
                    if changed.is_err() {
                        break true;
                    }
                    if !*requested.borrow() {
                        break true;
                    }
                }
                _ = &mut pump_in => break false,
                _ = &mut pump_out => break false,
            }
        };
        if !closed_by_request {
            tracing::info!(serial = %port, "serial port failed connection");
        }

        pump_in.abort();
        pump_out.abort();
        // In any case, wait for the router to drop the connection.
        let _ = (&mut router_exit).await;
    }
}
