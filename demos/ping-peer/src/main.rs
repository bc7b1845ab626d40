//! Example peer for the radial router.
//!
//! Connects over TCP, registers `ping`, and serves it by echoing the params.
//! With `--call`, it also invokes `ping` through the router once, which
//! round-trips via its own registration.
//!
//! Run a router first, then:
//!   cargo run -p radial-ping-peer -- --call

use clap::Parser;
use rmpv::Value;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use radial_rpc::Connection;

#[derive(Parser, Debug)]
#[command(name = "ping-peer")]
#[command(about = "Example radial peer serving `ping`")]
struct Cli {
    /// Router TCP address
    #[arg(short, long, default_value = "127.0.0.1:8900")]
    address: String,

    /// Invoke `ping` once through the router after registering
    #[arg(long)]
    call: bool,
}

fn main() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    rt.block_on(async_main());
}

async fn async_main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let stream = match TcpStream::connect(&cli.address).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::error!(address = %cli.address, error = %err, "failed to connect to router");
            std::process::exit(1);
        }
    };
    println!("Connected to router at {}", cli.address);

    let conn = Connection::over_stream(stream);
    conn.set_request_handler(|method, params, _cancel| async move {
        match method.as_str() {
            "ping" => {
                println!("  ping({params:?}) called");
                (Value::Array(params), Value::Nil)
            }
            _ => (Value::Nil, Value::from(format!("unknown method: {method}"))),
        }
    });
    conn.set_notification_handler(|method, params| async move {
        println!("  notification {method}({params:?})");
    });
    conn.set_error_handler(|err| tracing::warn!(error = %err, "connection error"));

    let run = tokio::spawn(conn.clone().run());

    let cancel = CancellationToken::new();
    match conn
        .send_request("$/register", vec![Value::from("ping")], &cancel)
        .await
    {
        Ok((result, error)) if error.is_nil() => {
            println!("Registered `ping`: {result:?}")
        }
        Ok((_, error)) => {
            tracing::error!(error = ?error, "registration refused");
            std::process::exit(1);
        }
        Err(err) => {
            tracing::error!(error = %err, "registration failed");
            std::process::exit(1);
        }
    }

    if cli.call {
        let params = vec![Value::from(1), Value::Boolean(true)];
        match conn.send_request("ping", params, &cancel).await {
            Ok((result, error)) => println!("ping -> result={result:?} error={error:?}"),
            Err(err) => tracing::error!(error = %err, "ping failed"),
        }
    }

    println!("Serving; press Ctrl+C to exit");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = run => {}
    }
    conn.close();
}
