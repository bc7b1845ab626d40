//! radial: MessagePack-RPC router daemon.
//!
//! Peers connect over TCP, a UNIX socket or a serial port, register method
//! names with `$/register`, and call each other through the router. The
//! built-in networking, monitor and serial methods run in-process.

mod monitor;
mod netapi;
mod serial;

use std::path::PathBuf;

use clap::Parser;
use tokio::net::{TcpListener, UnixListener};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use radial_router::Router;

const DEFAULT_UNIX_SOCKET: &str = "/var/run/radial.sock";
/// Overrides the default UNIX socket path when `--unix-port` is not given.
const UNIX_SOCKET_ENV: &str = "ARDUINO_ROUTER_SOCKET";

#[derive(Parser, Debug)]
#[command(name = "radial")]
#[command(about = "Router for MessagePack-RPC service peers")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// TCP listening address for RPC peers
    #[arg(short = 'l', long = "listen-port", default_value = "0.0.0.0:8900")]
    listen_tcp: String,

    /// UNIX socket path for RPC peers
    #[arg(short = 'u', long = "unix-port")]
    listen_unix: Option<PathBuf>,

    /// Serial port routed as a peer stream, opened on `$/serial/open`
    #[arg(short = 'p', long = "serial-port")]
    serial_port: Option<String>,

    /// Serial port baud rate
    #[arg(long, default_value_t = 115_200)]
    baudrate: u32,

    /// TCP listening address for the monitor byte pipe
    #[arg(long = "monitor-addr")]
    monitor_addr: Option<String>,

    /// Bound on in-flight forwarded requests per peer (0 = unbounded)
    #[arg(long = "max-pending-requests", default_value_t = 0)]
    max_pending_requests: usize,
}

impl Cli {
    fn unix_socket_path(&self) -> PathBuf {
        match &self.listen_unix {
            Some(path) => path.clone(),
            None => std::env::var_os(UNIX_SOCKET_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_UNIX_SOCKET)),
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    if let Err(err) = rt.block_on(run(cli)) {
        tracing::error!(error = %err, "failed to start router");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let router = Router::new(cli.max_pending_requests);

    netapi::register(&router);
    if let Some(addr) = &cli.monitor_addr {
        monitor::register(&router, addr)
            .await
            .map_err(|e| format!("failed to start monitor listener on {addr}: {e}"))?;
    }
    if let Some(port) = &cli.serial_port {
        serial::register(&router, port.clone(), cli.baudrate)?;
    }

    let tcp = TcpListener::bind(&cli.listen_tcp)
        .await
        .map_err(|e| format!("failed to listen on TCP port {}: {e}", cli.listen_tcp))?;
    tracing::info!(listen_addr = %cli.listen_tcp, "listening on TCP socket");

    let unix_path = cli.unix_socket_path();
    let unix = UnixListener::bind(&unix_path)
        .map_err(|e| format!("failed to listen on UNIX socket {}: {e}", unix_path.display()))?;
    tracing::info!(listen_addr = %unix_path.display(), "listening on UNIX socket");

    let tcp_loop = tokio::spawn(serve_tcp(router.clone(), tcp));
    let unix_loop = tokio::spawn(serve_unix(router.clone(), unix));

    wait_for_shutdown().await;

    tracing::info!("closing listeners");
    tcp_loop.abort();
    unix_loop.abort();
    let _ = std::fs::remove_file(&unix_path);
    Ok(())
}

async fn serve_tcp(router: Router, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::info!(addr = %addr, "accepted connection");
                router.accept(stream);
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to accept connection");
                break;
            }
        }
    }
}

async fn serve_unix(router: Router, listener: UnixListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                tracing::info!("accepted connection on UNIX socket");
                router.accept(stream);
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to accept connection");
                break;
            }
        }
    }
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
