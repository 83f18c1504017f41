use clap::Parser;
use clap_derive::Parser;
use resilient_socket::transport::tcp::TcpTransportProvider;
use resilient_socket::{ResilientConfig, ResilientSocket, Supervisor};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::anyhow;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn, Level};

/// Echo server and client on top of resilient sockets. Kill and re-establish the TCP connection
///  (e.g. with a proxy in between) to see the logical connection survive.
#[derive(Parser)]
struct Args {
    /// address to listen on (server) or to connect to (client)
    address: String,

    #[clap(long, default_value_t = false)]
    server: bool,

    #[clap(long)]
    max_recovery_attempts: Option<u32>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let addr: SocketAddr = args.address.parse()?;
    let config = ResilientConfig {
        max_recovery_attempts: args.max_recovery_attempts,
        connect_timeout: Some(Duration::from_secs(30)),
        ..ResilientConfig::default()
    };
    let supervisor = Supervisor::new(Arc::new(TcpTransportProvider), config)?;

    if args.server {
        run_server(supervisor, addr).await
    }
    else {
        run_client(supervisor, addr).await
    }
}

async fn run_server(supervisor: Arc<Supervisor>, addr: SocketAddr) -> anyhow::Result<()> {
    let mut listener = supervisor.listen(addr).await?;
    info!("echo server listening on {}", listener.local_addr());

    loop {
        let socket = listener.accept().await?;
        tokio::spawn(async move {
            let id = socket.connection_id();
            if let Err(e) = echo(socket).await {
                warn!("echoing on {:?} failed: {}", id, e);
            }
        });
    }
}

async fn echo(socket: ResilientSocket) -> anyhow::Result<()> {
    info!("accepted {:?}", socket.connection_id());
    let (mut reader, mut writer) = socket.into_split();

    let mut buf = vec![0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            info!("{:?} was closed by the client", writer.connection_id());
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
    }
}

async fn run_client(supervisor: Arc<Supervisor>, addr: SocketAddr) -> anyhow::Result<()> {
    let socket = ResilientSocket::connect(&supervisor, addr).await?;
    info!("connected as {:?} - type lines to have them echoed", socket.connection_id());
    let (mut reader, mut writer) = socket.into_split();

    let printer = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => print!("{}", String::from_utf8_lossy(&buf[..n])),
                Err(e) => {
                    warn!("reading failed: {}", e);
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        writer.write(format!("{}\n", line).as_bytes())?;
    }

    writer.shutdown().await?;
    printer.await
        .map_err(|e| anyhow!("printer task failed: {}", e))
}
