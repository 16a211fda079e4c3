// kcp-node: echo server and line client over KCP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use kcp_node::{Client, Config, Listener, Server, Session, WorkerPool};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: kcp-node [--config PATH] server | client ADDR";

enum Command {
    Server,
    Client(SocketAddr),
}

struct Echo;

impl Listener for Echo {
    fn on_connected(&self, session: &Session) -> anyhow::Result<()> {
        info!(conv = session.conv(), peer = %session.peer(), "peer connected");
        Ok(())
    }

    fn on_receive(&self, session: &Session, message: Vec<u8>) -> anyhow::Result<()> {
        session.send(message)?;
        Ok(())
    }

    fn on_closed(&self, session: &Session) {
        info!(conv = session.conv(), "peer closed");
    }
}

struct Print;

impl Listener for Print {
    fn on_receive(&self, _session: &Session, message: Vec<u8>) -> anyhow::Result<()> {
        println!("{}", String::from_utf8_lossy(&message));
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut command = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("kcp-node {}", VERSION);
                return Ok(());
            }
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            "server" => command = Some(Command::Server),
            "client" => {
                let addr = args.next().context("client needs an address")?;
                let addr = addr
                    .parse::<SocketAddr>()
                    .with_context(|| format!("bad address {addr:?}"))?;
                command = Some(Command::Client(addr));
            }
            other => bail!("unknown argument {other:?}\n{USAGE}"),
        }
    }
    let Some(command) = command else {
        bail!(USAGE);
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = kcp_node::config::load(config_path.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let pool = Arc::new(WorkerPool::new(cfg.worker_count()));
        match command {
            Command::Server => run_server(&cfg, Arc::clone(&pool)).await?,
            Command::Client(addr) => run_client(&cfg, addr, &pool).await?,
        }
        let stats = pool.stats().await;
        pool.shutdown().await;
        info!(stats = %toml::to_string(&stats).unwrap_or_default(), "stopped");
        Ok::<(), anyhow::Error>(())
    })
}

async fn run_server(cfg: &Config, pool: Arc<WorkerPool>) -> anyhow::Result<()> {
    let server = Server::bind(cfg.listen_addr(), cfg.channel.clone(), pool, Arc::new(Echo)).await?;
    server
        .run(async {
            if let Err(e) = shutdown_signal().await {
                tracing::warn!(error = %e, "signal handler failed");
            }
        })
        .await
}

async fn run_client(cfg: &Config, addr: SocketAddr, pool: &WorkerPool) -> anyhow::Result<()> {
    let client = Client::connect(addr, &cfg.channel, pool, Arc::new(Print)).await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => client.send(line)?,
                None => break,
            },
            _ = &mut shutdown => break,
        }
    }
    client.close();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
