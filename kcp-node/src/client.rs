//! UDP client: one connection on its own socket.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{bail, Context};
use kcp_core::{random_conv, ChannelConfig, Connection, WriteError};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::listener::Listener;
use crate::session::Session;
use crate::transport::{Link, RECV_BUF};
use crate::worker::WorkerPool;

pub struct Client {
    session: Arc<Session>,
    conv_keyed: bool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

async fn bind_for(remote: SocketAddr) -> std::io::Result<UdpSocket> {
    let local = if remote.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    UdpSocket::bind(local).await
}

/// Feed datagrams from the remote into the session until it closes.
fn spawn_reader(socket: Arc<UdpSocket>, session: Arc<Session>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUF];
        while session.is_active() {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) if from == session.peer() => session.deliver(buf[..n].to_vec()),
                Ok((_, from)) => trace!(%from, "datagram from unexpected peer"),
                Err(e) => {
                    debug!(error = %e, "client recv failed");
                }
            }
        }
    })
}

impl Client {
    /// Open a connection to `remote`. The conv comes from `config.conv`, or is random when 0.
    pub async fn connect(
        remote: SocketAddr,
        config: &ChannelConfig,
        pool: &WorkerPool,
        listener: Arc<dyn Listener>,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid channel config")?;
        let socket = Arc::new(
            bind_for(remote)
                .await
                .context("binding client socket")?,
        );
        let conv = if config.conv != 0 {
            config.conv
        } else {
            random_conv()
        };
        let conn = Connection::new(conv, config, pool.now_ms())?;
        let link = Link {
            socket: Arc::clone(&socket),
            peer: remote,
        };
        let session = pool.open(conn, link, listener, None);
        info!(%remote, conv, local = ?socket.local_addr().ok(), "client connected");
        let reader = spawn_reader(socket, Arc::clone(&session));
        Ok(Self {
            session,
            conv_keyed: config.use_conv_channel,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), WriteError> {
        self.session.send(payload)
    }

    /// Move the connection to a fresh local socket, keeping all protocol state.
    /// The server must key sessions by conv to follow the new address.
    pub async fn reconnect(&self) -> anyhow::Result<()> {
        if !self.conv_keyed {
            bail!("reconnect needs a conv-keyed channel");
        }
        let socket = Arc::new(
            bind_for(self.session.peer())
                .await
                .context("binding client socket")?,
        );
        self.session.set_socket(Arc::clone(&socket));
        let reader = spawn_reader(Arc::clone(&socket), Arc::clone(&self.session));
        if let Some(old) = self.reader.lock().replace(reader) {
            old.abort();
        }
        info!(conv = self.session.conv(), local = ?socket.local_addr().ok(), "client rebound");
        Ok(())
    }

    pub fn close(&self) {
        self.session.close();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            warn!(conv = self.session.conv(), "client dropped without close");
            reader.abort();
            self.session.close();
        }
    }
}
