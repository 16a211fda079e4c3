//! UDP server: one receive loop that maps each datagram to its session and hands it
//! to the owning worker. Unknown keys open a new connection.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use kcp_core::fec::is_parity_shard;
use kcp_core::integrity::{self, CHECKSUM_LEN};
use kcp_core::session::read_conv;
use kcp_core::{ChannelConfig, Connection, SessionKey, Strategy};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::listener::Listener;
use crate::session::Session;
use crate::transport::{Link, RECV_BUF};
use crate::worker::{Registration, SessionTable, WorkerPool};

pub struct Server {
    socket: Arc<UdpSocket>,
    config: ChannelConfig,
    pool: Arc<WorkerPool>,
    listener: Arc<dyn Listener>,
    table: Arc<SessionTable>,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        config: ChannelConfig,
        pool: Arc<WorkerPool>,
        listener: Arc<dyn Listener>,
    ) -> anyhow::Result<Self> {
        config.validate().context("invalid channel config")?;
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        let strategy = if config.use_conv_channel {
            Strategy::Conv {
                offset: config.conv_offset(),
            }
        } else {
            Strategy::Address
        };
        info!(addr = %socket.local_addr()?, ?strategy, "server listening");
        Ok(Self {
            socket: Arc::new(socket),
            config,
            pool,
            listener,
            table: Arc::new(SessionTable::new(strategy)),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Live sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.table.snapshot().into_iter().map(|(_, s)| s).collect()
    }

    /// Receive until `shutdown` resolves, then close every session.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        let mut buf = vec![0u8; RECV_BUF];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((n, from)) => self.on_datagram(&buf[..n], from),
                    // ICMP errors from earlier sends surface here; keep serving
                    Err(e) => warn!(error = %e, "recv_from failed"),
                },
                _ = &mut shutdown => break,
            }
        }
        self.close_all();
        Ok(())
    }

    /// Route one inbound datagram. With CRC on, only a sealed datagram may open a
    /// session or move a conv-keyed session to a new address.
    pub fn on_datagram(&self, datagram: &[u8], from: SocketAddr) {
        if self.config.crc32_check && integrity::open(datagram).is_err() {
            trace!(%from, "bad checksum, dropped");
            return;
        }
        let conv_keyed = matches!(self.table.strategy(), Strategy::Conv { .. });
        if conv_keyed && self.is_parity(datagram) {
            trace!(%from, "parity shard has no conv, dropped");
            return;
        }
        let Some(key) = self.table.key_for(datagram, from) else {
            trace!(%from, len = datagram.len(), "datagram too short for a session key");
            return;
        };
        let session = match self.table.get_key(&key) {
            Some(session) => {
                if conv_keyed && session.peer() != from {
                    debug!(session = session.id(), old = %session.peer(), new = %from, "peer address changed");
                    session.set_peer(from);
                }
                session
            }
            None => match self.accept(key, datagram, from) {
                Some(session) => session,
                None => return,
            },
        };
        session.deliver(datagram.to_vec());
    }

    fn is_parity(&self, datagram: &[u8]) -> bool {
        if self.config.fec_data_shards == 0 {
            return false;
        }
        let skip = if self.config.crc32_check { CHECKSUM_LEN } else { 0 };
        datagram.get(skip..).is_some_and(is_parity_shard)
    }

    fn accept(&self, key: SessionKey, datagram: &[u8], from: SocketAddr) -> Option<Arc<Session>> {
        if self.is_parity(datagram) {
            trace!(%from, "parity shard for unknown session, dropped");
            return None;
        }
        let conv = match key {
            SessionKey::Conv(conv) => conv,
            SessionKey::Addr(_) => read_conv(datagram, self.config.conv_offset())?,
        };
        let conn = match Connection::new(conv, &self.config, self.pool.now_ms()) {
            Ok(conn) => conn,
            Err(e) => {
                warn!(conv, error = %e, "cannot open connection");
                return None;
            }
        };
        let link = Link {
            socket: Arc::clone(&self.socket),
            peer: from,
        };
        let registration = Registration {
            table: Arc::clone(&self.table),
            key,
        };
        let session = self
            .pool
            .open(conn, link, Arc::clone(&self.listener), Some(registration));
        self.table.register(key, Arc::clone(&session));
        Some(session)
    }

    /// Ask every session to close.
    pub fn close_all(&self) {
        for (_, session) in self.table.snapshot() {
            session.close();
        }
    }
}
