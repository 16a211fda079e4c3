//! Application-facing handle to one connection.

use std::net::SocketAddr;
use std::sync::Arc;

use kcp_core::{Mailbox, WriteError};
use parking_lot::RwLock;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::trace;

use crate::transport::Link;
use crate::worker::Job;

/// Cheap to share. Sends stage the payload and wake the owning worker once per burst.
pub struct Session {
    id: u64,
    mailbox: Arc<Mailbox>,
    link: RwLock<Link>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        mailbox: Arc<Mailbox>,
        link: Link,
        jobs: mpsc::UnboundedSender<Job>,
    ) -> Self {
        Self {
            id,
            mailbox,
            link: RwLock::new(link),
            jobs,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn conv(&self) -> u32 {
        self.mailbox.conv()
    }

    pub fn peer(&self) -> SocketAddr {
        self.link.read().peer
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link.read().socket.local_addr().ok()
    }

    pub fn is_active(&self) -> bool {
        self.mailbox.is_active()
    }

    /// Queue one message (or a run of bytes in stream mode).
    pub fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), WriteError> {
        if self.mailbox.push_write(payload.into())? {
            self.jobs
                .send(Job::Write(self.id))
                .map_err(|_| WriteError::Inactive)?;
        }
        Ok(())
    }

    /// Ask the worker to close. `on_closed` fires once it has.
    pub fn close(&self) {
        let _ = self.jobs.send(Job::Close(self.id));
    }

    /// Stage an inbound datagram for the worker.
    pub(crate) fn deliver(&self, datagram: Vec<u8>) {
        match self.mailbox.push_read(datagram) {
            Ok(true) => {
                let _ = self.jobs.send(Job::Read(self.id));
            }
            Ok(false) => {}
            Err(e) => trace!(session = self.id, error = %e, "inbound datagram dropped"),
        }
    }

    pub(crate) fn link(&self) -> Link {
        self.link.read().clone()
    }

    pub(crate) fn set_peer(&self, peer: SocketAddr) {
        self.link.write().peer = peer;
    }

    pub(crate) fn set_socket(&self, socket: Arc<UdpSocket>) {
        self.link.write().socket = socket;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("conv", &self.conv())
            .field("peer", &self.peer())
            .finish()
    }
}
