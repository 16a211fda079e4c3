//! UDP side of a session: the socket it sends through and where it sends to.

use std::net::SocketAddr;
use std::sync::Arc;

use kcp_core::Output;
use tokio::net::UdpSocket;
use tracing::trace;

/// Largest datagram read off a socket.
pub const RECV_BUF: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct Link {
    pub socket: Arc<UdpSocket>,
    pub peer: SocketAddr,
}

/// Output sink writing each flushed datagram straight to the socket.
/// A full socket buffer drops the datagram; retransmission covers it.
pub struct UdpOutput<'a> {
    link: &'a Link,
}

impl<'a> UdpOutput<'a> {
    pub fn new(link: &'a Link) -> Self {
        Self { link }
    }
}

impl Output for UdpOutput<'_> {
    fn output(&mut self, data: &[u8]) {
        if let Err(e) = self.link.socket.try_send_to(data, self.link.peer) {
            trace!(peer = %self.link.peer, len = data.len(), error = %e, "datagram not sent");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn output_reaches_peer() {
        let rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let link = Link {
            socket: Arc::new(tx),
            peer: rx.local_addr().unwrap(),
        };
        UdpOutput::new(&link).output(b"datagram");
        let mut buf = [0u8; 64];
        let (n, from) = rx.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram");
        assert_eq!(from, link.socket.local_addr().unwrap());
    }
}
