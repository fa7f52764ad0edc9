use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{trace, warn};

/// Where finished FDT packets leave the process. Every wire packet - data,
///  ACK, NAK, handshake - is serialized into one datagram and handed to this
///  trait, so tests can swap the socket for a mock and assert on exact wire
///  bytes per destination.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    /// ship one serialized packet; must not fail the caller - loss recovery
    ///  is the reliability loop's job, not the channel's
    async fn send_datagram(&self, peer: SocketAddr, wire_bytes: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, peer: SocketAddr, wire_bytes: &[u8]) {
        trace!("{} wire bytes out to {:?}", wire_bytes.len(), peer);

        // a send error counts as one more lost datagram: the ACK/NAK
        //  machinery retransmits whatever mattered
        if let Err(e) = self.send_to(wire_bytes, peer).await {
            warn!("datagram to {:?} failed on the socket: {}", peer, e);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("bound socket must know its own address")
    }
}

/// The one place all outgoing datagrams of an endpoint pass through.
#[derive(Clone)]
pub struct SendPipeline {
    socket: Arc<dyn SendSocket>,
}

impl SendPipeline {
    pub fn new(socket: Arc<dyn SendSocket>) -> SendPipeline {
        SendPipeline { socket }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub async fn send_packet(&self, to: SocketAddr, packet_buf: &[u8]) {
        self.socket.send_datagram(to, packet_buf).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use tokio::runtime::Builder;

    #[test]
    fn test_send_packet_forwards_to_socket() {
        let mut socket = MockSendSocket::new();
        socket.expect_send_datagram()
            .once()
            .with(
                eq(SocketAddr::from(([10, 0, 0, 1], 9000))),
                eq(&b"payload"[..]),
            )
            .return_const(());

        let pipeline = SendPipeline::new(Arc::new(socket));

        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            pipeline.send_packet(SocketAddr::from(([10, 0, 0, 1], 9000)), b"payload").await;
        });
    }

    #[test]
    fn test_local_addr_passthrough() {
        let mut socket = MockSendSocket::new();
        socket.expect_local_addr()
            .return_const(SocketAddr::from(([127, 0, 0, 1], 7)));

        let pipeline = SendPipeline::new(Arc::new(socket));
        assert_eq!(pipeline.local_addr(), SocketAddr::from(([127, 0, 0, 1], 7)));
    }
}
