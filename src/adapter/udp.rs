//! UDP link transport.
//!
//! Each physical link gets a UDP socket bound to that device and
//! connected to one peer endpoint, so a unit handed to `send` egresses
//! on exactly the chosen link. A per-link pump task feeds received
//! datagrams into the shared inbound channel until the transport drops.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{InboundSender, InboundUnit, LinkProvider, LinkTransport};
use crate::error::{Error, Result};
use crate::types::IfIndex;
use crate::util::bind_udp_to_device;

const RECV_BUFFER: usize = 65536;

/// Opens device-bound UDP transports toward a fixed peer.
pub struct UdpLinkProvider {
    peer: SocketAddr,
}

impl UdpLinkProvider {
    pub fn new(peer: SocketAddr) -> Self {
        Self { peer }
    }
}

#[async_trait]
impl LinkProvider for UdpLinkProvider {
    async fn open(
        &self,
        index: IfIndex,
        name: &str,
        inbound: InboundSender,
    ) -> Result<Arc<dyn LinkTransport>> {
        let socket = bind_udp_to_device(name, self.peer.is_ipv6())?;
        socket.connect(self.peer).await.map_err(|e| Error::Transient {
            index,
            reason: format!("connect to {}: {e}", self.peer),
        })?;
        let socket = Arc::new(socket);

        let pump = spawn_pump(index, Arc::clone(&socket), inbound);
        info!(link = %name, %index, peer = %self.peer, "udp link opened");

        Ok(Arc::new(UdpLink {
            index,
            name: name.to_string(),
            socket,
            pump,
        }))
    }
}

fn spawn_pump(index: IfIndex, socket: Arc<UdpSocket>, inbound: InboundSender) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
            match socket.recv(&mut buf).await {
                Ok(len) => {
                    let unit = InboundUnit {
                        index,
                        data: buf[..len].to_vec(),
                    };
                    if inbound.send(unit).await.is_err() {
                        // Engine side is gone; nothing left to feed.
                        break;
                    }
                }
                Err(e) => {
                    debug!(%index, error = %e, "udp link receive error");
                    break;
                }
            }
        }
    })
}

struct UdpLink {
    index: IfIndex,
    name: String,
    socket: Arc<UdpSocket>,
    pump: JoinHandle<()>,
}

#[async_trait]
impl LinkTransport for UdpLink {
    fn index(&self) -> IfIndex {
        self.index
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, unit: &[u8]) -> Result<()> {
        self.socket.send(unit).await.map_err(|e| Error::Transient {
            index: self.index,
            reason: format!("send: {e}"),
        })?;
        Ok(())
    }
}

impl Drop for UdpLink {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::inbound_channel;

    // Loopback sockets stand in for device-bound ones; binding to a device
    // needs privileges the test runner does not have.
    #[tokio::test]
    async fn test_udp_link_round_trip() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let provider = UdpLinkProvider::new(peer_addr);
        let (tx, mut rx) = inbound_channel();
        let link = provider.open(IfIndex::new(1), "lo", tx).await.unwrap();

        link.send(&[1, 2, 3]).await.unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[1, 2, 3]);

        // Reply flows back through the pump tagged with the link index.
        peer.send_to(&[9, 8], from).await.unwrap();
        let unit = rx.recv().await.unwrap();
        assert_eq!(unit.index, IfIndex::new(1));
        assert_eq!(unit.data, vec![9, 8]);
    }
}
