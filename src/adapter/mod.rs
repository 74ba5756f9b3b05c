//! Boundary traits for the virtual adapter and the physical links.
//!
//! The engine never touches OS packet primitives directly. It pulls
//! outbound units from a [`VirtualAdapter`], pushes inbound units back
//! through it, and sends on a per-link [`LinkTransport`] capability
//! opened through a [`LinkProvider`]. Inbound traffic from every link
//! funnels into one channel, tagged with the link it arrived on.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::IfIndex;

pub mod memory;
pub mod udp;

pub use memory::{AdapterHandle, ChannelAdapter, MemoryLinks};
pub use udp::UdpLinkProvider;

/// One unit of traffic received from a physical link.
#[derive(Debug, Clone)]
pub struct InboundUnit {
    pub index: IfIndex,
    pub data: Vec<u8>,
}

pub type InboundSender = mpsc::Sender<InboundUnit>;
pub type InboundReceiver = mpsc::Receiver<InboundUnit>;

/// Queue depth of the shared inbound channel.
pub const INBOUND_QUEUE: usize = 1024;

/// The single logical interface applications see.
#[async_trait]
pub trait VirtualAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn mtu(&self) -> u16;

    /// Acquire the adapter. Called once per engine start; a failure here
    /// is a startup failure, not a per-unit error.
    async fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Next outbound unit from the application side. `None` means the
    /// adapter is closed and no more traffic will come.
    async fn next_outbound(&self) -> Result<Option<Vec<u8>>>;

    /// Deliver an inbound unit to the application side.
    async fn deliver_inbound(&self, unit: Vec<u8>) -> Result<()>;

    /// Stop accepting traffic in either direction.
    async fn close(&self) -> Result<()>;
}

/// Send capability for one physical link.
///
/// `send` reports transport failures as [`crate::Error::Transient`] for
/// this link; the caller applies the bounded timeout and owns retries.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    fn index(&self) -> IfIndex;

    fn name(&self) -> &str;

    async fn send(&self, unit: &[u8]) -> Result<()>;
}

/// Opens the send/receive capability for a discovered link.
///
/// Implementations deliver that link's inbound traffic through the
/// provided sender for as long as the returned transport is alive.
#[async_trait]
pub trait LinkProvider: Send + Sync {
    async fn open(
        &self,
        index: IfIndex,
        name: &str,
        inbound: InboundSender,
    ) -> Result<Arc<dyn LinkTransport>>;
}

/// Build the shared inbound channel at its standard depth.
pub fn inbound_channel() -> (InboundSender, InboundReceiver) {
    mpsc::channel(INBOUND_QUEUE)
}
