//! In-memory adapter and link transports.
//!
//! Channel-backed implementations of the boundary traits. Tests drive
//! the engine through these, and `run` falls back to them when no peer
//! endpoint is configured. Links record what they were asked to send
//! and can be scripted to fail.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{InboundSender, InboundUnit, LinkProvider, LinkTransport, VirtualAdapter};
use crate::error::{Error, Result};
use crate::types::IfIndex;

/// Application-side handle for a [`ChannelAdapter`] pair.
pub struct AdapterHandle {
    outbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: mpsc::Receiver<Vec<u8>>,
}

impl AdapterHandle {
    /// Feed one outbound unit into the engine.
    pub async fn send_outbound(&self, unit: Vec<u8>) -> Result<()> {
        self.outbound_tx
            .send(unit)
            .await
            .map_err(|_| Error::Adapter("engine side closed".into()))
    }

    /// Wait for the next unit the engine delivered inbound.
    pub async fn recv_inbound(&mut self) -> Option<Vec<u8>> {
        self.inbound_rx.recv().await
    }

    /// Non-blocking check for a delivered unit.
    pub fn try_recv_inbound(&mut self) -> Option<Vec<u8>> {
        self.inbound_rx.try_recv().ok()
    }
}

/// Channel-backed virtual adapter.
pub struct ChannelAdapter {
    name: String,
    mtu: u16,
    outbound_rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    closed: AtomicBool,
}

impl ChannelAdapter {
    /// Create an adapter and the application-side handle feeding it.
    pub fn pair(name: &str, mtu: u16) -> (Arc<Self>, AdapterHandle) {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let adapter = Arc::new(Self {
            name: name.to_string(),
            mtu,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
            inbound_tx,
            closed: AtomicBool::new(false),
        });
        let handle = AdapterHandle {
            outbound_tx,
            inbound_rx,
        };
        (adapter, handle)
    }
}

#[async_trait]
impl VirtualAdapter for ChannelAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn open(&self) -> Result<()> {
        self.closed.store(false, Ordering::Release);
        Ok(())
    }

    async fn next_outbound(&self) -> Result<Option<Vec<u8>>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(self.outbound_rx.lock().await.recv().await)
    }

    async fn deliver_inbound(&self, unit: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Adapter("adapter closed".into()));
        }
        self.inbound_tx
            .send(unit)
            .await
            .map_err(|_| Error::Adapter("application side closed".into()))
    }

    // The flag rather than the channel closes, so a stopped engine can
    // reopen the same adapter on restart.
    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// One scriptable in-memory link.
pub struct MemoryLink {
    index: IfIndex,
    name: String,
    inbound: InboundSender,
    sent: Mutex<Vec<Vec<u8>>>,
    fail_next: AtomicUsize,
    dead: AtomicBool,
}

impl MemoryLink {
    /// Units this link was asked to send, oldest first.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    /// Fail the next `n` sends with a transient error.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// A dead link rejects every send as unavailable.
    pub fn set_dead(&self, dead: bool) {
        self.dead.store(dead, Ordering::SeqCst);
    }

    /// Push a unit up as if it arrived from the wire on this link.
    pub async fn inject_inbound(&self, data: Vec<u8>) -> Result<()> {
        self.inbound
            .send(InboundUnit {
                index: self.index,
                data,
            })
            .await
            .map_err(|_| Error::Adapter("inbound channel closed".into()))
    }
}

#[async_trait]
impl LinkTransport for MemoryLink {
    fn index(&self) -> IfIndex {
        self.index
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, unit: &[u8]) -> Result<()> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(Error::LinkUnavailable(self.index));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Transient {
                index: self.index,
                reason: "scripted send failure".into(),
            });
        }
        self.sent.lock().push(unit.to_vec());
        Ok(())
    }
}

/// Link provider that opens [`MemoryLink`]s and keeps handles to them.
#[derive(Default)]
pub struct MemoryLinks {
    links: DashMap<IfIndex, Arc<MemoryLink>>,
    open_failures: Mutex<VecDeque<String>>,
}

impl MemoryLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to an opened link, for scripting and assertions.
    pub fn link(&self, index: IfIndex) -> Option<Arc<MemoryLink>> {
        self.links.get(&index).map(|e| Arc::clone(e.value()))
    }

    pub fn sent_count(&self, index: IfIndex) -> usize {
        self.link(index).map_or(0, |l| l.sent_count())
    }

    pub fn total_sent(&self) -> usize {
        self.links.iter().map(|e| e.value().sent_count()).sum()
    }

    /// Make the next `open` call fail with the given reason.
    pub fn fail_next_open(&self, reason: &str) {
        self.open_failures.lock().push_back(reason.to_string());
    }
}

#[async_trait]
impl LinkProvider for MemoryLinks {
    async fn open(
        &self,
        index: IfIndex,
        name: &str,
        inbound: InboundSender,
    ) -> Result<Arc<dyn LinkTransport>> {
        if let Some(reason) = self.open_failures.lock().pop_front() {
            return Err(Error::Adapter(reason));
        }

        let link = Arc::new(MemoryLink {
            index,
            name: name.to_string(),
            inbound,
            sent: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            dead: AtomicBool::new(false),
        });
        self.links.insert(index, Arc::clone(&link));
        Ok(link)
    }
}
