//! Connection Supervisor
//!
//! Single entry point for becoming reachable (listen) and for reaching a
//! specific peer (dial). Owns the registry of live links keyed by peer link
//! address and turns raw accept/connect outcomes into `LinkEvent`s.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::connection::LinkConnection;
use super::framing::read_frame;
use super::transport::{BoxedStream, Transport};
use crate::error::{MeshError, Result};
use crate::types::LinkAddress;

/// Line-level events handed to the mesh router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Established(LinkAddress),
    Lost(LinkAddress),
    Received { from: LinkAddress, payload: Vec<u8> },
    DialFailed { address: LinkAddress, reason: String },
    ListenFailed(String),
}

#[derive(Clone)]
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    links: Arc<DashMap<LinkAddress, Arc<LinkConnection>>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    acceptor: Arc<Mutex<Option<JoinHandle<()>>>>,
    next_link_id: Arc<AtomicU64>,
    max_frame_len: usize,
}

impl ConnectionSupervisor {
    pub fn new(
        transport: Arc<dyn Transport>,
        max_frame_len: usize,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();

        let supervisor = Self {
            transport,
            links: Arc::new(DashMap::new()),
            events,
            acceptor: Arc::new(Mutex::new(None)),
            next_link_id: Arc::new(AtomicU64::new(1)),
            max_frame_len,
        };

        (supervisor, rx)
    }

    pub fn local_address(&self) -> Option<LinkAddress> {
        self.transport.local_address()
    }

    /// Open the long-lived acceptor. Accept failures end it with a
    /// `ListenFailed` event; restarting is left to the caller.
    pub async fn listen(&self) -> Result<()> {
        if self.is_listening() {
            debug!("Acceptor already running");
            return Ok(());
        }

        let mut acceptor = match self.transport.bind().await {
            Ok(acceptor) => acceptor,
            Err(e) => {
                let reason = e.to_string();
                error!("Failed to open acceptor: {}", reason);
                self.emit(LinkEvent::ListenFailed(reason.clone()));
                return Err(MeshError::ListenFailed(reason));
            }
        };

        let supervisor = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match acceptor.accept().await {
                    Ok((stream, address)) => {
                        info!("Accepted link from {}", address);
                        supervisor.register(address, stream);
                    }
                    Err(e) => {
                        error!("Acceptor failed: {}", e);
                        supervisor.emit(LinkEvent::ListenFailed(e.to_string()));
                        break;
                    }
                }
            }
        });

        let previous = self.acceptor.lock().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }

        info!("Listening for links");
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.acceptor
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// One outbound attempt; no retry, no backoff.
    pub async fn dial(&self, address: &LinkAddress) -> Result<()> {
        debug!("Dialling {}", address);

        match self.transport.dial(address).await {
            Ok(stream) => {
                info!("Dialled link to {}", address);
                self.register(address.clone(), stream);
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("Dial to {} failed: {}", address, reason);
                self.emit(LinkEvent::DialFailed {
                    address: address.clone(),
                    reason: reason.clone(),
                });
                Err(MeshError::DialFailed {
                    address: address.clone(),
                    reason,
                })
            }
        }
    }

    /// Queue one frame on the link for `address`. Never waits on the peer; a
    /// link whose queue is full or whose writer has died is torn down.
    pub fn send(&self, address: &LinkAddress, payload: &[u8]) -> Result<()> {
        if payload.len() > self.max_frame_len {
            return Err(MeshError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_len,
            });
        }

        let link = self
            .links
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MeshError::NotConnected(address.clone()))?;

        match link.enqueue(payload.to_vec()) {
            Ok(()) => {
                debug!("Queued {} bytes for {}", payload.len(), address);
                Ok(())
            }
            Err(source) => {
                warn!("Write to {} failed: {}", address, source);
                self.retire(&link);
                Err(MeshError::WriteFailed {
                    address: address.clone(),
                    source,
                })
            }
        }
    }

    /// Queue on every live link; one failing link does not stop the others.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let addresses = self.connected_addresses();

        let mut delivered = 0;
        for address in &addresses {
            match self.send(address, payload) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Broadcast to {} failed: {}", address, e),
            }
        }

        debug!("Broadcast {} bytes to {}/{} links", payload.len(), delivered, addresses.len());
        delivered
    }

    /// Close the acceptor and every live link. Idempotent.
    pub fn stop(&self) {
        if let Some(handle) = self.acceptor.lock().take() {
            handle.abort();
            info!("Acceptor stopped");
        }

        let links: Vec<Arc<LinkConnection>> =
            self.links.iter().map(|entry| entry.value().clone()).collect();
        self.links.clear();

        for link in links {
            link.close();
        }
    }

    pub fn connected_addresses(&self) -> Vec<LinkAddress> {
        let mut addresses: Vec<_> = self.links.iter().map(|entry| entry.key().clone()).collect();
        addresses.sort();
        addresses
    }

    pub fn is_connected(&self, address: &LinkAddress) -> bool {
        self.links.contains_key(address)
    }

    pub fn link(&self, address: &LinkAddress) -> Option<Arc<LinkConnection>> {
        self.links.get(address).map(|entry| entry.value().clone())
    }

    pub fn statistics(&self) -> serde_json::Value {
        let links: Vec<_> = self.links.iter().map(|entry| entry.value().statistics()).collect();

        serde_json::json!({
            "listening": self.is_listening(),
            "local_address": self.local_address(),
            "links": links,
            "link_count": self.links.len(),
        })
    }

    /// Wrap a fresh stream as a link, supersede any previous link for the
    /// same address, start its reader and writer and announce it.
    fn register(&self, address: LinkAddress, stream: BoxedStream) {
        let (reader, writer) = tokio::io::split(stream);
        let id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        let (link, queue) = LinkConnection::new(id, address.clone());
        let link = Arc::new(link);
        link.mark_connected();

        // Events are emitted under the entry guard so that Established and
        // Lost for one address reach the router in registry order.
        match self.links.entry(address.clone()) {
            Entry::Occupied(mut entry) => {
                let previous = entry.insert(link.clone());
                info!("Link #{} to {} supersedes #{}", id, address, previous.id());
                previous.close();
                self.emit(LinkEvent::Established(address));
            }
            Entry::Vacant(entry) => {
                let _held = entry.insert(link.clone());
                self.emit(LinkEvent::Established(address));
            }
        }

        let supervisor = self.clone();
        let writer_link = link.clone();
        tokio::spawn(async move {
            if let Err(e) = writer_link.write_loop(writer, queue).await {
                warn!("Write to {} failed: {}", writer_link.address(), e);
                supervisor.retire(&writer_link);
            }
        });

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.read_loop(link, reader).await;
        });
    }

    async fn read_loop(&self, link: Arc<LinkConnection>, mut reader: tokio::io::ReadHalf<BoxedStream>) {
        let address = link.address().clone();

        loop {
            tokio::select! {
                _ = link.closed() => {
                    debug!("Reader for {} (#{}) stopped", address, link.id());
                    break;
                }
                frame = read_frame(&mut reader, self.max_frame_len) => {
                    match frame {
                        Ok(Some(payload)) => {
                            link.record_received();
                            self.emit(LinkEvent::Received { from: address.clone(), payload });
                        }
                        Ok(None) => {
                            info!("Link to {} closed by peer", address);
                            break;
                        }
                        Err(e) => {
                            warn!("Link to {} failed: {}", address, e);
                            break;
                        }
                    }
                }
            }
        }

        self.retire(&link);
    }

    /// Tear a link down: close it, drop its registry entry if it still owns
    /// it, and emit `Lost` exactly once.
    fn retire(&self, link: &Arc<LinkConnection>) {
        link.close();

        if let Entry::Occupied(entry) = self.links.entry(link.address().clone()) {
            if entry.get().id() == link.id() {
                info!("Link to {} lost", link.address());
                self.emit(LinkEvent::Lost(link.address().clone()));
                entry.remove();
            }
        }
    }

    fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            debug!("Link event dropped; router is gone");
        }
    }
}
