//! In-process transport
//!
//! A `MemoryNetwork` is a shared switchboard of named endpoints joined by
//! `tokio::io::duplex` pipes. Tests and simulations use it to run several
//! nodes in one runtime with stable, human-readable link addresses.

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use std::io;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::transport::{Acceptor, BoxedStream, Transport};
use crate::types::LinkAddress;

/// Buffer size of each in-memory pipe direction
const PIPE_CAPACITY: usize = 64 * 1024;

type Incoming = (DuplexStream, LinkAddress);

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<DashMap<LinkAddress, mpsc::UnboundedSender<Incoming>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport bound to `address` on this network
    pub fn endpoint(&self, address: impl Into<LinkAddress>) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local: address.into(),
        }
    }

    pub fn is_listening(&self, address: &LinkAddress) -> bool {
        self.listeners.contains_key(address)
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    local: LinkAddress,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn bind(&self) -> io::Result<Box<dyn Acceptor>> {
        let (tx, rx) = mpsc::unbounded_channel();

        if self.network.listeners.contains_key(&self.local) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} is already listening", self.local),
            ));
        }
        self.network.listeners.insert(self.local.clone(), tx);

        Ok(Box::new(MemoryAcceptor {
            network: self.network.clone(),
            local: self.local.clone(),
            incoming: rx,
        }))
    }

    async fn dial(&self, address: &LinkAddress) -> io::Result<BoxedStream> {
        let listener = self
            .network
            .listeners
            .get(address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::ConnectionRefused, format!("{} is not listening", address))
            })?;

        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        listener
            .send((theirs, self.local.clone()))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "acceptor closed"))?;

        debug!("{} dialled {} in memory", self.local, address);
        Ok(Box::new(ours))
    }

    fn local_address(&self) -> Option<LinkAddress> {
        Some(self.local.clone())
    }
}

struct MemoryAcceptor {
    network: MemoryNetwork,
    local: LinkAddress,
    incoming: mpsc::UnboundedReceiver<Incoming>,
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&mut self) -> io::Result<(BoxedStream, LinkAddress)> {
        match self.incoming.recv().await {
            Some((stream, remote)) => Ok((Box::new(stream), remote)),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "acceptor closed")),
        }
    }
}

impl Drop for MemoryAcceptor {
    fn drop(&mut self) {
        self.network.listeners.remove(&self.local);
    }
}
