//! Mesh Node
//!
//! Wires a transport, an identity store and the mesh router into one running
//! node with an explicit start/stop lifecycle.

use anyhow::{bail, Context};
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::identity_store::IdentityStore;
use crate::link::supervisor::ConnectionSupervisor;
use crate::link::transport::Transport;
use crate::mesh::router::{MeshEvent, MeshRouter};
use crate::mesh::state::{MeshSnapshot, MeshState};
use crate::types::{Identity, LinkAddress};

pub struct MeshNode {
    identity: Identity,
    supervisor: ConnectionSupervisor,
    router: MeshRouter,
    running: AtomicBool,
}

impl MeshNode {
    /// Start the router task. Must be called from within a Tokio runtime.
    /// The returned receiver carries delivered messages and link status.
    pub fn start(
        config: &MeshConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn IdentityStore>,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<MeshEvent>)> {
        config.validate()?;

        let identity = store
            .local_identity()
            .context("Failed to load local identity")?;
        if !identity.is_wire_safe() {
            bail!("Local identity {:?} cannot be sent on the wire", identity.as_str());
        }

        let (supervisor, link_events) = ConnectionSupervisor::new(transport, config.max_frame_len);
        let state = MeshState::new(identity.clone(), supervisor.local_address(), config);
        let (app_events, events) = mpsc::unbounded_channel();
        let (router, _task) = MeshRouter::spawn(state, supervisor.clone(), link_events, store, app_events);

        info!("Mesh node {} started", identity);

        let node = Self {
            identity,
            supervisor,
            router,
            running: AtomicBool::new(true),
        };
        Ok((node, events))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn local_address(&self) -> Option<LinkAddress> {
        self.supervisor.local_address()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn listen(&self) -> Result<()> {
        self.ensure_running()?;
        self.supervisor.listen().await
    }

    pub async fn dial(&self, address: &LinkAddress) -> Result<()> {
        self.ensure_running()?;
        self.supervisor.dial(address).await
    }

    pub async fn send_message(&self, target: &Identity, content: &str) -> Result<()> {
        self.ensure_running()?;
        self.router
            .send_message(target.clone(), content.to_string())
            .await
    }

    pub async fn snapshot(&self) -> Result<MeshSnapshot> {
        self.router.snapshot().await
    }

    pub async fn status(&self) -> Result<serde_json::Value> {
        let mesh = self.snapshot().await?;

        Ok(serde_json::json!({
            "identity": self.identity,
            "is_running": self.is_running(),
            "links": self.supervisor.statistics(),
            "mesh": mesh,
        }))
    }

    /// Close the acceptor, every link and the router. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!("Stopping mesh node {}", self.identity);
        self.router.shutdown();
        self.supervisor.stop();
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(MeshError::Stopped)
        }
    }
}

impl Drop for MeshNode {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity_store::MemoryIdentityStore;
    use crate::link::memory::MemoryNetwork;

    fn node(network: &MemoryNetwork, address: &str, identity: &str) -> (MeshNode, mpsc::UnboundedReceiver<MeshEvent>) {
        MeshNode::start(
            &MeshConfig::default(),
            Arc::new(network.endpoint(address)),
            Arc::new(MemoryIdentityStore::with_identity(identity)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_rejects_unsafe_identity() {
        let network = MemoryNetwork::new();
        let result = MeshNode::start(
            &MeshConfig::default(),
            Arc::new(network.endpoint("A")),
            Arc::new(MemoryIdentityStore::with_identity("bad|name")),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_status_reports_identity_and_links() {
        let network = MemoryNetwork::new();
        let (node, _events) = node(&network, "A", "devA");
        node.listen().await.unwrap();

        let status = node.status().await.unwrap();
        assert_eq!(status["identity"], "devA");
        assert_eq!(status["is_running"], true);
        assert_eq!(status["links"]["listening"], true);
        assert_eq!(status["mesh"]["local_address"], "A");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_refuses_work() {
        let network = MemoryNetwork::new();
        let (node, _events) = node(&network, "A", "devA");
        node.listen().await.unwrap();

        node.stop();
        node.stop();
        assert!(!node.is_running());
        assert!(matches!(node.dial(&"B".into()).await, Err(MeshError::Stopped)));
        assert!(matches!(
            node.send_message(&"devB".into(), "hi").await,
            Err(MeshError::Stopped)
        ));
    }
}
