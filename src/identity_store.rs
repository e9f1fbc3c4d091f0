//! Identity Store
//!
//! External collaborator that owns the local device identity and remembers
//! which identity was last seen behind which link address. The mesh core only
//! consumes this interface.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::types::{Identity, LinkAddress};

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// The local identity, created and persisted on first call. Runs once at
    /// node start, before any task exists.
    fn local_identity(&self) -> Result<Identity>;

    /// Called from the router task, so implementations must not block
    async fn record_mapping(&self, address: &LinkAddress, identity: &Identity) -> Result<()>;
}

fn generate_identity() -> Identity {
    Identity::new(Uuid::new_v4().to_string())
}

/// Volatile store, mainly for tests and simulations
#[derive(Default)]
pub struct MemoryIdentityStore {
    local: Mutex<Option<Identity>>,
    mappings: Mutex<BTreeMap<LinkAddress, Identity>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(identity: impl Into<Identity>) -> Self {
        Self {
            local: Mutex::new(Some(identity.into())),
            mappings: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn mapping(&self, address: &LinkAddress) -> Option<Identity> {
        self.mappings.lock().get(address).cloned()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    fn local_identity(&self) -> Result<Identity> {
        Ok(self.local.lock().get_or_insert_with(generate_identity).clone())
    }

    async fn record_mapping(&self, address: &LinkAddress, identity: &Identity) -> Result<()> {
        self.mappings.lock().insert(address.clone(), identity.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredIdentities {
    device_id: Option<Identity>,
    #[serde(default)]
    mappings: BTreeMap<LinkAddress, Identity>,
}

/// JSON-file backed store; the identity survives restarts while the file does
pub struct FileIdentityStore {
    path: PathBuf,
    state: Mutex<StoredIdentities>,
    /// Serializes async saves so the newest state is the last one written
    writes: tokio::sync::Mutex<()>,
}

impl FileIdentityStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read identity file {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse identity file {}", path.display()))?
        } else {
            StoredIdentities::default()
        };

        debug!("Opened identity store at {}", path.display());

        Ok(Self {
            path,
            state: Mutex::new(state),
            writes: tokio::sync::Mutex::new(()),
        })
    }

    pub fn mapping(&self, address: &LinkAddress) -> Option<Identity> {
        self.state.lock().mappings.get(address).cloned()
    }

    fn save(&self, state: &StoredIdentities) -> Result<()> {
        let json = serde_json::to_string_pretty(state).context("Failed to serialize identities")?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write identity file {}", self.path.display()))
    }

    async fn save_async(&self) -> Result<()> {
        let _turn = self.writes.lock().await;

        let json = {
            let state = self.state.lock();
            serde_json::to_string_pretty(&*state).context("Failed to serialize identities")?
        };

        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("Failed to write identity file {}", self.path.display()))
    }
}

#[async_trait]
impl IdentityStore for FileIdentityStore {
    fn local_identity(&self) -> Result<Identity> {
        let mut state = self.state.lock();

        if let Some(identity) = &state.device_id {
            return Ok(identity.clone());
        }

        let identity = generate_identity();
        state.device_id = Some(identity.clone());
        self.save(&state)?;

        info!("Created local identity {}", identity);
        Ok(identity)
    }

    async fn record_mapping(&self, address: &LinkAddress, identity: &Identity) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.mappings.get(address) == Some(identity) {
                return Ok(());
            }
            state.mappings.insert(address.clone(), identity.clone());
        }

        debug!("Recording {} at {}", identity, address);
        self.save_async().await
    }
}
