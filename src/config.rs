//! Node Configuration
//!
//! Loads and validates the settings a mesh node starts with.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::link::framing::MAX_FRAME_LEN;

/// Settings for one mesh node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Address the acceptor binds to
    pub listen_address: String,
    /// Address peers know this node by, when it differs from the bind address
    pub advertised_address: Option<String>,
    /// Peers dialled once at startup
    pub peers: Vec<String>,
    /// Where the local identity and recorded mappings persist
    pub identity_file: PathBuf,
    pub max_frame_len: usize,
    /// Broadcast ROUTE_UPDATE after each table change
    pub advertise_routes: bool,
    /// How long a relayed CHAT is remembered to catch copies travelling a loop
    pub forward_dedup_window_secs: u64,
    pub forward_dedup_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:7878".to_string(),
            advertised_address: None,
            peers: Vec::new(),
            identity_file: PathBuf::from("offline-mesh-identity.json"),
            max_frame_len: 4096,
            advertise_routes: true,
            forward_dedup_window_secs: 5,
            forward_dedup_capacity: 1024,
        }
    }
}

impl MeshConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: MeshConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn forward_dedup_window(&self) -> Duration {
        Duration::from_secs(self.forward_dedup_window_secs)
    }

    /// Apply a partial JSON patch over the current values
    pub fn update_from_json(&mut self, json: Value) -> Result<()> {
        if let Some(listen) = json.get("listen_address").and_then(|v| v.as_str()) {
            self.listen_address = listen.to_string();
        }

        if let Some(advertised) = json.get("advertised_address") {
            self.advertised_address = advertised.as_str().map(str::to_string);
        }

        if let Some(peers) = json.get("peers").and_then(|v| v.as_array()) {
            self.peers = peers
                .iter()
                .filter_map(|p| p.as_str().map(str::to_string))
                .collect();
        }

        if let Some(file) = json.get("identity_file").and_then(|v| v.as_str()) {
            self.identity_file = PathBuf::from(file);
        }

        if let Some(len) = json.get("max_frame_len").and_then(|v| v.as_u64()) {
            self.max_frame_len = len as usize;
        }

        if let Some(advertise) = json.get("advertise_routes").and_then(|v| v.as_bool()) {
            self.advertise_routes = advertise;
        }

        if let Some(window) = json.get("forward_dedup_window_secs").and_then(|v| v.as_u64()) {
            self.forward_dedup_window_secs = window;
        }

        if let Some(capacity) = json.get("forward_dedup_capacity").and_then(|v| v.as_u64()) {
            self.forward_dedup_capacity = capacity as usize;
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_address.trim().is_empty() {
            anyhow::bail!("Listen address cannot be empty");
        }

        if self.max_frame_len == 0 || self.max_frame_len > MAX_FRAME_LEN {
            anyhow::bail!("max_frame_len must be between 1 and {}", MAX_FRAME_LEN);
        }

        if self.forward_dedup_capacity == 0 {
            anyhow::bail!("forward_dedup_capacity must be greater than 0");
        }

        for peer in &self.peers {
            if peer.trim().is_empty() {
                anyhow::bail!("Peer addresses cannot be empty");
            }
        }

        Ok(())
    }
}
