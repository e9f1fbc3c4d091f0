//! Offline Mesh - connection and routing engine for short-range radio meshes
//!
//! Devices hold direct links to their neighbours, learn each other's stable
//! identities, and forward text messages hop by hop to identities that are
//! out of direct range.

pub mod config;
pub mod error;
pub mod identity_store;
pub mod link;
pub mod mesh;
pub mod node;
pub mod types;

pub use config::MeshConfig;
pub use error::{MeshError, Result};
pub use identity_store::{FileIdentityStore, IdentityStore, MemoryIdentityStore};
pub use mesh::{LinkStatus, MeshEvent, MeshSnapshot, ReceivedMessage};
pub use node::MeshNode;
pub use types::{Identity, LinkAddress};
