//! Mesh Routing Module
//!
//! Identity exchange, topology advertisement and hop-by-hop CHAT forwarding
//! on top of the link layer.

pub mod forward_cache;
pub mod identity;
pub mod protocol;
pub mod router;
pub mod routing;
pub mod state;

pub use identity::IdentityRegistry;
pub use protocol::WireMessage;
pub use router::{LinkStatus, MeshEvent, MeshRouter};
pub use routing::RoutingTable;
pub use state::{MeshSnapshot, MeshState, ReceivedMessage};
