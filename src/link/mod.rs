//! Link Layer
//!
//! Length-prefixed byte streams to directly connected peers and the
//! supervisor that owns them.

pub mod connection;
pub mod framing;
pub mod memory;
pub mod supervisor;
pub mod transport;

pub use connection::{LinkConnection, LinkState};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use supervisor::{ConnectionSupervisor, LinkEvent};
pub use transport::{Transport, TcpTransport};
