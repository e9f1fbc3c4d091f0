//! Mesh Error Taxonomy
//!
//! Nothing here is fatal to the process: every variant degrades to a logged
//! event plus local state cleanup.

use std::io;
use thiserror::Error;

use crate::types::{Identity, LinkAddress};

pub type Result<T> = std::result::Result<T, MeshError>;

#[derive(Debug, Error)]
pub enum MeshError {
    /// No live link for the requested address; the caller may dial first
    #[error("not connected to {0}")]
    NotConnected(LinkAddress),

    /// Write on a live link failed; the link has been torn down
    #[error("write to {address} failed: {source}")]
    WriteFailed {
        address: LinkAddress,
        #[source]
        source: io::Error,
    },

    #[error("dial to {address} failed: {reason}")]
    DialFailed { address: LinkAddress, reason: String },

    #[error("listener failed: {0}")]
    ListenFailed(String),

    #[error("link to {0} lost")]
    LinkLost(LinkAddress),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("no route to {0}")]
    RouteMiss(LinkAddress),

    #[error("no link address known for identity {0}")]
    IdentityMiss(Identity),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    /// A name or payload contains characters reserved by the wire format
    #[error("invalid wire token: {0:?}")]
    InvalidToken(String),

    #[error("mesh router has stopped")]
    Stopped,
}

impl MeshError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        MeshError::MalformedMessage(reason.into())
    }

    /// Short label used in status notifications and logs
    pub fn kind(&self) -> &'static str {
        match self {
            MeshError::NotConnected(_) => "not_connected",
            MeshError::WriteFailed { .. } => "write_failed",
            MeshError::DialFailed { .. } => "dial_failed",
            MeshError::ListenFailed(_) => "listen_failed",
            MeshError::LinkLost(_) => "link_lost",
            MeshError::MalformedMessage(_) => "malformed_message",
            MeshError::RouteMiss(_) => "route_miss",
            MeshError::IdentityMiss(_) => "identity_miss",
            MeshError::FrameTooLarge { .. } => "frame_too_large",
            MeshError::InvalidToken(_) => "invalid_token",
            MeshError::Stopped => "stopped",
        }
    }
}
