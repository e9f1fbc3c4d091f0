//! Mesh Wire Protocol
//!
//! `|`-delimited ASCII messages, one per frame:
//!
//! ```text
//! HELLO|<identity>
//! DEVICE_INFO|<identity>|<address[=identity],...>
//! ROUTE_UPDATE|<identity>|<dest>next,dest>next,...>
//! CHAT|<sender>|<target>|<content>
//! ```
//!
//! Every field is parsed individually. CHAT content is the remainder of the
//! frame and may itself contain `|`.

use serde::Serialize;
use std::fmt;

use crate::error::{MeshError, Result};
use crate::types::{Identity, LinkAddress};

pub const KIND_HELLO: &str = "HELLO";
pub const KIND_DEVICE_INFO: &str = "DEVICE_INFO";
pub const KIND_ROUTE_UPDATE: &str = "ROUTE_UPDATE";
pub const KIND_CHAT: &str = "CHAT";

/// One entry of a DEVICE_INFO known-device list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnownDevice {
    pub address: LinkAddress,
    /// Identity the advertiser has bound to this address, if any
    pub identity: Option<Identity>,
}

impl KnownDevice {
    pub fn new(address: impl Into<LinkAddress>) -> Self {
        Self {
            address: address.into(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<Identity>) -> Self {
        self.identity = Some(identity.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Hello {
        identity: Identity,
    },
    DeviceInfo {
        identity: Identity,
        known: Vec<KnownDevice>,
    },
    RouteUpdate {
        identity: Identity,
        routes: Vec<(LinkAddress, LinkAddress)>,
    },
    Chat {
        sender: Identity,
        target: Identity,
        content: String,
    },
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Hello { .. } => KIND_HELLO,
            WireMessage::DeviceInfo { .. } => KIND_DEVICE_INFO,
            WireMessage::RouteUpdate { .. } => KIND_ROUTE_UPDATE,
            WireMessage::Chat { .. } => KIND_CHAT,
        }
    }

    /// Identity of the device that produced this message
    pub fn sender(&self) -> &Identity {
        match self {
            WireMessage::Hello { identity }
            | WireMessage::DeviceInfo { identity, .. }
            | WireMessage::RouteUpdate { identity, .. } => identity,
            WireMessage::Chat { sender, .. } => sender,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| MeshError::malformed("frame is not valid UTF-8"))?;
        Self::parse(text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let (kind, rest) = text
            .split_once('|')
            .ok_or_else(|| MeshError::malformed(format!("missing fields in {:?}", text)))?;

        match kind {
            KIND_HELLO => {
                let [identity] = fields::<1>(kind, rest)?;
                Ok(WireMessage::Hello {
                    identity: identity_token(identity)?,
                })
            }
            KIND_DEVICE_INFO => {
                let [identity, list] = fields::<2>(kind, rest)?;
                Ok(WireMessage::DeviceInfo {
                    identity: identity_token(identity)?,
                    known: parse_known_list(list)?,
                })
            }
            KIND_ROUTE_UPDATE => {
                let [identity, list] = fields::<2>(kind, rest)?;
                Ok(WireMessage::RouteUpdate {
                    identity: identity_token(identity)?,
                    routes: parse_route_list(list)?,
                })
            }
            KIND_CHAT => {
                let mut parts = rest.splitn(3, '|');
                let (sender, target, content) = match (parts.next(), parts.next(), parts.next()) {
                    (Some(sender), Some(target), Some(content)) => (sender, target, content),
                    _ => {
                        return Err(MeshError::malformed(format!(
                            "CHAT expects 3 fields, got {:?}",
                            rest
                        )))
                    }
                };

                Ok(WireMessage::Chat {
                    sender: identity_token(sender)?,
                    target: identity_token(target)?,
                    content: content.to_string(),
                })
            }
            other => Err(MeshError::malformed(format!("unknown message kind {:?}", other))),
        }
    }

    pub fn hello(identity: &Identity) -> Self {
        WireMessage::Hello {
            identity: identity.clone(),
        }
    }

    pub fn chat(sender: &Identity, target: &Identity, content: impl Into<String>) -> Self {
        WireMessage::Chat {
            sender: sender.clone(),
            target: target.clone(),
            content: content.into(),
        }
    }
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireMessage::Hello { identity } => write!(f, "{}|{}", KIND_HELLO, identity),
            WireMessage::DeviceInfo { identity, known } => {
                write!(f, "{}|{}|", KIND_DEVICE_INFO, identity)?;
                for (i, device) in known.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", device.address)?;
                    if let Some(identity) = &device.identity {
                        write!(f, "={}", identity)?;
                    }
                }
                Ok(())
            }
            WireMessage::RouteUpdate { identity, routes } => {
                write!(f, "{}|{}|", KIND_ROUTE_UPDATE, identity)?;
                for (i, (dest, next_hop)) in routes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}>{}", dest, next_hop)?;
                }
                Ok(())
            }
            WireMessage::Chat {
                sender,
                target,
                content,
            } => write!(f, "{}|{}|{}|{}", KIND_CHAT, sender, target, content),
        }
    }
}

/// Split the part after the kind into exactly `N` fields
fn fields<'a, const N: usize>(kind: &str, rest: &'a str) -> Result<[&'a str; N]> {
    let parts: Vec<&str> = rest.split('|').collect();
    <[&str; N]>::try_from(parts.as_slice()).map_err(|_| {
        MeshError::malformed(format!(
            "{} expects {} fields, got {}",
            kind,
            N,
            parts.len()
        ))
    })
}

fn identity_token(token: &str) -> Result<Identity> {
    let identity = Identity::from(token);
    if identity.is_wire_safe() {
        Ok(identity)
    } else {
        Err(MeshError::malformed(format!("bad identity {:?}", token)))
    }
}

fn address_token(token: &str) -> Result<LinkAddress> {
    let address = LinkAddress::from(token);
    if address.is_wire_safe() {
        Ok(address)
    } else {
        Err(MeshError::malformed(format!("bad link address {:?}", token)))
    }
}

/// Empty entries are skipped so a trailing comma is accepted
fn list_entries(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|entry| !entry.is_empty())
}

fn parse_known_list(list: &str) -> Result<Vec<KnownDevice>> {
    list_entries(list)
        .map(|entry| match entry.split_once('=') {
            Some((address, identity)) => Ok(KnownDevice {
                address: address_token(address)?,
                identity: Some(identity_token(identity)?),
            }),
            None => Ok(KnownDevice::new(address_token(entry)?)),
        })
        .collect()
}

fn parse_route_list(list: &str) -> Result<Vec<(LinkAddress, LinkAddress)>> {
    list_entries(list)
        .map(|entry| {
            let (dest, next_hop) = entry
                .split_once('>')
                .ok_or_else(|| MeshError::malformed(format!("bad route entry {:?}", entry)))?;
            Ok((address_token(dest)?, address_token(next_hop)?))
        })
        .collect()
}
