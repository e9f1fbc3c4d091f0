//! Mesh State Machine
//!
//! Owns the live link set, KnownDevices, the routing table and the identity
//! registry. Every input is handled synchronously and yields a list of
//! `Action`s for the router task to carry out; nothing here touches I/O.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use super::forward_cache::{ForwardCache, ForwardCacheStats};
use super::identity::{Binding, IdentityRegistry};
use super::protocol::{KnownDevice, WireMessage};
use super::routing::{Neighbourhood, RoutingTable};
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::types::{Identity, LinkAddress};

/// A CHAT that reached its destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceivedMessage {
    pub sender: Identity,
    pub content: String,
    /// Link the message arrived on; `None` for loopback
    pub via: Option<LinkAddress>,
    pub received_at: DateTime<Utc>,
}

/// Side effects requested by the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send { to: LinkAddress, message: WireMessage },
    Broadcast(WireMessage),
    Deliver(ReceivedMessage),
    RecordMapping { address: LinkAddress, identity: Identity },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MeshCounters {
    pub delivered: u64,
    pub forwarded: u64,
    pub originated: u64,
    pub dropped: u64,
    pub malformed: u64,
}

/// Point-in-time copy of the router state
#[derive(Debug, Clone, Serialize)]
pub struct MeshSnapshot {
    pub local_identity: Identity,
    pub local_address: Option<LinkAddress>,
    pub live_links: Vec<LinkAddress>,
    pub known_devices: Vec<LinkAddress>,
    pub routes: BTreeMap<LinkAddress, LinkAddress>,
    pub identities: BTreeMap<Identity, LinkAddress>,
    pub counters: MeshCounters,
    pub forward_cache: ForwardCacheStats,
}

pub struct MeshState {
    local_identity: Identity,
    local_address: Option<LinkAddress>,
    advertise_routes: bool,
    hood: Neighbourhood,
    known: BTreeSet<LinkAddress>,
    routes: RoutingTable,
    identities: IdentityRegistry,
    forward_cache: ForwardCache,
    counters: MeshCounters,
}

impl MeshState {
    pub fn new(local_identity: Identity, local_address: Option<LinkAddress>, config: &MeshConfig) -> Self {
        Self {
            local_identity,
            local_address,
            advertise_routes: config.advertise_routes,
            hood: Neighbourhood::new(),
            known: BTreeSet::new(),
            routes: RoutingTable::new(),
            identities: IdentityRegistry::new(),
            forward_cache: ForwardCache::new(
                config.forward_dedup_window(),
                config.forward_dedup_capacity,
            ),
            counters: MeshCounters::default(),
        }
    }

    pub fn local_identity(&self) -> &Identity {
        &self.local_identity
    }

    pub fn local_address(&self) -> Option<&LinkAddress> {
        self.local_address.as_ref()
    }

    /// TCP endpoints only learn their address once bound
    pub fn set_local_address(&mut self, address: LinkAddress) {
        if self.local_address.as_ref() != Some(&address) {
            debug!("Local link address is {}", address);
            self.local_address = Some(address);
        }
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn identities(&self) -> &IdentityRegistry {
        &self.identities
    }

    pub fn is_live(&self, address: &LinkAddress) -> bool {
        self.hood.is_live(address)
    }

    pub fn link_established(&mut self, address: LinkAddress) -> Vec<Action> {
        info!("Link established with {}", address);
        let mut actions = Vec::new();

        self.hood.add_link(address.clone());
        self.known.insert(address.clone());

        actions.push(Action::Send {
            to: address,
            message: WireMessage::hello(&self.local_identity),
        });
        self.recompute(&mut actions);
        actions.push(Action::Broadcast(self.device_info()));

        actions
    }

    pub fn link_lost(&mut self, address: &LinkAddress) -> Vec<Action> {
        info!("Link lost with {}", address);
        let mut actions = Vec::new();

        self.hood.drop_link(address);
        if let Some(identity) = self.identities.remove_by_address(address) {
            debug!("Forgot identity {} at {}", identity, address);
        }
        self.routes.remove(address);
        self.recompute(&mut actions);

        actions
    }

    /// Handle one frame from `from`. Only malformed frames are errors; every
    /// other failure is logged and the message dropped.
    pub fn handle_inbound(&mut self, from: &LinkAddress, payload: &[u8], now: Instant) -> Result<Vec<Action>> {
        let message = match WireMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                self.counters.malformed += 1;
                return Err(e);
            }
        };

        if !self.hood.is_live(from) {
            debug!("Dropping {} from {}; link is not live", message.kind(), from);
            self.counters.dropped += 1;
            return Ok(Vec::new());
        }

        let actions = match message {
            WireMessage::Hello { identity } => self.on_hello(from, identity),
            WireMessage::DeviceInfo { identity, known } => self.on_device_info(from, identity, known),
            WireMessage::RouteUpdate { identity, routes } => self.on_route_update(from, identity, routes),
            WireMessage::Chat {
                sender,
                target,
                content,
            } => self.on_chat(from, sender, target, content, now),
        };

        Ok(actions)
    }

    /// Local origination. Lookup misses are returned to the caller; there is
    /// still no delivery acknowledgement once the message leaves.
    pub fn originate(&mut self, target: &Identity, content: &str) -> Result<Vec<Action>> {
        if !target.is_wire_safe() {
            return Err(MeshError::InvalidToken(target.to_string()));
        }

        if target == &self.local_identity {
            self.counters.delivered += 1;
            return Ok(vec![Action::Deliver(ReceivedMessage {
                sender: self.local_identity.clone(),
                content: content.to_string(),
                via: None,
                received_at: Utc::now(),
            })]);
        }

        let next_hop = self.resolve(target)?.clone();
        self.counters.originated += 1;
        debug!("Sending to {} via {}", target, next_hop);

        Ok(vec![Action::Send {
            to: next_hop,
            message: WireMessage::chat(&self.local_identity, target, content),
        }])
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            local_identity: self.local_identity.clone(),
            local_address: self.local_address.clone(),
            live_links: self.hood.live().iter().cloned().collect(),
            known_devices: self.known.iter().cloned().collect(),
            routes: self.routes.entries().clone(),
            identities: self.identities.entries(),
            counters: self.counters.clone(),
            forward_cache: self.forward_cache.stats(),
        }
    }

    fn on_hello(&mut self, from: &LinkAddress, identity: Identity) -> Vec<Action> {
        if identity == self.local_identity {
            warn!("{} announced our own identity; ignoring", from);
            return Vec::new();
        }

        debug!("HELLO from {} as {}", from, identity);
        let mut actions = vec![Action::RecordMapping {
            address: from.clone(),
            identity: identity.clone(),
        }];

        let binding = self.identities.set(identity.clone(), from.clone());
        if let Binding::Moved { previous } = &binding {
            info!("Identity {} moved from {} to {}", identity, previous, from);
        }

        if binding.changed() {
            actions.push(Action::Send {
                to: from.clone(),
                message: WireMessage::hello(&self.local_identity),
            });
            actions.push(Action::Broadcast(self.device_info()));
        }

        actions
    }

    fn on_device_info(&mut self, from: &LinkAddress, identity: Identity, known: Vec<KnownDevice>) -> Vec<Action> {
        if identity == self.local_identity {
            warn!("{} sent DEVICE_INFO under our own identity; ignoring", from);
            return Vec::new();
        }

        debug!("DEVICE_INFO from {} ({}) listing {} devices", from, identity, known.len());
        let mut actions = vec![Action::RecordMapping {
            address: from.clone(),
            identity: identity.clone(),
        }];
        self.identities.set(identity, from.clone());

        let reported: BTreeSet<LinkAddress> = known
            .iter()
            .map(|device| device.address.clone())
            .filter(|address| Some(address) != self.local_address.as_ref())
            .collect();
        self.hood.set_reported(from, reported);

        for device in known {
            if let Some(identity) = device.identity {
                self.learn_binding(identity, device.address);
            }
        }

        self.recompute(&mut actions);
        actions
    }

    /// Indirect binding from a neighbour's DEVICE_INFO. Never overrides a
    /// binding to a live link, which only HELLO establishes.
    fn learn_binding(&mut self, identity: Identity, address: LinkAddress) {
        if identity == self.local_identity
            || Some(&address) == self.local_address.as_ref()
            || self.hood.is_live(&address)
        {
            return;
        }

        if let Some(current) = self.identities.get(&identity) {
            if self.hood.is_live(current) {
                return;
            }
        }

        if self.identities.set(identity.clone(), address.clone()).changed() {
            debug!("Learned {} at {}", identity, address);
        }
    }

    fn on_route_update(
        &mut self,
        from: &LinkAddress,
        identity: Identity,
        routes: Vec<(LinkAddress, LinkAddress)>,
    ) -> Vec<Action> {
        let advertised: BTreeMap<LinkAddress, LinkAddress> = routes.into_iter().collect();
        let updated = self.routes.merge_advertised(
            from,
            &advertised,
            &self.hood,
            self.local_address.as_ref(),
        );
        self.hood.set_advertised(from, advertised);

        debug!("ROUTE_UPDATE from {} ({}) changed {} routes", from, identity, updated);
        Vec::new()
    }

    fn on_chat(
        &mut self,
        from: &LinkAddress,
        sender: Identity,
        target: Identity,
        content: String,
        now: Instant,
    ) -> Vec<Action> {
        if target == self.local_identity {
            info!("Message from {} via {}", sender, from);
            self.counters.delivered += 1;
            return vec![Action::Deliver(ReceivedMessage {
                sender,
                content,
                via: Some(from.clone()),
                received_at: Utc::now(),
            })];
        }

        if sender == self.local_identity {
            debug!("Dropping our own message to {} echoed by {}", target, from);
            self.counters.dropped += 1;
            return Vec::new();
        }

        if !self.forward_cache.admit(from, &sender, &target, &content, now) {
            debug!("Dropping looped message {} -> {} from {}", sender, target, from);
            self.counters.dropped += 1;
            return Vec::new();
        }

        let next_hop = match self.resolve(&target) {
            Ok(next_hop) => next_hop.clone(),
            Err(e) => {
                warn!("Cannot forward {} -> {}: {}", sender, target, e);
                self.counters.dropped += 1;
                return Vec::new();
            }
        };

        if &next_hop == from {
            debug!("Not forwarding {} -> {} back to {}", sender, target, from);
            self.counters.dropped += 1;
            return Vec::new();
        }

        debug!("Forwarding {} -> {} via {}", sender, target, next_hop);
        self.counters.forwarded += 1;
        vec![Action::Send {
            to: next_hop,
            message: WireMessage::Chat {
                sender,
                target,
                content,
            },
        }]
    }

    fn resolve(&self, target: &Identity) -> Result<&LinkAddress> {
        let address = self
            .identities
            .get(target)
            .ok_or_else(|| MeshError::IdentityMiss(target.clone()))?;

        self.routes
            .next_hop(address)
            .ok_or_else(|| MeshError::RouteMiss(address.clone()))
    }

    /// Full rebuild, then drop identity bindings that lost their route
    fn recompute(&mut self, actions: &mut Vec<Action>) {
        let changed = self.routes.rebuild(&self.hood, self.local_address.as_ref());

        let routes = &self.routes;
        let dropped = self.identities.retain(|address| routes.contains(address));
        for identity in dropped {
            debug!("Identity {} is no longer reachable", identity);
        }

        if changed && self.advertise_routes && !self.hood.live().is_empty() {
            actions.push(Action::Broadcast(WireMessage::RouteUpdate {
                identity: self.local_identity.clone(),
                routes: self.routes.to_route_list(),
            }));
        }
    }

    fn device_info(&self) -> WireMessage {
        let known = self
            .known
            .iter()
            .map(|address| KnownDevice {
                address: address.clone(),
                identity: self.identities.get_by_address(address).cloned(),
            })
            .collect();

        WireMessage::DeviceInfo {
            identity: self.local_identity.clone(),
            known,
        }
    }
}
