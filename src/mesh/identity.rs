//! Identity Registry
//!
//! Bidirectional identity <-> link address map. Each identity has at most one
//! address and each address at most one identity; `set` evicts whatever
//! stale entries would break that.

use log::debug;
use std::collections::{BTreeMap, HashMap};

use crate::types::{Identity, LinkAddress};

/// What a `set` call did to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// The identity was not bound before
    New,
    /// Same identity, same address
    Refreshed,
    /// The identity was bound to a different address
    Moved { previous: LinkAddress },
}

impl Binding {
    pub fn changed(&self) -> bool {
        !matches!(self, Binding::Refreshed)
    }
}

#[derive(Debug, Default, Clone)]
pub struct IdentityRegistry {
    by_identity: HashMap<Identity, LinkAddress>,
    by_address: HashMap<LinkAddress, Identity>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identity: &Identity) -> Option<&LinkAddress> {
        self.by_identity.get(identity)
    }

    pub fn get_by_address(&self, address: &LinkAddress) -> Option<&Identity> {
        self.by_address.get(address)
    }

    /// Bind `identity` to `address`, replacing any binding either side had.
    pub fn set(&mut self, identity: Identity, address: LinkAddress) -> Binding {
        if let Some(owner) = self.by_address.get(&address) {
            if owner != &identity {
                debug!("Address {} rebinds from {} to {}", address, owner, identity);
                self.by_identity.remove(owner);
            }
        }

        let binding = match self.by_identity.insert(identity.clone(), address.clone()) {
            None => Binding::New,
            Some(previous) if previous == address => Binding::Refreshed,
            Some(previous) => {
                self.by_address.remove(&previous);
                Binding::Moved { previous }
            }
        };

        self.by_address.insert(address, identity);
        binding
    }

    pub fn remove(&mut self, identity: &Identity) -> Option<LinkAddress> {
        let address = self.by_identity.remove(identity)?;
        self.by_address.remove(&address);
        Some(address)
    }

    pub fn remove_by_address(&mut self, address: &LinkAddress) -> Option<Identity> {
        let identity = self.by_address.remove(address)?;
        self.by_identity.remove(&identity);
        Some(identity)
    }

    /// Keep only bindings whose address satisfies `keep`; returns the dropped identities
    pub fn retain(&mut self, mut keep: impl FnMut(&LinkAddress) -> bool) -> Vec<Identity> {
        let dropped: Vec<LinkAddress> = self
            .by_address
            .keys()
            .filter(|address| !keep(address))
            .cloned()
            .collect();

        dropped
            .iter()
            .filter_map(|address| self.remove_by_address(address))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_identity.is_empty()
    }

    /// Sorted copy for snapshots and status output
    pub fn entries(&self) -> BTreeMap<Identity, LinkAddress> {
        self.by_identity
            .iter()
            .map(|(identity, address)| (identity.clone(), address.clone()))
            .collect()
    }

    pub fn is_consistent(&self) -> bool {
        self.by_identity.len() == self.by_address.len()
            && self
                .by_identity
                .iter()
                .all(|(identity, address)| self.by_address.get(address) == Some(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::from(s)
    }

    fn addr(s: &str) -> LinkAddress {
        LinkAddress::from(s)
    }

    #[test]
    fn test_set_and_lookup_both_directions() {
        let mut registry = IdentityRegistry::new();
        assert_eq!(registry.set(id("dev2"), addr("AA:BB")), Binding::New);

        assert_eq!(registry.get(&id("dev2")), Some(&addr("AA:BB")));
        assert_eq!(registry.get_by_address(&addr("AA:BB")), Some(&id("dev2")));
        assert_eq!(registry.set(id("dev2"), addr("AA:BB")), Binding::Refreshed);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_identity_moving_evicts_old_address() {
        let mut registry = IdentityRegistry::new();
        registry.set(id("dev2"), addr("AA:BB"));

        let binding = registry.set(id("dev2"), addr("CC:DD"));
        assert_eq!(binding, Binding::Moved { previous: addr("AA:BB") });
        assert!(registry.get_by_address(&addr("AA:BB")).is_none());
        assert_eq!(registry.get(&id("dev2")), Some(&addr("CC:DD")));
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_address_rebinding_evicts_old_identity() {
        let mut registry = IdentityRegistry::new();
        registry.set(id("dev2"), addr("AA:BB"));

        assert_eq!(registry.set(id("dev9"), addr("AA:BB")), Binding::New);
        assert!(registry.get(&id("dev2")).is_none());
        assert_eq!(registry.get_by_address(&addr("AA:BB")), Some(&id("dev9")));
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_remove_by_address_clears_both_sides() {
        let mut registry = IdentityRegistry::new();
        registry.set(id("dev2"), addr("AA:BB"));
        registry.set(id("dev3"), addr("CC:DD"));

        assert_eq!(registry.remove_by_address(&addr("AA:BB")), Some(id("dev2")));
        assert!(registry.get(&id("dev2")).is_none());
        assert_eq!(registry.remove(&id("dev3")), Some(addr("CC:DD")));
        assert!(registry.is_empty());
        assert!(registry.remove(&id("dev3")).is_none());
    }

    #[test]
    fn test_retain_drops_unreachable_bindings() {
        let mut registry = IdentityRegistry::new();
        registry.set(id("dev2"), addr("AA:BB"));
        registry.set(id("dev3"), addr("CC:DD"));

        let dropped = registry.retain(|address| address.as_str() == "CC:DD");
        assert_eq!(dropped, vec![id("dev2")]);
        assert_eq!(registry.entries().len(), 1);
        assert!(registry.is_consistent());
    }
}
