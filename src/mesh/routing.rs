//! Routing Table
//!
//! `destination -> next hop`, both link addresses. Every live link routes to
//! itself; every other entry points at a live link. The table is rebuilt in
//! full from the `Neighbourhood` whenever the live set changes.

use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::LinkAddress;

/// What the router knows about its direct neighbours
#[derive(Debug, Default, Clone)]
pub struct Neighbourhood {
    live: BTreeSet<LinkAddress>,
    /// Link addresses each neighbour reported in its DEVICE_INFO
    reported: BTreeMap<LinkAddress, BTreeSet<LinkAddress>>,
    /// Routes each neighbour advertised in its latest ROUTE_UPDATE
    advertised: BTreeMap<LinkAddress, BTreeMap<LinkAddress, LinkAddress>>,
}

impl Neighbourhood {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the link was already live
    pub fn add_link(&mut self, address: LinkAddress) -> bool {
        self.live.insert(address)
    }

    /// Forget a link together with everything it told us
    pub fn drop_link(&mut self, address: &LinkAddress) -> bool {
        self.reported.remove(address);
        self.advertised.remove(address);
        self.live.remove(address)
    }

    pub fn is_live(&self, address: &LinkAddress) -> bool {
        self.live.contains(address)
    }

    pub fn live(&self) -> &BTreeSet<LinkAddress> {
        &self.live
    }

    pub fn set_reported(&mut self, source: &LinkAddress, peers: BTreeSet<LinkAddress>) {
        self.reported.insert(source.clone(), peers);
    }

    pub fn set_advertised(&mut self, source: &LinkAddress, routes: BTreeMap<LinkAddress, LinkAddress>) {
        self.advertised.insert(source.clone(), routes);
    }

    pub fn reported(&self, source: &LinkAddress) -> Option<&BTreeSet<LinkAddress>> {
        self.reported.get(source)
    }

    /// The live link a neighbour's advertised next hop resolves to
    fn resolve_hop(&self, source: &LinkAddress, advertised_hop: &LinkAddress) -> LinkAddress {
        if self.live.contains(advertised_hop) {
            advertised_hop.clone()
        } else {
            source.clone()
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RoutingTable {
    routes: BTreeMap<LinkAddress, LinkAddress>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full rebuild. Direct routes first, then one-hop routes from reported
    /// neighbour sets, then routes neighbours advertised. Earlier entries win;
    /// ties go to the first live link in address order. Returns true if the
    /// table changed.
    pub fn rebuild(&mut self, hood: &Neighbourhood, local: Option<&LinkAddress>) -> bool {
        let mut routes = BTreeMap::new();

        for address in &hood.live {
            routes.insert(address.clone(), address.clone());
        }

        for via in &hood.live {
            let Some(peers) = hood.reported.get(via) else { continue };
            for peer in peers {
                if Some(peer) == local || routes.contains_key(peer) {
                    continue;
                }
                routes.insert(peer.clone(), via.clone());
            }
        }

        for source in &hood.live {
            let Some(advertised) = hood.advertised.get(source) else { continue };
            for (dest, hop) in advertised {
                if Some(dest) == local || Some(hop) == local || routes.contains_key(dest) {
                    continue;
                }
                routes.insert(dest.clone(), hood.resolve_hop(source, hop));
            }
        }

        let changed = routes != self.routes;
        if changed {
            debug!("Routing table rebuilt: {} routes", routes.len());
        }
        self.routes = routes;
        changed
    }

    /// Apply a neighbour's ROUTE_UPDATE on top of the current table. Last
    /// writer wins for indirect entries; direct routes and the local address
    /// are never touched, and routes that lead back through us are ignored.
    pub fn merge_advertised(
        &mut self,
        source: &LinkAddress,
        advertised: &BTreeMap<LinkAddress, LinkAddress>,
        hood: &Neighbourhood,
        local: Option<&LinkAddress>,
    ) -> usize {
        if !hood.is_live(source) {
            debug!("Ignoring routes from {}; not a live link", source);
            return 0;
        }

        let mut updated = 0;
        for (dest, hop) in advertised {
            if hood.is_live(dest) || Some(dest) == local || Some(hop) == local {
                trace!("Skipping advertised route {}>{} from {}", dest, hop, source);
                continue;
            }

            let next_hop = hood.resolve_hop(source, hop);
            if self.routes.get(dest) != Some(&next_hop) {
                self.routes.insert(dest.clone(), next_hop);
                updated += 1;
            }
        }

        updated
    }

    pub fn next_hop(&self, destination: &LinkAddress) -> Option<&LinkAddress> {
        self.routes.get(destination)
    }

    pub fn contains(&self, destination: &LinkAddress) -> bool {
        self.routes.contains_key(destination)
    }

    pub fn remove(&mut self, destination: &LinkAddress) -> Option<LinkAddress> {
        self.routes.remove(destination)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<LinkAddress, LinkAddress> {
        &self.routes
    }

    /// Entries in ROUTE_UPDATE order
    pub fn to_route_list(&self) -> Vec<(LinkAddress, LinkAddress)> {
        self.routes
            .iter()
            .map(|(dest, hop)| (dest.clone(), hop.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> LinkAddress {
        LinkAddress::from(s)
    }

    fn peers(list: &[&str]) -> BTreeSet<LinkAddress> {
        list.iter().map(|s| addr(s)).collect()
    }

    fn routes(list: &[(&str, &str)]) -> BTreeMap<LinkAddress, LinkAddress> {
        list.iter().map(|(d, n)| (addr(d), addr(n))).collect()
    }

    #[test]
    fn test_live_links_route_to_themselves() {
        let mut hood = Neighbourhood::new();
        hood.add_link(addr("A"));
        hood.add_link(addr("B"));

        let mut table = RoutingTable::new();
        assert!(table.rebuild(&hood, None));
        assert_eq!(table.next_hop(&addr("A")), Some(&addr("A")));
        assert_eq!(table.next_hop(&addr("B")), Some(&addr("B")));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_reported_peer_becomes_indirect_and_vanishes_with_link() {
        let local = addr("L");
        let mut hood = Neighbourhood::new();
        let mut table = RoutingTable::new();

        hood.add_link(addr("A"));
        hood.add_link(addr("B"));
        table.rebuild(&hood, Some(&local));

        hood.set_reported(&addr("A"), peers(&["C", "L", "B"]));
        assert!(table.rebuild(&hood, Some(&local)));
        assert_eq!(table.next_hop(&addr("C")), Some(&addr("A")));
        assert_eq!(table.next_hop(&addr("B")), Some(&addr("B")), "direct route wins");
        assert!(!table.contains(&local));

        hood.drop_link(&addr("A"));
        assert!(table.rebuild(&hood, Some(&local)));
        assert!(!table.contains(&addr("C")));
        assert!(!table.contains(&addr("A")));
    }

    #[test]
    fn test_ties_go_to_first_live_link() {
        let mut hood = Neighbourhood::new();
        hood.add_link(addr("B"));
        hood.add_link(addr("A"));
        hood.set_reported(&addr("A"), peers(&["C"]));
        hood.set_reported(&addr("B"), peers(&["C"]));

        let mut table = RoutingTable::new();
        table.rebuild(&hood, None);
        assert_eq!(table.next_hop(&addr("C")), Some(&addr("A")));
    }

    #[test]
    fn test_rebuild_reports_no_change() {
        let mut hood = Neighbourhood::new();
        hood.add_link(addr("A"));

        let mut table = RoutingTable::new();
        assert!(table.rebuild(&hood, None));
        assert!(!table.rebuild(&hood, None));
    }

    #[test]
    fn test_merge_keeps_next_hops_live() {
        let local = addr("L");
        let mut hood = Neighbourhood::new();
        hood.add_link(addr("A"));
        hood.add_link(addr("B"));

        let mut table = RoutingTable::new();
        table.rebuild(&hood, Some(&local));

        let advertised = routes(&[
            ("A", "A"),
            ("B", "A"),
            ("D", "C"),
            ("E", "B"),
            ("L", "A"),
            ("F", "L"),
        ]);
        let updated = table.merge_advertised(&addr("A"), &advertised, &hood, Some(&local));

        assert_eq!(updated, 2);
        assert_eq!(table.next_hop(&addr("B")), Some(&addr("B")));
        assert_eq!(table.next_hop(&addr("D")), Some(&addr("A")));
        assert_eq!(table.next_hop(&addr("E")), Some(&addr("B")));
        assert!(!table.contains(&local));
        assert!(!table.contains(&addr("F")));
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let mut hood = Neighbourhood::new();
        hood.add_link(addr("A"));
        hood.add_link(addr("B"));

        let mut table = RoutingTable::new();
        table.merge_advertised(&addr("A"), &routes(&[("D", "X")]), &hood, None);
        table.merge_advertised(&addr("B"), &routes(&[("D", "Y")]), &hood, None);
        assert_eq!(table.next_hop(&addr("D")), Some(&addr("B")));
    }

    #[test]
    fn test_merge_from_unknown_link_is_ignored() {
        let hood = Neighbourhood::new();
        let mut table = RoutingTable::new();
        assert_eq!(table.merge_advertised(&addr("A"), &routes(&[("D", "A")]), &hood, None), 0);
        assert!(table.is_empty());
    }

    #[test]
    fn test_advertised_routes_survive_rebuild_while_source_is_live() {
        let mut hood = Neighbourhood::new();
        hood.add_link(addr("A"));
        hood.set_advertised(&addr("A"), routes(&[("D", "C")]));

        let mut table = RoutingTable::new();
        table.rebuild(&hood, None);
        assert_eq!(table.next_hop(&addr("D")), Some(&addr("A")));

        hood.drop_link(&addr("A"));
        table.rebuild(&hood, None);
        assert!(table.is_empty());
    }
}
