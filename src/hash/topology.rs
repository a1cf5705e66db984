// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Placement metadata for cluster members.
use crate::Address;
use std::collections::BTreeMap;

/// Where a member physically lives.
///
/// Any of the identifiers may be unset, in which case two members with unset identifiers
/// at the same level are considered co-located at that level.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeTopologyInfo {
    /// The machine the member runs on.
    pub machine_id: Option<String>,
    /// The rack containing the machine.
    pub rack_id: Option<String>,
    /// The site containing the rack.
    pub site_id: Option<String>,
    /// The member's address.
    pub address: Address,
}

impl NodeTopologyInfo {
    /// Returns topology info for `address` with no placement identifiers set.
    pub fn new(address: Address) -> Self {
        Self {
            machine_id: None,
            rack_id: None,
            site_id: None,
            address,
        }
    }

    /// Set the machine identifier.
    pub fn machine<S: Into<String>>(mut self, id: S) -> Self {
        self.machine_id = Some(id.into());
        self
    }

    /// Set the rack identifier.
    pub fn rack<S: Into<String>>(mut self, id: S) -> Self {
        self.rack_id = Some(id.into());
        self
    }

    /// Set the site identifier.
    pub fn site<S: Into<String>>(mut self, id: S) -> Self {
        self.site_id = Some(id.into());
        self
    }

    /// Returns true if `self` and `other` live on the same site.
    pub fn same_site(&self, other: &Self) -> bool {
        self.site_id == other.site_id
    }

    /// Returns true if `self` and `other` live on the same rack of the same site.
    pub fn same_rack(&self, other: &Self) -> bool {
        self.same_site(other) && self.rack_id == other.rack_id
    }

    /// Returns true if `self` and `other` live on the same machine.
    pub fn same_machine(&self, other: &Self) -> bool {
        self.same_rack(other) && self.machine_id == other.machine_id
    }
}

/// A registry of [NodeTopologyInfo] for every live (or recently live) member.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyInfo {
    nodes: BTreeMap<Address, NodeTopologyInfo>,
}

impl TopologyInfo {
    /// Returns an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `info`, replacing any previous entry for the same address.
    pub fn add(&mut self, info: NodeTopologyInfo) {
        self.nodes.insert(info.address, info);
    }

    /// Remove the entry for `addr`.
    pub fn remove(&mut self, addr: &Address) -> Option<NodeTopologyInfo> {
        self.nodes.remove(addr)
    }

    /// Returns the entry for `addr`.
    pub fn get(&self, addr: &Address) -> Option<&NodeTopologyInfo> {
        self.nodes.get(addr)
    }

    /// Returns true if there is an entry for `addr`.
    pub fn contains(&self, addr: &Address) -> bool {
        self.nodes.contains_key(addr)
    }

    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over all entries in address order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeTopologyInfo> {
        self.nodes.values()
    }

    /// Returns a copy of this registry restricted to `members`.
    pub fn restrict<'a, I: IntoIterator<Item = &'a Address>>(&self, members: I) -> Self {
        let nodes = (members.into_iter())
            .filter_map(|m| self.nodes.get(m))
            .map(|info| (info.address, info.clone()))
            .collect();

        Self { nodes }
    }

    /// Returns topology info for `addr`, or an entry with unset identifiers if unknown.
    pub(crate) fn get_or_default(&self, addr: &Address) -> NodeTopologyInfo {
        (self.nodes.get(addr).cloned()).unwrap_or_else(|| NodeTopologyInfo::new(*addr))
    }
}

impl Extend<NodeTopologyInfo> for TopologyInfo {
    fn extend<I: IntoIterator<Item = NodeTopologyInfo>>(&mut self, iter: I) {
        for info in iter {
            self.add(info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(port: u16) -> Address {
        Address::from(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn entries_are_structurally_equal() {
        let a = NodeTopologyInfo::new(addr(1)).machine("m1").rack("r1").site("s1");
        let b = NodeTopologyInfo::new(addr(1)).site("s1").rack("r1").machine("m1");
        assert_eq!(a, b);
        assert_ne!(a, b.clone().machine("m2"));
    }

    #[test]
    fn add_get_remove() {
        let mut t = TopologyInfo::new();
        t.add(NodeTopologyInfo::new(addr(1)).site("s1"));
        t.add(NodeTopologyInfo::new(addr(2)).site("s2"));
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(&addr(2)).and_then(|i| i.site_id.as_deref()), Some("s2"));

        t.add(NodeTopologyInfo::new(addr(2)).site("s3"));
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(&addr(2)).and_then(|i| i.site_id.as_deref()), Some("s3"));

        assert!(t.remove(&addr(1)).is_some());
        assert!(t.remove(&addr(1)).is_none());
        assert!(!t.contains(&addr(1)));
    }

    #[test]
    fn co_location_levels() {
        let a = NodeTopologyInfo::new(addr(1)).machine("m1").rack("r1").site("s1");
        let b = NodeTopologyInfo::new(addr(2)).machine("m2").rack("r1").site("s1");
        let c = NodeTopologyInfo::new(addr(3)).machine("m1").rack("r2").site("s1");

        assert!(a.same_rack(&b) && !a.same_machine(&b));
        assert!(a.same_site(&c) && !a.same_rack(&c));
        // same machine id on a different rack is a different machine
        assert!(!a.same_machine(&c));
    }

    #[test]
    fn restrict_drops_non_members() {
        let mut t = TopologyInfo::new();
        t.extend((1..=4).map(|p| NodeTopologyInfo::new(addr(p))));

        let r = t.restrict(&[addr(1), addr(3), addr(9)]);
        assert_eq!(r.len(), 2);
        assert!(r.contains(&addr(1)) && r.contains(&addr(3)));
    }
}
