// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Consistent hash rings that map keys to their owning members.
//!
//! Every member is placed on a 64-bit ring at a position derived from its address. A key
//! is owned by the members found walking clockwise from the key's own position. Because
//! placement depends only on the member set (and, for the topology aware variant, on the
//! members' [NodeTopologyInfo]), any two members holding the same inputs agree on the
//! owners of every key.
pub mod topology;

pub use topology::{NodeTopologyInfo, TopologyInfo};

use crate::Address;
use siphasher::sip::SipHasher13;
use std::{cmp, collections::BTreeSet, hash::Hasher, net::IpAddr};

/// How owners are selected from the ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    /// Owners are the first `n` distinct members clockwise from a key.
    Default,
    /// Owners are spread across sites, then racks, then machines before any two replicas
    /// are co-located.
    TopologyAware(TopologyInfo),
}

/// An immutable snapshot of a hash ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsistentHash {
    ring: Vec<(u64, Address)>,
    placement: Placement,
}

/// Members involved in moving state off of one or more leavers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaveTransfers {
    /// Surviving old owners of keys owned by a leaver.
    pub providers: Vec<Address>,
    /// Members that become new owners of keys owned by a leaver.
    pub receivers: Vec<Address>,
}

fn sip() -> SipHasher13 {
    SipHasher13::new_with_keys(0, 0)
}

fn position(addr: &Address) -> u64 {
    let addr = addr.socket_addr();
    let mut h = sip();

    match addr.ip() {
        IpAddr::V4(ip) => h.write(&ip.octets()),
        IpAddr::V6(ip) => h.write(&ip.octets()),
    }
    h.write(&addr.port().to_be_bytes());

    h.finish()
}

/// Returns the ring position of `key`.
pub fn key_position(key: &[u8]) -> u64 {
    let mut h = sip();
    h.write(key);
    h.finish()
}

impl ConsistentHash {
    /// Create a ring with [Placement::Default].
    pub fn new<I: IntoIterator<Item = Address>>(members: I) -> Self {
        Self {
            ring: Self::place(members),
            placement: Placement::Default,
        }
    }

    /// Create a ring with [Placement::TopologyAware]. Only the entries of `topology` that
    /// belong to `members` are retained.
    pub fn topology_aware<I>(members: I, topology: &TopologyInfo) -> Self
    where I: IntoIterator<Item = Address> {
        let ring = Self::place(members);
        let topology = topology.restrict(ring.iter().map(|(_, addr)| addr));

        Self {
            ring,
            placement: Placement::TopologyAware(topology),
        }
    }

    /// Create a ring of either flavor.
    pub fn build<I>(topology_aware: bool, members: I, topology: &TopologyInfo) -> Self
    where I: IntoIterator<Item = Address> {
        if topology_aware {
            Self::topology_aware(members, topology)
        } else {
            Self::new(members)
        }
    }

    fn place<I: IntoIterator<Item = Address>>(members: I) -> Vec<(u64, Address)> {
        (members.into_iter())
            .map(|addr| (position(&addr), addr))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Returns a ring with the same placement that additionally contains `joiners`.
    ///
    /// `topology` supplies placement metadata for topology aware rings.
    pub fn with_members(&self, joiners: &[Address], topology: &TopologyInfo) -> Self {
        let members = self.members().chain(joiners.iter()).copied();
        Self::build(self.is_topology_aware(), members, topology)
    }

    /// Returns a ring with the same placement that excludes `leavers`.
    pub fn without_members(&self, leavers: &[Address]) -> Self {
        let members = self.members().filter(|m| !leavers.contains(m)).copied();

        match &self.placement {
            Placement::Default => Self::new(members),
            Placement::TopologyAware(t) => Self::topology_aware(members, t),
        }
    }

    /// Returns the placement strategy of this ring.
    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// Returns true if this ring spreads replicas by topology.
    pub fn is_topology_aware(&self) -> bool {
        matches!(self.placement, Placement::TopologyAware(_))
    }

    /// Iterate over all members in ring order.
    pub fn members(&self) -> impl Iterator<Item = &Address> + '_ {
        self.ring.iter().map(|(_, addr)| addr)
    }

    /// Returns true if `addr` is a member of this ring.
    pub fn contains(&self, addr: &Address) -> bool {
        self.members().any(|m| m == addr)
    }

    /// Returns the number of members.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns true if there are no members.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Returns the owners of `key`, most preferred first.
    ///
    /// The result contains no duplicates, and has `min(n, self.len())` entries.
    pub fn locate(&self, key: &[u8], n: usize) -> Vec<Address> {
        self.locate_position(key_position(key), n)
    }

    /// Returns the first owner of `key`.
    pub fn primary_owner(&self, key: &[u8]) -> Option<Address> {
        guard!(!self.is_empty());
        self.walk(key_position(key)).next().copied()
    }

    /// Returns true if `addr` is one of the `n` owners of `key`.
    pub fn is_key_local_to(&self, addr: &Address, key: &[u8], n: usize) -> bool {
        self.locate(key, n).contains(addr)
    }

    /// Returns the members that hold state `joiner` must pull when it joins.
    ///
    /// `self` must be the ring that includes `joiner`. A member is a provider if it owns
    /// some key on the ring without `joiner` for which `joiner` becomes a new owner.
    pub fn state_providers_on_join(&self, joiner: &Address, n: usize) -> Vec<Address> {
        let old = self.without_members(&[*joiner]);
        let mut providers = BTreeSet::new();

        for (old_owners, new_owners) in arcs(&old, self, n) {
            if new_owners.contains(joiner) && !old_owners.contains(joiner) {
                providers.extend(old_owners);
            }
        }

        providers.into_iter().collect()
    }

    /// Returns the members that provide and receive state when `leavers` depart.
    ///
    /// `self` must be the ring that still includes `leavers`, and `new` the ring without
    /// them.
    pub fn state_transfers_on_leave(
        &self,
        new: &Self,
        leavers: &[Address],
        n: usize,
    ) -> LeaveTransfers {
        let mut providers = BTreeSet::new();
        let mut receivers = BTreeSet::new();

        for (old_owners, new_owners) in arcs(self, new, n) {
            if !old_owners.iter().any(|o| leavers.contains(o)) {
                continue;
            }

            let mut gained = (new_owners.iter())
                .filter(|o| !old_owners.contains(o))
                .peekable();

            if gained.peek().is_none() {
                continue;
            }

            receivers.extend(gained.copied());
            providers.extend(old_owners.iter().filter(|o| !leavers.contains(o)).copied());
        }

        LeaveTransfers {
            providers: providers.into_iter().collect(),
            receivers: receivers.into_iter().collect(),
        }
    }

    /// Walk the ring clockwise from `pos`, wrapping around once.
    fn walk(&self, pos: u64) -> impl Iterator<Item = &Address> + '_ {
        let start = self.ring.partition_point(|(p, _)| *p < pos);
        let (head, tail) = self.ring.split_at(start);

        (tail.iter().chain(head.iter())).map(|(_, addr)| addr)
    }

    fn locate_position(&self, pos: u64, n: usize) -> Vec<Address> {
        let n = cmp::min(n, self.ring.len());

        match &self.placement {
            Placement::Default => self.walk(pos).take(n).copied().collect(),
            Placement::TopologyAware(topology) => self.locate_spread(pos, n, topology),
        }
    }

    fn locate_spread(&self, pos: u64, n: usize, topology: &TopologyInfo) -> Vec<Address> {
        type CoLocated = fn(&NodeTopologyInfo, &NodeTopologyInfo) -> bool;

        let levels: [CoLocated; 4] = [
            NodeTopologyInfo::same_site,
            NodeTopologyInfo::same_rack,
            NodeTopologyInfo::same_machine,
            |a, b| a.address == b.address,
        ];

        let mut owners: Vec<NodeTopologyInfo> = Vec::with_capacity(n);

        for co_located in levels.iter() {
            for addr in self.walk(pos) {
                if owners.len() == n {
                    break;
                }

                let candidate = topology.get_or_default(addr);

                if owners.iter().all(|o| !co_located(o, &candidate)) {
                    owners.push(candidate);
                }
            }
        }

        owners.into_iter().map(|o| o.address).collect()
    }
}

/// Yields the owners under `old` and `new` of every arc between adjacent positions of
/// either ring. All keys within an arc share the same owners on both rings.
fn arcs<'a>(
    old: &'a ConsistentHash,
    new: &'a ConsistentHash,
    n: usize,
) -> impl Iterator<Item = (Vec<Address>, Vec<Address>)> + 'a {
    let bounds: BTreeSet<u64> = (old.ring.iter().chain(new.ring.iter()))
        .map(|(pos, _)| *pos)
        .collect();

    (bounds.into_iter()).map(move |pos| (old.locate_position(pos, n), new.locate_position(pos, n)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::net::SocketAddr;

    fn addr(port: u16) -> Address {
        Address::from(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn ring(ports: &[u16]) -> ConsistentHash {
        ConsistentHash::new(ports.iter().map(|&p| addr(p)))
    }

    #[test]
    fn positions_hash_address_bytes() {
        let mut h = SipHasher13::new_with_keys(0, 0);
        h.write(&[127, 0, 0, 1, 0, 7]);
        assert_eq!(position(&addr(7)), h.finish());

        let v6 = Address::from(SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 1], 7)));
        assert_ne!(position(&v6), position(&addr(7)));
    }

    #[quickcheck]
    fn locate_is_deterministic(ports: Vec<u16>, key: Vec<u8>, n: u8) -> bool {
        let n = n as usize % 5;
        let a = ring(&ports);
        let mut rev = ports.clone();
        rev.reverse();
        let b = ring(&rev);

        a == b && a.locate(&key, n) == a.locate(&key, n) && a.locate(&key, n) == b.locate(&key, n)
    }

    #[quickcheck]
    fn owners_are_distinct_and_bounded(ports: Vec<u16>, key: Vec<u8>, n: u8) -> bool {
        let n = n as usize % 5;
        let r = ring(&ports);
        let owners = r.locate(&key, n);
        let uniq: BTreeSet<_> = owners.iter().collect();

        owners.len() == cmp::min(n, r.len()) && uniq.len() == owners.len()
    }

    #[quickcheck]
    fn removing_and_readding_is_identity(ports: Vec<u16>, leaver: u16) -> bool {
        let r = ring(&ports);
        let without = r.without_members(&[addr(leaver)]);
        let back = without.with_members(&[addr(leaver)], &TopologyInfo::new());

        !without.contains(&addr(leaver)) && back == ring(&[&ports[..], &[leaver]].concat())
    }

    #[test]
    fn empty_ring_has_no_owners() {
        let r = ring(&[]);
        assert!(r.locate(b"k", 2).is_empty());
        assert_eq!(r.primary_owner(b"k"), None);
    }

    #[test]
    fn primary_owner_leads_owners() {
        let r = ring(&[1, 2, 3, 4]);
        for i in 0..100u32 {
            let key = i.to_be_bytes();
            assert_eq!(r.primary_owner(&key), r.locate(&key, 3).first().copied());
        }
    }

    #[test]
    fn topology_aware_spreads_across_sites() {
        let mut t = TopologyInfo::new();
        t.add(NodeTopologyInfo::new(addr(1)).site("s1").rack("r1").machine("m1"));
        t.add(NodeTopologyInfo::new(addr(2)).site("s1").rack("r1").machine("m2"));
        t.add(NodeTopologyInfo::new(addr(3)).site("s1").rack("r2").machine("m3"));
        t.add(NodeTopologyInfo::new(addr(4)).site("s2").rack("r1").machine("m4"));

        let r = ConsistentHash::topology_aware((1..=4).map(addr), &t);

        for i in 0..1000u32 {
            let owners = r.locate(&i.to_be_bytes(), 2);
            assert_eq!(owners.len(), 2);
            // exactly one member lives on s2, so it is always a replica
            assert!(owners.contains(&addr(4)), "{:?}", owners);
        }

        for i in 0..1000u32 {
            let s1: Vec<_> = (r.locate(&i.to_be_bytes(), 3).iter())
                .map(|a| t.get(a).cloned().unwrap())
                .filter(|info| info.site_id.as_deref() == Some("s1"))
                .collect();
            assert_eq!(s1.len(), 2);
            assert!(!s1[0].same_rack(&s1[1]));
        }
    }

    #[test]
    fn topology_aware_ring_ignores_foreign_entries() {
        let mut t = TopologyInfo::new();
        t.extend((1..=5).map(|p| NodeTopologyInfo::new(addr(p)).site(format!("s{}", p))));

        let a = ConsistentHash::topology_aware((1..=3).map(addr), &t);
        let members = [addr(1), addr(2), addr(3)];
        let b = ConsistentHash::topology_aware(members.iter().copied(), &t.restrict(&members));
        assert_eq!(a, b);
    }

    #[test]
    fn join_providers_own_the_moved_keys() {
        let old = ring(&[1, 2, 3, 4]);
        let new = old.with_members(&[addr(5)], &TopologyInfo::new());
        let providers = new.state_providers_on_join(&addr(5), 2);

        assert!(!providers.is_empty());
        assert!(!providers.contains(&addr(5)));

        for i in 0..10_000u32 {
            let key = i.to_be_bytes();
            if new.is_key_local_to(&addr(5), &key, 2) {
                for o in old.locate(&key, 2) {
                    assert!(providers.contains(&o), "{} is not a provider", o);
                }
            }
        }
    }

    #[test]
    fn leave_transfers_cover_every_moved_key() {
        let old = ring(&[1, 2, 3, 4, 5]);
        let leavers = [addr(2), addr(4)];
        let new = old.without_members(&leavers);
        let LeaveTransfers { providers, receivers } =
            old.state_transfers_on_leave(&new, &leavers, 2);

        assert!(providers.iter().all(|p| !leavers.contains(p)));
        assert!(receivers.iter().all(|r| !leavers.contains(r)));

        for i in 0..10_000u32 {
            let key = i.to_be_bytes();
            let old_owners = old.locate(&key, 2);
            if !old_owners.iter().any(|o| leavers.contains(o)) {
                continue;
            }
            for o in new.locate(&key, 2) {
                if !old_owners.contains(&o) {
                    assert!(receivers.contains(&o));
                }
            }
        }
    }
}
