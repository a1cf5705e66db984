// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Batching of forwarded payloads by the new owner they must reach.
use crate::{
    command::{AffectedKeys, PrepareCommand, WriteCommand},
    hash::ConsistentHash,
    Address,
};
use std::collections::{BTreeMap, BTreeSet};

/// Groups payloads by each member that newly owns a key the payload affects, where that
/// key was previously owned by a leaver.
pub struct CommandAggregatingStateMap<'a, T> {
    leavers: &'a [Address],
    old: &'a ConsistentHash,
    new: &'a ConsistentHash,
    num_owners: usize,
    state: BTreeMap<Address, Vec<T>>,
}

/// Aggregates logged writes.
pub type TransactionLogMap<'a> = CommandAggregatingStateMap<'a, WriteCommand>;

/// Aggregates prepared but uncompleted transactions.
pub type PendingPreparesMap<'a> = CommandAggregatingStateMap<'a, PrepareCommand>;

impl<'a, T: AffectedKeys + Clone> CommandAggregatingStateMap<'a, T> {
    /// Returns an empty map over the transition from `old` to `new`.
    pub fn new(
        leavers: &'a [Address],
        old: &'a ConsistentHash,
        new: &'a ConsistentHash,
        num_owners: usize,
    ) -> Self {
        Self {
            leavers,
            old,
            new,
            num_owners,
            state: BTreeMap::new(),
        }
    }

    /// Add `payload` under every destination that must receive it.
    ///
    /// A payload is added at most once per destination, however many of its keys qualify.
    pub fn add_state(&mut self, payload: &T) {
        let mut dests = BTreeSet::new();

        for key in payload.affected_keys() {
            let old_owners = self.old.locate(&key, self.num_owners);

            if !self.leavers.iter().any(|l| old_owners.contains(l)) {
                continue;
            }

            let gained = (self.new.locate(&key, self.num_owners).into_iter())
                .filter(|o| !old_owners.contains(o));

            dests.extend(gained);
        }

        for dest in dests {
            self.state.entry(dest).or_default().push(payload.clone());
        }
    }

    /// Returns the payloads aggregated so far.
    pub fn state(&self) -> &BTreeMap<Address, Vec<T>> {
        &self.state
    }

    /// Consumes the map, returning aggregated payloads by destination.
    pub fn into_state(self) -> BTreeMap<Address, Vec<T>> {
        self.state
    }
}

impl<'a, T: AffectedKeys + Clone> Extend<T> for CommandAggregatingStateMap<'a, T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for payload in iter {
            self.add_state(&payload);
        }
    }
}
