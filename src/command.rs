// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Replicated operations, and the control messages exchanged during a rehash.
use crate::{
    container::DataContainer,
    hash::{ConsistentHash, NodeTopologyInfo},
    Address,
};
use bytes::Bytes;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

/// A cache key.
pub type Key = Bytes;

/// A cache value.
pub type Value = Bytes;

/// A bundle of cache entries, as transferred between members.
pub type StateChunk = HashMap<Key, Value>;

/// Anything that touches a known set of keys.
pub trait AffectedKeys {
    /// Returns every key this touches.
    fn affected_keys(&self) -> BTreeSet<Key>;
}

/// Identity of a transaction, unique across the cluster.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId {
    /// The member that started the transaction.
    pub origin: Address,
    /// Sequence number local to `origin`.
    pub seq: u64,
}

/// A write on the normal cache path.
///
/// Applying a write is idempotent: forwarded writes may be delivered more than once.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteCommand {
    /// Store a single entry.
    Put {
        key: Key,
        value: Value,
    },
    /// Store several entries.
    PutAll(Vec<(Key, Value)>),
    /// Remove a single entry.
    Remove { key: Key },
}

impl WriteCommand {
    /// Returns a [WriteCommand::Put].
    pub fn put<K: Into<Key>, V: Into<Value>>(key: K, value: V) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Returns a [WriteCommand::Remove].
    pub fn remove<K: Into<Key>>(key: K) -> Self {
        Self::Remove { key: key.into() }
    }

    /// Apply this write to `container`.
    pub fn apply(&self, container: &dyn DataContainer) {
        match self {
            Self::Put { key, value } => container.put(key.clone(), value.clone()),

            Self::PutAll(entries) => {
                for (key, value) in entries {
                    container.put(key.clone(), value.clone());
                }
            }

            Self::Remove { key } => {
                container.remove(key);
            }
        }
    }
}

impl AffectedKeys for WriteCommand {
    fn affected_keys(&self) -> BTreeSet<Key> {
        match self {
            Self::Put { key, .. } | Self::Remove { key } => Some(key.clone()).into_iter().collect(),
            Self::PutAll(entries) => entries.iter().map(|(k, _)| k.clone()).collect(),
        }
    }
}

/// The prepare phase of a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrepareCommand {
    /// The transaction being prepared.
    pub tx: TxId,
    /// Writes performed by the transaction, in order.
    pub modifications: Vec<WriteCommand>,
    /// If true, the transaction commits as part of the prepare.
    pub one_phase: bool,
}

impl PrepareCommand {
    /// Apply all modifications to `container`.
    pub fn apply(&self, container: &dyn DataContainer) {
        for m in self.modifications.iter() {
            m.apply(container);
        }
    }
}

impl AffectedKeys for PrepareCommand {
    fn affected_keys(&self) -> BTreeSet<Key> {
        (self.modifications.iter())
            .flat_map(AffectedKeys::affected_keys)
            .collect()
    }
}

/// A control message exchanged between members during a rehash.
#[allow(missing_docs)]
#[derive(Clone, Debug)]
pub enum RehashCommand {
    /// Ask the coordinator for permission to join, and for the current ring.
    JoinRequest { sender: Address },

    /// Announce that `sender` is joining, and which topology it has.
    JoinRehashStart {
        sender: Address,
        topology: NodeTopologyInfo,
    },

    /// Signal that the join of `sender` completed.
    JoinRehashEnd { sender: Address },

    /// Signal that the join of `sender` was aborted.
    JoinAbort { sender: Address },

    /// Request entries that `sender` becomes a new owner of by joining.
    PullStateJoin {
        sender: Address,
        old: Arc<ConsistentHash>,
        new: Arc<ConsistentHash>,
    },

    /// Request entries that `sender` becomes a new owner of because `leavers` left.
    PullStateLeave {
        sender: Address,
        old: Arc<ConsistentHash>,
        new: Arc<ConsistentHash>,
        leavers: Vec<Address>,
    },

    /// Signal that `sender` finished pulling state after `leavers` left.
    LeaveRehashEnd {
        sender: Address,
        leavers: Vec<Address>,
    },

    /// Forward writes logged while state was being transferred.
    ApplyTxLog {
        sender: Address,
        commands: Vec<WriteCommand>,
    },

    /// Forward transactions that were prepared but not yet completed.
    ApplyPendingPrepares {
        sender: Address,
        prepares: Vec<PrepareCommand>,
    },

    /// Drop copies of keys the receiver no longer owns.
    Invalidate {
        sender: Address,
        keys: Vec<Key>,
    },
}

impl RehashCommand {
    /// Returns the member that sent this command.
    pub fn sender(&self) -> Address {
        use RehashCommand::*;

        match self {
            JoinRequest { sender }
            | JoinRehashStart { sender, .. }
            | JoinRehashEnd { sender }
            | JoinAbort { sender }
            | PullStateJoin { sender, .. }
            | PullStateLeave { sender, .. }
            | LeaveRehashEnd { sender, .. }
            | ApplyTxLog { sender, .. }
            | ApplyPendingPrepares { sender, .. }
            | Invalidate { sender, .. } => *sender,
        }
    }

    /// Returns a short name for this kind of command.
    pub fn kind(&self) -> &'static str {
        use RehashCommand::*;

        match self {
            JoinRequest { .. } => "join-request",
            JoinRehashStart { .. } => "join-rehash-start",
            JoinRehashEnd { .. } => "join-rehash-end",
            JoinAbort { .. } => "join-abort",
            PullStateJoin { .. } => "pull-state-join",
            PullStateLeave { .. } => "pull-state-leave",
            LeaveRehashEnd { .. } => "leave-rehash-end",
            ApplyTxLog { .. } => "apply-tx-log",
            ApplyPendingPrepares { .. } => "apply-pending-prepares",
            Invalidate { .. } => "invalidate",
        }
    }
}

/// The response to a [RehashCommand].
#[derive(Clone, Debug)]
pub enum Response {
    /// The command was handled.
    Success(ResponseValue),
    /// The responder could not handle the command (e.g. it is not ready yet).
    Unsuccessful,
}

/// The payload of a [Response::Success].
#[allow(missing_docs)]
#[derive(Clone, Debug)]
pub enum ResponseValue {
    /// No payload.
    Ack,
    /// The coordinator's ring members and their topology.
    Members {
        members: Vec<Address>,
        topology: Vec<NodeTopologyInfo>,
    },
    /// The responder's own topology.
    Topology(NodeTopologyInfo),
    /// Pulled state.
    State(StateChunk),
}

impl Response {
    /// Returns a successful response with no payload.
    pub const fn ack() -> Self {
        Self::Success(ResponseValue::Ack)
    }

    /// Returns true if this response is successful.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}
