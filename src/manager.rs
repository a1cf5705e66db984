// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! The per-cache owner of the ring, and of every rehash that changes it.
use crate::{
    command::{
        Key, PrepareCommand, RehashCommand, Response, ResponseValue, StateChunk, TxId, Value,
        WriteCommand,
    },
    config::RehashConfig,
    container::DataContainer,
    hash::{ConsistentHash, NodeTopologyInfo, TopologyInfo},
    rehash::{RehashError, RehashTask},
    transport::{InboundHandler, Transport},
    txlog::{round_of, TransactionLogger},
    Address,
};
use log::{debug, error, info, warn};
use std::{
    collections::{BTreeSet, HashMap},
    iter,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, Notify, RwLock},
    time::timeout,
};

/// A view of cluster membership, as decided by the membership layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct View {
    /// Current members, coordinator first.
    pub members: Vec<Address>,
}

impl View {
    /// Returns a view of `members`.
    pub fn new<I: IntoIterator<Item = Address>>(members: I) -> Self {
        let members = members.into_iter().collect();
        Self { members }
    }

    /// Returns true if `addr` is a member.
    pub fn contains(&self, addr: &Address) -> bool {
        self.members.contains(addr)
    }
}

/// Distributes the entries of a cache over the members of a cluster, and rehashes them
/// when members join or leave.
pub struct DistributionManager {
    cfg: RehashConfig,
    addr: Address,
    transport: Arc<dyn Transport>,
    container: Arc<dyn DataContainer>,
    tx_log: TransactionLogger,
    state: RwLock<State>,
    rehash_done: Notify,
    leave_acked: Notify,
}

/// Mutable state, only changed with the write lock held.
struct State {
    ch: Option<Arc<ConsistentHash>>,
    topology: TopologyInfo,
    rehash_in_progress: bool,
    join_complete: bool,
    // a joiner the local member (as coordinator) has granted permission to join
    joiner: Option<Address>,
    leavers: Vec<Address>,
    // (receiver, round) pairs
    leave_acks: BTreeSet<(Address, Vec<Address>)>,
    prepared: HashMap<TxId, PrepareCommand>,
}

impl DistributionManager {
    /// Returns a manager for the local member of `transport`, storing entries in
    /// `container`. The manager owns no keys until it [joins][Self::join].
    ///
    /// # Panics
    /// Panics if `cfg` is invalid.
    pub fn new(
        cfg: RehashConfig,
        transport: Arc<dyn Transport>,
        container: Arc<dyn DataContainer>,
    ) -> Arc<Self> {
        cfg.validate();

        let addr = transport.local_addr();
        let mut topology = TopologyInfo::new();
        topology.add(cfg.node_topology(addr));

        let state = State {
            ch: None,
            topology,
            rehash_in_progress: false,
            join_complete: false,
            joiner: None,
            leavers: Vec::new(),
            leave_acks: BTreeSet::new(),
            prepared: HashMap::new(),
        };

        Arc::new(Self {
            tx_log: TransactionLogger::new(cfg.tx_log_drain_threshold),
            cfg,
            addr,
            transport,
            container,
            state: RwLock::new(state),
            rehash_done: Notify::new(),
            leave_acked: Notify::new(),
        })
    }

    /// Returns the address of the local member.
    #[inline]
    pub fn local_addr(&self) -> Address {
        self.addr
    }

    /// Returns the configuration.
    #[inline]
    pub fn config(&self) -> &RehashConfig {
        &self.cfg
    }

    /// Returns the transport.
    #[inline]
    pub fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    pub(crate) fn transport_handle(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Returns the local store.
    #[inline]
    pub fn container(&self) -> &dyn DataContainer {
        &*self.container
    }

    /// Returns the transaction log.
    #[inline]
    pub fn tx_logger(&self) -> &TransactionLogger {
        &self.tx_log
    }

    /// Returns the current ring, if the local member has one.
    pub async fn consistent_hash(&self) -> Option<Arc<ConsistentHash>> {
        self.state.read().await.ch.clone()
    }

    /// Returns the owners of `key` under the current ring.
    pub async fn locate(&self, key: &[u8]) -> Vec<Address> {
        let ch = self.consistent_hash().await;
        (ch.map(|ch| ch.locate(key, self.cfg.num_owners))).unwrap_or_default()
    }

    /// Returns true if the local member owns `key` under the current ring.
    pub async fn is_local(&self, key: &[u8]) -> bool {
        self.locate(key).await.contains(&self.addr)
    }

    /// Returns a snapshot of known topology.
    pub async fn topology(&self) -> TopologyInfo {
        self.state.read().await.topology.clone()
    }

    /// Returns true if a rehash is running on the local member.
    pub async fn is_rehash_in_progress(&self) -> bool {
        self.state.read().await.rehash_in_progress
    }

    /// Returns true if the local member completed a join.
    pub async fn is_join_complete(&self) -> bool {
        self.state.read().await.join_complete
    }

    /// Returns members that left but whose rehash has not finished.
    pub async fn leavers(&self) -> Vec<Address> {
        self.state.read().await.leavers.clone()
    }

    /// Resolves once no rehash is running on the local member.
    pub async fn wait_for_rehash(&self) {
        loop {
            let done = self.rehash_done.notified();

            if !self.is_rehash_in_progress().await {
                return;
            }

            done.await;
        }
    }

    /// Join the cluster. If the local member is the coordinator, it forms a cluster by
    /// itself.
    ///
    /// On failure, the local member is not a member of the ring and the join may be
    /// retried.
    pub async fn join(self: &Arc<Self>) -> Result<(), RehashError> {
        if self.is_join_complete().await {
            return Err(RehashError::AlreadyJoined(self.addr));
        }

        if self.transport.coordinator() == Some(self.addr) {
            self.bootstrap().await;
            return Ok(());
        }

        RehashTask::join().run(self.clone()).await
    }

    async fn bootstrap(&self) {
        let mut state = self.state.write().await;

        let me = iter::once(self.addr);
        let ch = ConsistentHash::build(self.cfg.topology_aware, me, &state.topology);
        state.ch = Some(Arc::new(ch));
        state.join_complete = true;

        info!("{} bootstrapped a new cluster", self.addr);
    }

    /// Handle a change in membership. If any ring members left, this runs a leave rehash
    /// to completion.
    pub async fn handle_view_change(self: &Arc<Self>, view: &View) -> Result<(), RehashError> {
        let leavers = {
            let mut state = self.state.write().await;

            if state.joiner.map_or(false, |j| !view.contains(&j)) {
                state.joiner = None;
            }

            let ch = match (view.contains(&self.addr), state.ch.clone()) {
                (true, Some(ch)) => ch,
                _ => return Ok(()),
            };

            let leavers: Vec<_> = ch.members().filter(|m| !view.contains(m)).copied().collect();

            if leavers.is_empty() {
                return Ok(());
            }

            for l in leavers.iter() {
                if !state.leavers.contains(l) {
                    state.leavers.push(*l);
                }
            }

            state.ch = Some(Arc::new(ch.without_members(&leavers)));
            leavers
        };

        info!("{} observed {:?} leaving", self.addr, leavers);
        RehashTask::leave(leavers).run(self.clone()).await
    }

    /// Handle views from `views` until it closes.
    pub async fn accept(self: Arc<Self>, mut views: mpsc::Receiver<View>) {
        while let Some(view) = views.recv().await {
            if let Err(e) = self.handle_view_change(&view).await {
                error!("rehash after view change failed: {}", e);
            }
        }
    }

    /// Returns the locally stored value of `key`.
    pub fn get(&self, key: &[u8]) -> Option<Value> {
        self.container.get(key)
    }

    /// Apply `cmd` to the local store, logging it if a rehash needs it forwarded.
    ///
    /// Blocks while the transaction log is locked.
    pub async fn write(&self, cmd: WriteCommand) {
        self.tx_log.log_write(&cmd, &*self.container).await;
    }

    /// Prepare a transaction. One phase prepares are applied immediately.
    pub async fn prepare(&self, cmd: PrepareCommand) {
        self.tx_log.log_prepare(&cmd, &*self.container).await;

        if !cmd.one_phase {
            self.state.write().await.prepared.insert(cmd.tx, cmd);
        }
    }

    /// Commit a prepared transaction. Returns false if `tx` is not prepared locally.
    pub async fn commit(&self, tx: &TxId) -> bool {
        let prepared = self.state.write().await.prepared.remove(tx);

        match prepared {
            Some(cmd) => {
                self.tx_log.log_commit(tx, &cmd.modifications, &*self.container).await;
                true
            }

            None => false,
        }
    }

    /// Roll back a prepared transaction. Returns false if `tx` is not prepared locally.
    pub async fn rollback(&self, tx: &TxId) -> bool {
        self.tx_log.log_rollback(tx).await;
        self.state.write().await.prepared.remove(tx).is_some()
    }

    /// Returns true if `tx` is prepared locally.
    pub async fn is_prepared(&self, tx: &TxId) -> bool {
        self.state.read().await.prepared.contains_key(tx)
    }

    /// Wait for no other rehash to be running, then mark one as running.
    pub(crate) async fn begin_rehash(&self) {
        loop {
            let done = self.rehash_done.notified();

            {
                let mut state = self.state.write().await;

                if !state.rehash_in_progress {
                    state.rehash_in_progress = true;
                    return;
                }
            }

            debug!("{} waiting for an in-flight rehash", self.addr);
            done.await;
        }
    }

    pub(crate) async fn end_rehash(&self) {
        self.state.write().await.rehash_in_progress = false;
        self.rehash_done.notify_waiters();
    }

    pub(crate) async fn install(&self, ch: Arc<ConsistentHash>) {
        debug!("{} installing ring of {} members", self.addr, ch.len());
        self.state.write().await.ch = Some(ch);
    }

    pub(crate) async fn merge_topology<I>(&self, infos: I)
    where I: IntoIterator<Item = NodeTopologyInfo> {
        self.state.write().await.topology.extend(infos);
    }

    pub(crate) async fn abandon_join(&self) {
        self.state.write().await.ch = None;
    }

    pub(crate) async fn mark_join_finished(&self, joined: bool) {
        self.state.write().await.join_complete = joined;
    }

    /// Forget `leavers`, and any acks for their round.
    pub(crate) async fn finish_leave(&self, leavers: &[Address]) {
        let mut state = self.state.write().await;
        let round = round_of(leavers);

        state.leavers.retain(|l| !leavers.contains(l));

        for l in leavers {
            state.topology.remove(l);
        }

        state.leave_acks.retain(|(_, r)| *r != round);
    }

    /// Wait until every member of `receivers` has finished pulling state for the round of
    /// `leavers`.
    pub(crate) async fn await_leave_acks(
        &self,
        leavers: &[Address],
        receivers: &[Address],
        deadline: Duration,
    ) -> Result<(), RehashError> {
        let round = round_of(leavers);

        let wait = async {
            loop {
                let acked = self.leave_acked.notified();

                {
                    let state = self.state.read().await;

                    let acked = |r: &Address| state.leave_acks.contains(&(*r, round.clone()));

                    if receivers.iter().all(acked) {
                        return;
                    }
                }

                acked.await;
            }
        };

        (timeout(deadline, wait).await).map_err(|_| RehashError::Timeout {
            what: "receivers to finish pulling state",
            after: deadline,
        })
    }

    /// Store the entries of `state` that the local member owns under `ch`.
    pub(crate) fn apply_state(&self, ch: &ConsistentHash, state: StateChunk) {
        let n = self.cfg.num_owners;

        for (key, value) in state {
            if ch.is_key_local_to(&self.addr, &key, n) {
                self.container.put(key, value);
            } else {
                debug!("{} discarding pulled entry it does not own", self.addr);
            }
        }
    }

    /// Drop any of `keys` the local member does not own under its current ring. Returns the
    /// number of entries dropped.
    pub(crate) async fn drop_unowned(&self, keys: &[Key]) -> usize {
        let ch = self.consistent_hash().await;
        let n = self.cfg.num_owners;

        (keys.iter())
            .filter(|k| !(ch.as_ref()).map_or(false, |ch| ch.is_key_local_to(&self.addr, k, n)))
            .filter(|k| self.container.remove(k).is_some())
            .count()
    }

    /// Entries held locally that `joiner` newly owns under `new`.
    fn state_for_join(
        &self,
        joiner: &Address,
        old: &ConsistentHash,
        new: &ConsistentHash,
    ) -> StateChunk {
        let n = self.cfg.num_owners;
        let gained = |k: &Key| {
            new.is_key_local_to(joiner, k, n) && !old.is_key_local_to(joiner, k, n)
        };

        (self.container.entries().into_iter())
            .filter(|(k, _)| gained(k))
            .collect()
    }

    /// Entries held locally that `receiver` newly owns under `new` because `leavers` left.
    fn state_for_leave(
        &self,
        receiver: &Address,
        old: &ConsistentHash,
        new: &ConsistentHash,
        leavers: &[Address],
    ) -> StateChunk {
        let n = self.cfg.num_owners;

        let moved = |key: &Key| {
            let old_owners = old.locate(key, n);
            guard!(leavers.iter().any(|l| old_owners.contains(l)));
            guard!(!old_owners.contains(receiver));
            guard!(new.is_key_local_to(receiver, key, n), ())
        };

        (self.container.entries().into_iter())
            .filter(|(k, _)| moved(k).is_some())
            .collect()
    }

    /// Wait until the local member has finished every leave observed before the round of
    /// `leavers`, and holds a ring no older than `old`. Gives up after the rpc timeout.
    async fn await_earlier_leaves(&self, old: &ConsistentHash, leavers: &[Address]) {
        let wait = async {
            loop {
                let done = self.rehash_done.notified();

                if self.has_caught_up(old, leavers).await {
                    return;
                }

                done.await;
            }
        };

        if timeout(self.cfg.rehash_rpc_timeout, wait).await.is_err() {
            warn!("{} answering a pull before catching up with earlier leaves", self.addr);
        }
    }

    async fn has_caught_up(&self, old: &ConsistentHash, leavers: &[Address]) -> bool {
        let state = self.state.read().await;

        let stale = (state.ch.as_ref())
            .map_or(false, |ch| ch.members().any(|m| !old.contains(m) && !leavers.contains(m)));

        // leavers are observed in order, so anything ahead of this round came before it
        let earlier = (state.leavers.iter())
            .position(|l| leavers.contains(l))
            .unwrap_or_else(|| state.leavers.len());

        !stale && earlier == 0
    }

    async fn handle_join_request(&self, sender: Address) -> Response {
        let mut state = self.state.write().await;

        let ch = match (&state.ch, state.join_complete, state.rehash_in_progress) {
            (Some(ch), true, false) => ch.clone(),
            _ => return Response::Unsuccessful,
        };

        if let Some(joiner) = state.joiner.filter(|j| *j != sender) {
            debug!("{} refusing {}: {} is still joining", self.addr, sender, joiner);
            return Response::Unsuccessful;
        }

        state.joiner = Some(sender);

        Response::Success(ResponseValue::Members {
            members: ch.members().copied().collect(),
            topology: state.topology.iter().cloned().collect(),
        })
    }

    async fn handle_join_start(&self, sender: Address, topology: NodeTopologyInfo) -> Response {
        let mut state = self.state.write().await;
        state.topology.add(topology);

        if let Some(ch) = state.ch.clone() {
            if !ch.contains(&sender) {
                info!("{} adding joiner {} to its ring", self.addr, sender);
                state.ch = Some(Arc::new(ch.with_members(&[sender], &state.topology)));
            }
        }

        Response::Success(ResponseValue::Topology(self.cfg.node_topology(self.addr)))
    }

    async fn handle_join_abort(&self, sender: Address) -> Response {
        let mut state = self.state.write().await;
        warn!("{} discarding aborted joiner {}", self.addr, sender);

        if let Some(ch) = state.ch.clone() {
            if ch.contains(&sender) {
                state.ch = Some(Arc::new(ch.without_members(&[sender])));
            }
        }

        state.topology.remove(&sender);

        if state.joiner == Some(sender) {
            state.joiner = None;
        }

        Response::ack()
    }
}

#[crate::async_trait]
impl InboundHandler for DistributionManager {
    async fn handle(&self, cmd: RehashCommand) -> Response {
        use RehashCommand::*;

        debug!("{} handling {} from {}", self.addr, cmd.kind(), cmd.sender());

        match cmd {
            JoinRequest { sender } => self.handle_join_request(sender).await,

            JoinRehashStart { sender, topology } => self.handle_join_start(sender, topology).await,

            JoinRehashEnd { sender } => {
                let mut state = self.state.write().await;
                if state.joiner == Some(sender) {
                    state.joiner = None;
                }
                Response::ack()
            }

            JoinAbort { sender } => self.handle_join_abort(sender).await,

            PullStateJoin { sender, old, new } => {
                let state = self.state_for_join(&sender, &old, &new);
                Response::Success(ResponseValue::State(state))
            }

            PullStateLeave { sender, old, new, leavers } => {
                self.await_earlier_leaves(&old, &leavers).await;

                // anything written after the snapshot must reach the round's log
                let snapshot = || self.state_for_leave(&sender, &old, &new, &leavers);
                let state = self.tx_log.enable_with(&leavers, snapshot).await;

                Response::Success(ResponseValue::State(state))
            }

            LeaveRehashEnd { sender, leavers } => {
                self.state.write().await.leave_acks.insert((sender, round_of(&leavers)));
                self.leave_acked.notify_waiters();
                Response::ack()
            }

            ApplyTxLog { commands, .. } => {
                for c in commands.iter() {
                    c.apply(&*self.container);
                }
                Response::ack()
            }

            ApplyPendingPrepares { prepares, .. } => {
                let mut state = self.state.write().await;

                for p in prepares {
                    if p.one_phase {
                        p.apply(&*self.container);
                    } else {
                        state.prepared.insert(p.tx, p);
                    }
                }

                Response::ack()
            }

            Invalidate { keys, .. } => {
                self.drop_unowned(&keys).await;
                Response::ack()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{container::MemoryContainer, simulation::Network, txlog::LoggerState};
    use std::net::SocketAddr;

    fn addr(port: u16) -> Address {
        Address::from(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn member(net: &Network, port: u16) -> Arc<DistributionManager> {
        let cfg = RehashConfig::low_latency();
        let container = Arc::new(MemoryContainer::new());
        let dm = DistributionManager::new(cfg, net.transport(addr(port)), container);
        net.register(addr(port), &dm);
        dm
    }

    #[tokio::test]
    async fn coordinator_bootstraps_alone() {
        let net = Network::new();
        net.set_view(vec![addr(1)]);
        let dm = member(&net, 1);

        assert!(dm.consistent_hash().await.is_none());
        dm.join().await.unwrap();

        let ch = dm.consistent_hash().await.unwrap();
        assert_eq!(ch.members().copied().collect::<Vec<_>>(), vec![addr(1)]);
        assert!(dm.is_join_complete().await);
        assert!(dm.is_local(b"anything").await);
        assert!(matches!(dm.join().await, Err(RehashError::AlreadyJoined(a)) if a == addr(1)));
        assert!(net.sent().is_empty());
    }

    #[tokio::test]
    async fn pulled_state_is_filtered_by_ownership() {
        let net = Network::new();
        let dm = member(&net, 1);
        let ch = ConsistentHash::new(vec![addr(1), addr(2), addr(3)]);

        let state: StateChunk = (0..100u32)
            .map(|i| (Key::from(format!("key-{}", i)), Value::from("v")))
            .collect();
        dm.apply_state(&ch, state.clone());

        for (k, _) in state {
            assert_eq!(dm.get(&k).is_some(), ch.is_key_local_to(&addr(1), &k, 2));
        }
    }

    #[tokio::test]
    async fn drop_unowned_keeps_owned_keys() {
        let net = Network::new();
        let dm = member(&net, 1);
        let ch = Arc::new(ConsistentHash::new(vec![addr(1), addr(2), addr(3)]));
        dm.install(ch.clone()).await;

        let keys: Vec<Key> = (0..100u32).map(|i| Key::from(format!("key-{}", i))).collect();
        for k in keys.iter() {
            dm.container().put(k.clone(), Value::from("v"));
        }

        let owned = (keys.iter()).filter(|k| ch.is_key_local_to(&addr(1), k, 2)).count();
        assert_eq!(dm.drop_unowned(&keys).await, keys.len() - owned);
        assert_eq!(dm.container().len(), owned);
    }

    #[tokio::test]
    async fn transactions_commit_and_roll_back() {
        let net = Network::new();
        let dm = member(&net, 1);
        let tx = |seq| TxId { origin: addr(1), seq };

        let prepare = |seq, key: &'static str| PrepareCommand {
            tx: tx(seq),
            modifications: vec![WriteCommand::put(key, "v")],
            one_phase: false,
        };

        dm.prepare(prepare(1, "a")).await;
        dm.prepare(prepare(2, "b")).await;
        assert!(dm.is_prepared(&tx(1)).await);
        assert_eq!(dm.get(b"a"), None);

        assert!(dm.commit(&tx(1)).await);
        assert!(dm.rollback(&tx(2)).await);
        assert!(!dm.commit(&tx(2)).await);

        assert_eq!(dm.get(b"a"), Some(Value::from("v")));
        assert_eq!(dm.get(b"b"), None);

        dm.prepare(PrepareCommand {
            one_phase: true,
            ..prepare(3, "c")
        })
        .await;
        assert!(!dm.is_prepared(&tx(3)).await);
        assert_eq!(dm.get(b"c"), Some(Value::from("v")));
    }

    #[tokio::test]
    async fn pull_on_leave_enables_the_log() {
        let net = Network::new();
        let dm = member(&net, 1);
        let old = Arc::new(ConsistentHash::new(vec![addr(1), addr(2), addr(3)]));
        let new = Arc::new(old.without_members(&[addr(2)]));

        let cmd = RehashCommand::PullStateLeave {
            sender: addr(3),
            old,
            new,
            leavers: vec![addr(2)],
        };

        assert!(dm.handle(cmd).await.is_success());
        assert_eq!(dm.tx_logger().state_of(&[addr(2)]).await, LoggerState::Enabled);

        dm.write(WriteCommand::put("k", "v")).await;
        assert_eq!(dm.tx_logger().drain(&[addr(2)]).await, vec![WriteCommand::put("k", "v")]);
        assert_eq!(dm.get(b"k"), Some(Value::from("v")));
    }

    #[tokio::test]
    async fn later_rounds_keep_their_logs() {
        let net = Network::new();
        let cfg = RehashConfig {
            state_retrieval_timeout: Duration::from_millis(50),
            rehash_rpc_timeout: Duration::from_millis(50),
            ..RehashConfig::low_latency()
        };
        let dm = DistributionManager::new(
            cfg,
            net.transport(addr(1)),
            Arc::new(MemoryContainer::new()),
        );
        net.register(addr(1), &dm);

        let all = Arc::new(ConsistentHash::new((1..=5).map(addr)));
        dm.install(all.clone()).await;

        // a receiver of the second round pulls before this member has seen the first leave,
        // and gets its answer once the wait for it times out
        let after_first = Arc::new(all.without_members(&[addr(2)]));
        let after_second = Arc::new(after_first.without_members(&[addr(4)]));
        let pull = RehashCommand::PullStateLeave {
            sender: addr(5),
            old: after_first,
            new: after_second,
            leavers: vec![addr(4)],
        };
        assert!(dm.handle(pull).await.is_success());

        dm.write(WriteCommand::put("k", "after")).await;

        // the first round fails or succeeds, but can't take the second round's log with it
        let _ = dm.handle_view_change(&View::new([1, 3, 4, 5].iter().map(|&p| addr(p)))).await;

        let log = dm.tx_logger();
        assert_eq!(log.state_of(&[addr(2)]).await, LoggerState::Disabled);
        assert_eq!(log.state_of(&[addr(4)]).await, LoggerState::Enabled);
        assert_eq!(log.drain(&[addr(4)]).await, vec![WriteCommand::put("k", "after")]);
    }

    #[tokio::test]
    async fn pulls_wait_for_earlier_leaves() {
        let net = Network::new();
        let dm = member(&net, 1);

        let all = ConsistentHash::new((1..=5).map(addr));
        let after_first = Arc::new(all.without_members(&[addr(2)]));
        let after_second = Arc::new(after_first.without_members(&[addr(4)]));
        dm.install(after_first.clone()).await;

        dm.begin_rehash().await;
        dm.state.write().await.leavers.push(addr(2));

        let pull = RehashCommand::PullStateLeave {
            sender: addr(5),
            old: after_first,
            new: after_second,
            leavers: vec![addr(4)],
        };
        let mut answer = tokio::spawn({
            let dm = dm.clone();
            async move { dm.handle(pull).await }
        });

        assert!(timeout(Duration::from_millis(20), &mut answer).await.is_err());

        dm.finish_leave(&[addr(2)]).await;
        dm.end_rehash().await;

        assert!(answer.await.unwrap().is_success());
        assert_eq!(dm.tx_logger().state_of(&[addr(4)]).await, LoggerState::Enabled);
    }

    #[tokio::test]
    async fn leave_acks_are_counted_per_round() {
        let net = Network::new();
        let dm = member(&net, 1);
        let ack = |leaver| RehashCommand::LeaveRehashEnd {
            sender: addr(3),
            leavers: vec![addr(leaver)],
        };
        let wait = Duration::from_millis(20);

        // an ack for another round doesn't release this one
        dm.handle(ack(4)).await;
        let err = dm.await_leave_acks(&[addr(2)], &[addr(3)], wait).await.unwrap_err();
        assert!(err.is_timeout());

        dm.handle(ack(2)).await;
        dm.await_leave_acks(&[addr(2)], &[addr(3)], wait).await.unwrap();

        dm.finish_leave(&[addr(2)]).await;
        assert!(dm.await_leave_acks(&[addr(2)], &[addr(3)], wait).await.is_err());
        dm.await_leave_acks(&[addr(4)], &[addr(3)], wait).await.unwrap();
    }

    #[tokio::test]
    async fn coordinator_admits_one_joiner_at_a_time() {
        let net = Network::new();
        net.set_view(vec![addr(1), addr(2), addr(3)]);
        let dm = member(&net, 1);
        dm.join().await.unwrap();

        let req = |p| RehashCommand::JoinRequest { sender: addr(p) };

        match dm.handle(req(2)).await {
            Response::Success(ResponseValue::Members { members, topology }) => {
                assert_eq!(members, vec![addr(1)]);
                assert_eq!(topology.len(), 1);
            }
            resp => panic!("unexpected response: {:?}", resp),
        }

        assert!(!dm.handle(req(3)).await.is_success());
        assert!(dm.handle(req(2)).await.is_success());

        dm.handle(RehashCommand::JoinRehashEnd { sender: addr(2) }).await;
        assert!(dm.handle(req(3)).await.is_success());

        // a joiner that vanished from the view no longer blocks others
        dm.handle_view_change(&View::new(vec![addr(1), addr(2)])).await.unwrap();
        assert!(dm.handle(req(2)).await.is_success());
    }

    #[tokio::test]
    async fn aborted_joiners_are_forgotten() {
        let net = Network::new();
        net.set_view(vec![addr(1)]);
        let dm = member(&net, 1);
        dm.join().await.unwrap();

        let start = RehashCommand::JoinRehashStart {
            sender: addr(2),
            topology: NodeTopologyInfo::new(addr(2)).site("s2"),
        };
        dm.handle(start).await;
        assert!(dm.consistent_hash().await.unwrap().contains(&addr(2)));
        assert!(dm.topology().await.contains(&addr(2)));

        dm.handle(RehashCommand::JoinAbort { sender: addr(2) }).await;
        assert!(!dm.consistent_hash().await.unwrap().contains(&addr(2)));
        assert!(!dm.topology().await.contains(&addr(2)));
    }

    #[tokio::test]
    async fn views_without_the_local_member_are_ignored() {
        let net = Network::new();
        net.set_view(vec![addr(1)]);
        let dm = member(&net, 1);
        dm.join().await.unwrap();

        let before = dm.consistent_hash().await;
        dm.handle_view_change(&View::new(vec![addr(2)])).await.unwrap();
        assert_eq!(dm.consistent_hash().await, before);
        assert!(!dm.is_rehash_in_progress().await);
    }

    #[tokio::test]
    async fn rehashes_are_serialized() {
        let net = Network::new();
        let dm = member(&net, 1);

        dm.begin_rehash().await;
        assert!(dm.is_rehash_in_progress().await);

        let mut waiter = tokio::spawn({
            let dm = dm.clone();
            async move {
                dm.begin_rehash().await;
                dm.end_rehash().await;
            }
        });

        assert!(timeout(Duration::from_millis(20), &mut waiter).await.is_err());

        dm.end_rehash().await;
        waiter.await.unwrap();
        dm.wait_for_rehash().await;
        assert!(!dm.is_rehash_in_progress().await);
    }
}
