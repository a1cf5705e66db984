// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Push-based state transfer off of one or more leaving members.
//!
//! Surviving members take one or both of two roles:
//!
//! * Receivers newly own keys a leaver owned. They pull those entries from every provider,
//!   then tell the providers they are done.
//! * Providers held replicas of a leaver's keys. Once every receiver is done pulling, they
//!   forward writes logged since the pull began, and any prepared transactions.
//!
//! Providers log writes from the moment they learn of the leave (or are first pulled from),
//! so anything missing from a receiver's snapshot is forwarded from the log.
use super::{
    aggregate::{PendingPreparesMap, TransactionLogMap},
    invalidate_invalid_holders, push_batches, RehashError,
};
use crate::{
    command::{RehashCommand, Response, ResponseValue, WriteCommand},
    hash::{ConsistentHash, LeaveTransfers},
    manager::DistributionManager,
    transport::{invoke_many, spawn_invoke},
    Address,
};
use log::{debug, error, info, warn};
use std::{sync::Arc, time::Instant};

/// Moves state off of leaving members.
pub struct LeaveTask {
    leavers: Vec<Address>,
    rings: Option<(Arc<ConsistentHash>, Arc<ConsistentHash>)>,
    transfers: LeaveTransfers,
    started: Instant,
}

impl LeaveTask {
    pub(super) fn new(leavers: Vec<Address>) -> Self {
        Self {
            leavers,
            rings: None,
            transfers: LeaveTransfers::default(),
            started: Instant::now(),
        }
    }

    /// Returns the leavers handled by this task.
    pub fn leavers(&self) -> &[Address] {
        &self.leavers
    }

    fn is_receiver(&self, addr: &Address) -> bool {
        self.transfers.receivers.contains(addr)
    }

    fn is_sender(&self, addr: &Address) -> bool {
        self.transfers.providers.contains(addr)
    }

    pub(super) async fn acquire_permission(
        &mut self,
        dm: &Arc<DistributionManager>,
    ) -> Result<(), RehashError> {
        let local = dm.local_addr();

        let new = match dm.consistent_hash().await {
            Some(new) => new,
            None => return Ok(()),
        };
        let old = Arc::new(new.with_members(&self.leavers, &dm.topology().await));

        self.transfers = old.state_transfers_on_leave(&new, &self.leavers, dm.config().num_owners);

        if self.is_sender(&local) {
            dm.tx_logger().enable(&self.leavers).await;
        }

        info!(
            "{} commencing leave rehash of {:?} (sender: {}, receiver: {})",
            local,
            self.leavers,
            self.is_sender(&local),
            self.is_receiver(&local),
        );

        self.rings = Some((old, new));
        Ok(())
    }

    pub(super) async fn transfer_state(
        &mut self,
        dm: &Arc<DistributionManager>,
    ) -> Result<(), RehashError> {
        let local = dm.local_addr();

        let (old, new) = match (dm.config().rehash_enabled, &self.rings) {
            (true, Some(rings)) => rings.clone(),
            _ => return Ok(()),
        };

        if self.is_receiver(&local) {
            let pulled = self.pull_state(dm, &old, &new).await;

            let providers = self.others(&self.transfers.providers, &local);
            let done = RehashCommand::LeaveRehashEnd {
                sender: local,
                leavers: self.leavers.clone(),
            };
            spawn_invoke(dm.transport_handle(), providers, done, dm.config().rehash_rpc_timeout);

            pulled?;
        }

        if self.is_sender(&local) {
            let receivers = self.others(&self.transfers.receivers, &local);
            let deadline = dm.config().state_retrieval_timeout;
            dm.await_leave_acks(&self.leavers, &receivers, deadline).await?;

            self.drain_tx_log(dm, &old, &new).await;
            invalidate_invalid_holders(dm, &old, &new).await;
        }

        Ok(())
    }

    pub(super) async fn finalize(
        &mut self,
        dm: &Arc<DistributionManager>,
        outcome: Result<(), RehashError>,
    ) -> Result<(), RehashError> {
        let local = dm.local_addr();

        dm.finish_leave(&self.leavers).await;

        // pulls may have enabled the round's log here even if this member is no sender
        dm.tx_logger().unlock_and_disable(&self.leavers).await;

        match outcome {
            Ok(()) => {
                let elapsed = self.started.elapsed();
                info!("{} completed leave rehash of {:?} in {:?}", local, self.leavers, elapsed);
                Ok(())
            }

            Err(e) => {
                error!("{} failed leave rehash of {:?}: {}", local, self.leavers, e);
                Err(RehashError::LeaveFailed(Box::new(e)))
            }
        }
    }

    fn others(&self, members: &[Address], local: &Address) -> Vec<Address> {
        members.iter().filter(|m| *m != local).copied().collect()
    }

    /// Pull the entries this member newly owns from every provider.
    async fn pull_state(
        &self,
        dm: &DistributionManager,
        old: &Arc<ConsistentHash>,
        new: &Arc<ConsistentHash>,
    ) -> Result<(), RehashError> {
        let local = dm.local_addr();
        let providers = self.others(&self.transfers.providers, &local);

        let cmd = RehashCommand::PullStateLeave {
            sender: local,
            old: old.clone(),
            new: new.clone(),
            leavers: self.leavers.clone(),
        };

        let deadline = dm.config().rehash_rpc_timeout;
        let mut first_err = None;

        for (provider, resp) in invoke_many(dm.transport(), providers, &cmd, deadline).await {
            match resp {
                Ok(Response::Success(ResponseValue::State(state))) => {
                    debug!("pulled {} entries from {}", state.len(), provider);
                    dm.apply_state(new, state);
                }

                Ok(resp) => warn!("skipping state of {}: {:?}", provider, resp),

                Err(source) => {
                    first_err.get_or_insert(RehashError::rpc(&cmd, provider, source));
                }
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    /// Forward everything logged since logging was enabled, then any pending prepares, and
    /// disable the log.
    async fn drain_tx_log(
        &self,
        dm: &DistributionManager,
        old: &ConsistentHash,
        new: &ConsistentHash,
    ) {
        let log = dm.tx_logger();

        while log.should_drain_without_lock(&self.leavers).await {
            let batch = log.drain(&self.leavers).await;
            self.forward_writes(dm, old, new, batch).await;
        }

        let last = log.drain_and_lock(&self.leavers).await;
        self.forward_writes(dm, old, new, last).await;

        let pending = log.pending_prepares(&self.leavers).await;

        if !pending.is_empty() {
            let n = dm.config().num_owners;
            let mut map = PendingPreparesMap::new(&self.leavers, old, new, n);
            map.extend(pending);

            #[rustfmt::skip]
            let failed = push_batches(dm, map.into_state(), |sender, prepares| {
                RehashCommand::ApplyPendingPrepares { sender, prepares }
            }).await;

            if failed > 0 {
                warn!("failed to forward pending prepares to {} members", failed);
            }
        }

        log.unlock_and_disable(&self.leavers).await;
    }

    async fn forward_writes(
        &self,
        dm: &DistributionManager,
        old: &ConsistentHash,
        new: &ConsistentHash,
        batch: Vec<WriteCommand>,
    ) {
        if batch.is_empty() {
            return;
        }

        debug!("forwarding a batch of {} logged writes", batch.len());

        let n = dm.config().num_owners;
        let mut map = TransactionLogMap::new(&self.leavers, old, new, n);
        map.extend(batch);

        #[rustfmt::skip]
        let failed = push_batches(dm, map.into_state(), |sender, commands| {
            RehashCommand::ApplyTxLog { sender, commands }
        }).await;

        if failed > 0 {
            warn!("failed to forward logged writes to {} members", failed);
        }
    }
}
