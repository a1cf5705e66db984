// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Rehash tasks, which move entries to their new owners after a membership change.
//!
//! Every task runs the same skeleton:
//!
//! 1. Wait for any other rehash on the local member to finish, and mark one in progress.
//! 2. `acquire_permission`: settle the old and new rings.
//! 3. `transfer_state`: move entries (skipped if an earlier phase failed).
//! 4. `finalize`: unconditional cleanup, which also decides the task's final result.
//! 5. Clear the in-progress mark and wake anyone waiting on it.
//!
//! A [JoinTask] is run by a joining member, which pulls state from existing members. A
//! [LeaveTask] is run by every surviving member when one or more members leave; members
//! that retained a leaver's replicas push them to members that newly own them.
pub mod aggregate;
mod join;
mod leave;

pub use join::JoinTask;
pub use leave::LeaveTask;

use crate::{
    command::{Key, RehashCommand, Response},
    hash::ConsistentHash,
    manager::DistributionManager,
    transport::{invoke_sync, spawn_invoke, RpcError},
    Address,
};
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, warn};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{info_span, Instrument};

/// A failed rehash.
#[derive(Debug, Error)]
pub enum RehashError {
    /// The local member has already joined.
    #[error("{0} has already joined")]
    AlreadyJoined(Address),

    /// No coordinator is known to the transport.
    #[error("no coordinator is known")]
    NoCoordinator,

    /// The coordinator never provided its ring.
    #[error("unable to retrieve the ring from the coordinator after {0:?}")]
    CoordinatorUnavailable(Duration),

    /// A wait did not finish in time.
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout {
        /// What was being waited on.
        what: &'static str,
        /// How long was waited.
        after: Duration,
    },

    /// A remote call failed.
    #[error("{cmd} to {target} failed: {source}")]
    Rpc {
        /// The kind of command sent.
        cmd: &'static str,
        /// The member it was sent to.
        target: Address,
        /// Why it failed.
        #[source]
        source: RpcError,
    },

    /// A spawned unit of work was cancelled or panicked.
    #[error("interrupted: {0}")]
    Interrupted(#[from] JoinError),

    /// A join failed, and was aborted.
    #[error("join aborted: {0}")]
    JoinAborted(#[source] Box<RehashError>),

    /// A leave rehash failed after cleanup ran.
    #[error("leave rehash failed: {0}")]
    LeaveFailed(#[source] Box<RehashError>),
}

impl RehashError {
    pub(crate) fn rpc(cmd: &RehashCommand, target: Address, source: RpcError) -> Self {
        let cmd = cmd.kind();
        Self::Rpc { cmd, target, source }
    }

    /// Returns true if this error was (ultimately) caused by a deadline passing.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::CoordinatorUnavailable(_) | Self::Timeout { .. } => true,
            Self::Rpc { source, .. } => matches!(source, RpcError::Timeout(_)),
            Self::JoinAborted(e) | Self::LeaveFailed(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// A unit of rehash work.
pub enum RehashTask {
    /// The local member is joining.
    Join(JoinTask),
    /// Members have left.
    Leave(LeaveTask),
}

impl RehashTask {
    /// Returns a task that joins the local member to the cluster.
    pub fn join() -> Self {
        Self::Join(JoinTask::new())
    }

    /// Returns a task that moves state off of `leavers`.
    pub fn leave(leavers: Vec<Address>) -> Self {
        Self::Leave(LeaveTask::new(leavers))
    }

    /// Returns a short name for this kind of task.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Leave(_) => "leave",
        }
    }

    /// Run the task to completion on `dm`.
    pub async fn run(mut self, dm: Arc<DistributionManager>) -> Result<(), RehashError> {
        let span = info_span!("rehash", kind = self.kind(), node = %dm.local_addr());

        async move {
            dm.begin_rehash().await;

            let outcome = match self.acquire_permission(&dm).await {
                Ok(()) => self.transfer_state(&dm).await,
                Err(e) => Err(e),
            };

            let result = self.finalize(&dm, outcome).await;
            dm.end_rehash().await;
            result
        }
        .instrument(span)
        .await
    }

    async fn acquire_permission(
        &mut self,
        dm: &Arc<DistributionManager>,
    ) -> Result<(), RehashError> {
        match self {
            Self::Join(t) => t.acquire_permission(dm).await,
            Self::Leave(t) => t.acquire_permission(dm).await,
        }
    }

    async fn transfer_state(&mut self, dm: &Arc<DistributionManager>) -> Result<(), RehashError> {
        match self {
            Self::Join(t) => t.transfer_state(dm).await,
            Self::Leave(t) => t.transfer_state(dm).await,
        }
    }

    async fn finalize(
        &mut self,
        dm: &Arc<DistributionManager>,
        outcome: Result<(), RehashError>,
    ) -> Result<(), RehashError> {
        match self {
            Self::Join(t) => t.finalize(dm, outcome).await,
            Self::Leave(t) => t.finalize(dm, outcome).await,
        }
    }
}

/// Push one batch to each destination, waiting for every push to finish.
///
/// Failed pushes are logged and skipped. Returns the number of failures.
pub(crate) async fn push_batches<T, F>(
    dm: &DistributionManager,
    batches: BTreeMap<Address, Vec<T>>,
    wrap: F,
) -> usize
where
    F: Fn(Address, Vec<T>) -> RehashCommand,
{
    let local = dm.local_addr();
    let deadline = dm.config().push_timeout();

    let mut pushes = (batches.into_iter())
        .filter(|(dest, batch)| *dest != local && !batch.is_empty())
        .map(|(dest, batch)| {
            let cmd = wrap(local, batch);
            let kind = cmd.kind();
            async move { (dest, kind, invoke_sync(dm.transport(), dest, cmd, deadline).await) }
        })
        .collect::<FuturesUnordered<_>>();

    let mut failures = 0;

    while let Some((dest, kind, resp)) = pushes.next().await {
        match resp {
            Ok(Response::Success(_)) => debug!("{} to {} succeeded", kind, dest),
            Ok(Response::Unsuccessful) => {
                warn!("{} to {} was unsuccessful", kind, dest);
                failures += 1;
            }
            Err(e) => {
                warn!("{} to {} failed: {}", kind, dest, e);
                failures += 1;
            }
        }
    }

    failures
}

/// Drop copies of keys held by members that no longer own them under `new`.
///
/// Local copies are dropped directly; live remote holders are told to drop theirs in the
/// background.
pub(crate) async fn invalidate_invalid_holders(
    dm: &DistributionManager,
    old: &ConsistentHash,
    new: &ConsistentHash,
) {
    let local = dm.local_addr();
    let n = dm.config().num_owners;

    let mut stale: BTreeMap<Address, Vec<Key>> = BTreeMap::new();

    for key in dm.container().keys() {
        let new_owners = new.locate(&key, n);

        for holder in old.locate(&key, n) {
            if !new_owners.contains(&holder) {
                stale.entry(holder).or_default().push(key.clone());
            }
        }
    }

    if let Some(keys) = stale.remove(&local) {
        let dropped = dm.drop_unowned(&keys).await;
        debug!("{} dropped {} entries it no longer owns", local, dropped);
    }

    for (holder, keys) in stale {
        if !new.contains(&holder) {
            continue;
        }

        debug!("invalidating {} entries on {}", keys.len(), holder);

        let cmd = RehashCommand::Invalidate {
            sender: local,
            keys,
        };

        let deadline = dm.config().rehash_rpc_timeout;
        spawn_invoke(dm.transport_handle(), vec![holder], cmd, deadline);
    }
}
