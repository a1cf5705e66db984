// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Logs of writes accepted while state is being moved off of leaving members.
//!
//! Each leave round (identified by its set of leavers) has its own log:
//!
//! ```text
//!  DISABLED --enable--> ENABLED --drain--> DRAINING
//!     ^                    |                  |
//!     |               drain_and_lock    drain_and_lock
//!     |                    v                  |
//!     +--unlock_and_disable-- LOCKED <--------+
//! ```
//!
//! Every write is applied to the local store while the logs are held, so it is either
//! visible to a snapshot taken with [enable_with][TransactionLogger::enable_with] or
//! logged for every round enabled by then. While any round is `LOCKED`, writers block.
use crate::{
    command::{PrepareCommand, TxId, WriteCommand},
    container::DataContainer,
    Address,
};
use std::{
    collections::{BTreeMap, VecDeque},
    mem,
};
use tokio::sync::{Mutex, Notify};

/// The state of a leave round's log.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoggerState {
    /// Writes are not logged.
    Disabled,
    /// Writes are logged.
    Enabled,
    /// Writes are logged, and at least one batch has been drained.
    Draining,
    /// Writes block until the round is disabled.
    Locked,
}

/// Returns the key of the leave round for `leavers`.
pub(crate) fn round_of(leavers: &[Address]) -> Vec<Address> {
    let mut round = leavers.to_vec();
    round.sort();
    round.dedup();
    round
}

/// Buffers writes and in-flight prepares during leave rehashes.
pub struct TransactionLogger {
    inner: Mutex<Rounds>,
    unlocked: Notify,
    drain_threshold: usize,
}

struct Round {
    state: LoggerState,
    log: VecDeque<WriteCommand>,
    prepares: BTreeMap<TxId, PrepareCommand>,
}

impl Round {
    fn is_logging(&self) -> bool {
        matches!(self.state, LoggerState::Enabled | LoggerState::Draining)
    }
}

type Rounds = BTreeMap<Vec<Address>, Round>;

impl TransactionLogger {
    /// Returns a logger with no enabled rounds, that reports a backlog once a round has more
    /// than `drain_threshold` writes logged.
    pub fn new(drain_threshold: usize) -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
            unlocked: Notify::new(),
            drain_threshold,
        }
    }

    /// Returns the most advanced state of any round.
    pub async fn state(&self) -> LoggerState {
        let rounds = self.inner.lock().await;
        (rounds.values().map(|r| r.state).max()).unwrap_or(LoggerState::Disabled)
    }

    /// Returns the state of the round for `leavers`.
    pub async fn state_of(&self, leavers: &[Address]) -> LoggerState {
        let rounds = self.inner.lock().await;
        (rounds.get(&round_of(leavers)).map(|r| r.state)).unwrap_or(LoggerState::Disabled)
    }

    /// Returns true if writes are logged for any round.
    pub async fn is_enabled(&self) -> bool {
        self.inner.lock().await.values().any(Round::is_logging)
    }

    /// Start logging writes for the round of `leavers`. Has no effect if the round is
    /// already enabled, even if it is locked.
    pub async fn enable(&self, leavers: &[Address]) {
        self.enable_with(leavers, || ()).await
    }

    /// Enable the round of `leavers`, then run `f` before any further write is applied.
    ///
    /// A write applied after `f` runs is logged for the round.
    pub async fn enable_with<T, F: FnOnce() -> T>(&self, leavers: &[Address], f: F) -> T {
        let mut rounds = self.inner.lock().await;

        (rounds.entry(round_of(leavers))).or_insert_with(|| Round {
            state: LoggerState::Enabled,
            log: VecDeque::new(),
            prepares: BTreeMap::new(),
        });

        f()
    }

    /// Run `f` against every round once none are locked. Returns whether any round is
    /// logging.
    async fn when_unlocked<F: FnOnce(&mut Rounds)>(&self, f: F) -> bool {
        loop {
            let unlocked = self.unlocked.notified();
            let mut rounds = self.inner.lock().await;

            if rounds.values().any(|r| r.state == LoggerState::Locked) {
                drop(rounds);
                unlocked.await;
                continue;
            }

            f(&mut *rounds);
            return !rounds.is_empty();
        }
    }

    /// Apply `cmd` to `store`, logging it for every enabled round. Blocks while any round
    /// is locked.
    ///
    /// Returns true if `cmd` was logged.
    pub async fn log_write(&self, cmd: &WriteCommand, store: &dyn DataContainer) -> bool {
        (self.when_unlocked(|rounds| {
            cmd.apply(store);

            for r in rounds.values_mut() {
                r.log.push_back(cmd.clone());
            }
        }))
        .await
    }

    /// Log a prepare for every enabled round, applying it to `store` if it is one phase.
    /// Blocks while any round is locked.
    ///
    /// One phase prepares are logged as their modifications, others are held until they
    /// commit or roll back.
    pub async fn log_prepare(&self, cmd: &PrepareCommand, store: &dyn DataContainer) -> bool {
        (self.when_unlocked(|rounds| {
            if cmd.one_phase {
                cmd.apply(store);
            }

            for r in rounds.values_mut() {
                if cmd.one_phase {
                    r.log.extend(cmd.modifications.iter().cloned());
                } else {
                    r.prepares.insert(cmd.tx, cmd.clone());
                }
            }
        }))
        .await
    }

    /// Apply the commit of `tx` to `store`, logging its `modifications` for every enabled
    /// round. Blocks while any round is locked.
    pub async fn log_commit(
        &self,
        tx: &TxId,
        modifications: &[WriteCommand],
        store: &dyn DataContainer,
    ) -> bool {
        (self.when_unlocked(|rounds| {
            for m in modifications {
                m.apply(store);
            }

            for r in rounds.values_mut() {
                r.prepares.remove(tx);
                r.log.extend(modifications.iter().cloned());
            }
        }))
        .await
    }

    /// Log the rollback of `tx`. Blocks while any round is locked.
    ///
    /// Returns true if `tx` was pending in any round.
    pub async fn log_rollback(&self, tx: &TxId) -> bool {
        let mut pending = false;

        (self.when_unlocked(|rounds| {
            for r in rounds.values_mut() {
                pending |= r.prepares.remove(tx).is_some();
            }
        }))
        .await;

        pending
    }

    /// Returns true if the round of `leavers` has enough writes logged that they should be
    /// drained before it is locked.
    pub async fn should_drain_without_lock(&self, leavers: &[Address]) -> bool {
        let rounds = self.inner.lock().await;

        (rounds.get(&round_of(leavers)))
            .map_or(false, |r| r.is_logging() && r.log.len() > self.drain_threshold)
    }

    /// Remove and return all writes logged for the round of `leavers`, without blocking
    /// writers.
    pub async fn drain(&self, leavers: &[Address]) -> Vec<WriteCommand> {
        let mut rounds = self.inner.lock().await;

        match rounds.get_mut(&round_of(leavers)) {
            Some(r) => {
                if r.state == LoggerState::Enabled {
                    r.state = LoggerState::Draining;
                }
                mem::take(&mut r.log).into()
            }

            None => Vec::new(),
        }
    }

    /// Lock out writers and return everything logged for the round of `leavers` since the
    /// last drain.
    ///
    /// Together with the output of prior calls to [drain][Self::drain], this is every
    /// write logged since the round was enabled.
    pub async fn drain_and_lock(&self, leavers: &[Address]) -> Vec<WriteCommand> {
        let mut rounds = self.inner.lock().await;

        match rounds.get_mut(&round_of(leavers)) {
            Some(r) => {
                r.state = LoggerState::Locked;
                mem::take(&mut r.log).into()
            }

            None => Vec::new(),
        }
    }

    /// Returns every prepare logged for the round of `leavers` that has neither committed
    /// nor rolled back.
    pub async fn pending_prepares(&self, leavers: &[Address]) -> Vec<PrepareCommand> {
        let rounds = self.inner.lock().await;

        (rounds.get(&round_of(leavers)))
            .map(|r| r.prepares.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Disable the round of `leavers`, discarding anything still logged for it, and wake
    /// blocked writers. Other rounds are unaffected.
    ///
    /// This may be called from any state.
    pub async fn unlock_and_disable(&self, leavers: &[Address]) {
        self.inner.lock().await.remove(&round_of(leavers));
        self.unlocked.notify_waiters();
    }
}
