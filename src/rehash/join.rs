// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Pull-based state transfer onto a joining member.
use super::{invalidate_invalid_holders, RehashError};
use crate::{
    command::{RehashCommand, Response, ResponseValue},
    hash::{ConsistentHash, TopologyInfo},
    manager::DistributionManager,
    transport::{broadcast, invoke_sync, spawn_broadcast, RpcError},
    Address,
};
use futures::future::join_all;
use log::{debug, error, info, warn};
use rand::{thread_rng, Rng};
use std::{
    convert::TryFrom,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{sync::Semaphore, task, time::sleep};

/// Granularity of the randomized backoff between ring retrieval attempts.
const BACKOFF_STEP: Duration = Duration::from_millis(10);

/// Joins the local member to the cluster.
pub struct JoinTask {
    rings: Option<(Arc<ConsistentHash>, Arc<ConsistentHash>)>,
    // true once other members may have observed the join
    cleanup: bool,
    started: Instant,
}

impl JoinTask {
    pub(super) fn new() -> Self {
        Self {
            rings: None,
            cleanup: false,
            started: Instant::now(),
        }
    }

    pub(super) async fn acquire_permission(
        &mut self,
        dm: &Arc<DistributionManager>,
    ) -> Result<(), RehashError> {
        let local = dm.local_addr();
        info!("{} commencing join rehash", local);

        let old = Arc::new(retrieve_old_consistent_hash(dm).await?);
        let new = joined_hash(&old, local, &dm.topology().await);

        self.cleanup = true;
        dm.install(new.clone()).await;
        self.rings = Some((old, new));

        Ok(())
    }

    pub(super) async fn transfer_state(
        &mut self,
        dm: &Arc<DistributionManager>,
    ) -> Result<(), RehashError> {
        let (old, new) = match &self.rings {
            Some(rings) => rings.clone(),
            None => return Ok(()),
        };

        announce(dm).await;

        if !dm.config().rehash_enabled {
            return Ok(());
        }

        let local = dm.local_addr();
        let providers = new.state_providers_on_join(&local, dm.config().num_owners);
        debug!("{} pulling state from {:?}", local, providers);

        pull_state(dm, providers, old, new).await
    }

    pub(super) async fn finalize(
        &mut self,
        dm: &Arc<DistributionManager>,
        outcome: Result<(), RehashError>,
    ) -> Result<(), RehashError> {
        let local = dm.local_addr();
        let deadline = dm.config().rehash_rpc_timeout;

        if let Err(e) = outcome.as_ref() {
            error!("{} failed to join: {}", local, e);

            if self.cleanup {
                let abort = RehashCommand::JoinAbort { sender: local };
                spawn_broadcast(dm.transport_handle(), abort, deadline);
                dm.abandon_join().await;
            }
        }

        dm.mark_join_finished(outcome.is_ok()).await;
        dm.transport().block_till_no_longer_retrying().await;

        if let Err(e) = outcome {
            warn!("join of {} aborted after {:?}", local, self.started.elapsed());
            return Err(RehashError::JoinAborted(Box::new(e)));
        }

        let end = RehashCommand::JoinRehashEnd { sender: local };
        spawn_broadcast(dm.transport_handle(), end, deadline);

        if let (true, Some((old, new))) = (dm.config().rehash_enabled, self.rings.as_ref()) {
            invalidate_invalid_holders(dm, old, new).await;
        }

        info!("{} completed join rehash in {:?}", local, self.started.elapsed());
        Ok(())
    }
}

/// Returns `old` with `joiner` added, or `old` itself if `joiner` is already a member.
pub(crate) fn joined_hash(
    old: &Arc<ConsistentHash>,
    joiner: Address,
    topology: &TopologyInfo,
) -> Arc<ConsistentHash> {
    if old.contains(&joiner) {
        return old.clone();
    }

    Arc::new(old.with_members(&[joiner], topology))
}

/// Returns a random delay in `[min, max]`, in multiples of [BACKOFF_STEP] above `min`.
pub(crate) fn backoff_delay<R>(rng: &mut R, min: Duration, max: Duration) -> Duration
where R: Rng + ?Sized {
    let steps = max.saturating_sub(min).as_millis() / BACKOFF_STEP.as_millis();
    let steps = u32::try_from(steps).unwrap_or(u32::MAX);

    min + BACKOFF_STEP * rng.gen_range(0..=steps)
}

/// Ask the coordinator for its ring, retrying with a randomized backoff until it answers or
/// the configured maximum wait elapses.
async fn retrieve_old_consistent_hash(
    dm: &DistributionManager,
) -> Result<ConsistentHash, RehashError> {
    let cfg = dm.config();
    let local = dm.local_addr();
    let give_up_after = cfg.join_give_up_after();
    let started = Instant::now();

    loop {
        let coordinator = (dm.transport().coordinator()).ok_or(RehashError::NoCoordinator)?;
        let req = RehashCommand::JoinRequest { sender: local };

        match invoke_sync(dm.transport(), coordinator, req.clone(), cfg.rehash_rpc_timeout).await {
            Ok(Response::Success(ResponseValue::Members { members, topology })) => {
                dm.merge_topology(topology).await;
                let topology = dm.topology().await;
                return Ok(ConsistentHash::build(cfg.topology_aware, members, &topology));
            }

            Ok(resp) => debug!("{} refused to provide its ring: {:?}", coordinator, resp),

            Err(RpcError::Timeout(after)) => {
                debug!("{} did not provide its ring within {:?}", coordinator, after)
            }

            Err(source) => return Err(RehashError::rpc(&req, coordinator, source)),
        }

        let (min, max) = (cfg.join_retry_min_sleep, cfg.join_retry_max_sleep);
        let delay = backoff_delay(&mut thread_rng(), min, max);
        sleep(delay).await;

        if started.elapsed() > give_up_after {
            return Err(RehashError::CoordinatorUnavailable(started.elapsed()));
        }
    }
}

/// Tell every member about the local member's topology, and record theirs.
async fn announce(dm: &DistributionManager) {
    let local = dm.local_addr();
    let cmd = RehashCommand::JoinRehashStart {
        sender: local,
        topology: dm.config().node_topology(local),
    };

    for (member, resp) in broadcast(dm.transport(), &cmd, dm.config().rehash_rpc_timeout).await {
        match resp {
            Ok(Response::Success(ResponseValue::Topology(info))) => {
                dm.merge_topology(Some(info)).await
            }
            Ok(resp) => debug!("skipping topology of {}: {:?}", member, resp),
            Err(e) => warn!("skipping topology of {}: {}", member, e),
        }
    }
}

/// Pull state from every provider concurrently, bounded by the configured pool size.
///
/// Every pull runs to completion; the first failure (if any) is returned.
async fn pull_state(
    dm: &Arc<DistributionManager>,
    providers: Vec<Address>,
    old: Arc<ConsistentHash>,
    new: Arc<ConsistentHash>,
) -> Result<(), RehashError> {
    let local = dm.local_addr();
    let pool = Arc::new(Semaphore::new(dm.config().state_pull_concurrency));

    let pulls = (providers.into_iter())
        .filter(|p| *p != local)
        .map(|provider| {
            let dm = dm.clone();
            let pool = pool.clone();
            let cmd = RehashCommand::PullStateJoin {
                sender: local,
                old: old.clone(),
                new: new.clone(),
            };
            let new = new.clone();

            task::spawn(async move {
                let _permit = pool.acquire().await;
                let deadline = dm.config().rehash_rpc_timeout;

                match invoke_sync(dm.transport(), provider, cmd.clone(), deadline).await {
                    Ok(Response::Success(ResponseValue::State(state))) => {
                        debug!("pulled {} entries from {}", state.len(), provider);
                        dm.apply_state(&new, state);
                        Ok(())
                    }

                    Ok(resp) => {
                        warn!("skipping state of {}: {:?}", provider, resp);
                        Ok(())
                    }

                    Err(source) => Err(RehashError::rpc(&cmd, provider, source)),
                }
            })
        });

    let mut first_err = None;

    for pulled in join_all(pulls).await {
        let res = pulled.map_err(RehashError::from).and_then(|r| r);

        if let Err(e) = res {
            warn!("state pull failed: {}", e);
            first_err.get_or_insert(e);
        }
    }

    first_err.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::net::SocketAddr;

    fn addr(port: u16) -> Address {
        Address::from(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[quickcheck]
    fn backoff_is_bounded(a: u16, b: u16) -> bool {
        let (min, max) = (a.min(b), a.max(b));
        let (min, max) = (Duration::from_millis(min as u64), Duration::from_millis(max as u64));
        let d = backoff_delay(&mut thread_rng(), min, max);

        min <= d && d <= max && (d - min).as_millis() % BACKOFF_STEP.as_millis() == 0
    }

    #[test]
    fn default_backoff_window() {
        let (min, max) = (Duration::from_millis(500), Duration::from_millis(2000));
        for _ in 0..1000 {
            let d = backoff_delay(&mut thread_rng(), min, max);
            assert!(min <= d && d <= max);
        }
        assert_eq!(backoff_delay(&mut thread_rng(), min, min), min);
    }

    #[test]
    fn huge_backoff_windows_stay_bounded() {
        let (min, max) = (Duration::from_millis(1), Duration::MAX);
        for _ in 0..100 {
            let d = backoff_delay(&mut thread_rng(), min, max);
            assert!(min <= d && d <= min + BACKOFF_STEP * u32::MAX);
        }
    }

    #[test]
    fn joining_twice_is_idempotent() {
        let t = TopologyInfo::new();
        let old = Arc::new(ConsistentHash::new(vec![addr(1), addr(2)]));

        let new = joined_hash(&old, addr(2), &t);
        assert!(Arc::ptr_eq(&old, &new));
        assert_eq!(*old, *new);

        let new = joined_hash(&old, addr(3), &t);
        assert!(new.contains(&addr(3)));
        assert_eq!(*joined_hash(&new, addr(3), &t), *new);
    }
}
