// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Shared code referred to by multiple test modules.
#![allow(dead_code)]

use rehash::{
    simulation::Network, Address, ConsistentHash, DistributionManager, Key, MemoryContainer,
    RehashConfig, Value, WriteCommand,
};
use simplelog::{Config, LevelFilter, TestLogger};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::time::{sleep, Duration, Instant};

pub const JIFFY: Duration = Duration::from_millis(5);

pub fn init_logger() {
    let _ = TestLogger::init(LevelFilter::Debug, Config::default());
}

pub fn addr(port: u16) -> Address {
    Address::from(SocketAddr::from(([127, 0, 0, 1], port)))
}

pub fn key(i: u32) -> Key {
    Key::from(format!("key-{}", i))
}

/// Returns a key whose owners on `ch` satisfy `pred`.
pub fn find_key<F: Fn(&[Address]) -> bool>(ch: &ConsistentHash, n: usize, pred: F) -> Key {
    (0..100_000).map(key).find(|k| pred(&ch.locate(k, n))).expect("no such key")
}

/// Create a member at `port` and attach it to `net`, without joining.
pub fn member(net: &Network, port: u16, cfg: RehashConfig) -> Arc<DistributionManager> {
    let container = Arc::new(MemoryContainer::new());
    let dm = DistributionManager::new(cfg, net.transport(addr(port)), container);
    net.register(addr(port), &dm);
    dm
}

/// Join members at `ports` one at a time. The first member is the coordinator.
pub async fn cluster(
    net: &Network,
    ports: &[u16],
    cfg: RehashConfig,
) -> Vec<Arc<DistributionManager>> {
    let mut members = Vec::new();

    for &port in ports {
        let mut view = net.view();
        view.push(addr(port));
        net.set_view(view);

        let dm = member(net, port, cfg.clone());
        dm.join().await.expect("join failed");
        members.push(dm);
    }

    members
}

/// Returns the member in `members` at `addr`.
pub fn at(members: &[Arc<DistributionManager>], addr: Address) -> &Arc<DistributionManager> {
    (members.iter())
        .find(|dm| dm.local_addr() == addr)
        .expect("not a member")
}

/// Write `key` on every one of its owners, as a client would.
pub async fn put(members: &[Arc<DistributionManager>], key: Key, value: &'static str) {
    let owners = members[0].locate(&key).await;
    assert!(!owners.is_empty());

    for owner in owners {
        let cmd = WriteCommand::put(key.clone(), value);
        at(members, owner).write(cmd).await;
    }
}

/// Returns true if every owner of `key` among `members` holds `value`.
pub async fn owners_hold(members: &[Arc<DistributionManager>], key: &Key, value: &str) -> bool {
    let owners = members[0].locate(key).await;

    (owners.iter()).all(|o| at(members, *o).get(key) == Some(Value::from(value.to_owned())))
}

/// Returns true if no member in `members` holds a key it does not own.
pub async fn holders_are_owners(members: &[Arc<DistributionManager>]) -> bool {
    for dm in members {
        for k in dm.container().keys() {
            if !dm.is_local(&k).await {
                return false;
            }
        }
    }

    true
}

/// Poll `cond` until it holds, panicking if it doesn't within a second.
pub async fn eventually<F, Fut>(what: &str, cond: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(1);

    while !cond().await {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(JIFFY).await;
    }
}
