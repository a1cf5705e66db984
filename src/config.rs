// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Configuration of the rehash protocol.
use crate::{hash::NodeTopologyInfo, Address};
use std::time::Duration;

/// Configuration for a [DistributionManager][crate::DistributionManager].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RehashConfig {
    /// Number of owners of each key.
    ///
    /// Must be non-zero.
    ///
    /// Defaults to 2.
    pub num_owners: usize,

    /// Whether state is transferred when membership changes. If false, rings are still
    /// updated but no entries are moved or invalidated.
    ///
    /// Defaults to true.
    pub rehash_enabled: bool,

    /// Timeout of each synchronous remote call made during a rehash.
    ///
    /// Defaults to 10 minutes.
    pub rehash_rpc_timeout: Duration,

    /// How long a state provider waits for every receiver to finish pulling state after
    /// a member leaves.
    ///
    /// Defaults to 4 minutes.
    pub state_retrieval_timeout: Duration,

    /// Lower bound of the randomized sleep between attempts to retrieve the ring from the
    /// coordinator.
    ///
    /// Defaults to 500ms.
    pub join_retry_min_sleep: Duration,

    /// Upper bound of the randomized sleep between attempts to retrieve the ring from the
    /// coordinator.
    ///
    /// Must be greater than or equal to `join_retry_min_sleep`.
    ///
    /// Defaults to 2s.
    pub join_retry_max_sleep: Duration,

    /// Total time after which a joiner stops trying to retrieve the ring.
    ///
    /// Defaults to 10 times `rehash_rpc_timeout`.
    pub join_max_wait: Option<Duration>,

    /// Timeout of each push of forwarded writes or prepares to a new owner after a member
    /// leaves. A push that times out is logged and skipped.
    ///
    /// Defaults to `rehash_rpc_timeout`.
    pub push_timeout: Option<Duration>,

    /// Number of logged writes above which the transaction log is drained without locking
    /// out concurrent writers.
    ///
    /// Defaults to 10.
    pub tx_log_drain_threshold: usize,

    /// Number of state pulls a joiner runs concurrently.
    ///
    /// Must be non-zero.
    ///
    /// Defaults to 4.
    pub state_pull_concurrency: usize,

    /// Whether replicas are spread across sites, racks and machines.
    ///
    /// Defaults to false.
    pub topology_aware: bool,

    /// Machine this member runs on.
    pub machine_id: Option<String>,

    /// Rack this member runs on.
    pub rack_id: Option<String>,

    /// Site this member runs on.
    pub site_id: Option<String>,
}

impl Default for RehashConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl RehashConfig {
    /// Returns the default configuration.
    pub const fn new() -> Self {
        Self {
            num_owners: 2,
            rehash_enabled: true,
            rehash_rpc_timeout: Duration::from_secs(600),
            state_retrieval_timeout: Duration::from_secs(240),
            join_retry_min_sleep: Duration::from_millis(500),
            join_retry_max_sleep: Duration::from_millis(2000),
            join_max_wait: None,
            push_timeout: None,
            tx_log_drain_threshold: 10,
            state_pull_concurrency: 4,
            topology_aware: false,
            machine_id: None,
            rack_id: None,
            site_id: None,
        }
    }

    /// Returns a configuration with short timeouts, suitable for tests and members that
    /// share a host.
    pub fn low_latency() -> Self {
        Self {
            rehash_rpc_timeout: Duration::from_millis(500),
            state_retrieval_timeout: Duration::from_millis(1000),
            join_retry_min_sleep: Duration::from_millis(10),
            join_retry_max_sleep: Duration::from_millis(50),
            ..Self::new()
        }
    }

    /// Set the number of owners of each key.
    pub fn num_owners(mut self, n: usize) -> Self {
        self.num_owners = n;
        self
    }

    /// Set the placement identifiers of this member.
    pub fn topology(mut self, machine: &str, rack: &str, site: &str) -> Self {
        self.topology_aware = true;
        self.machine_id = Some(machine.to_owned());
        self.rack_id = Some(rack.to_owned());
        self.site_id = Some(site.to_owned());
        self
    }

    /// Returns the total time a joiner spends retrieving the ring.
    pub fn join_give_up_after(&self) -> Duration {
        let fallback = self.rehash_rpc_timeout.checked_mul(10).unwrap_or(Duration::MAX);
        self.join_max_wait.unwrap_or(fallback)
    }

    /// Returns the timeout of each forwarded push.
    pub fn push_timeout(&self) -> Duration {
        self.push_timeout.unwrap_or(self.rehash_rpc_timeout)
    }

    /// Returns the topology of the member at `address`.
    pub fn node_topology(&self, address: Address) -> NodeTopologyInfo {
        NodeTopologyInfo {
            machine_id: self.machine_id.clone(),
            rack_id: self.rack_id.clone(),
            site_id: self.site_id.clone(),
            address,
        }
    }

    /// # Panics
    /// Panics if any documented constraint is violated.
    pub(crate) fn validate(&self) {
        assert!(self.num_owners > 0, "num_owners must be non-zero");
        assert!(self.state_pull_concurrency > 0);
        assert!(self.join_retry_min_sleep <= self.join_retry_max_sleep);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn give_up_defaults_to_ten_rpc_timeouts() {
        let cfg = RehashConfig::new();
        assert_eq!(cfg.join_give_up_after(), cfg.rehash_rpc_timeout * 10);

        let cfg = RehashConfig {
            rehash_rpc_timeout: Duration::MAX,
            ..RehashConfig::new()
        };
        assert_eq!(cfg.join_give_up_after(), Duration::MAX);

        let cfg = RehashConfig {
            join_max_wait: Some(Duration::from_secs(1)),
            ..cfg
        };
        assert_eq!(cfg.join_give_up_after(), Duration::from_secs(1));
    }
}
