// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Topology-change coordination for hash-partitioned in-memory caches.
//!
//! # Overview
//! `rehash` keeps the entries of a distributed cache with their owners while members come
//! and go. Keys are placed on a [consistent hash ring][hash], and each key is replicated to
//! a fixed number of owners. Whenever ring membership changes, some keys change owners, and
//! a [rehash][rehash] moves them.
//!
//! * A joining member asks the coordinator for the current ring, announces itself, and
//!   pulls the entries it newly owns from their previous owners.
//! * When members leave, every surviving member that newly owns some of their keys pulls
//!   those entries from the surviving replicas. Writes accepted during the transfer are
//!   held in a [transaction log][txlog] and forwarded once the pull completes.
//!
//! Membership itself is decided elsewhere: a [DistributionManager] is told about joins by
//! calling [join][DistributionManager::join], and about departures by [View]s. Messages are
//! exchanged through an implementation of [Transport]; [simulation] provides one that runs
//! entirely in-process, with fault injection.
//!
//! # Logging
//! Progress is reported through [log], and each rehash runs within a [tracing] span.
#![warn(rust_2018_idioms, missing_docs)]
#![doc(
    html_root_url = "https://docs.rs/rehash/0.1.0",
    test(
        no_crate_inject,
        attr(
            deny(rust_2018_idioms, unused_imports, unused_mut),
            allow(unused_variables)
        )
    )
)]
#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(test)]
#[test]
fn test_html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}

#[macro_use]
mod macros;

mod address;

pub mod command;
pub mod config;
pub mod container;
pub mod hash;
pub mod manager;
pub mod rehash;
pub mod simulation;
pub mod transport;
pub mod txlog;

#[doc(inline)]
pub use address::Address;
#[doc(inline)]
pub use command::{Key, PrepareCommand, RehashCommand, Response, TxId, Value, WriteCommand};
#[doc(inline)]
pub use config::RehashConfig;
#[doc(inline)]
pub use container::{DataContainer, MemoryContainer};
#[doc(inline)]
pub use hash::{ConsistentHash, NodeTopologyInfo, TopologyInfo};
#[doc(inline)]
pub use manager::{DistributionManager, View};
#[doc(inline)]
pub use rehash::{RehashError, RehashTask};
#[doc(inline)]
pub use transport::{InboundHandler, RpcError, Transport};

/// A re-export of [async_trait] for convenience.
///
/// [async_trait]: https://docs.rs/async-trait/latest/async_trait/attr.async_trait.html
#[doc(inline)]
pub use async_trait::async_trait;
