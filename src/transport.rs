// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Request/response messaging between members.
//!
//! The rehash protocol only needs a reliable way to send a [RehashCommand] to a member and
//! receive its [Response]. Connection management and encoding are left to implementations
//! of [Transport]; see [simulation][crate::simulation] for an in-process one.
use crate::{
    command::{RehashCommand, Response},
    Address,
};
use futures::stream::{FuturesUnordered, StreamExt};
use log::warn;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{task, time::timeout};

/// A failed remote call.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum RpcError {
    /// No response arrived before the deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The target could not be reached.
    #[error("{0} is unreachable")]
    Unreachable(Address),

    /// The target failed to handle the command.
    #[error("remote failure: {0}")]
    Remote(String),
}

/// Sends [RehashCommand]s to other members.
#[crate::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Returns the address of the local member.
    fn local_addr(&self) -> Address;

    /// Returns the members of the current view, in view order.
    fn members(&self) -> Vec<Address>;

    /// Returns the coordinator of the current view.
    fn coordinator(&self) -> Option<Address> {
        self.members().into_iter().next()
    }

    /// Send `cmd` to `target`, and wait for its response.
    async fn invoke(&self, target: Address, cmd: RehashCommand) -> Result<Response, RpcError>;

    /// Resolves once no failed remote invocations are queued for redelivery.
    async fn block_till_no_longer_retrying(&self) {}
}

/// Handles [RehashCommand]s received from other members.
#[crate::async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Handle `cmd`, producing a response for its sender.
    async fn handle(&self, cmd: RehashCommand) -> Response;
}

/// Send `cmd` to `target`, failing if no response arrives within `deadline`.
pub async fn invoke_sync(
    t: &dyn Transport,
    target: Address,
    cmd: RehashCommand,
    deadline: Duration,
) -> Result<Response, RpcError> {
    match timeout(deadline, t.invoke(target, cmd)).await {
        Ok(resp) => resp,
        Err(_) => Err(RpcError::Timeout(deadline)),
    }
}

/// Send `cmd` to every member in `targets` concurrently, and gather every response.
///
/// Responses are returned in the order they arrived.
pub async fn invoke_many<I>(
    t: &dyn Transport,
    targets: I,
    cmd: &RehashCommand,
    deadline: Duration,
) -> Vec<(Address, Result<Response, RpcError>)>
where
    I: IntoIterator<Item = Address>,
{
    (targets.into_iter())
        .map(|target| {
            let cmd = cmd.clone();
            async move { (target, invoke_sync(t, target, cmd, deadline).await) }
        })
        .collect::<FuturesUnordered<_>>()
        .collect()
        .await
}

/// Send `cmd` to every other member of the current view.
pub async fn broadcast(
    t: &dyn Transport,
    cmd: &RehashCommand,
    deadline: Duration,
) -> Vec<(Address, Result<Response, RpcError>)> {
    let local = t.local_addr();
    let targets = t.members().into_iter().filter(|m| *m != local);

    invoke_many(t, targets, cmd, deadline).await
}

/// Send `cmd` to `targets` in the background. Failures are logged.
pub fn spawn_invoke(
    t: Arc<dyn Transport>,
    targets: Vec<Address>,
    cmd: RehashCommand,
    deadline: Duration,
) {
    task::spawn(async move {
        for (target, resp) in invoke_many(&*t, targets, &cmd, deadline).await {
            if let Err(e) = resp {
                warn!("{} to {} failed: {}", cmd.kind(), target, e);
            }
        }
    });
}

/// Send `cmd` to every other member of the current view in the background.
pub fn spawn_broadcast(t: Arc<dyn Transport>, cmd: RehashCommand, deadline: Duration) {
    let local = t.local_addr();
    let targets = t.members().into_iter().filter(|m| *m != local).collect();

    spawn_invoke(t, targets, cmd, deadline);
}
