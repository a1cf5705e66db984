// Copyright 2020 nytopop (Eric Izoita)
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.
//! Fault-simulated networks for exercising the rehash protocol in a single process.
//!
//! A [Network] routes commands between registered [InboundHandler]s, records every
//! command it delivers, and can be told to drop, ignore, or refuse commands.
use crate::{
    command::{RehashCommand, Response},
    transport::{InboundHandler, RpcError, Transport},
    Address,
};
use futures::future;
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex, PoisonError, Weak},
};
use tokio::task;

macro_rules! lock {
    ($m:expr) => {
        $m.lock().unwrap_or_else(PoisonError::into_inner)
    };
}

/// A fault injected into a single delivery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// The target cannot be reached.
    Unreachable,
    /// The target never responds.
    Silent,
    /// The target responds with [Response::Unsuccessful] without handling the command.
    Unsuccessful,
}

/// A record of one command sent over a [Network].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// The sending member.
    pub from: Address,
    /// The receiving member.
    pub to: Address,
    /// The [kind][RehashCommand::kind] of command sent.
    pub kind: &'static str,
}

type FaultHook = dyn Fn(Address, &RehashCommand) -> Option<Fault> + Send + Sync;

/// A simulated network.
#[derive(Clone, Default)]
pub struct Network {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<Address, Weak<dyn InboundHandler>>,
    view: Vec<Address>,
    blocked: HashSet<Address>,
    silenced: HashSet<Address>,
    fault: Option<Arc<FaultHook>>,
    sent: Vec<Envelope>,
}

impl Network {
    /// Returns an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a transport bound to `addr`.
    pub fn transport(&self, addr: Address) -> Arc<SimTransport> {
        let net = self.clone();
        Arc::new(SimTransport { addr, net })
    }

    /// Deliver commands sent to `addr` to `handler`, for as long as it is alive.
    pub fn register<H: InboundHandler>(&self, addr: Address, handler: &Arc<H>) {
        let handler: Arc<dyn InboundHandler> = handler.clone();
        lock!(self.inner).nodes.insert(addr, Arc::downgrade(&handler));
    }

    /// Stop delivering commands to `addr`.
    pub fn unregister(&self, addr: &Address) {
        lock!(self.inner).nodes.remove(addr);
    }

    /// Set the membership every transport reports. The first member is the coordinator.
    pub fn set_view<I: IntoIterator<Item = Address>>(&self, members: I) {
        lock!(self.inner).view = members.into_iter().collect();
    }

    /// Returns the current membership.
    pub fn view(&self) -> Vec<Address> {
        lock!(self.inner).view.clone()
    }

    /// Fail every command sent to `dst` as unreachable.
    pub fn block(&self, dst: Address) {
        lock!(self.inner).blocked.insert(dst);
    }

    /// Stop dropping or ignoring commands sent to `dst`.
    pub fn allow(&self, dst: &Address) {
        let mut inner = lock!(self.inner);
        inner.blocked.remove(dst);
        inner.silenced.remove(dst);
    }

    /// Never respond to commands sent to `dst`.
    pub fn silence(&self, dst: Address) {
        lock!(self.inner).silenced.insert(dst);
    }

    /// Consult `hook` with the target of every command, injecting any fault it returns.
    pub fn set_fault<F>(&self, hook: F)
    where F: Fn(Address, &RehashCommand) -> Option<Fault> + Send + Sync + 'static {
        lock!(self.inner).fault = Some(Arc::new(hook));
    }

    /// Remove any fault hook.
    pub fn clear_fault(&self) {
        lock!(self.inner).fault = None;
    }

    /// Returns every command sent so far, in the order they were sent.
    pub fn sent(&self) -> Vec<Envelope> {
        lock!(self.inner).sent.clone()
    }

    /// Returns every command of `kind` sent so far.
    pub fn sent_of(&self, kind: &str) -> Vec<Envelope> {
        (self.sent().into_iter()).filter(|e| e.kind == kind).collect()
    }

    /// Forget every command sent so far.
    pub fn clear_sent(&self) {
        lock!(self.inner).sent.clear();
    }

    async fn deliver(
        &self,
        from: Address,
        to: Address,
        cmd: RehashCommand,
    ) -> Result<Response, RpcError> {
        #[rustfmt::skip]
        let (fault, handler) = {
            let mut inner = lock!(self.inner);
            inner.sent.push(Envelope { from, to, kind: cmd.kind() });

            let fault = if inner.blocked.contains(&to) {
                Some(Fault::Unreachable)
            } else if inner.silenced.contains(&to) {
                Some(Fault::Silent)
            } else {
                (inner.fault.as_deref()).and_then(|hook| hook(to, &cmd))
            };

            (fault, inner.nodes.get(&to).and_then(Weak::upgrade))
        };

        match (fault, handler) {
            (Some(Fault::Unreachable), _) | (None, None) => Err(RpcError::Unreachable(to)),
            (Some(Fault::Silent), _) => future::pending().await,
            (Some(Fault::Unsuccessful), _) => Ok(Response::Unsuccessful),

            // handled in its own task so that a caller giving up doesn't interrupt it
            (None, Some(h)) => (task::spawn(async move { h.handle(cmd).await }).await)
                .map_err(|e| RpcError::Remote(e.to_string())),
        }
    }
}

/// A [Transport] over a simulated [Network].
pub struct SimTransport {
    addr: Address,
    net: Network,
}

impl SimTransport {
    /// Returns the network this transport is bound to.
    pub fn network(&self) -> &Network {
        &self.net
    }
}

#[crate::async_trait]
impl Transport for SimTransport {
    fn local_addr(&self) -> Address {
        self.addr
    }

    fn members(&self) -> Vec<Address> {
        self.net.view()
    }

    async fn invoke(&self, target: Address, cmd: RehashCommand) -> Result<Response, RpcError> {
        self.net.deliver(self.addr, target, cmd).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::SocketAddr, time::Duration};
    use tokio::time::timeout;

    fn addr(port: u16) -> Address {
        Address::from(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    struct Echo;

    #[crate::async_trait]
    impl InboundHandler for Echo {
        async fn handle(&self, _: RehashCommand) -> Response {
            Response::ack()
        }
    }

    fn end(from: u16) -> RehashCommand {
        RehashCommand::JoinRehashEnd { sender: addr(from) }
    }

    #[tokio::test]
    async fn delivers_to_registered_handlers() {
        let net = Network::new();
        let echo = Arc::new(Echo);
        net.register(addr(2), &echo);

        let t = net.transport(addr(1));
        assert!(t.invoke(addr(2), end(1)).await.unwrap().is_success());
        assert_eq!(t.invoke(addr(3), end(1)).await.unwrap_err(), RpcError::Unreachable(addr(3)));

        drop(echo);
        assert_eq!(t.invoke(addr(2), end(1)).await.unwrap_err(), RpcError::Unreachable(addr(2)));

        let sent = net.sent_of("join-rehash-end");
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], Envelope {
            from: addr(1),
            to: addr(2),
            kind: "join-rehash-end",
        });
    }

    #[tokio::test]
    async fn injects_faults() {
        let net = Network::new();
        let echo = Arc::new(Echo);
        net.register(addr(2), &echo);
        let t = net.transport(addr(1));

        net.block(addr(2));
        assert!(t.invoke(addr(2), end(1)).await.is_err());

        net.allow(&addr(2));
        net.silence(addr(2));
        assert!(timeout(Duration::from_millis(50), t.invoke(addr(2), end(1))).await.is_err());

        net.allow(&addr(2));
        net.set_fault(|_, cmd| match cmd {
            RehashCommand::JoinRehashEnd { .. } => Some(Fault::Unsuccessful),
            _ => None,
        });
        assert!(!t.invoke(addr(2), end(1)).await.unwrap().is_success());

        net.clear_fault();
        assert!(t.invoke(addr(2), end(1)).await.unwrap().is_success());
    }

    #[test]
    fn first_member_coordinates() {
        let net = Network::new();
        let t = net.transport(addr(1));
        assert_eq!(t.coordinator(), None);

        net.set_view(vec![addr(3), addr(1)]);
        assert_eq!(t.coordinator(), Some(addr(3)));
        assert_eq!(t.members(), vec![addr(3), addr(1)]);
    }
}
