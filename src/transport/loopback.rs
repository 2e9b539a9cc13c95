//! In-process loopback transport
//!
//! A shared name-to-sender registry stands in for a cluster interconnect:
//! every node registers the sender side of its inbound queue under its
//! address, and routes resolve to clones of those senders. Used by the
//! tests and by single-process federations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{FedResult, FederationError};
use crate::ids::RouteId;
use crate::message::ActionMessage;

use super::Transport;

/// Shared address registry for one in-process federation.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    nodes: Arc<Mutex<HashMap<String, mpsc::Sender<ActionMessage>>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `address` to a node's inbound queue and return its transport.
    pub fn attach(&self, address: &str, inbound: mpsc::Sender<ActionMessage>) -> LoopbackTransport {
        self.nodes.lock().insert(address.to_string(), inbound);
        LoopbackTransport {
            network: self.clone(),
            address: address.to_string(),
            routes: HashMap::new(),
        }
    }

    fn resolve(&self, address: &str) -> Option<mpsc::Sender<ActionMessage>> {
        self.nodes.lock().get(address).cloned()
    }
}

/// Transport over a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    address: String,
    routes: HashMap<RouteId, mpsc::Sender<ActionMessage>>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn broker_connect(&mut self, address: &str) -> FedResult<()> {
        self.add_route(RouteId::PARENT, address).await
    }

    async fn broker_disconnect(&mut self) {
        self.routes.clear();
    }

    async fn add_route(&mut self, route: RouteId, address: &str) -> FedResult<()> {
        let sender = self
            .network
            .resolve(address)
            .ok_or_else(|| FederationError::TransportFailure(format!("no node at {address}")))?;
        debug!(route = %route, %address, "loopback route added");
        self.routes.insert(route, sender);
        Ok(())
    }

    async fn transmit(&self, route: RouteId, msg: ActionMessage) -> FedResult<()> {
        let sender = self
            .routes
            .get(&route)
            .ok_or_else(|| FederationError::TransportFailure(format!("no route {route}")))?;
        sender
            .send(msg)
            .await
            .map_err(|_| FederationError::TransportFailure(format!("route {route} closed")))
    }

    fn get_address(&self) -> String {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Action;

    #[tokio::test]
    async fn test_route_and_transmit() {
        let network = LoopbackNetwork::new();
        let (tx_a, _rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let mut a = network.attach("a", tx_a);
        let _b = network.attach("b", tx_b);

        a.add_route(RouteId::new(1), "b").await.unwrap();
        a.transmit(RouteId::new(1), ActionMessage::new(Action::InitRequest))
            .await
            .unwrap();

        let msg = rx_b.recv().await.unwrap();
        assert_eq!(msg.action, Action::InitRequest);
    }

    #[tokio::test]
    async fn test_unknown_address_fails() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::channel(8);
        let mut t = network.attach("only", tx);
        assert!(matches!(
            t.broker_connect("missing").await,
            Err(FederationError::TransportFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_transmit_without_route_fails() {
        let network = LoopbackNetwork::new();
        let (tx, _rx) = mpsc::channel(8);
        let t = network.attach("solo", tx);
        assert!(matches!(
            t.transmit(RouteId::new(9), ActionMessage::new(Action::Message)).await,
            Err(FederationError::TransportFailure(_))
        ));
    }
}
