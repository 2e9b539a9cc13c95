//! Broker control handle

use tokio::sync::{mpsc, oneshot};

use crate::error::{FedResult, FederationError};
use crate::message::ActionMessage;

/// Control requests processed by the broker router alongside the action
/// queues.
#[derive(Debug)]
pub enum BrokerControl {
    GetMetrics { reply: oneshot::Sender<BrokerMetrics> },
}

/// Aggregate counters exposed by a broker.
#[derive(Debug, Clone, Default)]
pub struct BrokerMetrics {
    /// Federates registered through this node.
    pub federates: usize,
    /// Directly attached child brokers and cores.
    pub brokers: usize,
    /// Children that have propagated a disconnect.
    pub children_finalized: usize,
    /// Handles recorded in this node's registry.
    pub handles: usize,
    pub messages_routed: u64,
    pub init_ready: bool,
    pub init_granted: bool,
}

/// Cloneable handle onto a running broker.
#[derive(Clone)]
pub struct BrokerHandle {
    control: mpsc::Sender<BrokerControl>,
    actions: mpsc::Sender<ActionMessage>,
}

impl BrokerHandle {
    pub(super) fn new(control: mpsc::Sender<BrokerControl>, actions: mpsc::Sender<ActionMessage>) -> Self {
        Self { control, actions }
    }

    /// Non-blocking enqueue of an action message, as the transport does.
    pub async fn add_message(&self, msg: ActionMessage) -> FedResult<()> {
        self.actions
            .send(msg)
            .await
            .map_err(|_| FederationError::ChannelClosed)
    }

    pub async fn metrics(&self) -> FedResult<BrokerMetrics> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(BrokerControl::GetMetrics { reply: tx })
            .await
            .map_err(|_| FederationError::ChannelClosed)?;
        rx.await.map_err(|_| FederationError::ChannelClosed)
    }
}
