//! Filter wrappers
//!
//! Thin federate-side views over registered source and destination
//! filters. A filter without an operator tees matching messages onto its
//! owner's filter queue; attaching an operator rewrites (or drops)
//! messages in flight, with the original source preserved by the routing
//! layer.

use crate::core::{CoreHandle, FilterOperator};
use crate::error::FedResult;
use crate::ids::{FederateId, HandleId};
use crate::message::Message;
use crate::time::Time;

/// A filter acting on messages leaving a target endpoint.
pub struct SourceFilter {
    core: CoreHandle,
    fed: FederateId,
    handle: HandleId,
}

impl SourceFilter {
    /// Register a source filter against the target endpoint.
    pub async fn new(
        core: CoreHandle,
        fed: FederateId,
        name: &str,
        target: &str,
        data_type: &str,
    ) -> FedResult<Self> {
        let handle = core.register_source_filter(fed, name, target, data_type).await?;
        Ok(Self { core, fed, handle })
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn has_message(&self) -> bool {
        self.core.receive_filter_count(self.fed) > 0
    }

    /// Pop the next message captured by this filter.
    pub fn get_message(&self) -> Option<Message> {
        self.core.receive_filter(self.handle)
    }

    /// Attach an operator that rewrites captured messages.
    pub async fn set_operator(&self, operator: FilterOperator) -> FedResult<()> {
        self.core.set_filter_operator(self.handle, operator).await
    }
}

/// A filter acting on messages arriving at a target endpoint.
pub struct DestinationFilter {
    core: CoreHandle,
    handle: HandleId,
}

impl DestinationFilter {
    /// Register a destination filter against the target endpoint.
    pub async fn new(
        core: CoreHandle,
        fed: FederateId,
        name: &str,
        target: &str,
        data_type: &str,
    ) -> FedResult<Self> {
        let handle = core.register_destination_filter(fed, name, target, data_type).await?;
        Ok(Self { core, handle })
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub async fn set_operator(&self, operator: FilterOperator) -> FedResult<()> {
        self.core.set_filter_operator(self.handle, operator).await
    }
}

/// Operator that delays every message by a fixed offset.
pub fn delay_operator(delay: Time) -> FilterOperator {
    Box::new(move |mut msg: Message| {
        msg.time = msg.time + delay;
        Some(msg)
    })
}

/// Operator that drops every message.
pub fn drop_operator() -> FilterOperator {
    Box::new(|_msg: Message| None)
}
