//! Transport seam
//!
//! Everything below the broker is pluggable. A transport owns the links to
//! peer nodes and moves action messages across them; the routing logic
//! above is transport-agnostic. Route 0 always leads to the parent.

mod loopback;

pub use loopback::{LoopbackNetwork, LoopbackTransport};

use async_trait::async_trait;

use crate::error::FedResult;
use crate::ids::RouteId;
use crate::message::ActionMessage;

/// Operations a broker requires from its transport.
#[async_trait]
pub trait Transport: Send {
    /// Establish the link to the parent broker at `address` (route 0).
    async fn broker_connect(&mut self, address: &str) -> FedResult<()>;

    /// Tear down every link.
    async fn broker_disconnect(&mut self);

    /// Establish a link to a child or peer under `route`.
    async fn add_route(&mut self, route: RouteId, address: &str) -> FedResult<()>;

    /// Send a message over an established route. Non-blocking on the hot
    /// path; queues on backpressure.
    async fn transmit(&self, route: RouteId, msg: ActionMessage) -> FedResult<()>;

    /// The address peers use to reach this node.
    fn get_address(&self) -> String;
}
