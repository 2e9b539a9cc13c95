//! fedhub - co-simulation coordination runtime
//!
//! fedhub federates independent simulators around a shared virtual clock
//! and an any-to-any message and value exchange fabric. Each federate
//! advances its local time only when the runtime can prove that no
//! message, event, or value update with an earlier timestamp can still
//! arrive.
//!
//! # Architecture
//!
//! - [`core`] - the leaf broker: hosts federate state machines, owns the
//!   federate-facing API and the time coordinator
//! - [`broker`] - routing nodes of the federation tree; the root assigns
//!   every global identifier
//! - [`federate`] - per-federate managers: local endpoint tables, queues,
//!   callbacks
//! - [`transport`] - the pluggable seam below the broker, with an
//!   in-process loopback implementation
//! - [`message`] - the action message and its wire frame
//!
//! Registration, init, time grants, and disconnects all travel as action
//! messages through single-consumer router tasks; priority commands are
//! drained ahead of payload traffic.

pub mod broker;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod federate;
pub mod guarded;
pub mod handles;
pub mod ids;
pub mod message;
pub mod time;
pub mod transport;

// Re-export commonly used types
pub use broker::{Broker, BrokerHandle, BrokerMetrics};
pub use config::BrokerConfig;
pub use core::{Core, CoreHandle, CoreMetrics, FederateInfo, FederatePhase};
pub use error::{FedResult, FederationError};
pub use federate::{DestinationFilter, FederateManager, SourceFilter};
pub use guarded::Guarded;
pub use handles::{HandleInfo, HandleKind, HandleRegistry};
pub use ids::{BrokerId, FederateId, HandleId, LocalId, RouteId};
pub use message::{Action, ActionMessage, Message};
pub use time::Time;
pub use transport::{LoopbackNetwork, LoopbackTransport, Transport};
