//! Federate-facing core commands
//!
//! Every phase- or state-changing operation of the federate API travels to
//! the core's router task as one of these requests, carrying its reply
//! channel. Read-only operations (receive, counts, value reads, name
//! lookups) go straight to the shared state and never enter the queue.

use tokio::sync::oneshot;

use crate::error::FedResult;
use crate::handles::HandleKind;
use crate::ids::{FederateId, HandleId};
use crate::message::Message;
use crate::time::Time;

use super::federate::{FederateInfo, FederatePhase};

/// A message operator attached to a filter; returning `None` drops the
/// message.
pub type FilterOperator = Box<dyn FnMut(Message) -> Option<Message> + Send>;

/// Adjustable per-federate time-control parameters.
#[derive(Debug, Clone, Copy)]
pub enum TimeParam {
    Delta(Time),
    LookAhead(Time),
    ImpactWindow(Time),
    MaxIterations(u64),
}

/// Point-in-time view of one federate, for queries and tests.
#[derive(Debug, Clone)]
pub struct FederateSnapshot {
    pub name: String,
    pub phase: FederatePhase,
    pub granted: Time,
    pub iteration: u64,
}

/// Aggregate counters exposed by the core.
#[derive(Debug, Clone, Default)]
pub struct CoreMetrics {
    pub federates: usize,
    pub finalized: usize,
    pub handles: usize,
    pub messages_routed: u64,
    pub grants_issued: u64,
    pub init_granted: bool,
}

/// Commands processed by the core router.
pub enum CoreRequest {
    RegisterFederate {
        name: String,
        info: FederateInfo,
        reply: oneshot::Sender<FedResult<FederateId>>,
    },

    RegisterHandle {
        fed: FederateId,
        kind: HandleKind,
        name: String,
        data_type: String,
        units: String,
        target: String,
        required: bool,
        reply: oneshot::Sender<FedResult<HandleId>>,
    },

    /// Blocks until the federation-wide init grant.
    EnterInitializing {
        fed: FederateId,
        reply: oneshot::Sender<FedResult<()>>,
    },

    /// Iterative entry into the executing phase at time zero.
    EnterExecuting {
        fed: FederateId,
        converged: bool,
        reply: oneshot::Sender<FedResult<bool>>,
    },

    TimeRequest {
        fed: FederateId,
        time: Time,
        reply: oneshot::Sender<FedResult<Time>>,
    },

    TimeRequestIterative {
        fed: FederateId,
        time: Time,
        converged: bool,
        reply: oneshot::Sender<FedResult<(Time, bool)>>,
    },

    /// Send from a local endpoint; replies with the stamped timestamp.
    Send {
        fed: FederateId,
        source_handle: HandleId,
        dest: String,
        time: Option<Time>,
        data: Vec<u8>,
        reply: oneshot::Sender<FedResult<Time>>,
    },

    /// Send a pre-built message (filters and re-sends).
    SendMessage {
        fed: FederateId,
        source_handle: HandleId,
        message: Message,
        reply: oneshot::Sender<FedResult<()>>,
    },

    SetValue {
        fed: FederateId,
        handle: HandleId,
        data: Vec<u8>,
        reply: oneshot::Sender<FedResult<()>>,
    },

    AddDependency {
        fed: FederateId,
        name: String,
        reply: oneshot::Sender<FedResult<()>>,
    },

    SetTimeParam {
        fed: FederateId,
        param: TimeParam,
        reply: oneshot::Sender<FedResult<()>>,
    },

    SetFilterOperator {
        filter: HandleId,
        operator: FilterOperator,
        reply: oneshot::Sender<FedResult<()>>,
    },

    /// Routing hint for a known (source, destination) endpoint pair.
    RegisterCommPair {
        source: String,
        dest: String,
        reply: oneshot::Sender<FedResult<()>>,
    },

    Finalize {
        fed: FederateId,
        reply: oneshot::Sender<FedResult<()>>,
    },

    /// Federate-reported error; tears the federation down.
    ErrorReport {
        fed: FederateId,
        code: i32,
        message: String,
        reply: oneshot::Sender<FedResult<()>>,
    },

    LogMessage {
        fed: FederateId,
        level: i32,
        message: String,
    },

    QueryFederate {
        fed: FederateId,
        reply: oneshot::Sender<FedResult<FederateSnapshot>>,
    },

    GetMetrics {
        reply: oneshot::Sender<CoreMetrics>,
    },
}

impl CoreRequest {
    /// Registration and lifecycle commands are drained ahead of payload
    /// and time traffic, mirroring the action-message priority split.
    pub fn is_priority(&self) -> bool {
        matches!(
            self,
            CoreRequest::RegisterFederate { .. }
                | CoreRequest::RegisterHandle { .. }
                | CoreRequest::EnterInitializing { .. }
                | CoreRequest::Finalize { .. }
                | CoreRequest::ErrorReport { .. }
        )
    }
}
