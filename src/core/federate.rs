//! Per-federate state
//!
//! A federate's mutable state splits in two: the part only the hosting
//! core's router task touches (phase, clocks, the blocked time request,
//! undelivered traffic) and the part shared with the federate's caller
//! thread through locks (delivered messages, current values, pending value
//! updates). Delivery from the first into the second happens only at
//! time-grant boundaries.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::FedResult;
use crate::ids::HandleId;
use crate::message::Message;
use crate::time::Time;

/// Default bound on iterations at a single timestamp.
pub const DEFAULT_MAX_ITERATIONS: u64 = 50;

/// Lifecycle phase of a federate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FederatePhase {
    Created,
    Initializing,
    Executing,
    Finalized,
    Error,
}

impl FederatePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            FederatePhase::Created => "created",
            FederatePhase::Initializing => "initializing",
            FederatePhase::Executing => "executing",
            FederatePhase::Finalized => "finalized",
            FederatePhase::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FederatePhase::Finalized | FederatePhase::Error)
    }
}

/// Time-control parameters supplied at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederateInfo {
    /// Minimum advance per grant; clamped up to the time epsilon.
    #[serde(rename = "time-delta")]
    pub time_delta: Time,

    /// Output horizon: outbound events carry timestamps at least this far
    /// past the granted time.
    #[serde(rename = "look-ahead")]
    pub look_ahead: Time,

    /// Input horizon: inbound events become eligible this far behind the
    /// granted time.
    #[serde(rename = "impact-window")]
    pub impact_window: Time,

    #[serde(rename = "max-iterations")]
    pub max_iterations: u64,
}

impl Default for FederateInfo {
    fn default() -> Self {
        Self {
            time_delta: Time::EPSILON,
            look_ahead: Time::ZERO,
            impact_window: Time::ZERO,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// Reply channel of a blocked time negotiation.
#[derive(Debug)]
pub enum PendingReply {
    /// `time_request`: resolves to the granted time.
    Time(oneshot::Sender<FedResult<Time>>),
    /// `request_time_iterative`: resolves to (granted, converged).
    Iterative(oneshot::Sender<FedResult<(Time, bool)>>),
    /// `enter_executing_state`: resolves to the convergence flag.
    Exec(oneshot::Sender<FedResult<bool>>),
}

/// A time request the coordinator has not yet satisfied.
#[derive(Debug)]
pub struct PendingRequest {
    /// Effective requested time (after the time-delta clamp).
    pub time: Time,
    pub iterative: bool,
    pub exec: bool,
    pub converged: bool,
    pub reply: PendingReply,
}

/// State shared between the router task and the federate's caller.
#[derive(Debug)]
pub struct FedShared {
    pub name: String,
    /// Delivered messages, in delivery order: (destination handle, message).
    pub inbox: Mutex<VecDeque<(HandleId, Message)>>,
    /// Messages delivered to this federate's filters.
    pub filter_inbox: Mutex<VecDeque<(HandleId, Message)>>,
    /// Subscription handles with a value change since the last drain.
    pub pending_updates: Mutex<Vec<HandleId>>,
}

impl FedShared {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            inbox: Mutex::new(VecDeque::new()),
            filter_inbox: Mutex::new(VecDeque::new()),
            pending_updates: Mutex::new(Vec::new()),
        })
    }
}

/// Router-owned record of one hosted federate.
#[derive(Debug)]
pub struct FederateState {
    pub name: String,
    pub phase: FederatePhase,
    pub granted: Time,
    pub iteration: u64,
    pub time_delta: Time,
    pub look_ahead: Time,
    pub impact_window: Time,
    pub max_iterations: u64,
    /// Names of federates this one waits on; empty means the whole
    /// federation.
    pub dependencies: HashSet<String>,
    /// The blocked time negotiation, if any.
    pub pending: Option<PendingRequest>,
    /// Caller blocked in `enter_initializing_state`.
    pub init_reply: Option<oneshot::Sender<FedResult<()>>>,
    /// Traffic held until a grant makes it eligible: (source handle for
    /// tie-breaking, destination handle, message).
    pub held: Vec<(HandleId, HandleId, Message)>,
    pub shared: Arc<FedShared>,
}

impl FederateState {
    pub fn new(name: &str, info: &FederateInfo) -> Self {
        Self {
            name: name.to_string(),
            phase: FederatePhase::Created,
            granted: Time::ZERO,
            iteration: 0,
            time_delta: info.time_delta.max(Time::EPSILON),
            look_ahead: info.look_ahead.max(Time::ZERO),
            impact_window: info.impact_window.max(Time::ZERO),
            max_iterations: info.max_iterations,
            dependencies: HashSet::new(),
            pending: None,
            init_reply: None,
            held: Vec::new(),
            shared: FedShared::new(name),
        }
    }

    /// The earliest timestamp this federate may place on an outbound event.
    pub fn earliest_output(&self) -> Time {
        self.granted + self.look_ahead
    }

    /// Clamp a raw request by the minimum advance step.
    pub fn effective_request(&self, requested: Time, iterative: bool) -> Time {
        if iterative {
            requested.max(self.granted)
        } else {
            requested.max(self.granted + self.time_delta)
        }
    }

    /// Move held traffic that has become eligible at `granted` into the
    /// shared inbox, FIFO by timestamp with ties broken by global source
    /// id. Returns the number delivered.
    pub fn deliver_eligible(&mut self, granted: Time) -> usize {
        let horizon = self.impact_window;
        let mut eligible: Vec<(HandleId, HandleId, Message)> = Vec::new();
        let mut remaining = Vec::with_capacity(self.held.len());
        for entry in self.held.drain(..) {
            if entry.2.time + horizon <= granted {
                eligible.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        self.held = remaining;

        eligible.sort_by_key(|(source, _, msg)| (msg.time, source.as_i32()));
        let count = eligible.len();
        let mut inbox = self.shared.inbox.lock();
        for (_, dest, msg) in eligible {
            inbox.push_back((dest, msg));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::HandleId;

    fn fed() -> FederateState {
        FederateState::new(
            "f",
            &FederateInfo {
                time_delta: Time::from_ns(2),
                look_ahead: Time::from_ns(3),
                impact_window: Time::ZERO,
                max_iterations: 10,
            },
        )
    }

    #[test]
    fn test_effective_request_clamps_by_delta() {
        let mut f = fed();
        f.granted = Time::from_ns(10);
        assert_eq!(f.effective_request(Time::from_ns(11), false), Time::from_ns(12));
        assert_eq!(f.effective_request(Time::from_ns(20), false), Time::from_ns(20));
        // Iterative requests may stay at the granted time.
        assert_eq!(f.effective_request(Time::from_ns(10), true), Time::from_ns(10));
    }

    #[test]
    fn test_deliver_orders_by_time_then_source() {
        let mut f = fed();
        let dest = HandleId::new(5);
        f.held.push((
            HandleId::new(9),
            dest,
            Message::new("b", "f", Time::from_ns(4), vec![2]),
        ));
        f.held.push((
            HandleId::new(1),
            dest,
            Message::new("a", "f", Time::from_ns(4), vec![1]),
        ));
        f.held.push((
            HandleId::new(9),
            dest,
            Message::new("b", "f", Time::from_ns(2), vec![0]),
        ));

        assert_eq!(f.deliver_eligible(Time::from_ns(4)), 3);
        let inbox = f.shared.inbox.lock();
        let order: Vec<u8> = inbox.iter().map(|(_, m)| m.data[0]).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_impact_window_defers_delivery() {
        let mut f = fed();
        f.impact_window = Time::from_ns(5);
        f.held.push((
            HandleId::new(1),
            HandleId::new(2),
            Message::new("a", "f", Time::from_ns(3), vec![]),
        ));

        // Not eligible until granted >= 3 + 5.
        assert_eq!(f.deliver_eligible(Time::from_ns(7)), 0);
        assert_eq!(f.held.len(), 1);
        assert_eq!(f.deliver_eligible(Time::from_ns(8)), 1);
        assert!(f.held.is_empty());
    }
}
