//! Action messages
//!
//! The action message is the sole unit of traffic between brokers, cores,
//! and the transport: a tagged record with a command code, source and
//! destination identifiers, a timestamp, routing fields, and string/binary
//! payloads. Registration, identifier negotiation, init-request, and
//! disconnect are priority commands: the router drains them before touching
//! payload traffic so that registration never starves.

mod wire;

pub use wire::{decode, encode, WireError};

use serde::{Deserialize, Serialize};

use crate::ids::{FederateId, HandleId, RouteId};
use crate::time::Time;

/// Request is part of an iterative time negotiation.
pub const FLAG_ITERATIVE: u32 = 1 << 0;
/// The requesting federate reports local convergence for this round.
pub const FLAG_CONVERGED: u32 = 1 << 1;
/// The request negotiates entry into the executing phase (time zero).
pub const FLAG_EXEC: u32 = 1 << 2;
/// Handle registration: the interface is required.
pub const FLAG_REQUIRED: u32 = 1 << 3;
/// Handle registration: the interface is optional.
pub const FLAG_OPTIONAL: u32 = 1 << 4;
/// Federate registration: the registrant is itself a sub-broker.
pub const FLAG_BROKER: u32 = 1 << 5;

/// Command codes carried by action messages.
///
/// The discriminants are the one-byte codes of the broker-to-broker wire
/// protocol; gaps separate the priority block from payload commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Action {
    RegisterFederate = 1,
    FederateAck = 2,
    RegisterBroker = 3,
    BrokerAck = 4,
    RegisterPublication = 5,
    RegisterSubscription = 6,
    RegisterEndpoint = 7,
    RegisterSourceFilter = 8,
    RegisterDestinationFilter = 9,
    HandleAck = 10,
    InitRequest = 11,
    InitGrant = 12,
    Disconnect = 13,

    NextTime = 20,
    TimeGrant = 21,
    Message = 22,
    ValueUpdate = 23,
    Error = 24,
    AddRoute = 25,
    RouteHint = 26,
    Log = 27,
}

impl Action {
    /// The one-byte wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Decode a wire code.
    pub fn from_code(code: u8) -> Option<Action> {
        use Action::*;
        Some(match code {
            1 => RegisterFederate,
            2 => FederateAck,
            3 => RegisterBroker,
            4 => BrokerAck,
            5 => RegisterPublication,
            6 => RegisterSubscription,
            7 => RegisterEndpoint,
            8 => RegisterSourceFilter,
            9 => RegisterDestinationFilter,
            10 => HandleAck,
            11 => InitRequest,
            12 => InitGrant,
            13 => Disconnect,
            20 => NextTime,
            21 => TimeGrant,
            22 => Message,
            23 => ValueUpdate,
            24 => Error,
            25 => AddRoute,
            26 => RouteHint,
            27 => Log,
            _ => return None,
        })
    }

    /// Priority commands are drained ahead of the main queue.
    pub fn is_priority(self) -> bool {
        (self as u8) < 20
    }

    /// True for the handle-registration family.
    pub fn is_handle_registration(self) -> bool {
        matches!(
            self,
            Action::RegisterPublication
                | Action::RegisterSubscription
                | Action::RegisterEndpoint
                | Action::RegisterSourceFilter
                | Action::RegisterDestinationFilter
        )
    }
}

/// The unit of inter-component traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMessage {
    pub action: Action,
    pub source_fed: FederateId,
    pub dest_fed: FederateId,
    pub source_handle: HandleId,
    pub dest_handle: HandleId,
    pub route: RouteId,
    pub time: Time,
    pub flags: u32,
    /// String payload; names, connection descriptors, and envelopes.
    pub payload: String,
    /// Binary payload; message bodies and value bytes.
    pub data: Vec<u8>,
}

impl ActionMessage {
    /// A message with every identifier invalid and no payload.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            source_fed: FederateId::INVALID,
            dest_fed: FederateId::INVALID,
            source_handle: HandleId::INVALID,
            dest_handle: HandleId::INVALID,
            route: RouteId::INVALID,
            time: Time::ZERO,
            flags: 0,
            payload: String::new(),
            data: Vec::new(),
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }
}

/// A message as seen by a federate endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Source endpoint name.
    pub source: String,
    /// Destination endpoint name.
    pub dest: String,
    /// The source before any filter rewrite.
    pub original_source: String,
    pub time: Time,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(source: impl Into<String>, dest: impl Into<String>, time: Time, data: Vec<u8>) -> Self {
        let source = source.into();
        Self {
            original_source: source.clone(),
            source,
            dest: dest.into(),
            time,
            data,
        }
    }
}

/// Addressing envelope carried in the string payload of `Action::Message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub source: String,
    pub dest: String,
    #[serde(rename = "original-source")]
    pub original_source: String,
}

impl MessageEnvelope {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(payload: &str) -> Option<Self> {
        serde_json::from_str(payload).ok()
    }
}

/// Auxiliary handle-registration record carried in the binary payload of
/// the register-handle commands and their acks; the handle name travels in
/// the string payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleSpec {
    pub kind: crate::handles::HandleKind,
    #[serde(rename = "data-type")]
    pub data_type: String,
    /// Units for publications and subscriptions, empty otherwise.
    #[serde(default)]
    pub units: String,
    /// Target endpoint for filters, empty otherwise.
    #[serde(default)]
    pub target: String,
}

impl HandleSpec {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// Build the action message carrying a federate-visible message.
pub fn pack_message(msg: &Message) -> ActionMessage {
    let mut cmd = ActionMessage::new(Action::Message);
    cmd.time = msg.time;
    cmd.payload = MessageEnvelope {
        source: msg.source.clone(),
        dest: msg.dest.clone(),
        original_source: msg.original_source.clone(),
    }
    .to_json();
    cmd.data = msg.data.clone();
    cmd
}

/// Recover the federate-visible message from an action message.
pub fn unpack_message(cmd: &ActionMessage) -> Option<Message> {
    let envelope = MessageEnvelope::from_json(&cmd.payload)?;
    Some(Message {
        source: envelope.source,
        dest: envelope.dest,
        original_source: envelope.original_source,
        time: cmd.time,
        data: cmd.data.clone(),
    })
}
