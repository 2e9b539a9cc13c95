//! Core node
//!
//! A core is a leaf broker: it hosts federate state machines, owns the
//! federate-facing API surface, and speaks the action-message protocol
//! toward its parent. A root core with no parent coordinates the whole
//! federation by itself, which is the common single-process arrangement.
//!
//! The router is a single consumer: commands and action messages are
//! classified into an ordered priority queue and an ordered main queue,
//! and the loop drains every priority entry before touching one main
//! entry, so registration never starves behind payload traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::{FedResult, FederationError};
use crate::guarded::Guarded;
use crate::handles::{HandleKind, HandleRegistry};
use crate::ids::{FederateId, HandleId, RouteId};
use crate::message::{
    pack_message, unpack_message, Action, ActionMessage, HandleSpec, Message, FLAG_REQUIRED,
};
use crate::time::Time;
use crate::transport::Transport;

use super::federate::{FederatePhase, FederateState, PendingReply, PendingRequest};
use super::handle::CoreHandle;
use super::requests::{CoreMetrics, CoreRequest, FederateSnapshot, FilterOperator, TimeParam};
use super::time_coord::{self, Floor};

const QUEUE_DEPTH: usize = 256;

/// State the core shares with federate callers outside the router task.
pub(super) struct CoreShared {
    pub registry: Guarded<HandleRegistry>,
    pub values: Guarded<HashMap<HandleId, Vec<u8>>>,
    pub feds: Guarded<HashMap<FederateId, Arc<super::federate::FedShared>>>,
}

enum CoreEvent {
    Request(CoreRequest),
    Action(ActionMessage),
}

struct PendingHandle {
    reply: oneshot::Sender<FedResult<HandleId>>,
}

/// A leaf broker hosting federates.
pub struct Core {
    identifier: String,
    config: BrokerConfig,
    is_root: bool,
    /// Global broker id of this core, raw; carried in the source-fed field
    /// of control traffic so the parent can route replies.
    global_id: i32,
    transport: Option<Box<dyn Transport>>,

    requests_tx: mpsc::Sender<CoreRequest>,
    requests_rx: mpsc::Receiver<CoreRequest>,
    actions_tx: mpsc::Sender<ActionMessage>,
    actions_rx: mpsc::Receiver<ActionMessage>,

    shared: Arc<CoreShared>,

    priority: VecDeque<CoreEvent>,
    main: VecDeque<CoreEvent>,

    feds: HashMap<FederateId, FederateState>,
    fed_names: HashMap<String, FederateId>,
    next_fed: i32,

    /// Registrations awaiting a global id from upstream.
    pending_feds: HashMap<String, (oneshot::Sender<FedResult<FederateId>>, super::federate::FederateInfo)>,
    pending_handles: HashMap<(HandleKind, String), PendingHandle>,
    /// Requests queued until the parent acknowledges this core.
    startup: Vec<CoreRequest>,
    connected: bool,

    init_sent: bool,
    init_granted: bool,
    disconnect_sent: bool,

    operators: HashMap<HandleId, FilterOperator>,
    /// Known communication pairs: destination endpoint name to source.
    hints: HashMap<String, String>,
    /// Root only: unresolved messages held because a hint names their
    /// destination.
    deferred: Vec<ActionMessage>,

    /// Last floor reported upstream; cleared whenever a grant is processed
    /// so the parent sees a fresh report each round.
    last_report: Option<Floor>,

    messages_routed: u64,
    grants_issued: u64,
}

impl Core {
    /// Build a core from its configuration. Non-root cores need a
    /// transport attached with [`Core::set_transport`] before running.
    pub fn new(config: BrokerConfig) -> Self {
        let identifier = config
            .name
            .clone()
            .unwrap_or_else(|| format!("core-{}", Uuid::new_v4()));
        let (requests_tx, requests_rx) = mpsc::channel(QUEUE_DEPTH);
        let (actions_tx, actions_rx) = mpsc::channel(QUEUE_DEPTH);
        let is_root = config.root;
        Self {
            identifier,
            config,
            is_root,
            global_id: -1,
            transport: None,
            requests_tx,
            requests_rx,
            actions_tx,
            actions_rx,
            shared: Arc::new(CoreShared {
                registry: Guarded::new(HandleRegistry::new()),
                values: Guarded::new(HashMap::new()),
                feds: Guarded::new(HashMap::new()),
            }),
            priority: VecDeque::new(),
            main: VecDeque::new(),
            feds: HashMap::new(),
            fed_names: HashMap::new(),
            next_fed: 0,
            pending_feds: HashMap::new(),
            pending_handles: HashMap::new(),
            startup: Vec::new(),
            connected: is_root,
            init_sent: false,
            init_granted: false,
            disconnect_sent: false,
            operators: HashMap::new(),
            hints: HashMap::new(),
            deferred: Vec::new(),
            last_report: None,
            messages_routed: 0,
            grants_issued: 0,
        }
    }

    /// Build a core directly from an initialization string.
    pub fn from_init_string(init: &str) -> eyre::Result<Self> {
        Ok(Self::new(BrokerConfig::from_init_string(init)?))
    }

    pub fn set_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }

    pub fn set_identifier(&mut self, name: &str) {
        self.identifier = name.to_string();
    }

    pub fn get_identifier(&self) -> &str {
        &self.identifier
    }

    /// Sender the transport layer feeds inbound action messages into.
    pub fn action_sender(&self) -> mpsc::Sender<ActionMessage> {
        self.actions_tx.clone()
    }

    /// Cloneable federate-facing handle.
    pub fn handle(&self) -> CoreHandle {
        CoreHandle::new(self.requests_tx.clone(), Arc::clone(&self.shared))
    }

    /// True once every hosted federate has signalled init-request and the
    /// minimum federate count is met.
    pub fn is_init_ready(&self) -> bool {
        self.feds.len() >= self.config.min_federates as usize
            && self
                .feds
                .values()
                .all(|fed| fed.init_reply.is_some() || fed.phase != FederatePhase::Created)
    }

    /// Run the router until every caller handle is dropped.
    pub async fn run(mut self) {
        if !self.is_root {
            if let Err(err) = self.connect_parent().await {
                error!(identifier = %self.identifier, %err, "parent connection failed");
                return;
            }
        }
        info!(identifier = %self.identifier, root = self.is_root, "core started");

        loop {
            while let Ok(req) = self.requests_rx.try_recv() {
                self.enqueue_request(req);
            }
            while let Ok(msg) = self.actions_rx.try_recv() {
                self.enqueue_action(msg);
            }

            if let Some(event) = self.priority.pop_front() {
                self.dispatch(event).await;
                continue;
            }
            if let Some(event) = self.main.pop_front() {
                self.dispatch(event).await;
                continue;
            }

            tokio::select! {
                req = self.requests_rx.recv() => match req {
                    Some(req) => self.enqueue_request(req),
                    None => break,
                },
                msg = self.actions_rx.recv() => match msg {
                    Some(msg) => self.enqueue_action(msg),
                    // The transport side never closes while the network
                    // holds our sender; treat closure as shutdown.
                    None => break,
                },
            }
        }
        info!(identifier = %self.identifier, "core stopped");
    }

    fn enqueue_request(&mut self, req: CoreRequest) {
        if req.is_priority() {
            self.priority.push_back(CoreEvent::Request(req));
        } else {
            self.main.push_back(CoreEvent::Request(req));
        }
    }

    fn enqueue_action(&mut self, msg: ActionMessage) {
        if msg.action.is_priority() {
            self.priority.push_back(CoreEvent::Action(msg));
        } else {
            self.main.push_back(CoreEvent::Action(msg));
        }
    }

    async fn dispatch(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Request(req) => self.handle_request(req).await,
            CoreEvent::Action(msg) => self.handle_action(msg).await,
        }
    }

    async fn connect_parent(&mut self) -> FedResult<()> {
        let address = self
            .config
            .broker_address
            .clone()
            .ok_or_else(|| FederationError::TransportFailure("no broker address configured".into()))?;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| FederationError::TransportFailure("no transport attached".into()))?;
        transport.broker_connect(&address).await?;

        let mut reg = ActionMessage::new(Action::RegisterBroker);
        reg.payload = self.identifier.clone();
        reg.data = transport.get_address().into_bytes();
        self.transmit_up(reg).await;
        Ok(())
    }

    async fn transmit_up(&mut self, msg: ActionMessage) {
        let Some(transport) = self.transport.as_ref() else {
            error!(identifier = %self.identifier, "no transport for upstream traffic");
            return;
        };
        if let Err(err) = transport.transmit(RouteId::PARENT, msg).await {
            error!(identifier = %self.identifier, %err, "upstream transmit failed");
            self.fail_federation(&FederationError::TransportFailure(err.to_string()));
        }
    }

    // ------------------------------------------------------------------
    // Federate API commands
    // ------------------------------------------------------------------

    async fn handle_request(&mut self, req: CoreRequest) {
        match req {
            CoreRequest::RegisterFederate { name, info, reply } => {
                if self.shared.registry.read(|reg| reg.is_operating()) {
                    let _ = reply.send(Err(FederationError::Frozen));
                    return;
                }
                if self.fed_names.contains_key(&name) || self.pending_feds.contains_key(&name) {
                    let _ = reply.send(Err(FederationError::NameInUse(name)));
                    return;
                }
                if !self.connected {
                    self.startup.push(CoreRequest::RegisterFederate { name, info, reply });
                    return;
                }
                if self.is_root {
                    let id = FederateId::new(self.next_fed);
                    self.next_fed += 1;
                    self.insert_federate(id, &name, &info);
                    let _ = reply.send(Ok(id));
                } else {
                    let mut msg = ActionMessage::new(Action::RegisterFederate);
                    msg.payload = name.clone();
                    msg.source_fed = FederateId::new(self.global_id);
                    self.pending_feds.insert(name, (reply, info));
                    self.transmit_up(msg).await;
                }
            }

            CoreRequest::RegisterHandle {
                fed,
                kind,
                name,
                data_type,
                units,
                target,
                required,
                reply,
            } => {
                let Some(state) = self.feds.get(&fed) else {
                    let _ = reply.send(Err(FederationError::InvalidIdentifier(fed.to_string())));
                    return;
                };
                if state.phase.is_terminal() || state.phase == FederatePhase::Executing {
                    let _ = reply.send(Err(FederationError::PhaseViolation(state.phase.as_str().into())));
                    return;
                }
                if let Err(err) = self.shared.registry.read(|reg| reg.check_name(kind, &name, fed)) {
                    let _ = reply.send(Err(err));
                    return;
                }
                if self.is_root {
                    let result = self.shared.registry.modify(|reg| {
                        let id = reg.allocate_id();
                        reg.insert(id, fed, kind, &name, &data_type, &units, &target, required)
                            .map(|_| id)
                    });
                    if result.is_ok() {
                        self.retry_deferred();
                    }
                    let _ = reply.send(result);
                } else {
                    if self.pending_handles.contains_key(&(kind, name.clone())) {
                        let _ = reply.send(Err(FederationError::NameInUse(name)));
                        return;
                    }
                    let mut msg = ActionMessage::new(match kind {
                        HandleKind::Publication => Action::RegisterPublication,
                        HandleKind::Subscription => Action::RegisterSubscription,
                        HandleKind::Endpoint => Action::RegisterEndpoint,
                        HandleKind::SourceFilter => Action::RegisterSourceFilter,
                        HandleKind::DestinationFilter => Action::RegisterDestinationFilter,
                    });
                    msg.payload = name.clone();
                    msg.source_fed = fed;
                    if required {
                        msg.set_flag(FLAG_REQUIRED);
                    }
                    msg.data = HandleSpec {
                        kind,
                        data_type,
                        units,
                        target,
                    }
                    .to_bytes();
                    self.pending_handles.insert((kind, name), PendingHandle { reply });
                    self.transmit_up(msg).await;
                }
            }

            CoreRequest::EnterInitializing { fed, reply } => {
                let Some(state) = self.feds.get_mut(&fed) else {
                    let _ = reply.send(Err(FederationError::InvalidIdentifier(fed.to_string())));
                    return;
                };
                if state.phase != FederatePhase::Created {
                    let _ = reply.send(Err(FederationError::PhaseViolation(state.phase.as_str().into())));
                    return;
                }
                if self.init_granted {
                    state.phase = FederatePhase::Initializing;
                    let _ = reply.send(Ok(()));
                    return;
                }
                state.init_reply = Some(reply);
                self.check_init_ready().await;
            }

            CoreRequest::EnterExecuting { fed, converged, reply } => {
                let Some(state) = self.feds.get_mut(&fed) else {
                    let _ = reply.send(Err(FederationError::InvalidIdentifier(fed.to_string())));
                    return;
                };
                if state.phase != FederatePhase::Initializing {
                    let _ = reply.send(Err(FederationError::PhaseViolation(state.phase.as_str().into())));
                    return;
                }
                state.pending = Some(PendingRequest {
                    time: Time::ZERO,
                    iterative: true,
                    exec: true,
                    converged,
                    reply: PendingReply::Exec(reply),
                });
                self.after_request_change().await;
            }

            CoreRequest::TimeRequest { fed, time, reply } => {
                let Some(state) = self.feds.get_mut(&fed) else {
                    let _ = reply.send(Err(FederationError::InvalidIdentifier(fed.to_string())));
                    return;
                };
                if state.phase.is_terminal() {
                    let _ = reply.send(Ok(state.granted));
                    return;
                }
                if state.phase != FederatePhase::Executing {
                    let _ = reply.send(Err(FederationError::PhaseViolation(state.phase.as_str().into())));
                    return;
                }
                let effective = state.effective_request(time, false);
                state.pending = Some(PendingRequest {
                    time: effective,
                    iterative: false,
                    exec: false,
                    converged: true,
                    reply: PendingReply::Time(reply),
                });
                self.after_request_change().await;
            }

            CoreRequest::TimeRequestIterative {
                fed,
                time,
                converged,
                reply,
            } => {
                let Some(state) = self.feds.get_mut(&fed) else {
                    let _ = reply.send(Err(FederationError::InvalidIdentifier(fed.to_string())));
                    return;
                };
                if state.phase.is_terminal() {
                    let _ = reply.send(Ok((state.granted, false)));
                    return;
                }
                if state.phase != FederatePhase::Executing {
                    let _ = reply.send(Err(FederationError::PhaseViolation(state.phase.as_str().into())));
                    return;
                }
                if state.iteration >= state.max_iterations {
                    // Iteration limit reached: report the best-available
                    // time without blocking the federation.
                    let _ = reply.send(Ok((state.granted, false)));
                    return;
                }
                let effective = state.effective_request(time, true);
                state.pending = Some(PendingRequest {
                    time: effective,
                    iterative: true,
                    exec: false,
                    converged,
                    reply: PendingReply::Iterative(reply),
                });
                self.after_request_change().await;
            }

            CoreRequest::Send {
                fed,
                source_handle,
                dest,
                time,
                data,
                reply,
            } => {
                let result = self.build_outbound(fed, source_handle, &dest, time, data);
                match result {
                    Ok(msg) => {
                        let stamp = msg.time;
                        self.route_message(pack_outbound(msg, fed, source_handle)).await;
                        self.messages_routed += 1;
                        let _ = reply.send(Ok(stamp));
                    }
                    Err(err) => {
                        let _ = reply.send(Err(err));
                    }
                }
            }

            CoreRequest::SendMessage {
                fed,
                source_handle,
                message,
                reply,
            } => {
                let earliest = match self.feds.get(&fed) {
                    Some(state) if state.phase == FederatePhase::Executing
                        || state.phase == FederatePhase::Initializing =>
                    {
                        state.earliest_output()
                    }
                    Some(state) => {
                        let _ = reply.send(Err(FederationError::PhaseViolation(state.phase.as_str().into())));
                        return;
                    }
                    None => {
                        let _ = reply.send(Err(FederationError::InvalidIdentifier(fed.to_string())));
                        return;
                    }
                };
                if message.time < earliest {
                    let _ = reply.send(Err(FederationError::LookAheadViolation {
                        requested: message.time,
                        earliest,
                    }));
                    return;
                }
                self.route_message(pack_outbound(message, fed, source_handle)).await;
                self.messages_routed += 1;
                let _ = reply.send(Ok(()));
            }

            CoreRequest::SetValue { fed, handle, data, reply } => {
                let valid = self.shared.registry.read(|reg| {
                    reg.lookup_by_handle(handle)
                        .is_some_and(|info| info.fed == fed && info.kind == HandleKind::Publication)
                });
                if !valid {
                    let _ = reply.send(Err(FederationError::InvalidIdentifier(handle.to_string())));
                    return;
                }
                let name = self
                    .shared
                    .registry
                    .read(|reg| reg.lookup_by_handle(handle).map(|info| info.name.clone()))
                    .unwrap_or_default();
                self.shared.values.modify(|values| {
                    values.insert(handle, data.clone());
                });
                if self.is_root {
                    self.fan_out_value(&name, &data);
                } else {
                    let mut msg = ActionMessage::new(Action::ValueUpdate);
                    msg.source_fed = fed;
                    msg.source_handle = handle;
                    msg.payload = name;
                    msg.data = data;
                    self.transmit_up(msg).await;
                }
                let _ = reply.send(Ok(()));
            }

            CoreRequest::AddDependency { fed, name, reply } => {
                match self.feds.get_mut(&fed) {
                    Some(state) => {
                        state.dependencies.insert(name);
                        let _ = reply.send(Ok(()));
                    }
                    None => {
                        let _ = reply.send(Err(FederationError::InvalidIdentifier(fed.to_string())));
                    }
                }
            }

            CoreRequest::SetTimeParam { fed, param, reply } => {
                match self.feds.get_mut(&fed) {
                    Some(state) => {
                        match param {
                            TimeParam::Delta(value) => state.time_delta = value.max(Time::EPSILON),
                            TimeParam::LookAhead(value) => state.look_ahead = value.max(Time::ZERO),
                            TimeParam::ImpactWindow(value) => state.impact_window = value.max(Time::ZERO),
                            TimeParam::MaxIterations(value) => state.max_iterations = value,
                        }
                        let _ = reply.send(Ok(()));
                    }
                    None => {
                        let _ = reply.send(Err(FederationError::InvalidIdentifier(fed.to_string())));
                    }
                }
            }

            CoreRequest::SetFilterOperator { filter, operator, reply } => {
                let valid = self.shared.registry.read(|reg| {
                    reg.lookup_by_handle(filter).is_some_and(|info| {
                        matches!(info.kind, HandleKind::SourceFilter | HandleKind::DestinationFilter)
                    })
                });
                if valid {
                    self.operators.insert(filter, operator);
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(FederationError::InvalidIdentifier(filter.to_string())));
                }
            }

            CoreRequest::RegisterCommPair { source, dest, reply } => {
                self.hints.insert(dest.clone(), source.clone());
                if !self.is_root {
                    let mut msg = ActionMessage::new(Action::RouteHint);
                    msg.payload = serde_json::json!({ "source": source, "dest": dest }).to_string();
                    self.transmit_up(msg).await;
                }
                let _ = reply.send(Ok(()));
            }

            CoreRequest::Finalize { fed, reply } => {
                if !self.feds.contains_key(&fed) {
                    let _ = reply.send(Err(FederationError::InvalidIdentifier(fed.to_string())));
                    return;
                }
                self.terminate_federate(fed, FederatePhase::Finalized);
                let _ = reply.send(Ok(()));
                self.check_disconnect().await;
                self.after_request_change().await;
            }

            CoreRequest::ErrorReport { fed, code, message, reply } => {
                warn!(
                    identifier = %self.identifier,
                    fed = %fed,
                    code,
                    %message,
                    "federate reported an error"
                );
                if !self.feds.contains_key(&fed) {
                    let _ = reply.send(Err(FederationError::InvalidIdentifier(fed.to_string())));
                    return;
                }
                let _ = reply.send(Ok(()));
                self.fail_federation(&FederationError::TransportFailure(message.clone()));
                if !self.is_root {
                    let mut msg = ActionMessage::new(Action::Error);
                    msg.source_fed = fed;
                    msg.flags = code as u32;
                    msg.payload = message;
                    self.transmit_up(msg).await;
                }
            }

            CoreRequest::LogMessage { fed, level, message } => {
                let name = self.feds.get(&fed).map(|f| f.name.clone()).unwrap_or_default();
                match level {
                    0 => error!(federate = %name, "{message}"),
                    1 => warn!(federate = %name, "{message}"),
                    2 => info!(federate = %name, "{message}"),
                    _ => debug!(federate = %name, "{message}"),
                }
            }

            CoreRequest::QueryFederate { fed, reply } => {
                let snapshot = self.feds.get(&fed).map(|state| FederateSnapshot {
                    name: state.name.clone(),
                    phase: state.phase,
                    granted: state.granted,
                    iteration: state.iteration,
                });
                let _ = reply.send(
                    snapshot.ok_or_else(|| FederationError::InvalidIdentifier(fed.to_string())),
                );
            }

            CoreRequest::GetMetrics { reply } => {
                let metrics = CoreMetrics {
                    federates: self.feds.len(),
                    finalized: self.feds.values().filter(|f| f.phase.is_terminal()).count(),
                    handles: self.shared.registry.read(|reg| reg.len()),
                    messages_routed: self.messages_routed,
                    grants_issued: self.grants_issued,
                    init_granted: self.init_granted,
                };
                let _ = reply.send(metrics);
            }
        }
    }

    fn insert_federate(&mut self, id: FederateId, name: &str, info: &super::federate::FederateInfo) {
        debug!(identifier = %self.identifier, fed = %id, name, "federate registered");
        let state = FederateState::new(name, info);
        self.shared.feds.modify(|feds| {
            feds.insert(id, Arc::clone(&state.shared));
        });
        self.feds.insert(id, state);
        self.fed_names.insert(name.to_string(), id);
    }

    fn build_outbound(
        &mut self,
        fed: FederateId,
        source_handle: HandleId,
        dest: &str,
        time: Option<Time>,
        data: Vec<u8>,
    ) -> FedResult<Message> {
        let state = self
            .feds
            .get(&fed)
            .ok_or_else(|| FederationError::InvalidIdentifier(fed.to_string()))?;
        if state.phase != FederatePhase::Executing && state.phase != FederatePhase::Initializing {
            return Err(FederationError::PhaseViolation(state.phase.as_str().into()));
        }
        let source_name = self
            .shared
            .registry
            .read(|reg| {
                reg.lookup_by_handle(source_handle)
                    .filter(|info| info.fed == fed && info.kind == HandleKind::Endpoint)
                    .map(|info| info.name.clone())
            })
            .ok_or_else(|| FederationError::InvalidIdentifier(source_handle.to_string()))?;

        let earliest = state.earliest_output();
        let stamp = time.unwrap_or(earliest);
        if stamp < earliest {
            return Err(FederationError::LookAheadViolation {
                requested: stamp,
                earliest,
            });
        }
        Ok(Message::new(source_name, dest, stamp, data))
    }

    // ------------------------------------------------------------------
    // Action messages from the tree
    // ------------------------------------------------------------------

    async fn handle_action(&mut self, msg: ActionMessage) {
        match msg.action {
            Action::BrokerAck => {
                self.global_id = msg.dest_fed.as_i32();
                self.connected = true;
                debug!(identifier = %self.identifier, broker_id = self.global_id, "broker id assigned");
                for req in std::mem::take(&mut self.startup) {
                    self.enqueue_request(req);
                }
            }

            Action::FederateAck => {
                if let Some((reply, info)) = self.pending_feds.remove(&msg.payload) {
                    let id = msg.dest_fed;
                    self.insert_federate(id, &msg.payload, &info);
                    let _ = reply.send(Ok(id));
                } else {
                    warn!(identifier = %self.identifier, name = %msg.payload, "unexpected federate ack");
                }
            }

            Action::HandleAck => {
                let Some(spec) = HandleSpec::from_bytes(&msg.data) else {
                    warn!(identifier = %self.identifier, "handle ack without spec");
                    return;
                };
                let key = (spec.kind, msg.payload.clone());
                let result = self.shared.registry.modify(|reg| {
                    reg.insert(
                        msg.dest_handle,
                        msg.dest_fed,
                        spec.kind,
                        &msg.payload,
                        &spec.data_type,
                        &spec.units,
                        &spec.target,
                        msg.has_flag(FLAG_REQUIRED),
                    )
                    .map(|_| msg.dest_handle)
                });
                if let Some(pending) = self.pending_handles.remove(&key) {
                    let _ = pending.reply.send(result);
                }
            }

            Action::InitGrant => self.grant_init(),

            Action::TimeGrant => {
                let floor = Floor {
                    time: msg.time,
                    flags: msg.flags,
                };
                self.process_grant(floor);
                self.after_request_change().await;
            }

            Action::Message => {
                self.route_message(msg).await;
            }

            Action::ValueUpdate => {
                self.apply_value_update(&msg);
            }

            Action::Error => {
                self.handle_error_action(msg);
            }

            Action::Disconnect => {
                // Federation-wide teardown from above.
                let ids: Vec<FederateId> = self.feds.keys().copied().collect();
                for fed in ids {
                    self.terminate_federate(fed, FederatePhase::Finalized);
                }
            }

            other => {
                warn!(identifier = %self.identifier, action = ?other, "unexpected action at core");
            }
        }
    }

    fn apply_value_update(&mut self, msg: &ActionMessage) {
        if !msg.dest_handle.is_valid() {
            warn!(identifier = %self.identifier, "undirected value update at core");
            return;
        }
        self.shared.values.modify(|values| {
            values.insert(msg.dest_handle, msg.data.clone());
        });
        if let Some(state) = self.feds.get(&msg.dest_fed) {
            let mut pending = state.shared.pending_updates.lock();
            if !pending.contains(&msg.dest_handle) {
                pending.push(msg.dest_handle);
            }
        }
    }

    /// Root: push the new value of a publication to every subscriber.
    fn fan_out_value(&mut self, name: &str, data: &[u8]) {
        let subscribers: Vec<(HandleId, FederateId)> = self.shared.registry.read(|reg| {
            reg.subscribers_of(name)
                .iter()
                .filter_map(|id| reg.lookup_by_handle(*id).map(|info| (info.id, info.fed)))
                .collect()
        });
        for (sub, owner) in subscribers {
            let mut update = ActionMessage::new(Action::ValueUpdate);
            update.dest_fed = owner;
            update.dest_handle = sub;
            update.data = data.to_vec();
            update.payload = name.to_string();
            self.apply_value_update(&update);
        }
    }

    fn handle_error_action(&mut self, msg: ActionMessage) {
        if msg.dest_fed.is_valid() {
            // A directed error: first see whether it answers a pending
            // registration.
            if let Some((reply, _)) = self.pending_feds.remove(&msg.payload) {
                let _ = reply.send(Err(FederationError::from_code(msg.flags, &msg.payload)));
                return;
            }
            let pending_key = self
                .pending_handles
                .keys()
                .find(|(_, name)| *name == msg.payload)
                .cloned();
            if let Some(key) = pending_key {
                if let Some(pending) = self.pending_handles.remove(&key) {
                    let _ = pending.reply.send(Err(FederationError::from_code(msg.flags, &msg.payload)));
                }
                return;
            }
            let err = FederationError::from_code(msg.flags, &msg.payload);
            if err.is_fatal() {
                self.fail_federation(&err);
            } else {
                warn!(identifier = %self.identifier, fed = %msg.dest_fed, %err, "recoverable error");
            }
        } else {
            self.fail_federation(&FederationError::from_code(msg.flags, &msg.payload));
        }
    }

    /// Move every federate into the error phase and resolve anything
    /// blocked. Idempotent.
    fn fail_federation(&mut self, err: &FederationError) {
        error!(identifier = %self.identifier, %err, "federation entering error state");
        let ids: Vec<FederateId> = self.feds.keys().copied().collect();
        for fed in ids {
            self.terminate_federate(fed, FederatePhase::Error);
        }
    }

    /// Transition one federate into a terminal phase, resolving its
    /// blocked calls with the current granted time. Idempotent.
    fn terminate_federate(&mut self, fed: FederateId, phase: FederatePhase) {
        let Some(state) = self.feds.get_mut(&fed) else {
            return;
        };
        if state.phase.is_terminal() {
            return;
        }
        state.phase = phase;
        if let Some(reply) = state.init_reply.take() {
            let _ = reply.send(Ok(()));
        }
        if let Some(pending) = state.pending.take() {
            let granted = state.granted;
            match pending.reply {
                PendingReply::Time(tx) => {
                    let _ = tx.send(Ok(granted));
                }
                PendingReply::Iterative(tx) => {
                    let _ = tx.send(Ok((granted, false)));
                }
                PendingReply::Exec(tx) => {
                    let _ = tx.send(Ok(false));
                }
            }
        }
    }

    async fn check_disconnect(&mut self) {
        if self.disconnect_sent {
            return;
        }
        if self.feds.is_empty() || !self.feds.values().all(|f| f.phase.is_terminal()) {
            return;
        }
        self.disconnect_sent = true;
        if self.is_root {
            info!(identifier = %self.identifier, "federation finalized");
        } else {
            let mut msg = ActionMessage::new(Action::Disconnect);
            msg.source_fed = FederateId::new(self.global_id);
            self.transmit_up(msg).await;
        }
    }

    // ------------------------------------------------------------------
    // Init coordination
    // ------------------------------------------------------------------

    async fn check_init_ready(&mut self) {
        if self.init_granted || !self.is_init_ready() {
            return;
        }
        if self.is_root {
            self.grant_init();
        } else if !self.init_sent {
            self.init_sent = true;
            let mut msg = ActionMessage::new(Action::InitRequest);
            msg.source_fed = FederateId::new(self.global_id);
            self.transmit_up(msg).await;
        }
    }

    fn grant_init(&mut self) {
        if self.init_granted {
            return;
        }
        self.init_granted = true;
        info!(identifier = %self.identifier, "initialization granted");
        for state in self.feds.values_mut() {
            if state.phase == FederatePhase::Created {
                state.phase = FederatePhase::Initializing;
                if let Some(reply) = state.init_reply.take() {
                    let _ = reply.send(Ok(()));
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Time coordination
    // ------------------------------------------------------------------

    /// Recompute grants and floor reports after any change to the set of
    /// blocked requests.
    async fn after_request_change(&mut self) {
        self.grant_dependency_requests();

        let Some(floor) = time_coord::local_floor(&self.feds) else {
            return;
        };
        if self.is_root {
            self.process_grant(floor);
        } else if self.last_report != Some(floor) {
            self.last_report = Some(floor);
            let mut msg = ActionMessage::new(Action::NextTime);
            msg.source_fed = FederateId::new(self.global_id);
            msg.time = floor.time;
            msg.flags = floor.flags;
            self.transmit_up(msg).await;
        }
    }

    /// Grants for federates that wait on an explicit dependency list
    /// rather than the whole federation.
    fn grant_dependency_requests(&mut self) {
        let candidates: Vec<FederateId> = self
            .feds
            .iter()
            .filter(|(_, state)| {
                !state.dependencies.is_empty()
                    && state
                        .pending
                        .as_ref()
                        .is_some_and(|pending| !pending.iterative && !pending.exec)
            })
            .map(|(id, _)| *id)
            .collect();

        for fed in candidates {
            let deps: Vec<FederateId> = self.feds[&fed]
                .dependencies
                .iter()
                .filter_map(|name| self.fed_names.get(name).copied())
                .filter(|dep| *dep != fed)
                .collect();
            let floor = time_coord::dependency_floor(deps.iter().filter_map(|id| self.feds.get(id)));
            let state = self.feds.get_mut(&fed).expect("candidate exists");
            let pending_time = state.pending.as_ref().expect("candidate is blocked").time;
            if let Some(grant) = time_coord::grant_for(pending_time, state.granted, floor) {
                let pending = state.pending.take().expect("candidate is blocked");
                state.granted = grant;
                state.iteration = 0;
                state.deliver_eligible(grant);
                self.grants_issued += 1;
                if let PendingReply::Time(tx) = pending.reply {
                    let _ = tx.send(Ok(grant));
                }
            }
        }
    }

    /// Apply a federation floor to every blocked federate.
    fn process_grant(&mut self, floor: Floor) {
        let blocked: Vec<FederateId> = self
            .feds
            .iter()
            .filter(|(_, state)| state.pending.is_some())
            .map(|(id, _)| *id)
            .collect();

        for fed in blocked {
            let state = self.feds.get_mut(&fed).expect("blocked federate exists");
            let pending_ref = state.pending.as_ref().expect("blocked federate is pending");

            if pending_ref.exec {
                if !floor.exec() {
                    continue;
                }
                let pending = state.pending.take().expect("pending taken once");
                let converged = floor.converged();
                if converged {
                    state.phase = FederatePhase::Executing;
                    state.granted = Time::ZERO;
                    state.deliver_eligible(Time::ZERO);
                    self.shared.registry.modify(|reg| reg.freeze());
                    debug!(identifier = %self.identifier, fed = %fed, "entered executing");
                } else {
                    state.iteration += 1;
                }
                self.grants_issued += 1;
                if let PendingReply::Exec(tx) = pending.reply {
                    let _ = tx.send(Ok(converged));
                }
                continue;
            }

            if floor.exec() {
                continue;
            }
            let Some(grant) = time_coord::grant_for(pending_ref.time, state.granted, floor.time) else {
                continue;
            };
            let pending = state.pending.take().expect("pending taken once");
            let advanced = grant > state.granted;
            if advanced {
                state.iteration = 0;
            }
            state.granted = grant;
            let converged = floor.converged();
            if pending.iterative && !converged {
                state.iteration += 1;
            }
            state.deliver_eligible(grant);
            self.grants_issued += 1;
            debug!(identifier = %self.identifier, fed = %fed, %grant, "time granted");
            match pending.reply {
                PendingReply::Time(tx) => {
                    let _ = tx.send(Ok(grant));
                }
                PendingReply::Iterative(tx) => {
                    let _ = tx.send(Ok((grant, converged)));
                }
                PendingReply::Exec(_) => unreachable!("exec handled above"),
            }
        }

        // The parent needs a fresh report for the next round even when the
        // local floor value did not move.
        self.last_report = None;
    }

    // ------------------------------------------------------------------
    // Message routing
    // ------------------------------------------------------------------

    /// Route an action message carrying federate traffic: deliver locally,
    /// forward upward, or (at the root) defer or reject.
    async fn route_message(&mut self, mut msg: ActionMessage) {
        let Some(mut message) = unpack_message(&msg) else {
            warn!(identifier = %self.identifier, "malformed message envelope");
            return;
        };

        // Source filters act where the message enters the fabric.
        if msg.source_handle.is_valid() {
            match self.apply_filters(HandleKind::SourceFilter, message) {
                Some(filtered) => message = filtered,
                None => return,
            }
        }

        let dest = self.shared.registry.read(|reg| {
            reg.lookup_by_name(HandleKind::Endpoint, &message.dest)
                .and_then(|id| reg.lookup_by_handle(id).map(|info| (info.id, info.fed)))
        });

        match dest {
            Some((dest_handle, dest_fed)) => {
                match self.apply_filters(HandleKind::DestinationFilter, message) {
                    Some(filtered) => message = filtered,
                    None => return,
                }
                let Some(state) = self.feds.get_mut(&dest_fed) else {
                    warn!(identifier = %self.identifier, fed = %dest_fed, "message for unknown federate");
                    return;
                };
                state.held.push((msg.source_handle, dest_handle, message));
            }
            None if !self.is_root => {
                msg.payload = pack_message(&message).payload;
                msg.data = message.data;
                self.transmit_up(msg).await;
            }
            None => {
                if self.hints.contains_key(&message.dest) {
                    debug!(identifier = %self.identifier, dest = %message.dest, "deferring hinted message");
                    self.deferred.push(pack_outbound(message, msg.source_fed, msg.source_handle));
                } else {
                    // Recoverable by contract; the federation keeps running.
                    warn!(identifier = %self.identifier, dest = %message.dest, "unknown destination");
                }
            }
        }
    }

    /// Run a message past the filters of `kind` whose target matches.
    /// Filters with an operator rewrite (or drop) the message; filters
    /// without one receive a copy on their owner's filter queue.
    fn apply_filters(&mut self, kind: HandleKind, message: Message) -> Option<Message> {
        let target = match kind {
            HandleKind::SourceFilter => message.source.clone(),
            _ => message.dest.clone(),
        };
        let filters: Vec<(HandleId, FederateId)> = self.shared.registry.read(|reg| {
            reg.filters_targeting(kind, &target)
                .into_iter()
                .map(|info| (info.id, info.fed))
                .collect()
        });

        let mut current = message;
        for (filter, owner) in filters {
            if let Some(operator) = self.operators.get_mut(&filter) {
                let original_source = current.original_source.clone();
                match operator(current) {
                    Some(mut rewritten) => {
                        rewritten.original_source = original_source;
                        current = rewritten;
                    }
                    None => return None,
                }
            } else if let Some(state) = self.feds.get(&owner) {
                state.shared.filter_inbox.lock().push_back((filter, current.clone()));
            }
        }
        Some(current)
    }

    /// Root: re-route messages deferred on a communications hint after a
    /// new endpoint registration.
    fn retry_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let ready: Vec<ActionMessage> = {
            let registry = &self.shared.registry;
            let mut still_deferred = Vec::new();
            let mut ready = Vec::new();
            for msg in self.deferred.drain(..) {
                let resolved = unpack_message(&msg).is_some_and(|m| {
                    registry.read(|reg| reg.lookup_by_name(HandleKind::Endpoint, &m.dest).is_some())
                });
                if resolved {
                    ready.push(msg);
                } else {
                    still_deferred.push(msg);
                }
            }
            self.deferred = still_deferred;
            ready
        };
        for msg in ready {
            self.main.push_back(CoreEvent::Action(msg));
        }
    }
}

/// Wrap a federate-visible message for routing, stamping its origin.
fn pack_outbound(message: Message, fed: FederateId, source_handle: HandleId) -> ActionMessage {
    let mut msg = pack_message(&message);
    msg.source_fed = fed;
    msg.source_handle = source_handle;
    msg
}
