//! Broker router
//!
//! A broker is a routing node in the federation tree: it registers child
//! brokers and the federates beneath them, assigns global identifiers when
//! it is the root, forwards what it cannot answer toward the root, and
//! aggregates init, time, and disconnect rounds across its children.
//!
//! The router is a single consumer over two ordered queues; the priority
//! queue (registration, identifier negotiation, init, disconnect) is
//! drained completely before one main-queue entry is processed.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::{FedResult, FederationError};
use crate::handles::{HandleKind, HandleRegistry};
use crate::ids::{FederateId, RouteId};
use crate::message::{
    unpack_message, Action, ActionMessage, HandleSpec, FLAG_CONVERGED, FLAG_EXEC, FLAG_ITERATIVE,
    FLAG_REQUIRED,
};
use crate::time::Time;
use crate::transport::Transport;

use super::handle::{BrokerControl, BrokerHandle, BrokerMetrics};

const QUEUE_DEPTH: usize = 256;

/// What a pending name, forwarded upward, is waiting to become.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PendingKind {
    Federate,
    Broker,
}

/// Record of one directly attached child broker or core.
#[derive(Debug)]
struct ChildEntry {
    name: String,
    global_id: i32,
    route: RouteId,
    init_requested: bool,
    finalized: bool,
    /// Latest reported (floor, flags) and whether it arrived since the
    /// last broadcast.
    floor: Option<(Time, u32)>,
    fresh: bool,
}

enum BrokerEvent {
    Control(BrokerControl),
    Action(ActionMessage),
}

/// A routing node of the federation tree.
pub struct Broker {
    identifier: String,
    config: BrokerConfig,
    is_root: bool,
    global_id: i32,
    transport: Option<Box<dyn Transport>>,

    control_tx: mpsc::Sender<BrokerControl>,
    control_rx: mpsc::Receiver<BrokerControl>,
    actions_tx: mpsc::Sender<ActionMessage>,
    actions_rx: mpsc::Receiver<ActionMessage>,

    priority: VecDeque<BrokerEvent>,
    main: VecDeque<BrokerEvent>,

    children: Vec<ChildEntry>,
    child_names: HashMap<String, usize>,
    child_ids: HashMap<i32, usize>,
    routing_table: HashMap<FederateId, RouteId>,
    fed_names: HashMap<String, FederateId>,
    registry: HandleRegistry,
    /// Names forwarded upward, and the route their reply goes back down.
    pending_names: HashMap<(PendingKind, String), RouteId>,

    next_fed: i32,
    next_broker: i32,
    next_route: i32,

    connected: bool,
    init_sent: bool,
    init_granted: bool,
    disconnect_forwarded: bool,
    children_finalized: usize,

    hints: HashMap<String, String>,
    deferred: Vec<ActionMessage>,
    messages_routed: u64,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let identifier = config
            .name
            .clone()
            .unwrap_or_else(|| format!("broker-{}", Uuid::new_v4()));
        let (control_tx, control_rx) = mpsc::channel(QUEUE_DEPTH);
        let (actions_tx, actions_rx) = mpsc::channel(QUEUE_DEPTH);
        let is_root = config.root;
        Self {
            identifier,
            config,
            is_root,
            global_id: if is_root { 0 } else { -1 },
            transport: None,
            control_tx,
            control_rx,
            actions_tx,
            actions_rx,
            priority: VecDeque::new(),
            main: VecDeque::new(),
            children: Vec::new(),
            child_names: HashMap::new(),
            child_ids: HashMap::new(),
            routing_table: HashMap::new(),
            fed_names: HashMap::new(),
            registry: HandleRegistry::new(),
            pending_names: HashMap::new(),
            next_fed: 0,
            next_broker: 1,
            next_route: 1,
            connected: is_root,
            init_sent: false,
            init_granted: false,
            disconnect_forwarded: false,
            children_finalized: 0,
            hints: HashMap::new(),
            deferred: Vec::new(),
            messages_routed: 0,
        }
    }

    /// Build a broker directly from an initialization string.
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

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle::new(self.control_tx.clone(), self.actions_tx.clone())
    }

    /// True once every child has signalled init-request and the minimum
    /// counts are met.
    pub fn is_init_ready(&self) -> bool {
        self.children.len() >= self.config.min_brokers as usize
            && self.fed_names.len() >= self.config.min_federates as usize
            && self.children.iter().all(|child| child.init_requested)
    }

    pub async fn run(mut self) {
        if !self.is_root {
            if let Err(err) = self.connect_parent().await {
                error!(identifier = %self.identifier, %err, "parent connection failed");
                return;
            }
        }
        info!(identifier = %self.identifier, root = self.is_root, "broker started");

        loop {
            while let Ok(ctl) = self.control_rx.try_recv() {
                self.priority.push_back(BrokerEvent::Control(ctl));
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
                ctl = self.control_rx.recv() => match ctl {
                    Some(ctl) => self.priority.push_back(BrokerEvent::Control(ctl)),
                    None => break,
                },
                msg = self.actions_rx.recv() => match msg {
                    Some(msg) => self.enqueue_action(msg),
                    None => break,
                },
            }
        }
        info!(identifier = %self.identifier, "broker stopped");
    }

    fn enqueue_action(&mut self, msg: ActionMessage) {
        if msg.action.is_priority() {
            self.priority.push_back(BrokerEvent::Action(msg));
        } else {
            self.main.push_back(BrokerEvent::Action(msg));
        }
    }

    async fn dispatch(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Control(BrokerControl::GetMetrics { reply }) => {
                let metrics = BrokerMetrics {
                    federates: self.fed_names.len(),
                    brokers: self.children.len(),
                    children_finalized: self.children_finalized,
                    handles: self.registry.len(),
                    messages_routed: self.messages_routed,
                    init_ready: self.is_init_ready(),
                    init_granted: self.init_granted,
                };
                let _ = reply.send(metrics);
            }
            BrokerEvent::Action(msg) => self.process_command(msg).await,
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
        self.transmit(RouteId::PARENT, reg).await;
        Ok(())
    }

    async fn transmit(&mut self, route: RouteId, msg: ActionMessage) {
        let Some(transport) = self.transport.as_ref() else {
            error!(identifier = %self.identifier, "no transport attached");
            return;
        };
        if let Err(err) = transport.transmit(route, msg).await {
            error!(identifier = %self.identifier, %route, %err, "transmit failed");
        }
    }

    /// Route toward a federate: the local table first, the parent on miss.
    fn get_route(&self, fed: FederateId) -> Option<RouteId> {
        match self.routing_table.get(&fed) {
            Some(route) => Some(*route),
            None if !self.is_root => Some(RouteId::PARENT),
            None => None,
        }
    }

    async fn broadcast(&mut self, msg: ActionMessage) {
        let routes: Vec<RouteId> = self
            .children
            .iter()
            .filter(|child| !child.finalized)
            .map(|child| child.route)
            .collect();
        for route in routes {
            self.transmit(route, msg.clone()).await;
        }
    }

    async fn process_command(&mut self, msg: ActionMessage) {
        match msg.action {
            Action::RegisterBroker => self.register_broker(msg).await,
            Action::BrokerAck => self.broker_ack(msg).await,
            Action::RegisterFederate => self.register_federate(msg).await,
            Action::FederateAck => self.federate_ack(msg).await,
            Action::RegisterPublication
            | Action::RegisterSubscription
            | Action::RegisterEndpoint
            | Action::RegisterSourceFilter
            | Action::RegisterDestinationFilter => self.register_handle(msg).await,
            Action::HandleAck => self.handle_ack(msg).await,
            Action::InitRequest => self.init_request(msg).await,
            Action::InitGrant => {
                self.init_granted = true;
                self.broadcast(msg).await;
            }
            Action::Disconnect => self.disconnect(msg).await,
            Action::NextTime => self.next_time(msg).await,
            Action::TimeGrant => {
                self.note_freeze(&msg);
                self.broadcast(msg).await;
            }
            Action::Message => self.route_payload(msg).await,
            Action::ValueUpdate => self.route_value(msg).await,
            Action::RouteHint => self.route_hint(msg).await,
            Action::Error => self.route_error(msg).await,
            Action::Log => {
                // Logs bubble to the root where operators watch them.
                if !self.is_root {
                    self.transmit(RouteId::PARENT, msg).await;
                }
            }
            other => {
                warn!(identifier = %self.identifier, action = ?other, "unexpected action at broker");
            }
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    async fn register_broker(&mut self, msg: ActionMessage) {
        let name = msg.payload.clone();
        let address = String::from_utf8(msg.data.clone()).unwrap_or_default();

        let route = RouteId::new(self.next_route);
        self.next_route += 1;
        if let Some(transport) = self.transport.as_mut() {
            if let Err(err) = transport.add_route(route, &address).await {
                error!(identifier = %self.identifier, %name, %err, "child route failed");
                return;
            }
        }

        if self.registry.is_operating() {
            let mut err = ActionMessage::new(Action::Error);
            err.payload = name;
            err.flags = FederationError::Frozen.code();
            self.transmit(route, err).await;
            return;
        }
        if self.child_names.contains_key(&name) {
            let mut err = ActionMessage::new(Action::Error);
            err.payload = name.clone();
            err.flags = FederationError::NameInUse(name).code();
            self.transmit(route, err).await;
            return;
        }

        let index = self.children.len();
        self.children.push(ChildEntry {
            name: name.clone(),
            global_id: -1,
            route,
            init_requested: false,
            finalized: false,
            floor: None,
            fresh: false,
        });
        self.child_names.insert(name.clone(), index);
        debug!(identifier = %self.identifier, %name, %route, "child attached");

        if self.is_root {
            let id = self.next_broker;
            self.next_broker += 1;
            self.children[index].global_id = id;
            self.child_ids.insert(id, index);

            let mut ack = ActionMessage::new(Action::BrokerAck);
            ack.dest_fed = FederateId::new(id);
            ack.payload = name;
            self.transmit(route, ack).await;
        } else {
            self.pending_names.insert((PendingKind::Broker, name.clone()), route);
            let mut fwd = ActionMessage::new(Action::RegisterBroker);
            fwd.payload = name;
            self.transmit(RouteId::PARENT, fwd).await;
        }
    }

    async fn broker_ack(&mut self, msg: ActionMessage) {
        if msg.payload == self.identifier {
            self.global_id = msg.dest_fed.as_i32();
            self.connected = true;
            debug!(identifier = %self.identifier, broker_id = self.global_id, "broker id assigned");
            return;
        }
        let Some(route) = self.pending_names.remove(&(PendingKind::Broker, msg.payload.clone())) else {
            warn!(identifier = %self.identifier, name = %msg.payload, "unexpected broker ack");
            return;
        };
        if let Some(index) = self.child_names.get(&msg.payload).copied() {
            self.children[index].global_id = msg.dest_fed.as_i32();
            self.child_ids.insert(msg.dest_fed.as_i32(), index);
        }
        self.transmit(route, msg).await;
    }

    async fn register_federate(&mut self, msg: ActionMessage) {
        let name = msg.payload.clone();
        let Some(route) = self.child_route(msg.source_fed.as_i32()) else {
            warn!(identifier = %self.identifier, %name, "federate registration from unknown child");
            return;
        };

        if self.registry.is_operating() {
            self.send_error_down(route, &name, &FederationError::Frozen).await;
            return;
        }
        if self.fed_names.contains_key(&name) {
            self.send_error_down(route, &name, &FederationError::NameInUse(name.clone()))
                .await;
            return;
        }

        if self.is_root {
            let id = FederateId::new(self.next_fed);
            self.next_fed += 1;
            self.fed_names.insert(name.clone(), id);
            self.routing_table.insert(id, route);

            let mut ack = ActionMessage::new(Action::FederateAck);
            ack.dest_fed = id;
            ack.payload = name.clone();
            debug!(identifier = %self.identifier, %name, fed = %id, "federate registered");
            self.transmit(route, ack).await;
        } else {
            self.pending_names.insert((PendingKind::Federate, name.clone()), route);
            let mut fwd = ActionMessage::new(Action::RegisterFederate);
            fwd.payload = name;
            fwd.source_fed = FederateId::new(self.global_id);
            self.transmit(RouteId::PARENT, fwd).await;
        }
    }

    async fn federate_ack(&mut self, msg: ActionMessage) {
        let Some(route) = self.pending_names.remove(&(PendingKind::Federate, msg.payload.clone())) else {
            warn!(identifier = %self.identifier, name = %msg.payload, "unexpected federate ack");
            return;
        };
        self.fed_names.insert(msg.payload.clone(), msg.dest_fed);
        self.routing_table.insert(msg.dest_fed, route);
        self.transmit(route, msg).await;
    }

    async fn register_handle(&mut self, msg: ActionMessage) {
        let kind = match msg.action {
            Action::RegisterPublication => HandleKind::Publication,
            Action::RegisterSubscription => HandleKind::Subscription,
            Action::RegisterEndpoint => HandleKind::Endpoint,
            Action::RegisterSourceFilter => HandleKind::SourceFilter,
            Action::RegisterDestinationFilter => HandleKind::DestinationFilter,
            _ => unreachable!("register_handle called for handle registrations"),
        };
        let fed = msg.source_fed;
        let name = msg.payload.clone();

        if !self.is_root {
            self.transmit(RouteId::PARENT, msg).await;
            return;
        }

        let Some(route) = self.get_route(fed) else {
            warn!(identifier = %self.identifier, %name, fed = %fed, "handle registration for unknown federate");
            return;
        };
        let spec = HandleSpec::from_bytes(&msg.data).unwrap_or(HandleSpec {
            kind,
            data_type: String::new(),
            units: String::new(),
            target: String::new(),
        });

        let inserted = {
            let id = match self.registry.check_name(kind, &name, fed) {
                Ok(()) => self.registry.allocate_id(),
                Err(err) => {
                    self.send_error_to_fed(fed, &name, &err).await;
                    return;
                }
            };
            self.registry
                .insert(
                    id,
                    fed,
                    kind,
                    &name,
                    &spec.data_type,
                    &spec.units,
                    &spec.target,
                    msg.has_flag(FLAG_REQUIRED),
                )
                .map(|_| id)
        };

        match inserted {
            Ok(id) => {
                let mut ack = ActionMessage::new(Action::HandleAck);
                ack.dest_fed = fed;
                ack.dest_handle = id;
                ack.payload = name;
                ack.flags = msg.flags;
                ack.data = spec.to_bytes();
                debug!(identifier = %self.identifier, name = %ack.payload, handle = %id, "handle registered");
                self.transmit(route, ack).await;
                self.retry_deferred();
            }
            Err(err) => {
                self.send_error_to_fed(fed, &name, &err).await;
            }
        }
    }

    async fn handle_ack(&mut self, msg: ActionMessage) {
        // Record the handle at this level so payload routing can resolve
        // names without climbing to the root.
        if let Some(spec) = HandleSpec::from_bytes(&msg.data) {
            let _ = self.registry.insert(
                msg.dest_handle,
                msg.dest_fed,
                spec.kind,
                &msg.payload,
                &spec.data_type,
                &spec.units,
                &spec.target,
                msg.has_flag(FLAG_REQUIRED),
            );
        }
        if let Some(route) = self.get_route(msg.dest_fed) {
            self.transmit(route, msg).await;
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle rounds
    // ------------------------------------------------------------------

    async fn init_request(&mut self, msg: ActionMessage) {
        if let Some(index) = self.child_index(msg.source_fed.as_i32()) {
            self.children[index].init_requested = true;
            debug!(identifier = %self.identifier, child = %self.children[index].name, "child init-ready");
        }
        if !self.is_init_ready() || self.init_granted {
            return;
        }
        if self.is_root {
            self.init_granted = true;
            info!(identifier = %self.identifier, "federation initialization granted");
            self.broadcast(ActionMessage::new(Action::InitGrant)).await;
        } else if !self.init_sent && self.connected {
            self.init_sent = true;
            let mut fwd = ActionMessage::new(Action::InitRequest);
            fwd.source_fed = FederateId::new(self.global_id);
            self.transmit(RouteId::PARENT, fwd).await;
        }
    }

    async fn disconnect(&mut self, msg: ActionMessage) {
        if let Some(index) = self.child_index(msg.source_fed.as_i32()) {
            if !self.children[index].finalized {
                self.children[index].finalized = true;
                self.children_finalized += 1;
                debug!(identifier = %self.identifier, child = %self.children[index].name, "child finalized");
            }
        }
        if self.children_finalized < self.children.len() || self.disconnect_forwarded {
            return;
        }
        self.disconnect_forwarded = true;
        if self.is_root {
            info!(identifier = %self.identifier, "federation finalized");
        } else {
            let mut fwd = ActionMessage::new(Action::Disconnect);
            fwd.source_fed = FederateId::new(self.global_id);
            self.transmit(RouteId::PARENT, fwd).await;
        }
    }

    // ------------------------------------------------------------------
    // Time rounds
    // ------------------------------------------------------------------

    async fn next_time(&mut self, msg: ActionMessage) {
        let Some(index) = self.child_index(msg.source_fed.as_i32()) else {
            warn!(identifier = %self.identifier, "time report from unknown child");
            return;
        };
        self.children[index].floor = Some((msg.time, msg.flags));
        self.children[index].fresh = true;

        let active: Vec<&ChildEntry> = self.children.iter().filter(|child| !child.finalized).collect();
        if active.is_empty() || !active.iter().all(|child| child.fresh && child.floor.is_some()) {
            return;
        }

        let mut floor = Time::MAX;
        let mut converged = true;
        let mut iterative = false;
        let mut exec = true;
        for child in &active {
            let (time, flags) = child.floor.expect("fresh child has a floor");
            floor = floor.min(time);
            converged &= flags & FLAG_CONVERGED != 0;
            iterative |= flags & FLAG_ITERATIVE != 0;
            exec &= flags & FLAG_EXEC != 0;
        }
        let mut flags = 0;
        if converged {
            flags |= FLAG_CONVERGED;
        }
        if iterative {
            flags |= FLAG_ITERATIVE;
        }
        if exec {
            flags |= FLAG_EXEC;
        }

        for child in self.children.iter_mut() {
            child.fresh = false;
        }

        if self.is_root {
            let mut grant = ActionMessage::new(Action::TimeGrant);
            grant.time = floor;
            grant.flags = flags;
            debug!(identifier = %self.identifier, %floor, flags, "time grant broadcast");
            self.note_freeze(&grant);
            self.broadcast(grant).await;
        } else {
            // Re-report every completed round, even at an unchanged floor,
            // so the parent sees the round as fresh.
            let mut fwd = ActionMessage::new(Action::NextTime);
            fwd.source_fed = FederateId::new(self.global_id);
            fwd.time = floor;
            fwd.flags = flags;
            self.transmit(RouteId::PARENT, fwd).await;
        }
    }

    /// The registries freeze when the executing transition commits.
    fn note_freeze(&mut self, grant: &ActionMessage) {
        if grant.has_flag(FLAG_EXEC) && grant.has_flag(FLAG_CONVERGED) && !self.registry.is_operating() {
            self.registry.freeze();
            info!(identifier = %self.identifier, "registries frozen");
        }
    }

    // ------------------------------------------------------------------
    // Payload routing
    // ------------------------------------------------------------------

    async fn route_payload(&mut self, mut msg: ActionMessage) {
        self.messages_routed += 1;

        if !msg.dest_fed.is_valid() {
            // A gateway never resolves names locally; unresolved payload
            // climbs to the root.
            if self.config.gateway && !self.is_root {
                self.transmit(RouteId::PARENT, msg).await;
                return;
            }
            let Some(message) = unpack_message(&msg) else {
                warn!(identifier = %self.identifier, "malformed message envelope");
                return;
            };
            let resolved = self
                .registry
                .lookup_by_name(HandleKind::Endpoint, &message.dest)
                .and_then(|id| self.registry.lookup_by_handle(id))
                .map(|info| (info.fed, info.id));
            if let Some((fed, handle)) = resolved {
                msg.dest_fed = fed;
                msg.dest_handle = handle;
            } else if self.is_root {
                if self.hints.contains_key(&message.dest) {
                    debug!(identifier = %self.identifier, dest = %message.dest, "deferring hinted message");
                    self.deferred.push(msg);
                } else {
                    warn!(identifier = %self.identifier, dest = %message.dest, "unknown destination");
                    let err = FederationError::UnknownDestination(message.dest.clone());
                    let source = msg.source_fed;
                    self.send_error_to_fed(source, &message.dest, &err).await;
                }
                return;
            } else {
                self.transmit(RouteId::PARENT, msg).await;
                return;
            }
        }

        match self.get_route(msg.dest_fed) {
            Some(route) => self.transmit(route, msg).await,
            None => {
                warn!(identifier = %self.identifier, fed = %msg.dest_fed, "no route to federate");
            }
        }
    }

    async fn route_value(&mut self, msg: ActionMessage) {
        if msg.dest_handle.is_valid() {
            // Already directed at a subscription; route by owner.
            if let Some(route) = self.get_route(msg.dest_fed) {
                self.transmit(route, msg).await;
            }
            return;
        }
        if !self.is_root {
            self.transmit(RouteId::PARENT, msg).await;
            return;
        }
        let subscribers: Vec<(FederateId, crate::ids::HandleId)> = self
            .registry
            .subscribers_of(&msg.payload)
            .iter()
            .filter_map(|id| self.registry.lookup_by_handle(*id).map(|info| (info.fed, info.id)))
            .collect();
        for (owner, sub) in subscribers {
            let mut update = ActionMessage::new(Action::ValueUpdate);
            update.dest_fed = owner;
            update.dest_handle = sub;
            update.payload = msg.payload.clone();
            update.data = msg.data.clone();
            if let Some(route) = self.get_route(owner) {
                self.transmit(route, update).await;
            }
        }
    }

    async fn route_hint(&mut self, msg: ActionMessage) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&msg.payload) {
            if let (Some(source), Some(dest)) = (value["source"].as_str(), value["dest"].as_str()) {
                self.hints.insert(dest.to_string(), source.to_string());
            }
        }
        if !self.is_root {
            self.transmit(RouteId::PARENT, msg).await;
        }
    }

    async fn route_error(&mut self, msg: ActionMessage) {
        if msg.dest_fed.is_valid() {
            if let Some(route) = self
                .pending_names
                .remove(&(PendingKind::Federate, msg.payload.clone()))
                .or_else(|| self.get_route(msg.dest_fed))
            {
                self.transmit(route, msg).await;
            }
        } else if self.is_root {
            // Federation-fatal: everyone hears about it.
            error!(identifier = %self.identifier, detail = %msg.payload, "federation error broadcast");
            self.broadcast(msg).await;
        } else {
            self.transmit(RouteId::PARENT, msg).await;
        }
    }

    /// Root: re-queue messages deferred on a communications hint.
    fn retry_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let (ready, still): (Vec<_>, Vec<_>) = self.deferred.drain(..).partition(|msg| {
            unpack_message(msg).is_some_and(|m| {
                self.registry.lookup_by_name(HandleKind::Endpoint, &m.dest).is_some()
            })
        });
        self.deferred = still;
        for msg in ready {
            self.main.push_back(BrokerEvent::Action(msg));
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn child_index(&self, broker_id: i32) -> Option<usize> {
        self.child_ids.get(&broker_id).copied()
    }

    fn child_route(&self, broker_id: i32) -> Option<RouteId> {
        self.child_index(broker_id).map(|index| self.children[index].route)
    }

    /// Directed registration failure for a federate that has no global id
    /// yet; the receiving core matches it to its pending entry by name.
    async fn send_error_down(&mut self, route: RouteId, name: &str, err: &FederationError) {
        let mut msg = ActionMessage::new(Action::Error);
        msg.dest_fed = FederateId::new(i32::MAX);
        msg.payload = name.to_string();
        msg.flags = err.code();
        self.transmit(route, msg).await;
    }

    async fn send_error_to_fed(&mut self, fed: FederateId, name: &str, err: &FederationError) {
        let Some(route) = self.get_route(fed) else {
            warn!(identifier = %self.identifier, %fed, %err, "cannot route error to federate");
            return;
        };
        let mut msg = ActionMessage::new(Action::Error);
        msg.dest_fed = fed;
        msg.payload = name.to_string();
        msg.flags = err.code();
        self.transmit(route, msg).await;
    }
}
