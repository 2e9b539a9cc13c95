//! Federate-facing core handle
//!
//! Cloneable client of the core router. Phase- and state-changing calls
//! travel through the command queue and suspend on their reply channel;
//! read-only calls (receive variants, value reads, name lookups) touch the
//! shared registries directly and never block behind payload traffic.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::{FedResult, FederationError};
use crate::handles::HandleKind;
use crate::ids::{FederateId, HandleId};
use crate::message::Message;
use crate::time::Time;

use super::federate::FederateInfo;
use super::node::CoreShared;
use super::requests::{CoreMetrics, CoreRequest, FederateSnapshot, FilterOperator, TimeParam};

/// Handle federates use to talk to their hosting core.
#[derive(Clone)]
pub struct CoreHandle {
    requests: mpsc::Sender<CoreRequest>,
    shared: Arc<CoreShared>,
}

impl CoreHandle {
    pub(super) fn new(requests: mpsc::Sender<CoreRequest>, shared: Arc<CoreShared>) -> Self {
        Self { requests, shared }
    }

    async fn roundtrip<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<FedResult<T>>) -> CoreRequest,
    ) -> FedResult<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| FederationError::ChannelClosed)?;
        rx.await.map_err(|_| FederationError::ChannelClosed)?
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    pub async fn register_federate(&self, name: &str, info: FederateInfo) -> FedResult<FederateId> {
        let name = name.to_string();
        self.roundtrip(|reply| CoreRequest::RegisterFederate { name, info, reply })
            .await
    }

    async fn register_handle(
        &self,
        fed: FederateId,
        kind: HandleKind,
        name: &str,
        data_type: &str,
        units: &str,
        target: &str,
        required: bool,
    ) -> FedResult<HandleId> {
        let (name, data_type, units, target) = (
            name.to_string(),
            data_type.to_string(),
            units.to_string(),
            target.to_string(),
        );
        self.roundtrip(|reply| CoreRequest::RegisterHandle {
            fed,
            kind,
            name,
            data_type,
            units,
            target,
            required,
            reply,
        })
        .await
    }

    pub async fn register_endpoint(&self, fed: FederateId, name: &str, data_type: &str) -> FedResult<HandleId> {
        self.register_handle(fed, HandleKind::Endpoint, name, data_type, "", "", false)
            .await
    }

    pub async fn register_publication(
        &self,
        fed: FederateId,
        name: &str,
        data_type: &str,
        units: &str,
    ) -> FedResult<HandleId> {
        self.register_handle(fed, HandleKind::Publication, name, data_type, units, "", false)
            .await
    }

    pub async fn register_subscription(
        &self,
        fed: FederateId,
        name: &str,
        data_type: &str,
        units: &str,
        required: bool,
    ) -> FedResult<HandleId> {
        self.register_handle(fed, HandleKind::Subscription, name, data_type, units, "", required)
            .await
    }

    pub async fn register_source_filter(
        &self,
        fed: FederateId,
        name: &str,
        target: &str,
        data_type: &str,
    ) -> FedResult<HandleId> {
        self.register_handle(fed, HandleKind::SourceFilter, name, data_type, "", target, false)
            .await
    }

    pub async fn register_destination_filter(
        &self,
        fed: FederateId,
        name: &str,
        target: &str,
        data_type: &str,
    ) -> FedResult<HandleId> {
        self.register_handle(fed, HandleKind::DestinationFilter, name, data_type, "", target, false)
            .await
    }

    // ------------------------------------------------------------------
    // Lookups (shared-state reads)
    // ------------------------------------------------------------------

    pub fn get_publication(&self, name: &str) -> Option<HandleId> {
        self.shared
            .registry
            .read(|reg| reg.lookup_by_name(HandleKind::Publication, name))
    }

    /// The subscription `fed` holds against the named publication.
    pub fn get_subscription(&self, fed: FederateId, name: &str) -> Option<HandleId> {
        self.shared.registry.read(|reg| {
            reg.subscribers_of(name)
                .iter()
                .copied()
                .find(|id| reg.lookup_by_handle(*id).is_some_and(|info| info.fed == fed))
        })
    }

    pub fn get_endpoint_id(&self, name: &str) -> Option<HandleId> {
        self.shared
            .registry
            .read(|reg| reg.lookup_by_name(HandleKind::Endpoint, name))
    }

    pub fn get_endpoint_name(&self, handle: HandleId) -> Option<String> {
        self.shared.registry.read(|reg| {
            reg.lookup_by_handle(handle)
                .filter(|info| info.kind == HandleKind::Endpoint)
                .map(|info| info.name.clone())
        })
    }

    pub fn get_type(&self, handle: HandleId) -> Option<String> {
        self.shared
            .registry
            .read(|reg| reg.lookup_by_handle(handle).map(|info| info.data_type.clone()))
    }

    pub fn get_units(&self, handle: HandleId) -> Option<String> {
        self.shared
            .registry
            .read(|reg| reg.lookup_by_handle(handle).map(|info| info.units.clone()))
    }

    pub fn get_federate_name(&self, fed: FederateId) -> Option<String> {
        self.shared.feds.read(|feds| feds.get(&fed).map(|shared| shared.name.clone()))
    }

    pub fn get_federate_id(&self, name: &str) -> Option<FederateId> {
        self.shared.feds.read(|feds| {
            feds.iter()
                .find(|(_, shared)| shared.name == name)
                .map(|(id, _)| *id)
        })
    }

    // ------------------------------------------------------------------
    // Values
    // ------------------------------------------------------------------

    pub async fn set_value(&self, fed: FederateId, handle: HandleId, data: Vec<u8>) -> FedResult<()> {
        self.roundtrip(|reply| CoreRequest::SetValue { fed, handle, data, reply })
            .await
    }

    /// The latest value seen for a publication or subscription handle.
    pub fn get_value(&self, handle: HandleId) -> Option<Vec<u8>> {
        self.shared.values.read(|values| values.get(&handle).cloned())
    }

    /// Drain the list of subscription handles updated since the last call.
    pub fn get_value_updates(&self, fed: FederateId) -> Vec<HandleId> {
        self.shared
            .feds
            .read(|feds| feds.get(&fed).map(|shared| std::mem::take(&mut *shared.pending_updates.lock())))
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Send with the default timestamp (granted time plus look-ahead).
    /// Replies with the stamped time.
    pub async fn send(
        &self,
        fed: FederateId,
        source_handle: HandleId,
        dest: &str,
        data: Vec<u8>,
    ) -> FedResult<Time> {
        let dest = dest.to_string();
        self.roundtrip(|reply| CoreRequest::Send {
            fed,
            source_handle,
            dest,
            time: None,
            data,
            reply,
        })
        .await
    }

    /// Send with an explicit timestamp; must respect look-ahead.
    pub async fn send_event(
        &self,
        fed: FederateId,
        source_handle: HandleId,
        dest: &str,
        time: Time,
        data: Vec<u8>,
    ) -> FedResult<Time> {
        let dest = dest.to_string();
        self.roundtrip(|reply| CoreRequest::Send {
            fed,
            source_handle,
            dest,
            time: Some(time),
            data,
            reply,
        })
        .await
    }

    pub async fn send_message(
        &self,
        fed: FederateId,
        source_handle: HandleId,
        message: Message,
    ) -> FedResult<()> {
        self.roundtrip(|reply| CoreRequest::SendMessage {
            fed,
            source_handle,
            message,
            reply,
        })
        .await
    }

    /// Pop the next delivered message for one endpoint handle.
    pub fn receive(&self, handle: HandleId) -> Option<Message> {
        let (fed, _) = self.shared.registry.read(|reg| reg.global_to_local(handle))?;
        self.shared.feds.read(|feds| {
            let shared = feds.get(&fed)?;
            let mut inbox = shared.inbox.lock();
            let index = inbox.iter().position(|(dest, _)| *dest == handle)?;
            inbox.remove(index).map(|(_, msg)| msg)
        })
    }

    /// Pop the next delivered message for any of the federate's endpoints.
    pub fn receive_any(&self, fed: FederateId) -> Option<(HandleId, Message)> {
        self.shared
            .feds
            .read(|feds| feds.get(&fed).and_then(|shared| shared.inbox.lock().pop_front()))
    }

    pub fn receive_count(&self, handle: HandleId) -> usize {
        let Some((fed, _)) = self.shared.registry.read(|reg| reg.global_to_local(handle)) else {
            return 0;
        };
        self.shared.feds.read(|feds| {
            feds.get(&fed)
                .map(|shared| shared.inbox.lock().iter().filter(|(dest, _)| *dest == handle).count())
                .unwrap_or(0)
        })
    }

    pub fn receive_count_any(&self, fed: FederateId) -> usize {
        self.shared
            .feds
            .read(|feds| feds.get(&fed).map(|shared| shared.inbox.lock().len()).unwrap_or(0))
    }

    pub fn receive_filter_count(&self, fed: FederateId) -> usize {
        self.shared
            .feds
            .read(|feds| feds.get(&fed).map(|shared| shared.filter_inbox.lock().len()).unwrap_or(0))
    }

    pub fn receive_any_filter(&self, fed: FederateId) -> Option<(HandleId, Message)> {
        self.shared
            .feds
            .read(|feds| feds.get(&fed).and_then(|shared| shared.filter_inbox.lock().pop_front()))
    }

    /// Pop the next message captured by one specific filter.
    pub fn receive_filter(&self, filter: HandleId) -> Option<Message> {
        let (fed, _) = self.shared.registry.read(|reg| reg.global_to_local(filter))?;
        self.shared.feds.read(|feds| {
            let shared = feds.get(&fed)?;
            let mut inbox = shared.filter_inbox.lock();
            let index = inbox.iter().position(|(id, _)| *id == filter)?;
            inbox.remove(index).map(|(_, msg)| msg)
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle and time
    // ------------------------------------------------------------------

    pub async fn enter_initializing_state(&self, fed: FederateId) -> FedResult<()> {
        self.roundtrip(|reply| CoreRequest::EnterInitializing { fed, reply }).await
    }

    /// Returns true once the whole federation agrees to start executing.
    pub async fn enter_executing_state(&self, fed: FederateId, converged: bool) -> FedResult<bool> {
        self.roundtrip(|reply| CoreRequest::EnterExecuting { fed, converged, reply })
            .await
    }

    /// Suspends until no earlier-timestamped work can still arrive.
    pub async fn time_request(&self, fed: FederateId, time: Time) -> FedResult<Time> {
        self.roundtrip(|reply| CoreRequest::TimeRequest { fed, time, reply }).await
    }

    pub async fn request_time_iterative(
        &self,
        fed: FederateId,
        time: Time,
        converged: bool,
    ) -> FedResult<(Time, bool)> {
        self.roundtrip(|reply| CoreRequest::TimeRequestIterative {
            fed,
            time,
            converged,
            reply,
        })
        .await
    }

    pub async fn get_current_iteration(&self, fed: FederateId) -> FedResult<u64> {
        Ok(self.query_federate(fed).await?.iteration)
    }

    pub async fn query_federate(&self, fed: FederateId) -> FedResult<FederateSnapshot> {
        self.roundtrip(|reply| CoreRequest::QueryFederate { fed, reply }).await
    }

    pub async fn set_time_delta(&self, fed: FederateId, value: Time) -> FedResult<()> {
        self.roundtrip(|reply| CoreRequest::SetTimeParam {
            fed,
            param: TimeParam::Delta(value),
            reply,
        })
        .await
    }

    pub async fn set_look_ahead(&self, fed: FederateId, value: Time) -> FedResult<()> {
        self.roundtrip(|reply| CoreRequest::SetTimeParam {
            fed,
            param: TimeParam::LookAhead(value),
            reply,
        })
        .await
    }

    pub async fn set_impact_window(&self, fed: FederateId, value: Time) -> FedResult<()> {
        self.roundtrip(|reply| CoreRequest::SetTimeParam {
            fed,
            param: TimeParam::ImpactWindow(value),
            reply,
        })
        .await
    }

    pub async fn set_maximum_iterations(&self, fed: FederateId, value: u64) -> FedResult<()> {
        self.roundtrip(|reply| CoreRequest::SetTimeParam {
            fed,
            param: TimeParam::MaxIterations(value),
            reply,
        })
        .await
    }

    pub async fn add_dependency(&self, fed: FederateId, name: &str) -> FedResult<()> {
        let name = name.to_string();
        self.roundtrip(|reply| CoreRequest::AddDependency { fed, name, reply }).await
    }

    pub async fn set_filter_operator(&self, filter: HandleId, operator: FilterOperator) -> FedResult<()> {
        self.roundtrip(|reply| CoreRequest::SetFilterOperator { filter, operator, reply })
            .await
    }

    pub async fn register_frequent_communications_pair(&self, source: &str, dest: &str) -> FedResult<()> {
        let (source, dest) = (source.to_string(), dest.to_string());
        self.roundtrip(|reply| CoreRequest::RegisterCommPair { source, dest, reply })
            .await
    }

    /// Idempotent: a second call on the same federate is a no-op.
    pub async fn finalize(&self, fed: FederateId) -> FedResult<()> {
        self.roundtrip(|reply| CoreRequest::Finalize { fed, reply }).await
    }

    pub async fn error(&self, fed: FederateId, code: i32, message: &str) -> FedResult<()> {
        let message = message.to_string();
        self.roundtrip(|reply| CoreRequest::ErrorReport { fed, code, message, reply })
            .await
    }

    pub async fn log_message(&self, fed: FederateId, level: i32, message: &str) -> FedResult<()> {
        self.requests
            .send(CoreRequest::LogMessage {
                fed,
                level,
                message: message.to_string(),
            })
            .await
            .map_err(|_| FederationError::ChannelClosed)
    }

    pub async fn metrics(&self) -> FedResult<CoreMetrics> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(CoreRequest::GetMetrics { reply: tx })
            .await
            .map_err(|_| FederationError::ChannelClosed)?;
        rx.await.map_err(|_| FederationError::ChannelClosed)
    }
}
