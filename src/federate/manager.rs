//! Per-federate manager
//!
//! Owns the federate-side view of its interfaces: the dense local endpoint
//! table, per-endpoint inbound queues, the subscription-to-endpoint links,
//! and the callbacks list. Delivery out of the core happens in
//! [`FederateManager::update_time`], which runs when a time grant becomes
//! valid. The endpoint lock is released around every callback invocation;
//! callbacks are stored as integer-indexed entries so one may replace
//! another from inside an invocation.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::CoreHandle;
use crate::error::{FedResult, FederationError};
use crate::ids::{FederateId, HandleId, LocalId};
use crate::message::Message;
use crate::time::Time;

/// Callback invoked when a message or value lands on an endpoint.
pub type EndpointCallback = Arc<Mutex<Box<dyn FnMut(LocalId, Time) + Send>>>;

struct LocalEndpoint {
    name: String,
    data_type: String,
    handle: HandleId,
    callback_index: Option<usize>,
}

#[derive(Default)]
struct EndpointTable {
    entries: Vec<LocalEndpoint>,
    by_name: HashMap<String, LocalId>,
    by_handle: HashMap<HandleId, LocalId>,
    queues: Vec<VecDeque<Message>>,
    all_callback_index: Option<usize>,
}

/// Federate-side manager over a hosting core.
pub struct FederateManager {
    core: CoreHandle,
    fed: FederateId,
    current_time: Mutex<Time>,
    endpoints: Mutex<EndpointTable>,
    /// Subscription handle to (endpoint, publication name) link.
    subscriptions: Mutex<HashMap<HandleId, (LocalId, String)>>,
    callbacks: Mutex<Vec<EndpointCallback>>,
    /// Arrival order of endpoint indices, for any-endpoint receives.
    message_order: Mutex<Vec<LocalId>>,
}

impl FederateManager {
    pub fn new(core: CoreHandle, fed: FederateId) -> Self {
        Self {
            core,
            fed,
            current_time: Mutex::new(Time::ZERO),
            endpoints: Mutex::new(EndpointTable::default()),
            subscriptions: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            message_order: Mutex::new(Vec::new()),
        }
    }

    pub fn federate_id(&self) -> FederateId {
        self.fed
    }

    pub fn current_time(&self) -> Time {
        *self.current_time.lock()
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register an endpoint and return its dense local index.
    pub async fn register_endpoint(&self, name: &str, data_type: &str) -> FedResult<LocalId> {
        let handle = self.core.register_endpoint(self.fed, name, data_type).await?;
        let mut table = self.endpoints.lock();
        let id = LocalId::new(table.entries.len() as i32);
        table.entries.push(LocalEndpoint {
            name: name.to_string(),
            data_type: data_type.to_string(),
            handle,
            callback_index: None,
        });
        table.by_name.insert(name.to_string(), id);
        table.by_handle.insert(handle, id);
        table.queues.push(VecDeque::new());
        debug!(fed = %self.fed, %name, local = %id, "endpoint registered");
        Ok(id)
    }

    /// Subscribe an endpoint to a publication; value updates arrive as
    /// synthesized messages on the endpoint's queue.
    pub async fn subscribe(&self, endpoint: LocalId, name: &str, data_type: &str) -> FedResult<()> {
        if !self.valid_endpoint(endpoint) {
            return Err(FederationError::InvalidIdentifier(endpoint.to_string()));
        }
        let handle = self
            .core
            .register_subscription(self.fed, name, data_type, "", false)
            .await?;
        self.subscriptions
            .lock()
            .insert(handle, (endpoint, name.to_string()));
        Ok(())
    }

    /// Hint the routing layer about a known communication pair.
    pub async fn register_known_communication_path(
        &self,
        local_endpoint: LocalId,
        remote_endpoint: &str,
    ) -> FedResult<()> {
        let source = self
            .endpoint_name(local_endpoint)
            .ok_or_else(|| FederationError::InvalidIdentifier(local_endpoint.to_string()))?;
        self.core
            .register_frequent_communications_pair(&source, remote_endpoint)
            .await
    }

    fn valid_endpoint(&self, id: LocalId) -> bool {
        (id.as_i32() as usize) < self.endpoints.lock().entries.len() && id.is_valid()
    }

    // ------------------------------------------------------------------
    // Queue inspection
    // ------------------------------------------------------------------

    pub fn has_message(&self) -> bool {
        self.endpoints.lock().queues.iter().any(|q| !q.is_empty())
    }

    pub fn has_message_at(&self, id: LocalId) -> bool {
        let table = self.endpoints.lock();
        table
            .queues
            .get(id.as_i32() as usize)
            .is_some_and(|q| !q.is_empty())
    }

    /// Pending receives for one endpoint.
    pub fn receive_count(&self, id: LocalId) -> usize {
        let table = self.endpoints.lock();
        table.queues.get(id.as_i32() as usize).map_or(0, VecDeque::len)
    }

    /// Pending receives across every endpoint. Prefer draining with
    /// [`FederateManager::get_message_any`] in concurrent use.
    pub fn receive_count_total(&self) -> usize {
        self.endpoints.lock().queues.iter().map(VecDeque::len).sum()
    }

    /// Pop the next message for one endpoint.
    pub fn get_message(&self, id: LocalId) -> Option<Message> {
        let mut table = self.endpoints.lock();
        let queue = table.queues.get_mut(id.as_i32() as usize)?;
        let msg = queue.pop_front()?;
        drop(table);
        self.remove_ordered_message(id);
        Some(msg)
    }

    /// Pop the oldest delivered message across all endpoints.
    pub fn get_message_any(&self) -> Option<(LocalId, Message)> {
        let id = {
            let mut order = self.message_order.lock();
            if order.is_empty() {
                return None;
            }
            order.remove(0)
        };
        let mut table = self.endpoints.lock();
        let msg = table.queues.get_mut(id.as_i32() as usize)?.pop_front()?;
        Some((id, msg))
    }

    /// Drop one arrival-order entry for `id`: the common case is the back
    /// element, anything else is found by reverse scan.
    fn remove_ordered_message(&self, id: LocalId) {
        let mut order = self.message_order.lock();
        if order.last() == Some(&id) {
            order.pop();
            return;
        }
        if let Some(pos) = order.iter().rposition(|entry| *entry == id) {
            order.remove(pos);
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send with the default timestamp (granted plus look-ahead).
    pub async fn send(&self, source: LocalId, dest: &str, data: Vec<u8>) -> FedResult<Time> {
        let handle = self
            .endpoint_handle(source)
            .ok_or_else(|| FederationError::InvalidIdentifier(source.to_string()))?;
        self.core.send(self.fed, handle, dest, data).await
    }

    /// Send with an explicit timestamp; must respect look-ahead.
    pub async fn send_at(&self, source: LocalId, dest: &str, time: Time, data: Vec<u8>) -> FedResult<Time> {
        let handle = self
            .endpoint_handle(source)
            .ok_or_else(|| FederationError::InvalidIdentifier(source.to_string()))?;
        self.core.send_event(self.fed, handle, dest, time, data).await
    }

    pub async fn send_message(&self, source: LocalId, message: Message) -> FedResult<()> {
        let handle = self
            .endpoint_handle(source)
            .ok_or_else(|| FederationError::InvalidIdentifier(source.to_string()))?;
        self.core.send_message(self.fed, handle, message).await
    }

    // ------------------------------------------------------------------
    // Time
    // ------------------------------------------------------------------

    pub async fn enter_initializing(&self) -> FedResult<()> {
        self.core.enter_initializing_state(self.fed).await
    }

    pub async fn enter_executing(&self, converged: bool) -> FedResult<bool> {
        let done = self.core.enter_executing_state(self.fed, converged).await?;
        if done {
            self.update_time(Time::ZERO);
        }
        Ok(done)
    }

    /// Block until the grant, then pull everything the grant made visible.
    pub async fn request_time(&self, time: Time) -> FedResult<Time> {
        let granted = self.core.time_request(self.fed, time).await?;
        self.update_time(granted);
        Ok(granted)
    }

    pub async fn request_time_iterative(&self, time: Time, converged: bool) -> FedResult<(Time, bool)> {
        let (granted, all_converged) = self.core.request_time_iterative(self.fed, time, converged).await?;
        self.update_time(granted);
        Ok((granted, all_converged))
    }

    pub async fn finalize(&self) -> FedResult<()> {
        self.core.finalize(self.fed).await
    }

    pub async fn error(&self, code: i32, message: &str) -> FedResult<()> {
        self.core.error(self.fed, code, message).await
    }

    /// Pull delivered messages and value updates out of the core into the
    /// per-endpoint queues, invoking callbacks with the lock released.
    pub fn update_time(&self, new_time: Time) {
        *self.current_time.lock() = new_time;

        let pending = self.core.receive_count_any(self.fed);
        let mut table = self.endpoints.lock();
        for _ in 0..pending {
            let Some((handle, msg)) = self.core.receive_any(self.fed) else {
                break;
            };
            let Some(&local) = table.by_handle.get(&handle) else {
                continue;
            };
            table.queues[local.as_i32() as usize].push_back(msg);
            self.message_order.lock().push(local);

            if let Some(callback) = self.callback_for(&table, local) {
                drop(table);
                let mut cb = callback.lock();
                (*cb)(local, new_time);
                drop(cb);
                table = self.endpoints.lock();
            }
        }
        drop(table);

        let links: Vec<(HandleId, LocalId, String)> = {
            let subs = self.subscriptions.lock();
            if subs.is_empty() {
                return;
            }
            self.core
                .get_value_updates(self.fed)
                .into_iter()
                .filter_map(|handle| {
                    subs.get(&handle)
                        .map(|(endpoint, name)| (handle, *endpoint, name.clone()))
                })
                .collect()
        };

        let mut table = self.endpoints.lock();
        for (handle, endpoint, source) in links {
            let Some(entry) = table.entries.get(endpoint.as_i32() as usize) else {
                continue;
            };
            let value = self.core.get_value(handle).unwrap_or_default();
            let msg = Message::new(source, entry.name.clone(), new_time, value);
            table.queues[endpoint.as_i32() as usize].push_back(msg);
            self.message_order.lock().push(endpoint);

            if let Some(callback) = self.callback_for(&table, endpoint) {
                drop(table);
                let mut cb = callback.lock();
                (*cb)(endpoint, new_time);
                drop(cb);
                table = self.endpoints.lock();
            }
        }
    }

    fn callback_for(&self, table: &EndpointTable, local: LocalId) -> Option<EndpointCallback> {
        let index = table
            .entries
            .get(local.as_i32() as usize)
            .and_then(|entry| entry.callback_index)
            .or(table.all_callback_index)?;
        self.callbacks.lock().get(index).cloned()
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    /// Register a callback for every endpoint; replaces any previous
    /// all-endpoints callback.
    pub fn register_callback(&self, callback: impl FnMut(LocalId, Time) + Send + 'static) {
        let wrapped: EndpointCallback = Arc::new(Mutex::new(Box::new(callback)));
        let mut table = self.endpoints.lock();
        let mut callbacks = self.callbacks.lock();
        match table.all_callback_index {
            Some(index) => callbacks[index] = wrapped,
            None => {
                table.all_callback_index = Some(callbacks.len());
                callbacks.push(wrapped);
            }
        }
    }

    /// Register a callback for one endpoint.
    pub fn register_endpoint_callback(
        &self,
        id: LocalId,
        callback: impl FnMut(LocalId, Time) + Send + 'static,
    ) -> FedResult<()> {
        let wrapped: EndpointCallback = Arc::new(Mutex::new(Box::new(callback)));
        let mut table = self.endpoints.lock();
        let Some(entry) = table.entries.get_mut(id.as_i32() as usize) else {
            return Err(FederationError::InvalidIdentifier(id.to_string()));
        };
        let mut callbacks = self.callbacks.lock();
        entry.callback_index = Some(callbacks.len());
        callbacks.push(wrapped);
        Ok(())
    }

    /// Register one callback shared by several endpoints.
    pub fn register_endpoints_callback(
        &self,
        ids: &[LocalId],
        callback: impl FnMut(LocalId, Time) + Send + 'static,
    ) {
        let wrapped: EndpointCallback = Arc::new(Mutex::new(Box::new(callback)));
        let mut table = self.endpoints.lock();
        let mut callbacks = self.callbacks.lock();
        let index = callbacks.len();
        callbacks.push(wrapped);
        for id in ids {
            if let Some(entry) = table.entries.get_mut(id.as_i32() as usize) {
                entry.callback_index = Some(index);
            }
        }
    }

    // ------------------------------------------------------------------
    // Endpoint queries
    // ------------------------------------------------------------------

    pub fn endpoint_name(&self, id: LocalId) -> Option<String> {
        let table = self.endpoints.lock();
        table.entries.get(id.as_i32() as usize).map(|e| e.name.clone())
    }

    pub fn endpoint_id(&self, name: &str) -> Option<LocalId> {
        self.endpoints.lock().by_name.get(name).copied()
    }

    pub fn endpoint_type(&self, id: LocalId) -> Option<String> {
        let table = self.endpoints.lock();
        table.entries.get(id.as_i32() as usize).map(|e| e.data_type.clone())
    }

    pub fn endpoint_handle(&self, id: LocalId) -> Option<HandleId> {
        let table = self.endpoints.lock();
        table.entries.get(id.as_i32() as usize).map(|e| e.handle)
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_ordered_message_back_and_middle() {
        let core_parts = crate::core::Core::new(crate::config::BrokerConfig {
            root: true,
            ..Default::default()
        });
        let manager = FederateManager::new(core_parts.handle(), FederateId::new(0));

        {
            let mut order = manager.message_order.lock();
            order.extend([LocalId::new(0), LocalId::new(1), LocalId::new(0), LocalId::new(2)]);
        }

        // Back element comes off in one step.
        manager.remove_ordered_message(LocalId::new(2));
        assert_eq!(
            *manager.message_order.lock(),
            vec![LocalId::new(0), LocalId::new(1), LocalId::new(0)]
        );

        // A middle entry is found by reverse scan: the *latest* matching
        // entry goes first.
        manager.remove_ordered_message(LocalId::new(0));
        assert_eq!(*manager.message_order.lock(), vec![LocalId::new(0), LocalId::new(1)]);

        // Removing something absent is a no-op.
        manager.remove_ordered_message(LocalId::new(9));
        assert_eq!(manager.message_order.lock().len(), 2);
    }
}
