//! Handle and name registry
//!
//! Lookup structures mapping names to global handles and (federate, local
//! index) pairs to global handles, for publications, subscriptions,
//! endpoints, and filters. Global ids are drawn from a monotonic counter
//! owned by the root broker; every other node inserts records under ids
//! assigned upstream. Once the federation is operating the registry is
//! frozen and every registration fails.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{FedResult, FederationError};
use crate::ids::{FederateId, HandleId, LocalId};

/// The kind of a registered interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    Publication,
    Subscription,
    Endpoint,
    SourceFilter,
    DestinationFilter,
}

impl HandleKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HandleKind::Publication => "publication",
            HandleKind::Subscription => "subscription",
            HandleKind::Endpoint => "endpoint",
            HandleKind::SourceFilter => "source-filter",
            HandleKind::DestinationFilter => "destination-filter",
        }
    }
}

/// Immutable record of a registered handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleInfo {
    pub id: HandleId,
    pub fed: FederateId,
    pub kind: HandleKind,
    pub name: String,
    pub data_type: String,
    /// Units string; publications and subscriptions only.
    pub units: String,
    /// Target endpoint; filters only.
    pub target: String,
    pub required: bool,
    /// Dense per-federate index in registration order within the kind.
    pub local: LocalId,
}

/// Name and id indices for every handle known to a node.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: HashMap<HandleId, HandleInfo>,
    publications: BTreeMap<String, HandleId>,
    endpoints: BTreeMap<String, HandleId>,
    /// Multiple federates may subscribe to the same publication name; a
    /// duplicate from the same federate is a collision.
    subscriptions: BTreeMap<String, Vec<HandleId>>,
    source_filters: BTreeMap<String, HandleId>,
    destination_filters: BTreeMap<String, HandleId>,
    local_index: HashMap<(FederateId, HandleKind, LocalId), HandleId>,
    local_counts: HashMap<(FederateId, HandleKind), i32>,
    next_handle: i32,
    operating: bool,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze the registry; all further registrations fail with `Frozen`.
    pub fn freeze(&mut self) {
        self.operating = true;
    }

    pub fn is_operating(&self) -> bool {
        self.operating
    }

    /// Draw the next global handle id. Root node only.
    pub fn allocate_id(&mut self) -> HandleId {
        let id = HandleId::new(self.next_handle);
        self.next_handle += 1;
        id
    }

    /// Check that `name` is free in the namespace of `kind`.
    pub fn check_name(&self, kind: HandleKind, name: &str, fed: FederateId) -> FedResult<()> {
        if self.operating {
            return Err(FederationError::Frozen);
        }
        let taken = match kind {
            HandleKind::Publication => self.publications.contains_key(name),
            HandleKind::Endpoint => self.endpoints.contains_key(name),
            HandleKind::SourceFilter => self.source_filters.contains_key(name),
            HandleKind::DestinationFilter => self.destination_filters.contains_key(name),
            HandleKind::Subscription => self
                .subscriptions
                .get(name)
                .is_some_and(|subs| subs.iter().any(|id| self.handles[id].fed == fed)),
        };
        if taken {
            Err(FederationError::NameInUse(name.to_string()))
        } else {
            Ok(())
        }
    }

    /// Record a handle under an already-assigned global id.
    ///
    /// The dense local index is assigned here, in registration order per
    /// federate and kind.
    pub fn insert(
        &mut self,
        id: HandleId,
        fed: FederateId,
        kind: HandleKind,
        name: &str,
        data_type: &str,
        units: &str,
        target: &str,
        required: bool,
    ) -> FedResult<LocalId> {
        self.check_name(kind, name, fed)?;

        let count = self.local_counts.entry((fed, kind)).or_insert(0);
        let local = LocalId::new(*count);
        *count += 1;

        match kind {
            HandleKind::Publication => {
                self.publications.insert(name.to_string(), id);
            }
            HandleKind::Endpoint => {
                self.endpoints.insert(name.to_string(), id);
            }
            HandleKind::Subscription => {
                self.subscriptions.entry(name.to_string()).or_default().push(id);
            }
            HandleKind::SourceFilter => {
                self.source_filters.insert(name.to_string(), id);
            }
            HandleKind::DestinationFilter => {
                self.destination_filters.insert(name.to_string(), id);
            }
        }
        self.local_index.insert((fed, kind, local), id);
        self.handles.insert(
            id,
            HandleInfo {
                id,
                fed,
                kind,
                name: name.to_string(),
                data_type: data_type.to_string(),
                units: units.to_string(),
                target: target.to_string(),
                required,
                local,
            },
        );
        Ok(local)
    }

    /// Look up a handle by name within the namespace of `kind`.
    ///
    /// For subscriptions this returns the first registrant; use
    /// [`HandleRegistry::subscribers_of`] for the full set.
    pub fn lookup_by_name(&self, kind: HandleKind, name: &str) -> Option<HandleId> {
        match kind {
            HandleKind::Publication => self.publications.get(name).copied(),
            HandleKind::Endpoint => self.endpoints.get(name).copied(),
            HandleKind::SourceFilter => self.source_filters.get(name).copied(),
            HandleKind::DestinationFilter => self.destination_filters.get(name).copied(),
            HandleKind::Subscription => self.subscriptions.get(name).and_then(|v| v.first()).copied(),
        }
    }

    /// Every subscription handle registered against `name`.
    pub fn subscribers_of(&self, name: &str) -> &[HandleId] {
        self.subscriptions.get(name).map_or(&[], Vec::as_slice)
    }

    pub fn lookup_by_handle(&self, id: HandleId) -> Option<&HandleInfo> {
        self.handles.get(&id)
    }

    pub fn local_to_global(&self, fed: FederateId, kind: HandleKind, local: LocalId) -> Option<HandleId> {
        self.local_index.get(&(fed, kind, local)).copied()
    }

    pub fn global_to_local(&self, id: HandleId) -> Option<(FederateId, LocalId)> {
        self.handles.get(&id).map(|info| (info.fed, info.local))
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Filters of `kind` whose target is the named endpoint.
    pub fn filters_targeting(&self, kind: HandleKind, target: &str) -> Vec<&HandleInfo> {
        let names = match kind {
            HandleKind::SourceFilter => &self.source_filters,
            HandleKind::DestinationFilter => &self.destination_filters,
            _ => return Vec::new(),
        };
        names
            .values()
            .filter_map(|id| self.handles.get(id))
            .filter(|info| info.target == target)
            .collect()
    }

    /// Handles owned by one federate, in registration order per kind.
    pub fn handles_of(&self, fed: FederateId) -> Vec<&HandleInfo> {
        let mut owned: Vec<&HandleInfo> = self.handles.values().filter(|info| info.fed == fed).collect();
        owned.sort_by_key(|info| (info.kind.as_str(), info.local.as_i32()));
        owned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_endpoint() -> (HandleRegistry, HandleId) {
        let mut reg = HandleRegistry::new();
        let id = reg.allocate_id();
        reg.insert(id, FederateId::new(0), HandleKind::Endpoint, "ep", "raw", "", "", false)
            .unwrap();
        (reg, id)
    }

    #[test]
    fn test_round_trip_by_name_and_handle() {
        let (reg, id) = registry_with_endpoint();
        assert_eq!(reg.lookup_by_name(HandleKind::Endpoint, "ep"), Some(id));
        let info = reg.lookup_by_handle(id).unwrap();
        assert_eq!(info.name, "ep");
        assert_eq!(info.kind, HandleKind::Endpoint);
    }

    #[test]
    fn test_local_global_bijection() {
        let mut reg = HandleRegistry::new();
        let fed = FederateId::new(2);
        for i in 0..3 {
            let id = reg.allocate_id();
            reg.insert(id, fed, HandleKind::Endpoint, &format!("ep{i}"), "raw", "", "", false)
                .unwrap();
        }
        for i in 0..3 {
            let local = LocalId::new(i);
            let id = reg.local_to_global(fed, HandleKind::Endpoint, local).unwrap();
            assert_eq!(reg.global_to_local(id), Some((fed, local)));
        }
    }

    #[test]
    fn test_name_collision() {
        let mut reg = HandleRegistry::new();
        let id = reg.allocate_id();
        reg.insert(id, FederateId::new(0), HandleKind::Publication, "x", "double", "m", "", false)
            .unwrap();
        let id2 = reg.allocate_id();
        let err = reg
            .insert(id2, FederateId::new(1), HandleKind::Publication, "x", "double", "m", "", false)
            .unwrap_err();
        assert_eq!(err, FederationError::NameInUse("x".to_string()));
    }

    #[test]
    fn test_namespaces_are_disjoint() {
        let mut reg = HandleRegistry::new();
        let id = reg.allocate_id();
        reg.insert(id, FederateId::new(0), HandleKind::Publication, "same", "double", "", "", false)
            .unwrap();
        let id2 = reg.allocate_id();
        // An endpoint may reuse a publication's name.
        reg.insert(id2, FederateId::new(0), HandleKind::Endpoint, "same", "raw", "", "", false)
            .unwrap();
    }

    #[test]
    fn test_multiple_subscribers_same_name() {
        let mut reg = HandleRegistry::new();
        let a = reg.allocate_id();
        reg.insert(a, FederateId::new(0), HandleKind::Subscription, "p1", "double", "", "", false)
            .unwrap();
        let b = reg.allocate_id();
        reg.insert(b, FederateId::new(1), HandleKind::Subscription, "p1", "double", "", "", false)
            .unwrap();
        assert_eq!(reg.subscribers_of("p1"), &[a, b]);

        // Same federate subscribing twice collides.
        let c = reg.allocate_id();
        assert!(reg
            .insert(c, FederateId::new(0), HandleKind::Subscription, "p1", "double", "", "", false)
            .is_err());
    }

    #[test]
    fn test_frozen_registry_rejects() {
        let (mut reg, _) = registry_with_endpoint();
        reg.freeze();
        let id = reg.allocate_id();
        let err = reg
            .insert(id, FederateId::new(0), HandleKind::Endpoint, "late", "raw", "", "", false)
            .unwrap_err();
        assert_eq!(err, FederationError::Frozen);
    }
}
