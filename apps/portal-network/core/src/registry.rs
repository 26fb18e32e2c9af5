use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::ids::{BlockPos, EndpointId, ResourceId};

pub const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("an endpoint is already registered at {position} in {dimension}")]
    DuplicateLocation {
        dimension: ResourceId,
        position: BlockPos,
    },
    #[error("endpoint id {0} is already registered")]
    DuplicateId(EndpointId),
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub id: EndpointId,
    #[serde(default)]
    pub name: String,
    pub dimension: ResourceId,
    pub position: BlockPos,
    pub activation_cost: u64,
}

impl EndpointRecord {
    /// The stored name, or the short id when no name was given.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.id.short()
        } else {
            self.name.clone()
        }
    }
}

/// Registration request; the registry assigns the id.
#[derive(Debug, Clone)]
pub struct NewEndpoint {
    pub name: String,
    pub dimension: ResourceId,
    pub position: BlockPos,
    pub activation_cost: u64,
}

impl NewEndpoint {
    pub fn new(dimension: ResourceId, position: BlockPos, activation_cost: u64) -> Self {
        Self {
            name: String::new(),
            dimension,
            position,
            activation_cost,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

fn normalize_name(raw: &str) -> String {
    raw.trim().chars().take(MAX_NAME_LEN).collect()
}

/// Durable table of every endpoint in one world.
///
/// Iteration and snapshots follow registration order.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    records: HashMap<EndpointId, EndpointRecord>,
    order: Vec<EndpointId>,
    by_location: HashMap<(ResourceId, BlockPos), EndpointId>,
    dirty: bool,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a registry from persisted rows, keeping their order.
    pub fn from_records(
        records: impl IntoIterator<Item = EndpointRecord>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for record in records {
            registry.insert_record(record)?;
        }
        registry.dirty = false;
        Ok(registry)
    }

    pub fn register(&mut self, endpoint: NewEndpoint) -> Result<EndpointId, RegistryError> {
        let mut id = EndpointId::generate();
        while self.records.contains_key(&id) {
            id = EndpointId::generate();
        }
        self.insert_record(EndpointRecord {
            id,
            name: endpoint.name,
            dimension: endpoint.dimension,
            position: endpoint.position,
            activation_cost: endpoint.activation_cost,
        })?;
        Ok(id)
    }

    /// Inserts a row with a caller-chosen id.
    pub fn insert_record(&mut self, mut record: EndpointRecord) -> Result<(), RegistryError> {
        if self.records.contains_key(&record.id) {
            return Err(RegistryError::DuplicateId(record.id));
        }
        let location = (record.dimension.clone(), record.position);
        if self.by_location.contains_key(&location) {
            return Err(RegistryError::DuplicateLocation {
                dimension: record.dimension,
                position: record.position,
            });
        }
        record.name = normalize_name(&record.name);
        debug!(endpoint = %record.id, dimension = %record.dimension, position = %record.position, "registered endpoint");
        self.by_location.insert(location, record.id);
        self.order.push(record.id);
        self.records.insert(record.id, record);
        self.dirty = true;
        Ok(())
    }

    pub fn unregister(&mut self, id: EndpointId) -> Option<EndpointRecord> {
        let record = self.records.remove(&id)?;
        self.by_location
            .remove(&(record.dimension.clone(), record.position));
        self.order.retain(|existing| *existing != id);
        self.dirty = true;
        debug!(endpoint = %id, "unregistered endpoint");
        Some(record)
    }

    pub fn lookup(&self, id: EndpointId) -> Option<&EndpointRecord> {
        self.records.get(&id)
    }

    pub fn contains(&self, id: EndpointId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn find_at(&self, dimension: &ResourceId, position: BlockPos) -> Option<&EndpointRecord> {
        let id = self.by_location.get(&(dimension.clone(), position))?;
        self.records.get(id)
    }

    pub fn list_visible(&self, excluding: Option<EndpointId>) -> Vec<EndpointRecord> {
        self.iter()
            .filter(|record| Some(record.id) != excluding)
            .cloned()
            .collect()
    }

    /// Applies a new display name and returns the stored form.
    pub fn rename(&mut self, id: EndpointId, name: &str) -> Result<String, RegistryError> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(RegistryError::UnknownEndpoint(id))?;
        record.name = normalize_name(name);
        self.dirty = true;
        Ok(record.name.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = &EndpointRecord> + '_ {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn overworld_at(x: i32) -> NewEndpoint {
        NewEndpoint::new(ResourceId::overworld(), BlockPos::new(x, 64, 0), 50)
    }

    #[test_timeout::timeout]
    fn rejects_duplicate_location() {
        let mut registry = EndpointRegistry::new();
        registry.register(overworld_at(1)).expect("first");
        let err = registry.register(overworld_at(1)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateLocation { .. }));
        assert_eq!(registry.len(), 1);

        // Same position in another dimension is a different anchor.
        registry
            .register(NewEndpoint::new(ResourceId::nether(), BlockPos::new(1, 64, 0), 50))
            .expect("other dimension");
        assert_eq!(registry.len(), 2);
    }

    #[test_timeout::timeout]
    fn ids_and_locations_stay_unique() {
        let mut registry = EndpointRegistry::new();
        for x in 0..50 {
            registry.register(overworld_at(x)).expect("register");
        }
        let ids: HashSet<_> = registry.iter().map(|r| r.id).collect();
        let spots: HashSet<_> = registry
            .iter()
            .map(|r| (r.dimension.clone(), r.position))
            .collect();
        assert_eq!(ids.len(), 50);
        assert_eq!(spots.len(), 50);
    }

    #[test_timeout::timeout]
    fn snapshot_keeps_registration_order_and_excludes_caller() {
        let mut registry = EndpointRegistry::new();
        let a = registry.register(overworld_at(1).named("alpha")).unwrap();
        let b = registry.register(overworld_at(2).named("beta")).unwrap();
        let c = registry.register(overworld_at(3)).unwrap();

        let ids: Vec<_> = registry.list_visible(None).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a, b, c]);

        let ids: Vec<_> = registry.list_visible(Some(b)).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![a, c]);

        registry.unregister(a);
        let ids: Vec<_> = registry.list_visible(None).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b, c]);
        assert!(registry
            .find_at(&ResourceId::overworld(), BlockPos::new(1, 64, 0))
            .is_none());
    }

    #[test_timeout::timeout]
    fn rename_normalizes_and_tracks_dirty() {
        let mut registry = EndpointRegistry::new();
        let id = registry.register(overworld_at(1)).unwrap();
        registry.mark_clean();

        let stored = registry.rename(id, "  Home Base  ").unwrap();
        assert_eq!(stored, "Home Base");
        assert!(registry.is_dirty());

        let long = "x".repeat(MAX_NAME_LEN + 10);
        assert_eq!(registry.rename(id, &long).unwrap().len(), MAX_NAME_LEN);

        let missing = EndpointId::generate();
        assert_eq!(
            registry.rename(missing, "nope"),
            Err(RegistryError::UnknownEndpoint(missing))
        );
    }

    #[test_timeout::timeout]
    fn empty_name_falls_back_to_short_id() {
        let mut registry = EndpointRegistry::new();
        let id = registry.register(overworld_at(1)).unwrap();
        let record = registry.lookup(id).unwrap();
        assert_eq!(record.display_name(), id.short());
    }

    #[test_timeout::timeout]
    fn from_records_rejects_conflicts() {
        let record = EndpointRecord {
            id: EndpointId::generate(),
            name: "a".into(),
            dimension: ResourceId::overworld(),
            position: BlockPos::new(0, 0, 0),
            activation_cost: 1,
        };
        let dup = EndpointRecord {
            id: EndpointId::generate(),
            ..record.clone()
        };
        assert!(matches!(
            EndpointRegistry::from_records(vec![record.clone(), dup]),
            Err(RegistryError::DuplicateLocation { .. })
        ));
        let registry = EndpointRegistry::from_records(vec![record]).unwrap();
        assert!(!registry.is_dirty());
    }
}
