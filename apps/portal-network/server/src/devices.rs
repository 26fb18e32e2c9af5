//! Keyboard-to-endpoint association.
//!
//! A keyboard records the endpoint it serves when it is placed. Keyboards
//! from older worlds carry no binding; for those a bounded scan picks the
//! nearest endpoint once and stores the result.

use std::collections::HashMap;

use portal_network_core::{BlockPos, EndpointId, EndpointRegistry, ResourceId};
use serde::{Deserialize, Serialize};
use tracing::warn;

type DeviceKey = (ResourceId, BlockPos);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Binding>", into = "Vec<Binding>")]
pub struct DeviceBindings {
    bindings: HashMap<DeviceKey, EndpointId>,
}

/// Persisted form of one keyboard binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    pub dimension: ResourceId,
    pub device: BlockPos,
    pub endpoint: EndpointId,
}

impl From<Vec<Binding>> for DeviceBindings {
    fn from(rows: Vec<Binding>) -> Self {
        Self {
            bindings: rows
                .into_iter()
                .map(|row| ((row.dimension, row.device), row.endpoint))
                .collect(),
        }
    }
}

impl From<DeviceBindings> for Vec<Binding> {
    fn from(value: DeviceBindings) -> Self {
        let mut rows: Vec<Binding> = value
            .bindings
            .into_iter()
            .map(|((dimension, device), endpoint)| Binding {
                dimension,
                device,
                endpoint,
            })
            .collect();
        rows.sort_by(|a, b| (&a.dimension, a.device).cmp(&(&b.dimension, b.device)));
        rows
    }
}

impl DeviceBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, dimension: ResourceId, device: BlockPos, endpoint: EndpointId) {
        self.bindings.insert((dimension, device), endpoint);
    }

    pub fn unbind(&mut self, dimension: &ResourceId, device: BlockPos) -> Option<EndpointId> {
        self.bindings.remove(&(dimension.clone(), device))
    }

    /// Drops every binding that points at `endpoint`.
    pub fn forget_endpoint(&mut self, endpoint: EndpointId) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, bound| *bound != endpoint);
        before - self.bindings.len()
    }

    pub fn bound(&self, dimension: &ResourceId, device: BlockPos) -> Option<EndpointId> {
        self.bindings.get(&(dimension.clone(), device)).copied()
    }

    /// Endpoint served by the keyboard at `device`.
    ///
    /// A binding to an endpoint that no longer exists is discarded. Without a
    /// usable binding the nearest endpoint within `scan_radius` (ties broken
    /// by registration order) is bound and returned.
    pub fn resolve(
        &mut self,
        registry: &EndpointRegistry,
        dimension: &ResourceId,
        device: BlockPos,
        scan_radius: u32,
    ) -> Option<EndpointId> {
        if let Some(endpoint) = self.bound(dimension, device) {
            if registry.contains(endpoint) {
                return Some(endpoint);
            }
            self.unbind(dimension, device);
        }

        let mut best: Option<(u32, EndpointId)> = None;
        for record in registry.iter() {
            if &record.dimension != dimension {
                continue;
            }
            let distance = record.position.chebyshev(&device);
            if distance > scan_radius {
                continue;
            }
            if best.map_or(true, |(closest, _)| distance < closest) {
                best = Some((distance, record.id));
            }
        }
        let (_, endpoint) = best?;
        warn!(
            dimension = %dimension,
            device = %device,
            endpoint = %endpoint,
            "keyboard had no binding; bound to nearest endpoint"
        );
        self.bind(dimension.clone(), device, endpoint);
        Some(endpoint)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
