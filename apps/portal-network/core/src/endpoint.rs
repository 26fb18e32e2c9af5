use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::EndpointId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Opening,
    Active,
    Unstable,
    Closing,
}

impl Phase {
    /// Phases in which the endpoint holds a committed link.
    pub fn is_linked(self) -> bool {
        matches!(self, Phase::Active | Phase::Unstable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Opening => "opening",
            Phase::Active => "active",
            Phase::Unstable => "unstable",
            Phase::Closing => "closing",
        }
    }

    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Idle, Opening)
                | (Opening, Idle)
                | (Opening, Active)
                | (Idle, Active)
                | (Active, Closing)
                | (Active, Unstable)
                | (Unstable, Closing)
                | (Closing, Idle)
        )
    }
}

/// Runtime state co-located with an anchor block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointState {
    pub self_id: EndpointId,
    pub linked_id: Option<EndpointId>,
    pub phase: Phase,
    pub frame_valid: bool,
    /// Ticks spent in `Unstable`.
    #[serde(default)]
    pub unstable_ticks: u32,
    #[serde(skip)]
    pub revalidate: bool,
}

impl EndpointState {
    pub fn idle(self_id: EndpointId) -> Self {
        Self {
            self_id,
            linked_id: None,
            phase: Phase::Idle,
            frame_valid: false,
            unstable_ticks: 0,
            revalidate: true,
        }
    }

    /// Moves to `next`, returning `false` (and leaving the state untouched)
    /// for a transition the state machine does not allow.
    pub fn transition(&mut self, next: Phase) -> bool {
        if !self.phase.can_transition_to(next) {
            return false;
        }
        self.phase = next;
        if next != Phase::Unstable {
            self.unstable_ticks = 0;
        }
        true
    }

    /// `Closing -> Idle` with the link cleared, from any linked phase.
    pub fn close_locally(&mut self) -> bool {
        if !self.phase.is_linked() {
            return false;
        }
        self.transition(Phase::Closing);
        self.linked_id = None;
        self.transition(Phase::Idle)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    state: EndpointState,
    #[serde(skip)]
    loaded: bool,
}

/// Endpoint states keyed by id. Anchors refer to their state only by id.
///
/// A state is stored for every placed anchor; only loaded ones are reachable
/// through the `*_loaded` accessors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointArena {
    slots: HashMap<EndpointId, Slot>,
}

impl EndpointArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: EndpointState, loaded: bool) {
        self.slots.insert(state.self_id, Slot { state, loaded });
    }

    pub fn remove(&mut self, id: EndpointId) -> Option<EndpointState> {
        self.slots.remove(&id).map(|slot| slot.state)
    }

    pub fn contains(&self, id: EndpointId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Stored state, loaded or not.
    pub fn get(&self, id: EndpointId) -> Option<&EndpointState> {
        self.slots.get(&id).map(|slot| &slot.state)
    }

    pub fn get_mut(&mut self, id: EndpointId) -> Option<&mut EndpointState> {
        self.slots.get_mut(&id).map(|slot| &mut slot.state)
    }

    pub fn get_loaded(&self, id: EndpointId) -> Option<&EndpointState> {
        self.slots
            .get(&id)
            .filter(|slot| slot.loaded)
            .map(|slot| &slot.state)
    }

    pub fn get_loaded_mut(&mut self, id: EndpointId) -> Option<&mut EndpointState> {
        self.slots
            .get_mut(&id)
            .filter(|slot| slot.loaded)
            .map(|slot| &mut slot.state)
    }

    pub fn is_loaded(&self, id: EndpointId) -> bool {
        self.slots.get(&id).map(|slot| slot.loaded).unwrap_or(false)
    }

    pub fn set_loaded(&mut self, id: EndpointId, loaded: bool) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.loaded = loaded;
                true
            }
            None => false,
        }
    }

    /// Loaded ids in a stable order.
    pub fn loaded_ids(&self) -> Vec<EndpointId> {
        let mut ids: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.loaded)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn ids(&self) -> Vec<EndpointId> {
        let mut ids: Vec<_> = self.slots.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
