//! Request dispatch for connected keyboard devices.
//!
//! Every request is handled on the authoritative loop against the
//! [`Simulation`]. Replies and status pushes go out through each session's
//! bounded outbound queue; a full queue drops the message for that session
//! only.

use std::collections::{HashMap, HashSet};

use metrics::counter;
use portal_network_core::{BlockPos, EndpointId, Phase, ResourceId};
use portal_wire::{DeviceMessage, EndpointEntry, ServerMessage};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sim::Simulation;

/// Capacity of each session's outbound queue.
pub const OUTBOUND_QUEUE_LEN: usize = 64;

pub const NO_SOURCE_MESSAGE: &str = "no portal core near this keyboard";

struct Session {
    dimension: ResourceId,
    outbound: mpsc::Sender<ServerMessage>,
    observing: HashSet<EndpointId>,
}

impl Session {
    fn push(&self, id: Uuid, message: ServerMessage) {
        match self.outbound.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(session = %id, "outbound queue full; dropping message");
                counter!("portal_outbound_dropped_total", 1);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(session = %id, "session writer already gone");
            }
        }
    }
}

pub struct SyncService {
    sessions: HashMap<Uuid, Session>,
    legacy_scan_radius: u32,
}

impl SyncService {
    pub fn new(legacy_scan_radius: u32) -> Self {
        Self {
            sessions: HashMap::new(),
            legacy_scan_radius,
        }
    }

    pub fn open_session(&mut self, session: Uuid, outbound: mpsc::Sender<ServerMessage>) {
        debug!(session = %session, "device session opened");
        self.sessions.insert(
            session,
            Session {
                dimension: ResourceId::overworld(),
                outbound,
                observing: HashSet::new(),
            },
        );
    }

    pub fn close_session(&mut self, session: Uuid) {
        if self.sessions.remove(&session).is_some() {
            debug!(session = %session, "device session closed");
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn handle(&mut self, sim: &mut Simulation, session_id: Uuid, message: DeviceMessage) {
        let kind = message.kind_name();
        counter!("portal_requests_total", 1, "kind" => kind);
        let Some(session) = self.sessions.get_mut(&session_id) else {
            warn!(session = %session_id, kind, "request from unknown session");
            return;
        };

        let failure = match message {
            DeviceMessage::Hello { dimension } => {
                debug!(session = %session_id, dimension = %dimension, "device hello");
                session.dimension = dimension;
                None
            }
            DeviceMessage::EndpointListRequest { device_pos } => {
                let source = sim.resolve_device(&session.dimension, device_pos, self.legacy_scan_radius);
                let entries = sim
                    .registry()
                    .list_visible(source)
                    .into_iter()
                    .map(|record| EndpointEntry {
                        id: record.id,
                        name: record.name,
                        dimension: record.dimension,
                        position: record.position,
                        cost: record.activation_cost,
                    })
                    .collect();
                session.push(
                    session_id,
                    ServerMessage::EndpointListResponse {
                        device_pos,
                        entries,
                    },
                );
                if let Some(source) = source {
                    session.observing.insert(source);
                    if let Some(status) = status_for(sim, source) {
                        session.push(session_id, status);
                    }
                }
                None
            }
            DeviceMessage::ConnectRequest {
                device_pos,
                target_id,
            } => match sim.resolve_device(&session.dimension, device_pos, self.legacy_scan_radius) {
                Some(source) => {
                    session.observing.insert(source);
                    sim.connect(source, target_id).err().map(|err| {
                        debug!(source = %source, target = %target_id, error = %err, "connect rejected");
                        err.to_string()
                    })
                }
                None => Some(NO_SOURCE_MESSAGE.to_owned()),
            },
            DeviceMessage::DisconnectRequest { device_pos } => {
                match sim.resolve_device(&session.dimension, device_pos, self.legacy_scan_radius) {
                    Some(source) => {
                        session.observing.insert(source);
                        sim.disconnect(source).err().map(|err| {
                            debug!(source = %source, error = %err, "disconnect rejected");
                            err.to_string()
                        })
                    }
                    None => Some(NO_SOURCE_MESSAGE.to_owned()),
                }
            }
            DeviceMessage::RenameRequest { anchor_pos, name } => {
                let dimension = session.dimension.clone();
                self.rename(sim, session_id, &dimension, anchor_pos, &name)
            }
        };

        if let Some(message) = failure {
            counter!("portal_request_failures_total", 1, "kind" => kind);
            if let Some(session) = self.sessions.get(&session_id) {
                session.push(session_id, ServerMessage::ConnectionError { message });
            }
        }
    }

    fn rename(
        &mut self,
        sim: &mut Simulation,
        session_id: Uuid,
        dimension: &ResourceId,
        anchor_pos: BlockPos,
        name: &str,
    ) -> Option<String> {
        let Some(id) = sim.registry().find_at(dimension, anchor_pos).map(|r| r.id) else {
            return Some(format!("no portal core at {anchor_pos}"));
        };
        let applied = match sim.rename(id, name) {
            Ok(applied) => applied,
            Err(err) => return Some(err.to_string()),
        };
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.observing.insert(id);
        }
        for (observer_id, observer) in &self.sessions {
            if observer.observing.contains(&id) {
                observer.push(
                    *observer_id,
                    ServerMessage::NameResponse {
                        anchor_pos,
                        name: applied.clone(),
                    },
                );
            }
        }
        None
    }

    /// Pushes a status update to every observer of an endpoint whose phase
    /// changed since the last call.
    pub fn flush_status(&mut self, sim: &mut Simulation) {
        let changed: HashSet<EndpointId> = sim
            .drain_changes()
            .into_iter()
            .map(|change| change.endpoint)
            .collect();
        if changed.is_empty() {
            return;
        }
        for endpoint in changed {
            let Some(status) = status_for(sim, endpoint) else {
                continue;
            };
            for (session_id, session) in &self.sessions {
                if session.observing.contains(&endpoint) {
                    session.push(*session_id, status.clone());
                }
            }
        }
    }
}

fn status_for(sim: &Simulation, endpoint: EndpointId) -> Option<ServerMessage> {
    let record = sim.registry().lookup(endpoint)?;
    let phase = sim
        .endpoint_state(endpoint)
        .map(|state| state.phase)
        .unwrap_or_default();
    Some(ServerMessage::StatusResponse {
        anchor_pos: record.position,
        active: phase.is_linked(),
        disconnect_allowed: phase == Phase::Active,
    })
}
