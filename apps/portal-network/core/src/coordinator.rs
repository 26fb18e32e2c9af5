//! Open/close protocol for pairs of endpoints.
//!
//! All mutation happens inside one call on the authoritative loop, so a
//! coordination step never interleaves with another. The only cross-call
//! window is between [`Coordinator::begin_open`] and
//! [`Coordinator::complete_open`]; the source sits in `Opening` for that
//! window and anything that removes it turns the completion into
//! [`ConnectError::Cancelled`]. An open that is never completed is reset
//! by the next [`Coordinator::tick`].

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::endpoint::{EndpointArena, EndpointState, Phase};
use crate::energy::{EnergyError, EnergyProvider};
use crate::frame::{self, FrameRules};
use crate::hooks::LinkHooks;
use crate::ids::{BlockPos, EndpointId, ResourceId};
use crate::registry::{EndpointRecord, EndpointRegistry, NewEndpoint, RegistryError};
use crate::world::World;

pub const DEFAULT_UNSTABLE_GRACE_TICKS: u32 = 100;
pub const DEFAULT_REVALIDATE_INTERVAL_TICKS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Target => f.write_str("target"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("cannot connect an endpoint to itself")]
    SelfConnect,
    #[error("target endpoint {0} not found")]
    TargetNotFound(EndpointId),
    #[error("source endpoint {0} not found")]
    SourceNotFound(EndpointId),
    #[error("endpoint {0} is already connecting or connected")]
    AlreadyConnecting(EndpointId),
    #[error("{side} frame is incomplete")]
    InvalidStructure { side: Side },
    #[error("insufficient energy: requires {required}, has {available}")]
    InsufficientEnergy { required: u64, available: u64 },
    #[error("target endpoint {0} is busy")]
    TargetBusy(EndpointId),
    #[error("connection from {0} was cancelled")]
    Cancelled(EndpointId),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DisconnectError {
    #[error("endpoint {0} is not connected")]
    NotActive(EndpointId),
}

/// A committed phase change, reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub endpoint: EndpointId,
    pub phase: Phase,
    pub linked: Option<EndpointId>,
}

/// Handle for a source parked in `Opening` by [`Coordinator::begin_open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a pending open leaves its source in Opening until completed"]
pub struct PendingOpen {
    source: EndpointId,
    target: EndpointId,
    cost: u64,
}

impl PendingOpen {
    pub fn source(&self) -> EndpointId {
        self.source
    }

    pub fn target(&self) -> EndpointId {
        self.target
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }
}

/// World-scoped services a coordination step operates on.
pub struct CoordinatorContext<'a> {
    pub registry: &'a mut EndpointRegistry,
    pub endpoints: &'a mut EndpointArena,
    pub world: &'a mut dyn World,
    pub energy: &'a mut dyn EnergyProvider,
    pub hooks: &'a mut dyn LinkHooks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub frame: FrameRules,
    pub unstable_grace_ticks: u32,
    /// Periodic revalidation of every loaded endpoint; `0` disables it.
    pub revalidate_interval_ticks: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            frame: FrameRules::default(),
            unstable_grace_ticks: DEFAULT_UNSTABLE_GRACE_TICKS,
            revalidate_interval_ticks: DEFAULT_REVALIDATE_INTERVAL_TICKS,
        }
    }
}

#[derive(Debug, Default)]
pub struct Coordinator {
    config: CoordinatorConfig,
    changes: Vec<StatusChange>,
    /// Sources parked in `Opening` by a live [`PendingOpen`].
    in_flight: HashSet<EndpointId>,
    tick: u64,
}

fn frame_at(
    world: &dyn World,
    rules: &FrameRules,
    dimension: &ResourceId,
    position: BlockPos,
) -> bool {
    frame::validate(world, dimension, position, rules).is_some()
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            changes: Vec::new(),
            in_flight: HashSet::new(),
            tick: 0,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Status changes committed since the last drain, in commit order.
    pub fn drain_changes(&mut self) -> Vec<StatusChange> {
        std::mem::take(&mut self.changes)
    }

    fn record(&mut self, state: &EndpointState) {
        self.changes.push(StatusChange {
            endpoint: state.self_id,
            phase: state.phase,
            linked: state.linked_id,
        });
    }

    pub fn anchor_placed(
        &mut self,
        ctx: &mut CoordinatorContext<'_>,
        endpoint: NewEndpoint,
    ) -> Result<EndpointId, RegistryError> {
        let id = ctx.registry.register(endpoint)?;
        ctx.endpoints.insert(EndpointState::idle(id), true);
        Ok(id)
    }

    pub fn anchor_removed(
        &mut self,
        ctx: &mut CoordinatorContext<'_>,
        id: EndpointId,
    ) -> Option<EndpointRecord> {
        let link = ctx
            .endpoints
            .get(id)
            .filter(|state| state.phase.is_linked())
            .map(|state| state.linked_id);
        if let Some(remote) = link {
            if let Some(remote) = remote {
                self.close_remote(ctx, remote, id);
            }
            ctx.hooks.teardown_link(id);
        }
        ctx.endpoints.remove(id);
        let record = ctx.registry.unregister(id);
        if record.is_some() {
            info!(endpoint = %id, "anchor removed");
        }
        record
    }

    /// Marks an endpoint reachable and heals any stale link it carries.
    pub fn endpoint_loaded(&mut self, ctx: &mut CoordinatorContext<'_>, id: EndpointId) -> bool {
        if !ctx.endpoints.set_loaded(id, true) {
            return false;
        }
        if let Some(state) = ctx.endpoints.get_mut(id) {
            state.revalidate = true;
        }
        self.heal(ctx, id);
        true
    }

    pub fn endpoint_unloaded(&mut self, ctx: &mut CoordinatorContext<'_>, id: EndpointId) -> bool {
        ctx.endpoints.set_loaded(id, false)
    }

    /// Schedules revalidation of every loaded endpoint whose frame could
    /// include `position`.
    pub fn notify_block_changed(
        &mut self,
        ctx: &mut CoordinatorContext<'_>,
        dimension: &ResourceId,
        position: BlockPos,
    ) {
        let radius = self.config.frame.radius;
        for id in ctx.endpoints.loaded_ids() {
            let Some(record) = ctx.registry.lookup(id) else {
                continue;
            };
            if &record.dimension != dimension || record.position.chebyshev(&position) > radius {
                continue;
            }
            if let Some(state) = ctx.endpoints.get_mut(id) {
                state.revalidate = true;
            }
        }
    }

    /// Closes a loaded endpoint whose link no longer resolves to a partner
    /// pointing back at it. Returns whether the state changed.
    pub fn heal(&mut self, ctx: &mut CoordinatorContext<'_>, id: EndpointId) -> bool {
        let Some(state) = ctx.endpoints.get_loaded(id) else {
            return false;
        };
        match state.phase {
            Phase::Idle => false,
            Phase::Opening if self.in_flight.contains(&id) => false,
            Phase::Opening | Phase::Closing => {
                let stale = state.phase;
                if let Some(state) = ctx.endpoints.get_loaded_mut(id) {
                    state.phase = Phase::Idle;
                    state.linked_id = None;
                    state.unstable_ticks = 0;
                    warn!(endpoint = %id, phase = stale.as_str(), "reset interrupted transition");
                    let snapshot = state.clone();
                    self.record(&snapshot);
                }
                true
            }
            Phase::Active | Phase::Unstable => {
                let remote_ok = state.linked_id.is_some_and(|remote| {
                    ctx.registry.contains(remote)
                        && ctx.endpoints.get(remote).is_some_and(|other| {
                            other.phase.is_linked() && other.linked_id == Some(id)
                        })
                });
                if remote_ok {
                    return false;
                }
                let stale_remote = state.linked_id;
                let Some(state) = ctx.endpoints.get_loaded_mut(id) else {
                    return false;
                };
                state.close_locally();
                let snapshot = state.clone();
                ctx.hooks.teardown_link(id);
                warn!(endpoint = %id, remote = ?stale_remote, "healed stale link");
                self.record(&snapshot);
                true
            }
        }
    }

    /// Runs both halves of the open protocol in one step.
    pub fn open_both_sides(
        &mut self,
        ctx: &mut CoordinatorContext<'_>,
        source: EndpointId,
        target: EndpointId,
    ) -> Result<(), ConnectError> {
        let pending = self.begin_open(ctx, source, target)?;
        self.complete_open(ctx, pending)
    }

    /// Local checks on the source; parks it in `Opening` on success.
    pub fn begin_open(
        &mut self,
        ctx: &mut CoordinatorContext<'_>,
        source: EndpointId,
        target: EndpointId,
    ) -> Result<PendingOpen, ConnectError> {
        let result = self.try_begin_open(ctx, source, target);
        if let Err(err) = &result {
            debug!(source = %source, target = %target, error = %err, "connect rejected");
            ctx.hooks.connection_failed(source, err);
        }
        result
    }

    fn try_begin_open(
        &mut self,
        ctx: &mut CoordinatorContext<'_>,
        source: EndpointId,
        target: EndpointId,
    ) -> Result<PendingOpen, ConnectError> {
        if source == target {
            return Err(ConnectError::SelfConnect);
        }
        if !ctx.registry.contains(target) {
            return Err(ConnectError::TargetNotFound(target));
        }
        let Some(record) = ctx.registry.lookup(source) else {
            return Err(ConnectError::SourceNotFound(source));
        };
        let (dimension, position, cost) =
            (record.dimension.clone(), record.position, record.activation_cost);

        self.heal(ctx, source);
        let phase = ctx
            .endpoints
            .get_loaded(source)
            .map(|state| state.phase)
            .ok_or(ConnectError::SourceNotFound(source))?;
        if phase != Phase::Idle {
            return Err(ConnectError::AlreadyConnecting(source));
        }

        let valid = frame_at(&*ctx.world, &self.config.frame, &dimension, position);
        if let Some(state) = ctx.endpoints.get_loaded_mut(source) {
            state.frame_valid = valid;
        }
        if !valid {
            return Err(ConnectError::InvalidStructure { side: Side::Source });
        }

        let available = ctx.energy.available_energy(source);
        if available < cost {
            return Err(ConnectError::InsufficientEnergy {
                required: cost,
                available,
            });
        }

        let state = ctx
            .endpoints
            .get_loaded_mut(source)
            .ok_or(ConnectError::SourceNotFound(source))?;
        state.transition(Phase::Opening);
        self.in_flight.insert(source);
        Ok(PendingOpen {
            source,
            target,
            cost,
        })
    }

    /// Remote validation and commit. Either both sides end `Active` or the
    /// source is back in `Idle` with nothing else changed.
    pub fn complete_open(
        &mut self,
        ctx: &mut CoordinatorContext<'_>,
        pending: PendingOpen,
    ) -> Result<(), ConnectError> {
        let result = self.try_complete_open(ctx, pending);
        match &result {
            Ok(()) => {
                ctx.hooks.materialize_link(pending.source, pending.target);
                info!(source = %pending.source, target = %pending.target, cost = pending.cost, "link opened");
            }
            Err(err) => {
                debug!(source = %pending.source, target = %pending.target, error = %err, "connect failed");
                ctx.hooks.connection_failed(pending.source, err);
            }
        }
        result
    }

    fn try_complete_open(
        &mut self,
        ctx: &mut CoordinatorContext<'_>,
        pending: PendingOpen,
    ) -> Result<(), ConnectError> {
        let PendingOpen {
            source,
            target,
            cost,
        } = pending;

        self.in_flight.remove(&source);
        let still_opening = ctx.registry.contains(source)
            && ctx
                .endpoints
                .get_loaded(source)
                .is_some_and(|state| state.phase == Phase::Opening);
        if !still_opening {
            return Err(ConnectError::Cancelled(source));
        }

        let Some(record) = ctx.registry.lookup(target) else {
            rollback(ctx.endpoints, source);
            return Err(ConnectError::TargetNotFound(target));
        };
        let (dimension, position) = (record.dimension.clone(), record.position);

        if !ctx.world.is_loaded(&dimension, position) && !ctx.world.force_load(&dimension, position)
        {
            rollback(ctx.endpoints, source);
            return Err(ConnectError::TargetNotFound(target));
        }
        if !ctx.endpoints.set_loaded(target, true) {
            rollback(ctx.endpoints, source);
            return Err(ConnectError::TargetNotFound(target));
        }

        self.heal(ctx, target);
        let target_idle = ctx
            .endpoints
            .get_loaded(target)
            .is_some_and(|state| state.phase == Phase::Idle);
        if !target_idle {
            rollback(ctx.endpoints, source);
            return Err(ConnectError::TargetBusy(target));
        }

        let valid = frame_at(&*ctx.world, &self.config.frame, &dimension, position);
        if let Some(state) = ctx.endpoints.get_loaded_mut(target) {
            state.frame_valid = valid;
        }
        if !valid {
            rollback(ctx.endpoints, source);
            return Err(ConnectError::InvalidStructure { side: Side::Target });
        }

        if let Err(err) = ctx.energy.debit(source, cost) {
            rollback(ctx.endpoints, source);
            let available = match err {
                EnergyError::Insufficient { available, .. } => available,
                EnergyError::NoStore(_) => 0,
            };
            return Err(ConnectError::InsufficientEnergy {
                required: cost,
                available,
            });
        }

        for (id, partner) in [(source, target), (target, source)] {
            if let Some(state) = ctx.endpoints.get_loaded_mut(id) {
                state.linked_id = Some(partner);
                state.frame_valid = true;
                state.transition(Phase::Active);
                let snapshot = state.clone();
                self.record(&snapshot);
            }
        }
        Ok(())
    }

    /// Closes `id` locally and its partner too when the partner is loaded
    /// and still points back. An unloaded partner heals on its next load.
    pub fn force_close_one_side(
        &mut self,
        ctx: &mut CoordinatorContext<'_>,
        id: EndpointId,
    ) -> Result<(), DisconnectError> {
        let state = ctx
            .endpoints
            .get_loaded_mut(id)
            .filter(|state| state.phase.is_linked())
            .ok_or(DisconnectError::NotActive(id))?;
        let remote = state.linked_id;
        state.close_locally();
        let snapshot = state.clone();
        self.record(&snapshot);
        ctx.hooks.teardown_link(id);

        if let Some(remote) = remote {
            self.close_remote(ctx, remote, id);
        }
        info!(endpoint = %id, remote = ?remote, "link closed");
        Ok(())
    }

    fn close_remote(
        &mut self,
        ctx: &mut CoordinatorContext<'_>,
        remote: EndpointId,
        origin: EndpointId,
    ) {
        let Some(state) = ctx
            .endpoints
            .get_loaded_mut(remote)
            .filter(|state| state.phase.is_linked() && state.linked_id == Some(origin))
        else {
            debug!(endpoint = %remote, "remote not loaded; left for lazy heal");
            return;
        };
        state.close_locally();
        let snapshot = state.clone();
        self.record(&snapshot);
        ctx.hooks.teardown_link(remote);
    }

    /// Structural-integrity pass over every loaded endpoint.
    pub fn tick(&mut self, ctx: &mut CoordinatorContext<'_>) {
        self.tick += 1;
        // A pending open never outlives the step that began it.
        for id in std::mem::take(&mut self.in_flight) {
            self.heal(ctx, id);
        }
        let interval = u64::from(self.config.revalidate_interval_ticks);
        let periodic = interval > 0 && self.tick % interval == 0;

        for id in ctx.endpoints.loaded_ids() {
            let Some(record) = ctx.registry.lookup(id) else {
                continue;
            };
            let (dimension, position) = (record.dimension.clone(), record.position);

            let needs_check = ctx
                .endpoints
                .get_loaded(id)
                .is_some_and(|state| state.revalidate || periodic);
            if needs_check {
                let valid = frame_at(&*ctx.world, &self.config.frame, &dimension, position);
                if let Some(state) = ctx.endpoints.get_loaded_mut(id) {
                    state.frame_valid = valid;
                    state.revalidate = false;
                }
            }

            let Some(state) = ctx.endpoints.get_loaded_mut(id) else {
                continue;
            };
            match state.phase {
                Phase::Active if !state.frame_valid => {
                    state.transition(Phase::Unstable);
                    let snapshot = state.clone();
                    warn!(endpoint = %id, "frame broken; link unstable");
                    self.record(&snapshot);
                }
                Phase::Unstable => {
                    state.unstable_ticks = state.unstable_ticks.saturating_add(1);
                    if state.unstable_ticks >= self.config.unstable_grace_ticks {
                        let remote = state.linked_id;
                        state.close_locally();
                        let snapshot = state.clone();
                        self.record(&snapshot);
                        ctx.hooks.teardown_link(id);
                        if let Some(remote) = remote {
                            self.close_remote(ctx, remote, id);
                        }
                        info!(endpoint = %id, remote = ?remote, "unstable link collapsed");
                    }
                }
                _ => {}
            }
        }
    }
}

fn rollback(endpoints: &mut EndpointArena, source: EndpointId) {
    if let Some(state) = endpoints.get_loaded_mut(source) {
        if state.phase == Phase::Opening {
            state.transition(Phase::Idle);
        }
    }
}
