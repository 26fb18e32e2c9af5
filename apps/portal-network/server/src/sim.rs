//! The simulated world owned by the authoritative loop.
//!
//! [`Simulation`] bundles the block grid, energy balances, endpoint registry
//! and states, keyboard bindings and the coordinator. Everything here is
//! synchronous and single-owner; the runtime hands requests in one at a time.

use std::path::{Path, PathBuf};

use portal_network_core::frame::ring_positions;
use portal_network_core::persist::{self, read_json, write_json_atomic, PersistError};
use portal_network_core::{
    Axis, BlockKind, BlockPos, ConnectError, Coordinator, CoordinatorConfig, CoordinatorContext,
    DisconnectError, EndpointArena, EndpointId, EndpointRecord, EndpointRegistry, EndpointState,
    EnergyLedger, GridWorld, LinkHooks, NewEndpoint, RegistryError,
    RegistryStore, ResourceId, StatusChange, World,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const WORLD_STATE_FILE_NAME: &str = "world_state.json";
const WORLD_STATE_VERSION: u32 = 1;

/// Link notifications rendered as log lines.
#[derive(Debug, Default)]
pub struct TracingHooks;

impl LinkHooks for TracingHooks {
    fn materialize_link(&mut self, a: EndpointId, b: EndpointId) {
        info!(endpoint = %a, remote = %b, "link field materialized");
    }

    fn teardown_link(&mut self, endpoint: EndpointId) {
        info!(endpoint = %endpoint, "link field torn down");
    }

    fn connection_failed(&mut self, source: EndpointId, reason: &ConnectError) {
        debug!(endpoint = %source, reason = %reason, "failure cue");
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WorldStateFile {
    version: u32,
    saved_at: i64,
    world: GridWorld,
    energy: EnergyLedger,
    endpoints: EndpointArena,
    devices: crate::devices::DeviceBindings,
}

pub struct Simulation {
    world: GridWorld,
    energy: EnergyLedger,
    registry: EndpointRegistry,
    endpoints: EndpointArena,
    devices: crate::devices::DeviceBindings,
    coordinator: Coordinator,
    hooks: TracingHooks,
    store: RegistryStore,
    state_path: PathBuf,
}

impl Simulation {
    /// An empty world with the three vanilla dimensions, saved under
    /// `world_dir`.
    pub fn empty(world_dir: &Path, config: CoordinatorConfig) -> Self {
        let mut world = GridWorld::new();
        for dimension in [ResourceId::overworld(), ResourceId::nether(), ResourceId::end()] {
            world.add_dimension(dimension);
        }
        Self {
            world,
            energy: EnergyLedger::new(),
            registry: EndpointRegistry::new(),
            endpoints: EndpointArena::new(),
            devices: Default::default(),
            coordinator: Coordinator::new(config),
            hooks: TracingHooks,
            store: RegistryStore::in_dir(world_dir),
            state_path: world_dir.join(WORLD_STATE_FILE_NAME),
        }
    }

    /// Loads both files from `world_dir`. Unreadable files are quarantined
    /// and replaced by empty state.
    pub fn open(world_dir: &Path, config: CoordinatorConfig) -> Self {
        let mut sim = Self::empty(world_dir, config);
        sim.registry = sim.store.load();

        match read_world_state(&sim.state_path) {
            Ok(Some(state)) => {
                sim.world = state.world;
                sim.energy = state.energy;
                sim.endpoints = state.endpoints;
                sim.devices = state.devices;
            }
            Ok(None) => {}
            Err(err) => persist::recover_from_load_failure(&sim.state_path, &err),
        }
        sim.reconcile();
        info!(
            world_dir = %world_dir.display(),
            endpoints = sim.registry.len(),
            "simulation loaded"
        );
        sim
    }

    /// Pairs states with registry rows after a load, then marks endpoints in
    /// loaded chunks reachable (which heals stale links).
    fn reconcile(&mut self) {
        for id in self.endpoints.ids() {
            if !self.registry.contains(id) {
                warn!(endpoint = %id, "dropping state without registry entry");
                self.endpoints.remove(id);
            }
        }
        let records: Vec<(EndpointId, ResourceId, BlockPos)> = self
            .registry
            .iter()
            .map(|r| (r.id, r.dimension.clone(), r.position))
            .collect();
        for (id, dimension, position) in records {
            if !self.endpoints.contains(id) {
                self.endpoints.insert(EndpointState::idle(id), false);
            }
            if self.world.is_loaded(&dimension, position) {
                self.with_ctx(|coordinator, ctx| coordinator.endpoint_loaded(ctx, id));
            }
        }
    }

    pub fn with_ctx<R>(
        &mut self,
        f: impl FnOnce(&mut Coordinator, &mut CoordinatorContext<'_>) -> R,
    ) -> R {
        let mut ctx = CoordinatorContext {
            registry: &mut self.registry,
            endpoints: &mut self.endpoints,
            world: &mut self.world,
            energy: &mut self.energy,
            hooks: &mut self.hooks,
        };
        f(&mut self.coordinator, &mut ctx)
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn world(&self) -> &GridWorld {
        &self.world
    }

    pub fn energy(&self) -> &EnergyLedger {
        &self.energy
    }

    pub fn endpoint_state(&self, id: EndpointId) -> Option<&EndpointState> {
        self.endpoints.get(id)
    }

    pub fn devices(&self) -> &crate::devices::DeviceBindings {
        &self.devices
    }

    pub fn place_anchor(
        &mut self,
        dimension: ResourceId,
        position: BlockPos,
        name: &str,
        activation_cost: u64,
    ) -> Result<EndpointId, RegistryError> {
        if let Some(existing) = self.registry.find_at(&dimension, position) {
            return Err(RegistryError::DuplicateLocation {
                dimension: existing.dimension.clone(),
                position,
            });
        }
        self.world.load_chunk_at(&dimension, position);
        self.world.set_block(&dimension, position, BlockKind::Anchor);
        let endpoint = NewEndpoint::new(dimension, position, activation_cost).named(name);
        self.with_ctx(|coordinator, ctx| coordinator.anchor_placed(ctx, endpoint))
    }

    pub fn remove_anchor(
        &mut self,
        dimension: &ResourceId,
        position: BlockPos,
    ) -> Option<EndpointRecord> {
        let id = self.registry.find_at(dimension, position)?.id;
        let record = self.with_ctx(|coordinator, ctx| coordinator.anchor_removed(ctx, id));
        self.world.clear_block(dimension, position);
        self.energy.remove(id);
        self.devices.forget_endpoint(id);
        record
    }

    /// Lays a rectangular frame around `anchor` on the plane normal to `axis`.
    pub fn build_frame(
        &mut self,
        dimension: &ResourceId,
        anchor: BlockPos,
        axis: Axis,
        half_width: i32,
        height: i32,
    ) {
        for pos in ring_positions(anchor, axis, half_width, half_width, 1, height) {
            self.world.set_block(dimension, pos, BlockKind::Frame);
        }
        self.with_ctx(|coordinator, ctx| coordinator.notify_block_changed(ctx, dimension, anchor));
    }

    pub fn break_block(&mut self, dimension: &ResourceId, position: BlockPos) {
        if self.registry.find_at(dimension, position).is_some() {
            self.remove_anchor(dimension, position);
            return;
        }
        self.world.clear_block(dimension, position);
        self.with_ctx(|coordinator, ctx| {
            coordinator.notify_block_changed(ctx, dimension, position)
        });
    }

    /// Places a keyboard, bound to `serves` when given.
    pub fn place_keyboard(
        &mut self,
        dimension: ResourceId,
        position: BlockPos,
        serves: Option<EndpointId>,
    ) {
        self.world.set_block(&dimension, position, BlockKind::Keyboard);
        match serves {
            Some(endpoint) => self.devices.bind(dimension, position, endpoint),
            None => {
                self.devices.unbind(&dimension, position);
            }
        }
    }

    pub fn set_energy(&mut self, endpoint: EndpointId, amount: u64) {
        self.energy.set_balance(endpoint, amount);
    }

    /// Loads the chunk holding `position` and every endpoint inside it.
    pub fn load_chunk(&mut self, dimension: &ResourceId, position: BlockPos) {
        self.world.load_chunk_at(dimension, position);
        for id in self.endpoints_in_chunk(dimension, position) {
            self.with_ctx(|coordinator, ctx| coordinator.endpoint_loaded(ctx, id));
        }
    }

    pub fn unload_chunk(&mut self, dimension: &ResourceId, position: BlockPos) {
        self.world.unload_chunk_at(dimension, position);
        for id in self.endpoints_in_chunk(dimension, position) {
            self.with_ctx(|coordinator, ctx| coordinator.endpoint_unloaded(ctx, id));
        }
    }

    fn endpoints_in_chunk(&self, dimension: &ResourceId, position: BlockPos) -> Vec<EndpointId> {
        let chunk = position.chunk();
        self.registry
            .iter()
            .filter(|r| &r.dimension == dimension && r.position.chunk() == chunk)
            .map(|r| r.id)
            .collect()
    }

    pub fn resolve_device(
        &mut self,
        dimension: &ResourceId,
        device: BlockPos,
        scan_radius: u32,
    ) -> Option<EndpointId> {
        self.devices
            .resolve(&self.registry, dimension, device, scan_radius)
    }

    pub fn connect(&mut self, source: EndpointId, target: EndpointId) -> Result<(), ConnectError> {
        self.with_ctx(|coordinator, ctx| coordinator.open_both_sides(ctx, source, target))
    }

    pub fn disconnect(&mut self, endpoint: EndpointId) -> Result<(), DisconnectError> {
        self.with_ctx(|coordinator, ctx| coordinator.force_close_one_side(ctx, endpoint))
    }

    pub fn rename(&mut self, endpoint: EndpointId, name: &str) -> Result<String, RegistryError> {
        self.registry.rename(endpoint, name)
    }

    pub fn tick(&mut self) {
        self.with_ctx(|coordinator, ctx| coordinator.tick(ctx));
    }

    pub fn current_tick(&self) -> u64 {
        self.coordinator.current_tick()
    }

    pub fn drain_changes(&mut self) -> Vec<StatusChange> {
        self.coordinator.drain_changes()
    }

    /// Writes the registry and the world state. Runs between ticks only.
    pub fn save(&mut self) -> Result<(), PersistError> {
        self.store.save(&mut self.registry)?;
        let file = WorldStateFileRef {
            version: WORLD_STATE_VERSION,
            saved_at: persist::unix_now(),
            world: &self.world,
            energy: &self.energy,
            endpoints: &self.endpoints,
            devices: &self.devices,
        };
        write_json_atomic(&self.state_path, &file)?;
        debug!(path = %self.state_path.display(), "world state saved");
        Ok(())
    }

    /// Builds the two-endpoint demo: an overworld gate with enough energy
    /// for one jump and a nether gate, each with a bound keyboard.
    pub fn seed_demo(&mut self) -> Result<(EndpointId, EndpointId), RegistryError> {
        let overworld = ResourceId::overworld();
        let nether = ResourceId::nether();

        let home_pos = BlockPos::new(10, 64, 10);
        let home = self.place_anchor(overworld.clone(), home_pos, "Overworld Gate", 50)?;
        self.build_frame(&overworld, home_pos, Axis::Z, 2, 3);
        self.set_energy(home, 50);
        self.place_keyboard(overworld, BlockPos::new(10, 64, 12), Some(home));

        let hub_pos = BlockPos::new(5, 32, 5);
        let hub = self.place_anchor(nether.clone(), hub_pos, "Nether Hub", 50)?;
        self.build_frame(&nether, hub_pos, Axis::Z, 2, 3);
        self.place_keyboard(nether, BlockPos::new(5, 32, 7), Some(hub));

        Ok((home, hub))
    }
}

#[derive(Serialize)]
struct WorldStateFileRef<'a> {
    version: u32,
    saved_at: i64,
    world: &'a GridWorld,
    energy: &'a EnergyLedger,
    endpoints: &'a EndpointArena,
    devices: &'a crate::devices::DeviceBindings,
}

fn read_world_state(path: &Path) -> Result<Option<WorldStateFile>, PersistError> {
    let Some(state) = read_json::<WorldStateFile>(path)? else {
        return Ok(None);
    };
    if state.version != WORLD_STATE_VERSION {
        return Err(PersistError::UnsupportedVersion {
            path: path.to_path_buf(),
            found: state.version,
        });
    }
    Ok(Some(state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_network_core::Phase;
    use std::fs;
    use uuid::Uuid;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("portal-sim-{}", Uuid::new_v4()));
            fs::create_dir_all(&dir).expect("create temp dir");
            Self(dir)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn phase(sim: &Simulation, id: EndpointId) -> Phase {
        sim.endpoint_state(id).expect("state").phase
    }

    #[test_timeout::timeout]
    fn active_link_survives_save_and_reopen() {
        let dir = TempDir::new();
        let mut sim = Simulation::empty(&dir.0, CoordinatorConfig::default());
        let (home, hub) = sim.seed_demo().expect("seed");
        sim.connect(home, hub).expect("connect");
        sim.save().expect("save");

        let reopened = Simulation::open(&dir.0, CoordinatorConfig::default());
        assert_eq!(reopened.registry().len(), 2);
        assert_eq!(phase(&reopened, home), Phase::Active);
        assert_eq!(phase(&reopened, hub), Phase::Active);
        assert_eq!(
            reopened.endpoint_state(hub).and_then(|s| s.linked_id),
            Some(home)
        );
        assert_eq!(reopened.devices().len(), 2);
    }

    #[test_timeout::timeout]
    fn unloaded_remote_heals_when_its_chunk_loads() {
        let dir = TempDir::new();
        let mut sim = Simulation::empty(&dir.0, CoordinatorConfig::default());
        let (home, hub) = sim.seed_demo().expect("seed");
        sim.connect(home, hub).expect("connect");

        let nether = ResourceId::nether();
        let hub_pos = BlockPos::new(5, 32, 5);
        sim.unload_chunk(&nether, hub_pos);
        sim.disconnect(home).expect("disconnect");
        assert_eq!(phase(&sim, home), Phase::Idle);
        assert_eq!(phase(&sim, hub), Phase::Active);

        sim.load_chunk(&nether, hub_pos);
        let hub_state = sim.endpoint_state(hub).expect("state");
        assert_eq!(hub_state.phase, Phase::Idle);
        assert_eq!(hub_state.linked_id, None);
    }

    #[test_timeout::timeout]
    fn corrupt_world_state_is_set_aside() {
        let dir = TempDir::new();
        let mut sim = Simulation::empty(&dir.0, CoordinatorConfig::default());
        sim.seed_demo().expect("seed");
        sim.save().expect("save");
        fs::write(dir.0.join(WORLD_STATE_FILE_NAME), b"{ not json").expect("corrupt");

        let reopened = Simulation::open(&dir.0, CoordinatorConfig::default());
        assert_eq!(reopened.registry().len(), 2);
        let quarantined = fs::read_dir(&dir.0)
            .expect("list")
            .filter_map(Result::ok)
            .any(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("world_state.json.corrupt-")
            });
        assert!(quarantined);
        // States are rebuilt idle for every registered endpoint.
        for record in reopened.registry().iter() {
            assert_eq!(phase(&reopened, record.id), Phase::Idle);
        }
    }

    #[test_timeout::timeout]
    fn removing_an_anchor_forgets_its_keyboard() {
        let dir = TempDir::new();
        let mut sim = Simulation::empty(&dir.0, CoordinatorConfig::default());
        let (home, hub) = sim.seed_demo().expect("seed");
        sim.connect(home, hub).expect("connect");

        sim.break_block(&ResourceId::overworld(), BlockPos::new(10, 64, 10));
        assert!(!sim.registry().contains(home));
        assert_eq!(phase(&sim, hub), Phase::Idle);
        assert_eq!(sim.devices().len(), 1);
        assert_eq!(
            sim.world().block(&ResourceId::overworld(), BlockPos::new(10, 64, 10)),
            None
        );
    }
}
