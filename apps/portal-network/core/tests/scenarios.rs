use portal_network_core::frame::ring_positions;
use portal_network_core::{
    Axis, BlockKind, BlockPos, ConnectError, Coordinator, CoordinatorConfig, CoordinatorContext,
    EndpointArena, EndpointId, EndpointRegistry, EnergyLedger, EnergyProvider, GridWorld,
    LinkEvent, NewEndpoint, Phase, RecordingHooks, ResourceId,
};

struct Harness {
    registry: EndpointRegistry,
    endpoints: EndpointArena,
    world: GridWorld,
    energy: EnergyLedger,
    hooks: RecordingHooks,
    coordinator: Coordinator,
}

impl Harness {
    fn new() -> Self {
        let mut world = GridWorld::new();
        world.add_dimension(ResourceId::overworld());
        world.add_dimension(ResourceId::nether());
        Self {
            registry: EndpointRegistry::new(),
            endpoints: EndpointArena::new(),
            world,
            energy: EnergyLedger::new(),
            hooks: RecordingHooks::new(),
            coordinator: Coordinator::new(CoordinatorConfig::default()),
        }
    }

    fn with<R>(&mut self, f: impl FnOnce(&mut Coordinator, &mut CoordinatorContext<'_>) -> R) -> R {
        let mut ctx = CoordinatorContext {
            registry: &mut self.registry,
            endpoints: &mut self.endpoints,
            world: &mut self.world,
            energy: &mut self.energy,
            hooks: &mut self.hooks,
        };
        f(&mut self.coordinator, &mut ctx)
    }

    fn framed_endpoint(&mut self, dimension: ResourceId, pos: BlockPos, cost: u64) -> EndpointId {
        self.world.load_chunk_at(&dimension, pos);
        self.world.set_block(&dimension, pos, BlockKind::Anchor);
        for frame in ring_positions(pos, Axis::Z, 1, 1, 1, 2) {
            self.world.set_block(&dimension, frame, BlockKind::Frame);
        }
        self.with(|c, ctx| c.anchor_placed(ctx, NewEndpoint::new(dimension, pos, cost)))
            .expect("anchor placed")
    }

    fn phase(&self, id: EndpointId) -> Phase {
        self.endpoints.get(id).map(|s| s.phase).unwrap_or_default()
    }

    fn linked(&self, id: EndpointId) -> Option<EndpointId> {
        self.endpoints.get(id).and_then(|s| s.linked_id)
    }

    /// Every linked endpoint's partner points back at it.
    fn assert_symmetric(&self) {
        for id in self.endpoints.ids() {
            let Some(state) = self.endpoints.get(id) else {
                continue;
            };
            if !state.phase.is_linked() {
                continue;
            }
            let remote = state.linked_id.expect("linked phase without partner");
            let other = self.endpoints.get(remote).expect("partner state");
            assert!(other.phase.is_linked(), "{remote} not linked back");
            assert_eq!(other.linked_id, Some(id));
        }
    }
}

fn scenario_pair(source_energy: u64) -> (Harness, EndpointId, EndpointId) {
    let mut h = Harness::new();
    let p1 = h.framed_endpoint(ResourceId::overworld(), BlockPos::new(10, 64, 10), 50);
    let p2 = h.framed_endpoint(ResourceId::nether(), BlockPos::new(5, 32, 5), 50);
    h.energy.set_balance(p1, source_energy);
    (h, p1, p2)
}

#[test_timeout::timeout]
fn scenario_a_links_both_sides_and_debits_source() {
    let (mut h, p1, p2) = scenario_pair(50);

    h.with(|c, ctx| c.open_both_sides(ctx, p1, p2)).expect("open");

    assert_eq!(h.phase(p1), Phase::Active);
    assert_eq!(h.linked(p1), Some(p2));
    assert_eq!(h.phase(p2), Phase::Active);
    assert_eq!(h.linked(p2), Some(p1));
    assert_eq!(h.energy.available_energy(p1), 0);
    assert_eq!(h.hooks.take(), vec![LinkEvent::Materialized(p1, p2)]);
    h.assert_symmetric();

    let changes = h.coordinator.drain_changes();
    assert_eq!(changes.len(), 2);
    assert!(changes.iter().all(|change| change.phase == Phase::Active));
}

#[test_timeout::timeout]
fn scenario_b_insufficient_energy_changes_nothing() {
    let (mut h, p1, p2) = scenario_pair(10);

    let err = h.with(|c, ctx| c.open_both_sides(ctx, p1, p2)).unwrap_err();
    assert_eq!(
        err,
        ConnectError::InsufficientEnergy {
            required: 50,
            available: 10
        }
    );
    assert_eq!(h.phase(p1), Phase::Idle);
    assert_eq!(h.phase(p2), Phase::Idle);
    assert_eq!(h.linked(p1), None);
    assert_eq!(h.linked(p2), None);
    assert_eq!(h.energy.available_energy(p1), 10);
    assert!(h.coordinator.drain_changes().is_empty());
}

#[test_timeout::timeout]
fn scenario_c_close_one_side_heals_the_other() {
    let (mut h, p1, p2) = scenario_pair(50);
    h.with(|c, ctx| c.open_both_sides(ctx, p1, p2)).expect("open");

    // Remote loaded: closed eagerly.
    h.with(|c, ctx| c.force_close_one_side(ctx, p1)).expect("close");
    assert_eq!(h.phase(p1), Phase::Idle);
    assert_eq!(h.linked(p1), None);
    assert_eq!(h.phase(p2), Phase::Idle);
    assert_eq!(h.linked(p2), None);
    h.assert_symmetric();
}

#[test_timeout::timeout]
fn scenario_c_unreachable_remote_heals_on_next_interaction() {
    let (mut h, p1, p2) = scenario_pair(50);
    h.with(|c, ctx| c.open_both_sides(ctx, p1, p2)).expect("open");
    h.with(|c, ctx| c.endpoint_unloaded(ctx, p2));

    h.with(|c, ctx| c.force_close_one_side(ctx, p1)).expect("close");
    assert_eq!(h.phase(p1), Phase::Idle);
    assert_eq!(h.phase(p2), Phase::Active);

    // A fresh connect from the stale side heals it first.
    h.with(|c, ctx| c.endpoint_loaded(ctx, p2));
    assert_eq!(h.phase(p2), Phase::Idle);
    assert_eq!(h.linked(p2), None);
    h.assert_symmetric();
}

#[test_timeout::timeout]
fn scenario_d_unknown_target_mutates_nothing() {
    let (mut h, p1, _p2) = scenario_pair(50);
    let ghost = EndpointId::generate();

    let err = h.with(|c, ctx| c.open_both_sides(ctx, p1, ghost)).unwrap_err();
    assert_eq!(err, ConnectError::TargetNotFound(ghost));
    assert_eq!(h.phase(p1), Phase::Idle);
    assert_eq!(h.energy.available_energy(p1), 50);
    assert_eq!(
        h.hooks.take(),
        vec![LinkEvent::Failed(p1, ConnectError::TargetNotFound(ghost))]
    );
}

#[test_timeout::timeout]
fn duplicate_request_while_opening_yields_one_pair() {
    let (mut h, p1, p2) = scenario_pair(100);

    let first = h.with(|c, ctx| c.begin_open(ctx, p1, p2)).expect("first begin");
    let second = h.with(|c, ctx| c.begin_open(ctx, p1, p2));
    assert_eq!(second, Err(ConnectError::AlreadyConnecting(p1)));

    h.with(|c, ctx| c.complete_open(ctx, first)).expect("complete");
    let third = h.with(|c, ctx| c.open_both_sides(ctx, p1, p2));
    assert_eq!(third, Err(ConnectError::AlreadyConnecting(p1)));

    let active = h
        .endpoints
        .ids()
        .into_iter()
        .filter(|id| h.phase(*id) == Phase::Active)
        .count();
    assert_eq!(active, 2);
    assert_eq!(h.energy.available_energy(p1), 50);
    h.assert_symmetric();
}

#[test_timeout::timeout]
fn symmetry_holds_across_a_busy_network() {
    let mut h = Harness::new();
    let ids: Vec<_> = (0..6)
        .map(|i| {
            let id = h.framed_endpoint(ResourceId::overworld(), BlockPos::new(i * 20, 64, 0), 5);
            h.energy.set_balance(id, 1_000);
            id
        })
        .collect();

    let attempts = [(0, 1), (2, 1), (1, 0), (2, 3), (4, 3), (4, 5), (5, 4), (0, 5)];
    for (a, b) in attempts {
        let _ = h.with(|c, ctx| c.open_both_sides(ctx, ids[a], ids[b]));
        h.assert_symmetric();
    }
    h.with(|c, ctx| c.force_close_one_side(ctx, ids[3])).expect("close");
    h.assert_symmetric();
    h.with(|c, ctx| c.anchor_removed(ctx, ids[4]));
    h.assert_symmetric();
    for _ in 0..25 {
        h.with(|c, ctx| c.tick(ctx));
        h.assert_symmetric();
    }

    assert_eq!(h.linked(ids[0]), Some(ids[1]));
    assert_eq!(h.phase(ids[2]), Phase::Idle);
    assert_eq!(h.phase(ids[5]), Phase::Idle);
}
