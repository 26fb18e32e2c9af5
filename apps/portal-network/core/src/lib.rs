//! Shared primitives for the portal network: endpoint identity, the per-world
//! registry, frame validation and the connection coordinator.
//!
//! Everything in this crate is synchronous. The owning process is expected to
//! drive it from a single authoritative loop and to pass the world-scoped
//! services in explicitly through [`CoordinatorContext`].

pub mod coordinator;
pub mod endpoint;
pub mod energy;
pub mod frame;
pub mod hooks;
pub mod ids;
pub mod persist;
pub mod registry;
pub mod world;

pub use coordinator::{
    ConnectError, Coordinator, CoordinatorConfig, CoordinatorContext, DisconnectError,
    PendingOpen, Side, StatusChange,
};
pub use endpoint::{EndpointArena, EndpointState, Phase};
pub use energy::{EnergyError, EnergyLedger, EnergyProvider};
pub use frame::{validate, Axis, FrameMatch, FrameRules, InteriorRect};
pub use hooks::{LinkEvent, LinkHooks, NoopHooks, RecordingHooks};
pub use ids::{BlockPos, EndpointId, IdError, ResourceId};
pub use persist::{PersistError, RegistryStore};
pub use registry::{EndpointRecord, EndpointRegistry, NewEndpoint, RegistryError};
pub use world::{BlockKind, BlockView, GridWorld, World};
