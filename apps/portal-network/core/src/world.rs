use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::ids::{BlockPos, ResourceId};

/// Read-only block access used by the frame validator.
pub trait BlockView {
    /// True when the block at `pos` is valid frame material.
    fn is_frame_block(&self, dimension: &ResourceId, pos: BlockPos) -> bool;
}

/// The host world as seen by the coordinator.
pub trait World: BlockView {
    fn is_loaded(&self, dimension: &ResourceId, pos: BlockPos) -> bool;

    /// Makes the region around `pos` available within the current step.
    /// Returns `false` when that cannot be done synchronously.
    fn force_load(&mut self, dimension: &ResourceId, pos: BlockPos) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Frame,
    Anchor,
    Keyboard,
    Solid,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DimensionGrid {
    #[serde(with = "block_entries")]
    blocks: HashMap<BlockPos, BlockKind>,
    loaded_chunks: BTreeSet<(i32, i32)>,
    /// Dimensions that refuse synchronous force-loading.
    #[serde(default)]
    frozen: bool,
}

/// In-memory block grid implementing [`World`].
///
/// Unknown dimensions are treated as unloadable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridWorld {
    dimensions: BTreeMap<ResourceId, DimensionGrid>,
}

impl GridWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dimension(&mut self, dimension: ResourceId) {
        self.dimensions.entry(dimension).or_default();
    }

    pub fn has_dimension(&self, dimension: &ResourceId) -> bool {
        self.dimensions.contains_key(dimension)
    }

    pub fn set_block(&mut self, dimension: &ResourceId, pos: BlockPos, kind: BlockKind) {
        self.dimensions
            .entry(dimension.clone())
            .or_default()
            .blocks
            .insert(pos, kind);
    }

    pub fn clear_block(&mut self, dimension: &ResourceId, pos: BlockPos) -> Option<BlockKind> {
        self.dimensions.get_mut(dimension)?.blocks.remove(&pos)
    }

    pub fn block(&self, dimension: &ResourceId, pos: BlockPos) -> Option<BlockKind> {
        self.dimensions.get(dimension)?.blocks.get(&pos).copied()
    }

    pub fn load_chunk_at(&mut self, dimension: &ResourceId, pos: BlockPos) {
        self.dimensions
            .entry(dimension.clone())
            .or_default()
            .loaded_chunks
            .insert(pos.chunk());
    }

    pub fn unload_chunk_at(&mut self, dimension: &ResourceId, pos: BlockPos) -> bool {
        self.dimensions
            .get_mut(dimension)
            .map(|grid| grid.loaded_chunks.remove(&pos.chunk()))
            .unwrap_or(false)
    }

    pub fn set_frozen(&mut self, dimension: &ResourceId, frozen: bool) {
        self.dimensions.entry(dimension.clone()).or_default().frozen = frozen;
    }

    /// Positions of every block of `kind` in `dimension`, sorted.
    pub fn blocks_of(&self, dimension: &ResourceId, kind: BlockKind) -> Vec<BlockPos> {
        let mut found: Vec<BlockPos> = self
            .dimensions
            .get(dimension)
            .map(|grid| {
                grid.blocks
                    .iter()
                    .filter(|(_, k)| **k == kind)
                    .map(|(pos, _)| *pos)
                    .collect()
            })
            .unwrap_or_default();
        found.sort();
        found
    }
}

impl BlockView for GridWorld {
    fn is_frame_block(&self, dimension: &ResourceId, pos: BlockPos) -> bool {
        self.block(dimension, pos) == Some(BlockKind::Frame)
    }
}

impl World for GridWorld {
    fn is_loaded(&self, dimension: &ResourceId, pos: BlockPos) -> bool {
        self.dimensions
            .get(dimension)
            .map(|grid| grid.loaded_chunks.contains(&pos.chunk()))
            .unwrap_or(false)
    }

    fn force_load(&mut self, dimension: &ResourceId, pos: BlockPos) -> bool {
        match self.dimensions.get_mut(dimension) {
            Some(grid) if !grid.frozen => {
                grid.loaded_chunks.insert(pos.chunk());
                true
            }
            _ => false,
        }
    }
}

// JSON object keys must be strings, so blocks are stored as a list.
mod block_entries {
    use super::{BlockKind, BlockPos};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::HashMap;

    #[derive(Serialize, Deserialize)]
    struct Entry {
        pos: BlockPos,
        kind: BlockKind,
    }

    pub fn serialize<S: Serializer>(
        blocks: &HashMap<BlockPos, BlockKind>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut entries: Vec<Entry> = blocks
            .iter()
            .map(|(pos, kind)| Entry {
                pos: *pos,
                kind: *kind,
            })
            .collect();
        entries.sort_by_key(|entry| entry.pos);
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<BlockPos, BlockKind>, D::Error> {
        let entries = Vec::<Entry>::deserialize(deserializer)?;
        Ok(entries
            .into_iter()
            .map(|entry| (entry.pos, entry.kind))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn force_load_respects_frozen_and_unknown_dimensions() {
        let mut world = GridWorld::new();
        let nether = ResourceId::nether();
        let pos = BlockPos::new(5, 32, 5);

        assert!(!world.force_load(&nether, pos));

        world.add_dimension(nether.clone());
        assert!(!world.is_loaded(&nether, pos));
        assert!(world.force_load(&nether, pos));
        assert!(world.is_loaded(&nether, pos));

        world.unload_chunk_at(&nether, pos);
        world.set_frozen(&nether, true);
        assert!(!world.force_load(&nether, pos));
    }

    #[test_timeout::timeout]
    fn grid_round_trips_through_json() {
        let mut world = GridWorld::new();
        let overworld = ResourceId::overworld();
        world.set_block(&overworld, BlockPos::new(1, 2, 3), BlockKind::Frame);
        world.set_block(&overworld, BlockPos::new(1, 3, 3), BlockKind::Anchor);
        world.load_chunk_at(&overworld, BlockPos::new(1, 2, 3));

        let json = serde_json::to_string(&world).expect("serialize");
        let restored: GridWorld = serde_json::from_str(&json).expect("deserialize");
        assert!(restored.is_frame_block(&overworld, BlockPos::new(1, 2, 3)));
        assert_eq!(
            restored.block(&overworld, BlockPos::new(1, 3, 3)),
            Some(BlockKind::Anchor)
        );
        assert!(restored.is_loaded(&overworld, BlockPos::new(0, 0, 0)));
    }
}
