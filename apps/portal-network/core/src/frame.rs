//! Structural validation of the ring of frame blocks around an anchor.
//!
//! The validator is a pure function of the block view: it never mutates, and
//! "no frame" is reported as `None` rather than as an error.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::{BlockPos, ResourceId};
use crate::world::BlockView;

pub const DEFAULT_SCAN_RADIUS: u32 = 8;

/// Axis a frame plane is normal to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    /// Order in which planes are tried: upright frames first.
    pub const SCAN_ORDER: [Axis; 3] = [Axis::Z, Axis::X, Axis::Y];

    /// In-plane `(u, v)` axes for a plane normal to `self`.
    pub fn plane_basis(self) -> (Axis, Axis) {
        match self {
            Axis::Z => (Axis::X, Axis::Y),
            Axis::X => (Axis::Z, Axis::Y),
            Axis::Y => (Axis::X, Axis::Z),
        }
    }
}

/// `None` when the step leaves the `i32` coordinate range.
fn offset(pos: BlockPos, axis: Axis, delta: i32) -> Option<BlockPos> {
    Some(match axis {
        Axis::X => BlockPos::new(pos.x.checked_add(delta)?, pos.y, pos.z),
        Axis::Y => BlockPos::new(pos.x, pos.y.checked_add(delta)?, pos.z),
        Axis::Z => BlockPos::new(pos.x, pos.y, pos.z.checked_add(delta)?),
    })
}

fn offset2(pos: BlockPos, (u, du): (Axis, i32), (v, dv): (Axis, i32)) -> Option<BlockPos> {
    offset(offset(pos, u, du)?, v, dv)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRules {
    pub radius: u32,
    pub min_interior_width: u32,
    pub min_interior_height: u32,
}

impl Default for FrameRules {
    fn default() -> Self {
        Self {
            radius: DEFAULT_SCAN_RADIUS,
            min_interior_width: 1,
            min_interior_height: 1,
        }
    }
}

/// Inclusive box covering the interior of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InteriorRect {
    pub min: BlockPos,
    pub max: BlockPos,
}

impl InteriorRect {
    pub fn contains(&self, pos: &BlockPos) -> bool {
        (self.min.x..=self.max.x).contains(&pos.x)
            && (self.min.y..=self.max.y).contains(&pos.y)
            && (self.min.z..=self.max.z).contains(&pos.z)
    }

    pub fn positions(&self) -> impl Iterator<Item = BlockPos> + '_ {
        (self.min.x..=self.max.x).flat_map(move |x| {
            (self.min.y..=self.max.y)
                .flat_map(move |y| (self.min.z..=self.max.z).map(move |z| BlockPos::new(x, y, z)))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMatch {
    pub axis: Axis,
    pub boundary: BTreeSet<BlockPos>,
    pub interior: InteriorRect,
}

impl FrameMatch {
    pub fn interior_width(&self) -> u32 {
        let (u, _) = self.axis.plane_basis();
        span(&self.interior, u)
    }

    pub fn interior_height(&self) -> u32 {
        let (_, v) = self.axis.plane_basis();
        span(&self.interior, v)
    }
}

fn span(rect: &InteriorRect, axis: Axis) -> u32 {
    let (lo, hi) = match axis {
        Axis::X => (rect.min.x, rect.max.x),
        Axis::Y => (rect.min.y, rect.max.y),
        Axis::Z => (rect.min.z, rect.max.z),
    };
    hi.abs_diff(lo) + 1
}

/// Finds a complete frame enclosing `anchor`, trying each plane in
/// [`Axis::SCAN_ORDER`].
pub fn validate<V: BlockView + ?Sized>(
    view: &V,
    dimension: &ResourceId,
    anchor: BlockPos,
    rules: &FrameRules,
) -> Option<FrameMatch> {
    Axis::SCAN_ORDER
        .into_iter()
        .find_map(|axis| match_plane(view, dimension, anchor, axis, rules))
}

fn match_plane<V: BlockView + ?Sized>(
    view: &V,
    dimension: &ResourceId,
    anchor: BlockPos,
    axis: Axis,
    rules: &FrameRules,
) -> Option<FrameMatch> {
    let (u, v) = axis.plane_basis();
    let radius = i32::try_from(rules.radius).ok()?;

    let probe = |along: Axis, step: i32| -> Option<i32> {
        (1..=radius).find(|d| {
            offset(anchor, along, d * step).is_some_and(|pos| view.is_frame_block(dimension, pos))
        })
    };
    let left = probe(u, -1)?;
    let right = probe(u, 1)?;
    let down = probe(v, -1)?;
    let up = probe(v, 1)?;

    let width = (left + right - 1) as u32;
    let height = (down + up - 1) as u32;
    if width < rules.min_interior_width || height < rules.min_interior_height {
        return None;
    }

    let mut boundary = BTreeSet::new();
    for du in -left..=right {
        for dv in -down..=up {
            let pos = offset2(anchor, (u, du), (v, dv))?;
            let on_edge = du == -left || du == right || dv == -down || dv == up;
            let is_frame = view.is_frame_block(dimension, pos);
            if on_edge != is_frame {
                return None;
            }
            if on_edge {
                boundary.insert(pos);
            }
        }
    }

    let corner_a = offset2(anchor, (u, 1 - left), (v, 1 - down))?;
    let corner_b = offset2(anchor, (u, right - 1), (v, up - 1))?;
    let interior = InteriorRect {
        min: BlockPos::new(
            corner_a.x.min(corner_b.x),
            corner_a.y.min(corner_b.y),
            corner_a.z.min(corner_b.z),
        ),
        max: BlockPos::new(
            corner_a.x.max(corner_b.x),
            corner_a.y.max(corner_b.y),
            corner_a.z.max(corner_b.z),
        ),
    };

    Some(FrameMatch {
        axis,
        boundary,
        interior,
    })
}

/// Places a rectangular ring of frame blocks around `anchor` on the plane
/// normal to `axis`. `left/right/down/up` are distances from the anchor to
/// the ring. Positions outside the coordinate range are skipped. Used by
/// tests and the demo world.
pub fn ring_positions(
    anchor: BlockPos,
    axis: Axis,
    left: i32,
    right: i32,
    down: i32,
    up: i32,
) -> Vec<BlockPos> {
    let (u, v) = axis.plane_basis();
    let mut out = Vec::new();
    for du in -left..=right {
        for dv in -down..=up {
            if du == -left || du == right || dv == -down || dv == up {
                out.extend(offset2(anchor, (u, du), (v, dv)));
            }
        }
    }
    out
}
