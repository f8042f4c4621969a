// game.rs — interfaces visible to the engine shell (loader, renderer, camera)

use myrift_common::cgrid::CellInit;
use myrift_common::r_shared::Footprint;

use crate::g_anim::AnimTable;
use crate::g_local::EntityFlags;

/// Everything the resource loader hands over for one level, already
/// decoded from whatever on-disk form it keeps: initial grid data,
/// the two read-only bytecode buffers, animation tables, and entity
/// placements.
#[derive(Debug, Default, Clone)]
pub struct LevelData {
    pub cells: Vec<CellInit>,
    pub cond: Vec<u8>,
    pub stmt: Vec<u8>,
    pub anims: Vec<AnimTable>,
    pub placements: Vec<Placement>,
}

/// One entity to spawn at level start.
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub yaw: i32,
    pub kind: u8,
    pub flags: EntityFlags,
    pub channels: u16,
    pub footprint: Footprint,
    pub anim_table: i32,
    pub anim_seq: i32,
    /// Parent entity key, -1 = the world root.
    pub parent: i32,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            z: 0,
            yaw: 0,
            kind: 0,
            flags: EntityFlags::SOLID,
            channels: 1,
            footprint: Footprint::square(16),
            anim_table: 0,
            anim_seq: 0,
            parent: -1,
        }
    }
}

/// One renderer draw-list entry: an entity touched by the culling
/// pass, with its resolved world-space pose for mesh placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawEntry {
    pub key: i32,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub yaw: i32,
    pub model_frame: u16,
}

/// Camera pose used by the view pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct CamPose {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub yaw: i32,
    pub pitch: i32,
}
