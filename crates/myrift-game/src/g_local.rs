// g_local.rs — local definitions for the game module

// Re-export the simulation-core foundations so game files can reach
// them via `use crate::g_local::*`.
pub use myrift_common::cgrid::{Cell, CellKind, Grid, WorldError};
pub use myrift_common::cworld::{Blocker, ColliderFlags, ScanOutcome, World, DOOR_CHANNELS};
pub use myrift_common::r_shared::{
    angle_diff, angle_from_delta, angle_norm, dist_approx, world_to_cell, Footprint,
    ANGLE_MASK, CELL_SHIFT, CELL_SIZE, FRAC_BITS, FRAC_ONE, GRID_SIZE,
};
pub use myrift_common::rayscan::{cast_ray, Ray, RayHit, RayHitKind, SightRay, TypedRay};
pub use myrift_common::sintab::{cos_fx, sin_fx};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::g_anim::{AnimCursor, AnimTable};
use crate::game::DrawEntry;
use crate::game_import::EngineImport;

// Entity arena size; keys are stable for the whole level.
pub const MAX_ENTITIES: usize = 512;

// Opcode-addressable register file sizes.
pub const NUM_SPECIAL: usize = 26;
pub const NUM_CUSTOM: usize = 12;

/// Re-evaluation passes allowed per entity per tick before the loop
/// guard forces it inert.
pub const MAX_SCRIPT_PASSES: u32 = 10;

// Engine-posted message codes.
pub const MSG_RAY_HIT: u16 = 1;

/// Script-cursor sentinel: the entity has no condition chain bound.
pub const NO_SCRIPT: u32 = u32::MAX;

// entity->flags
bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EntityFlags: u16 {
        // Capability predicates mirrored into the collision world.
        const SOLID          = 0x0001;
        const DECOR          = 0x0002;
        const IGNORE_TERRAIN = 0x0004;
        const DOOR_SENSITIVE = 0x0008;

        // Run-time state.
        /// Needs a script re-evaluation this tick.
        const TRIGGERED      = 0x0100;
        /// Forced inert by the loop guard; skipped until re-armed.
        const INERT          = 0x0200;
        /// Vanished (parked under the graveyard).
        const INACTIVE       = 0x0400;
    }
}

impl EntityFlags {
    /// The subset the collision engine cares about.
    pub fn collider_flags(self) -> ColliderFlags {
        ColliderFlags::from_bits_truncate(self.bits() & 0x000f)
    }
}

// ============================================================
// Pose
// ============================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pose {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub yaw: i32,
}

// ============================================================
// Messages
// ============================================================

/// Pending inter-entity message node; arena-allocated, singly linked,
/// newest first.
#[derive(Debug, Clone, Copy)]
pub struct Msg {
    pub sender: i32,
    pub code: u16,
    /// Ticks since posted (or last refreshed).
    pub age: u16,
    pub next: i32,
}

/// A message as seen by one script execution, after the drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainedMsg {
    pub sender: i32,
    pub code: u16,
    pub age: u16,
}

// ============================================================
// Entity
// ============================================================

#[derive(Debug, Clone)]
pub struct Entity {
    pub in_use: bool,
    pub key: i32,

    // Multi-way tree links; -1 = none.
    pub parent: i32,
    pub first_child: i32,
    pub next_sibling: i32,

    pub pose: Pose,
    /// Pose before the most recent committed move, for rollback.
    pub prev_pose: Pose,
    pub footprint: Footprint,

    pub flags: EntityFlags,
    /// Gameplay type, 0..16; typed queries match `1 << kind`.
    pub kind: u8,
    pub channels: u16,

    pub anim: AnimCursor,
    /// Script cursor: offset of the current condition chain.
    pub cond_off: u32,

    /// Pending message list head, -1 = none.
    pub msg_head: i32,

    // Opcode-addressable register files.
    pub special: [i32; NUM_SPECIAL],
    pub custom: [i32; NUM_CUSTOM],
}

impl Default for Entity {
    fn default() -> Self {
        Self {
            in_use: false,
            key: -1,
            parent: -1,
            first_child: -1,
            next_sibling: -1,
            pose: Pose::default(),
            prev_pose: Pose::default(),
            footprint: Footprint::default(),
            flags: EntityFlags::empty(),
            kind: 0,
            channels: 0,
            anim: AnimCursor::default(),
            cond_off: NO_SCRIPT,
            msg_head: -1,
            special: [0; NUM_SPECIAL],
            custom: [0; NUM_CUSTOM],
        }
    }
}

// ============================================================
// Deferred batches
// ============================================================

/// Structural edits requested mid-traversal, applied after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingChange {
    Reparent { ent: i32, parent: i32 },
    Vanish { ent: i32 },
}

// ============================================================
// Game context
// ============================================================

/// All level-lifetime simulation state. Threaded explicitly through
/// every game function; there are no module-level globals.
pub struct GameContext {
    pub world: World,
    pub ents: Vec<Entity>,

    // Message arena.
    pub msgs: Vec<Msg>,
    pub msg_free: i32,
    /// Messages drained for the script execution in progress.
    pub cur_msgs: Vec<DrainedMsg>,

    // Read-only script bytecode, owned by the resource loader.
    pub cond: Vec<u8>,
    pub stmt: Vec<u8>,
    pub anims: Vec<AnimTable>,

    pub tick: u32,
    /// Held input bits and this tick's rising edges.
    pub input: u8,
    pub input_edges: u8,

    /// Deferred structural edits (applied in phase 4).
    pub changed: Vec<PendingChange>,
    /// Entities whose presence must be recomputed (phase 5).
    pub colliding: Vec<i32>,

    // Renderer-facing output of the last view pass.
    pub draw_list: Vec<DrawEntry>,
    pub visible_cells: Vec<(i32, i32)>,

    pub rng: StdRng,
    pub imports: Box<dyn EngineImport>,

    pub root: i32,
    pub graveyard: i32,
}

impl GameContext {
    pub fn new(world: World, imports: Box<dyn EngineImport>) -> Self {
        Self {
            world,
            ents: Vec::new(),
            msgs: Vec::new(),
            msg_free: -1,
            cur_msgs: Vec::new(),
            cond: Vec::new(),
            stmt: Vec::new(),
            anims: Vec::new(),
            tick: 0,
            input: 0,
            input_edges: 0,
            changed: Vec::new(),
            colliding: Vec::new(),
            draw_list: Vec::new(),
            visible_cells: Vec::new(),
            rng: StdRng::seed_from_u64(0x7269_6674),
            imports,
            root: -1,
            graveyard: -1,
        }
    }

    /// Usable as a script target: spawned and not vanished.
    #[inline]
    pub fn is_live(&self, key: i32) -> bool {
        key >= 0
            && (key as usize) < self.ents.len()
            && self.ents[key as usize].in_use
            && !self.ents[key as usize].flags.contains(EntityFlags::INACTIVE)
    }

    /// Room id of the cell under an entity (0 when out of range).
    pub fn room_of(&self, key: i32) -> u8 {
        let ent = &self.ents[key as usize];
        self.world
            .grid
            .cell(world_to_cell(ent.pose.x), world_to_cell(ent.pose.z))
            .map(|c| c.room)
            .unwrap_or(0)
    }
}
