// cworld.rs — collision world: occupancy bookkeeping and shaped cell queries

use bitflags::bitflags;

use crate::cgrid::{Cell, Grid};
use crate::r_shared::{aabb_overlap, world_to_cell, Footprint};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ColliderFlags: u16 {
        /// Participates in movement blocking.
        const SOLID          = 0x0001;
        /// Decorative occupant: visible, never blocks anything.
        const DECOR          = 0x0002;
        /// Moves through solid terrain (ghosts, camera probes).
        const IGNORE_TERRAIN = 0x0004;
        /// Door-crossing participant: may not end a move in a door cell.
        const DOOR_SENSITIVE = 0x0008;
    }
}

/// Collision channels whose members are subject to the door-crossing
/// end-cell rejection.
pub const DOOR_CHANNELS: u16 = 0x0DF0;

/// Per-entity collision state. The collider table is indexed by the
/// entity's stable key; slots are allocated once per level and reused
/// only when the level is torn down.
#[derive(Debug, Clone)]
pub struct Collider {
    pub in_use: bool,
    pub x: i32,
    pub z: i32,
    pub footprint: Footprint,
    pub flags: ColliderFlags,
    pub channels: u16,
    /// Gameplay type, 0..16; typed queries match `1 << kind`.
    pub kind: u8,
    /// Head of this entity's occupancy record list, -1 = none.
    pub occ_head: i32,
    /// Scan-generation stamp, see `World::scan_rect`.
    pub scan_mark: u32,
}

impl Default for Collider {
    fn default() -> Self {
        Self {
            in_use: false,
            x: 0,
            z: 0,
            footprint: Footprint::default(),
            flags: ColliderFlags::empty(),
            channels: 0,
            kind: 0,
            occ_head: -1,
            scan_mark: 0,
        }
    }
}

/// Links one entity to one cell its footprint overlaps. Doubly linked
/// within the owning cell, singly linked within the owning entity so a
/// whole entity unlinks in O(k).
#[derive(Debug, Clone, Copy)]
struct OccRecord {
    /// Owning entity key, -1 = record is on the free list.
    ent: i32,
    /// Flat cell index.
    cell: i32,
    cell_prev: i32,
    cell_next: i32,
    ent_next: i32,
}

// ============================================================
// Query results
// ============================================================

/// What rejected a shaped query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Blocker {
    Terrain { cx: i32, cz: i32 },
    Entity(i32),
    Door { cx: i32, cz: i32 },
    /// The query touched a cell outside the grid; the whole query is
    /// rejected, never partially applied.
    OutOfBounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Clear,
    Blocked(Blocker),
}

impl ScanOutcome {
    #[inline]
    pub fn is_clear(self) -> bool {
        matches!(self, ScanOutcome::Clear)
    }
}

/// Verdict from a scan policy callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellVisit {
    Continue,
    Blocked(Blocker),
}

/// Inclusive cell-coordinate rectangle covered by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRect {
    pub x0: i32,
    pub z0: i32,
    pub x1: i32,
    pub z1: i32,
}

impl CellRect {
    /// The cells a world-space AABB overlaps. The max edge is treated as
    /// exclusive so a box ending exactly on a cell boundary does not
    /// claim the next cell.
    pub fn from_aabb(aabb: (i32, i32, i32, i32)) -> Self {
        let (x0, z0, x1, z1) = aabb;
        Self {
            x0: world_to_cell(x0),
            z0: world_to_cell(z0),
            x1: world_to_cell(x1.max(x0 + 1) - 1),
            z1: world_to_cell(z1.max(z0 + 1) - 1),
        }
    }
}

// ============================================================
// Scan policies
//
// One traversal, three protocols: presence collection (never
// rejects), movement validity, and typed movement validity.
// ============================================================

pub trait ScanPolicy {
    fn visit_cell(&mut self, cx: i32, cz: i32, cell: &Cell) -> CellVisit;

    fn visit_occupant(&mut self, _key: i32, _occ: &Collider) -> CellVisit {
        CellVisit::Continue
    }

    /// Policies that never look at occupants skip the list walk.
    fn wants_occupants(&self) -> bool {
        true
    }
}

/// Presence-only protocol: collects the covered cells for occupancy
/// (re)building and never rejects anything in range.
#[derive(Default)]
struct PresencePolicy {
    covered: Vec<(i32, i32)>,
}

impl ScanPolicy for PresencePolicy {
    fn visit_cell(&mut self, cx: i32, cz: i32, _cell: &Cell) -> CellVisit {
        self.covered.push((cx, cz));
        CellVisit::Continue
    }

    fn wants_occupants(&self) -> bool {
        false
    }
}

/// Movement-validity protocol; `type_mask` turns it into the typed
/// variant ("shots are blocked only by class X").
struct MovePolicy {
    mover: i32,
    aabb: (i32, i32, i32, i32),
    channels: u16,
    ignore_terrain: bool,
    type_mask: Option<u16>,
}

impl ScanPolicy for MovePolicy {
    fn visit_cell(&mut self, cx: i32, cz: i32, cell: &Cell) -> CellVisit {
        if cell.kind.blocks_move() && !self.ignore_terrain {
            CellVisit::Blocked(Blocker::Terrain { cx, cz })
        } else {
            CellVisit::Continue
        }
    }

    fn visit_occupant(&mut self, key: i32, occ: &Collider) -> CellVisit {
        if key == self.mover
            || !occ.flags.contains(ColliderFlags::SOLID)
            || occ.flags.contains(ColliderFlags::DECOR)
            || occ.channels & self.channels == 0
        {
            return CellVisit::Continue;
        }
        if let Some(mask) = self.type_mask {
            if (1u16 << (occ.kind & 15)) & mask == 0 {
                return CellVisit::Continue;
            }
        }
        if aabb_overlap(self.aabb, occ.footprint.aabb_at(occ.x, occ.z)) {
            CellVisit::Blocked(Blocker::Entity(key))
        } else {
            CellVisit::Continue
        }
    }
}

// ============================================================
// World
// ============================================================

pub struct World {
    pub grid: Grid,
    pub(crate) colliders: Vec<Collider>,
    occ: Vec<OccRecord>,
    occ_free: i32,
    pub(crate) scan_counter: u32,
    last_blocker: Option<Blocker>,
}

impl World {
    pub fn new(grid: Grid, max_ents: usize) -> Self {
        Self {
            grid,
            colliders: vec![Collider::default(); max_ents],
            occ: Vec::new(),
            occ_free: -1,
            scan_counter: 0,
            last_blocker: None,
        }
    }

    // ---- collider table ----

    /// Activate a collider slot for an entity. Presence is not
    /// registered here; callers follow up with `register_presence`.
    pub fn add_collider(
        &mut self,
        key: i32,
        x: i32,
        z: i32,
        footprint: Footprint,
        flags: ColliderFlags,
        channels: u16,
        kind: u8,
    ) {
        let col = &mut self.colliders[key as usize];
        debug_assert!(!col.in_use, "collider slot {} reused", key);
        *col = Collider {
            in_use: true,
            x,
            z,
            footprint,
            flags,
            channels,
            kind,
            occ_head: -1,
            scan_mark: 0,
        };
    }

    #[inline]
    pub fn collider(&self, key: i32) -> Option<&Collider> {
        self.colliders
            .get(key as usize)
            .filter(|c| c.in_use && key >= 0)
    }

    #[inline]
    pub fn collider_mut(&mut self, key: i32) -> Option<&mut Collider> {
        if key < 0 {
            return None;
        }
        self.colliders.get_mut(key as usize).filter(|c| c.in_use)
    }

    // ---- blocker side channel ----

    #[inline]
    pub fn last_blocker(&self) -> Option<Blocker> {
        self.last_blocker
    }

    /// Read and clear the "what blocked me" side channel.
    #[inline]
    pub fn take_blocker(&mut self) -> Option<Blocker> {
        self.last_blocker.take()
    }

    fn block(&mut self, b: Blocker) -> ScanOutcome {
        self.last_blocker = Some(b);
        ScanOutcome::Blocked(b)
    }

    // ---- generic shaped traversal ----

    /// Entity and next-link of an occupancy record; used by the ray
    /// walk to traverse a cell's list without holding a borrow.
    #[inline]
    pub(crate) fn occ_entry(&self, rec: i32) -> (i32, i32) {
        let r = &self.occ[rec as usize];
        (r.ent, r.cell_next)
    }

    /// Start a new scan generation; cells and colliders stamped with the
    /// returned value have been processed by the current query.
    #[inline]
    pub(crate) fn begin_scan(&mut self) -> u32 {
        self.scan_counter = self.scan_counter.wrapping_add(1);
        self.scan_counter
    }

    /// Visit every cell of `rect` exactly once, and every occupant of
    /// those cells exactly once (a multi-cell occupant is reported on
    /// its first cell only), invoking the policy. Stops at the first
    /// blocking verdict; any out-of-range cell aborts the whole scan.
    pub fn scan_rect<P: ScanPolicy>(&mut self, rect: CellRect, policy: &mut P) -> ScanOutcome {
        let scan = self.begin_scan();
        for cz in rect.z0..=rect.z1 {
            for cx in rect.x0..=rect.x1 {
                let idx = match self.grid.index(cx, cz) {
                    Ok(i) => i,
                    Err(_) => return self.block(Blocker::OutOfBounds),
                };
                {
                    let cell = self.grid.cell_by_index_mut(idx);
                    if cell.scan_mark == scan {
                        continue;
                    }
                    cell.scan_mark = scan;
                }
                let verdict = policy.visit_cell(cx, cz, self.grid.cell_by_index(idx));
                if let CellVisit::Blocked(b) = verdict {
                    return self.block(b);
                }
                if !policy.wants_occupants() {
                    continue;
                }
                let mut rec = self.grid.cell_by_index(idx).occ_head;
                while rec != -1 {
                    let (ent, next) = {
                        let r = &self.occ[rec as usize];
                        (r.ent, r.cell_next)
                    };
                    rec = next;
                    let col = &mut self.colliders[ent as usize];
                    if col.scan_mark == scan {
                        continue;
                    }
                    col.scan_mark = scan;
                    let verdict = policy.visit_occupant(ent, &self.colliders[ent as usize]);
                    if let CellVisit::Blocked(b) = verdict {
                        return self.block(b);
                    }
                }
            }
        }
        ScanOutcome::Clear
    }

    // ---- presence ----

    /// Create an occupancy record for every cell the entity's footprint
    /// overlaps at its current position. Cells already holding a record
    /// for this entity are left alone. If any covered cell is out of
    /// grid range the entity is ineligible for placement: nothing is
    /// registered and `false` is returned.
    pub fn register_presence(&mut self, key: i32) -> bool {
        let (x, z, footprint) = match self.collider(key) {
            Some(c) => (c.x, c.z, c.footprint),
            None => return false,
        };
        let rect = CellRect::from_aabb(footprint.aabb_at(x, z));
        let mut policy = PresencePolicy::default();
        if !self.scan_rect(rect, &mut policy).is_clear() {
            return false;
        }
        for (cx, cz) in policy.covered {
            let idx = self.grid.index(cx, cz).expect("scanned cell in range") as i32;
            if !self.has_record(key, idx) {
                self.link_record(key, idx);
            }
        }
        true
    }

    /// Remove every occupancy record of the entity, from both the
    /// per-cell and per-entity lists. Idempotent.
    pub fn clear_presence(&mut self, key: i32) {
        let Some(col) = self.collider_mut(key) else { return };
        let mut rec = col.occ_head;
        col.occ_head = -1;
        while rec != -1 {
            let next = self.occ[rec as usize].ent_next;
            self.unlink_from_cell(rec);
            self.free_record(rec);
            rec = next;
        }
    }

    /// Move a collider to a new position, recomputing its presence.
    /// Returns false (with presence cleared) if the new footprint
    /// leaves the grid.
    pub fn move_collider(&mut self, key: i32, x: i32, z: i32) -> bool {
        self.clear_presence(key);
        let Some(col) = self.collider_mut(key) else { return false };
        col.x = x;
        col.z = z;
        self.register_presence(key)
    }

    /// The cells an entity currently has occupancy records in.
    pub fn presence_cells(&self, key: i32) -> Vec<(i32, i32)> {
        let mut out = Vec::new();
        let Some(col) = self.collider(key) else { return out };
        let mut rec = col.occ_head;
        while rec != -1 {
            let r = &self.occ[rec as usize];
            out.push((r.cell % crate::r_shared::GRID_SIZE, r.cell / crate::r_shared::GRID_SIZE));
            rec = r.ent_next;
        }
        out.sort_unstable();
        out
    }

    fn has_record(&self, key: i32, cell_idx: i32) -> bool {
        let Some(col) = self.collider(key) else { return false };
        let mut rec = col.occ_head;
        while rec != -1 {
            let r = &self.occ[rec as usize];
            if r.cell == cell_idx {
                return true;
            }
            rec = r.ent_next;
        }
        false
    }

    fn alloc_record(&mut self) -> i32 {
        if self.occ_free != -1 {
            let idx = self.occ_free;
            self.occ_free = self.occ[idx as usize].cell_next;
            idx
        } else {
            self.occ.push(OccRecord {
                ent: -1,
                cell: -1,
                cell_prev: -1,
                cell_next: -1,
                ent_next: -1,
            });
            (self.occ.len() - 1) as i32
        }
    }

    fn free_record(&mut self, rec: i32) {
        let r = &mut self.occ[rec as usize];
        r.ent = -1;
        r.cell = -1;
        r.cell_prev = -1;
        r.cell_next = self.occ_free;
        r.ent_next = -1;
        self.occ_free = rec;
    }

    fn link_record(&mut self, key: i32, cell_idx: i32) {
        let rec = self.alloc_record();

        // Push onto the cell's doubly-linked list.
        let old_head = {
            let cell = self.grid.cell_by_index_mut(cell_idx as usize);
            let h = cell.occ_head;
            cell.occ_head = rec;
            h
        };
        if old_head != -1 {
            self.occ[old_head as usize].cell_prev = rec;
        }

        // Push onto the entity's singly-linked list.
        let col = &mut self.colliders[key as usize];
        let ent_head = col.occ_head;
        col.occ_head = rec;

        self.occ[rec as usize] = OccRecord {
            ent: key,
            cell: cell_idx,
            cell_prev: -1,
            cell_next: old_head,
            ent_next: ent_head,
        };
    }

    fn unlink_from_cell(&mut self, rec: i32) {
        let OccRecord { cell, cell_prev, cell_next, .. } = self.occ[rec as usize];
        if cell_prev != -1 {
            self.occ[cell_prev as usize].cell_next = cell_next;
        } else {
            self.grid.cell_by_index_mut(cell as usize).occ_head = cell_next;
        }
        if cell_next != -1 {
            self.occ[cell_next as usize].cell_prev = cell_prev;
        }
    }

    // ---- movement validity ----

    /// May `key` occupy (x, z)? Scans the cells the mover's footprint
    /// would overlap there. Rejection records the blocker in the side
    /// channel; the collider itself is not touched.
    pub fn check_move(&mut self, key: i32, x: i32, z: i32, channels: u16) -> ScanOutcome {
        self.check_move_inner(key, x, z, channels, None)
    }

    /// As `check_move`, but an occupant only blocks when its type bit is
    /// in `type_mask`.
    pub fn check_move_typed(
        &mut self,
        key: i32,
        x: i32,
        z: i32,
        channels: u16,
        type_mask: u16,
    ) -> ScanOutcome {
        self.check_move_inner(key, x, z, channels, Some(type_mask))
    }

    fn check_move_inner(
        &mut self,
        key: i32,
        x: i32,
        z: i32,
        channels: u16,
        type_mask: Option<u16>,
    ) -> ScanOutcome {
        let (footprint, flags) = match self.collider(key) {
            Some(c) => (c.footprint, c.flags),
            None => {
                tracing::debug!(key, "check_move on missing collider");
                return self.block(Blocker::OutOfBounds);
            }
        };

        // Door-crossing participants may not end a move standing in a
        // door, regardless of what the cell scan would say.
        let (ecx, ecz) = (world_to_cell(x), world_to_cell(z));
        let end_kind = self.grid.cell(ecx, ecz).map(|c| c.kind);
        let Ok(end_kind) = end_kind else {
            return self.block(Blocker::OutOfBounds);
        };
        if end_kind.is_door()
            && flags.contains(ColliderFlags::DOOR_SENSITIVE)
            && channels & DOOR_CHANNELS != 0
        {
            return self.block(Blocker::Door { cx: ecx, cz: ecz });
        }

        let mut policy = MovePolicy {
            mover: key,
            aabb: footprint.aabb_at(x, z),
            channels,
            ignore_terrain: flags.contains(ColliderFlags::IGNORE_TERRAIN),
            type_mask,
        };
        let rect = CellRect::from_aabb(policy.aabb);
        self.scan_rect(rect, &mut policy)
    }
}
