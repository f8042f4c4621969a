// rayscan.rs — fixed-point DDA ray traversal over the world grid

use crate::cgrid::CellKind;
use crate::cworld::{Collider, ColliderFlags, World};
use crate::r_shared::{
    angle_norm, fixed_div, world_to_cell, Footprint, CELL_SHIFT, CELL_SIZE, FRAC_BITS,
};
use crate::sintab::{cos_fx, sin_fx};

/// Bar pitch of grate cells in world units; the gap width is the low
/// six bits of the cell's data byte.
pub const GRATE_PITCH: i32 = 64;

const FAR: i64 = i64::MAX / 4;

// ============================================================
// Ray description and results
// ============================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct Ray {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    /// Base facing, 1024-unit circle.
    pub yaw: i32,
    /// Added to `yaw` before marching (fan rays, shot spread).
    pub yaw_offset: i32,
    /// Vertical angle; only used to resolve the hit's y coordinate.
    pub pitch: i32,
    /// Perpendicular shift of the ray origin, positive to the right
    /// of the facing.
    pub lateral: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RayHitKind {
    Wall { cx: i32, cz: i32 },
    Occupant(i32),
}

/// First qualifying obstruction along a ray, with the resolved
/// contact position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayHit {
    pub kind: RayHitKind,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub dist: i32,
}

/// Occupant eligibility verdict from a ray policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OccVisit {
    /// Not an obstruction for this ray flavor.
    Ignore,
    /// Test the ray against the occupant's footprint.
    Test,
}

/// Strategy hook distinguishing the traversal flavors (line of sight,
/// camera, draw-list culling). The grid walk itself is shared.
pub trait RayPolicy {
    fn visit_occupant(&mut self, key: i32, occ: &Collider) -> OccVisit;
}

/// Plain line-of-sight flavor: one entity (usually the caster) is
/// transparent, as is everything non-solid or decorative.
pub struct SightRay {
    pub ignore: i32,
}

impl RayPolicy for SightRay {
    fn visit_occupant(&mut self, key: i32, occ: &Collider) -> OccVisit {
        if key == self.ignore
            || !occ.flags.contains(ColliderFlags::SOLID)
            || occ.flags.contains(ColliderFlags::DECOR)
        {
            OccVisit::Ignore
        } else {
            OccVisit::Test
        }
    }
}

/// Shot-resolution flavor: only occupants whose type bit is in the
/// mask can obstruct the ray.
pub struct TypedRay {
    pub ignore: i32,
    pub type_mask: u16,
}

impl RayPolicy for TypedRay {
    fn visit_occupant(&mut self, key: i32, occ: &Collider) -> OccVisit {
        if key == self.ignore || occ.flags.contains(ColliderFlags::DECOR) {
            return OccVisit::Ignore;
        }
        if (1u16 << (occ.kind & 15)) & self.type_mask != 0 {
            OccVisit::Test
        } else {
            OccVisit::Ignore
        }
    }
}

// ============================================================
// Traversal
// ============================================================

/// March a ray cell by cell until something qualifying obstructs it or
/// it leaves the grid ("no hit"). Occupants of each visited cell are
/// offered to the policy before the cell's wall geometry is tested;
/// whichever candidate lies nearer along the ray wins.
pub fn cast_ray<P: RayPolicy>(w: &mut World, ray: Ray, policy: &mut P) -> Option<RayHit> {
    let yaw = angle_norm(ray.yaw + ray.yaw_offset);
    let dir_x = sin_fx(yaw);
    let dir_z = cos_fx(yaw);

    // Lateral offset shifts the origin along the facing's right vector.
    let ox = ray.x + ((ray.lateral as i64 * dir_z as i64) >> FRAC_BITS) as i32;
    let oz = ray.z - ((ray.lateral as i64 * dir_x as i64) >> FRAC_BITS) as i32;

    let mut cx = world_to_cell(ox);
    let mut cz = world_to_cell(oz);
    if !w.grid.in_range(cx, cz) {
        return None;
    }

    // Slope for resolving the contact's y coordinate.
    let pitch_slope = if ray.pitch == 0 {
        0
    } else {
        fixed_div(sin_fx(ray.pitch), cos_fx(ray.pitch))
    };

    // Per-axis accumulated distances to the next cell boundary, in
    // world units along the ray, plus the per-cell increments.
    let step_x: i32 = if dir_x > 0 { 1 } else { -1 };
    let step_z: i32 = if dir_z > 0 { 1 } else { -1 };
    let delta_x = if dir_x == 0 {
        FAR
    } else {
        ((CELL_SIZE as i64) << FRAC_BITS) / dir_x.unsigned_abs() as i64
    };
    let delta_z = if dir_z == 0 {
        FAR
    } else {
        ((CELL_SIZE as i64) << FRAC_BITS) / dir_z.unsigned_abs() as i64
    };
    let mut side_x = if dir_x == 0 {
        FAR
    } else {
        let bdist = if dir_x > 0 { ((cx + 1) << CELL_SHIFT) - ox } else { ox - (cx << CELL_SHIFT) };
        bdist as i64 * delta_x / CELL_SIZE as i64
    };
    let mut side_z = if dir_z == 0 {
        FAR
    } else {
        let bdist = if dir_z > 0 { ((cz + 1) << CELL_SHIFT) - oz } else { oz - (cz << CELL_SHIFT) };
        bdist as i64 * delta_z / CELL_SIZE as i64
    };

    let scan = w.begin_scan();
    let finish = |t: i64, kind: RayHitKind| -> RayHit {
        let t32 = t as i32;
        RayHit {
            kind,
            x: ox + ((dir_x as i64 * t) >> FRAC_BITS) as i32,
            y: ray.y + ((pitch_slope as i64 * t) >> FRAC_BITS) as i32,
            z: oz + ((dir_z as i64 * t) >> FRAC_BITS) as i32,
            dist: t32,
        }
    };

    // Nearest occupant intersection found so far; committed once the
    // walk has advanced past it without a nearer wall hit.
    let mut pending: Option<(i64, i32)> = None;
    let mut dist: i64 = 0;

    loop {
        // Occupant pass, once per cell and once per occupant.
        let cell_idx = w.grid.index(cx, cz).expect("walk stays in range");
        let marked = {
            let cell = w.grid.cell_by_index_mut(cell_idx);
            let m = cell.scan_mark == scan;
            cell.scan_mark = scan;
            m
        };
        if !marked {
            let mut rec = w.grid.cell_by_index(cell_idx).occ_head;
            while rec != -1 {
                let (ent, next) = w.occ_entry(rec);
                rec = next;
                let col = &mut w.colliders[ent as usize];
                if col.scan_mark == scan {
                    continue;
                }
                col.scan_mark = scan;
                let col = &w.colliders[ent as usize];
                if policy.visit_occupant(ent, col) == OccVisit::Test {
                    if let Some(t) =
                        ray_vs_aabb(ox, oz, dir_x, dir_z, col.footprint.aabb_at(col.x, col.z))
                    {
                        if pending.map_or(true, |(pt, _)| t < pt) {
                            pending = Some((t, ent));
                        }
                    }
                }
            }

            // Wall pass.
            let cell = w.grid.cell_by_index(cell_idx);
            if cell.kind.ray_geometry() {
                let wall_t = wall_intersection(
                    cell.kind, cell.data, cx, cz, ox, oz, dir_x, dir_z, dist,
                );
                if let Some(t) = wall_t {
                    return Some(match pending {
                        Some((pt, ent)) if pt <= t => finish(pt, RayHitKind::Occupant(ent)),
                        _ => finish(t, RayHitKind::Wall { cx, cz }),
                    });
                }
            }
        }

        // Step into the next cell along whichever axis crosses sooner.
        if side_x < side_z {
            dist = side_x;
            side_x += delta_x;
            cx += step_x;
        } else {
            dist = side_z;
            side_z += delta_z;
            cz += step_z;
        }

        // A pending occupant hit behind the walk front can no longer be
        // beaten by a nearer wall.
        if let Some((pt, ent)) = pending {
            if pt <= dist {
                return Some(finish(pt, RayHitKind::Occupant(ent)));
            }
        }

        if !w.grid.in_range(cx, cz) {
            return None;
        }
    }
}

/// 2D slab test of the ray against an absolute AABB. Returns the entry
/// distance along the ray in world units, if any at or ahead of the
/// origin.
fn ray_vs_aabb(ox: i32, oz: i32, dir_x: i32, dir_z: i32, aabb: (i32, i32, i32, i32)) -> Option<i64> {
    let (x0, z0, x1, z1) = aabb;
    let mut tmin: i64 = 0;
    let mut tmax: i64 = FAR;

    for (o, d, lo, hi) in [(ox, dir_x, x0, x1), (oz, dir_z, z0, z1)] {
        if d == 0 {
            if o < lo || o > hi {
                return None;
            }
        } else {
            let mut t1 = (((lo - o) as i64) << FRAC_BITS) / d as i64;
            let mut t2 = (((hi - o) as i64) << FRAC_BITS) / d as i64;
            if t1 > t2 {
                std::mem::swap(&mut t1, &mut t2);
            }
            tmin = tmin.max(t1);
            tmax = tmax.min(t2);
        }
    }
    if tmin <= tmax {
        Some(tmin)
    } else {
        None
    }
}

/// Intersect the ray with the wall geometry of one cell, entered at
/// `entry` along the ray. Returns the hit distance or None when the
/// cell's opening lets the ray through.
#[allow(clippy::too_many_arguments)]
fn wall_intersection(
    kind: CellKind,
    data: u8,
    cx: i32,
    cz: i32,
    ox: i32,
    oz: i32,
    dir_x: i32,
    dir_z: i32,
    entry: i64,
) -> Option<i64> {
    let x0 = cx << CELL_SHIFT;
    let z0 = cz << CELL_SHIFT;

    let point_at = |t: i64| -> (i32, i32) {
        (
            ox + ((dir_x as i64 * t) >> FRAC_BITS) as i32,
            oz + ((dir_z as i64 * t) >> FRAC_BITS) as i32,
        )
    };

    match kind {
        // A plain wall obstructs at its near face: the point where the
        // walk entered the cell.
        CellKind::Wall => Some(entry),

        // Wall along the (x0,z0)-(x1,z1) diagonal: points with
        // x - x0 == z - z0.
        CellKind::DiagonalA => {
            let denom = dir_x - dir_z;
            if denom == 0 {
                return None;
            }
            let t = (((oz - z0) - (ox - x0)) as i64) << FRAC_BITS;
            let t = t / denom as i64;
            let (px, _) = point_at(t);
            let s = px - x0;
            (t >= 0 && (0..CELL_SIZE).contains(&s)).then_some(t)
        }

        // Wall along the (x0,z1)-(x1,z0) diagonal: points with
        // (x - x0) + (z - z0) == CELL_SIZE.
        CellKind::DiagonalB => {
            let denom = dir_x + dir_z;
            if denom == 0 {
                return None;
            }
            let t = ((CELL_SIZE - (ox - x0) - (oz - z0)) as i64) << FRAC_BITS;
            let t = t / denom as i64;
            let (px, _) = point_at(t);
            let s = px - x0;
            (t >= 0 && (0..CELL_SIZE).contains(&s)).then_some(t)
        }

        // Sliding doors block their mid-cell plane except for the open
        // span, which extends data*2 units from the cell's low edge.
        CellKind::DoorX | CellKind::DoorZ => {
            let (t, offset) = plane_crossing(kind, data, x0, z0, ox, oz, dir_x, dir_z)?;
            let open = (data as i32) << 1;
            (offset >= open).then_some(t)
        }

        // A grate passes the ray wherever the crossing lands in a gap
        // between bars.
        CellKind::Grate => {
            let (t, offset) = plane_crossing(kind, data, x0, z0, ox, oz, dir_x, dir_z)?;
            let gap = (data & 63) as i32;
            (offset.rem_euclid(GRATE_PITCH) >= gap).then_some(t)
        }

        CellKind::Open | CellKind::Hole | CellKind::Decor => None,
    }
}

/// Crossing of the mid-cell blocking plane used by doors and grates.
/// Returns the ray distance and the offset of the crossing point along
/// the plane, measured from the cell's low edge.
#[allow(clippy::too_many_arguments)]
fn plane_crossing(
    kind: CellKind,
    _data: u8,
    x0: i32,
    z0: i32,
    ox: i32,
    oz: i32,
    dir_x: i32,
    dir_z: i32,
) -> Option<(i64, i32)> {
    // DoorZ slides along Z (plane at mid-X); everything else uses the
    // plane at mid-Z.
    let along_x = !matches!(kind, CellKind::DoorZ);
    let (plane, o, d, cross_o, cross_d, low) = if along_x {
        (z0 + CELL_SIZE / 2, oz, dir_z, ox, dir_x, x0)
    } else {
        (x0 + CELL_SIZE / 2, ox, dir_x, oz, dir_z, z0)
    };
    if d == 0 {
        return None;
    }
    let t = (((plane - o) as i64) << FRAC_BITS) / d as i64;
    if t < 0 {
        return None;
    }
    let at = cross_o + ((cross_d as i64 * t) >> FRAC_BITS) as i32;
    let offset = at - low;
    (0..CELL_SIZE).contains(&offset).then_some((t, offset))
}
