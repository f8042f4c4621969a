// g_phys.rs — entity movement through the collision engine

use crate::g_local::*;

/// Attempt to move an entity to (nx, nz). The move commits only when
/// the movement-validity query clears; on rejection the pose is left
/// untouched and the blocker stays readable in the world's side
/// channel for the `Blocked`/`BlockedBy` conditions.
pub fn try_move(ctx: &mut GameContext, key: i32, nx: i32, nz: i32) -> bool {
    if !ctx.is_live(key) {
        return false;
    }
    let channels = ctx.ents[key as usize].channels;
    if !ctx.world.check_move(key, nx, nz, channels).is_clear() {
        return false;
    }
    commit_move(ctx, key, nx, nz);
    true
}

/// As `try_move`, but only occupants whose type bit is in `type_mask`
/// can stop the mover.
pub fn try_move_typed(ctx: &mut GameContext, key: i32, nx: i32, nz: i32, type_mask: u16) -> bool {
    if !ctx.is_live(key) {
        return false;
    }
    let channels = ctx.ents[key as usize].channels;
    if !ctx.world.check_move_typed(key, nx, nz, channels, type_mask).is_clear() {
        return false;
    }
    commit_move(ctx, key, nx, nz);
    true
}

/// Step along the entity's facing by `dist` world units.
pub fn step_forward(ctx: &mut GameContext, key: i32, dist: i32) -> bool {
    if !ctx.is_live(key) {
        return false;
    }
    let pose = ctx.ents[key as usize].pose;
    let nx = pose.x + ((sin_fx(pose.yaw) as i64 * dist as i64) >> FRAC_BITS) as i32;
    let nz = pose.z + ((cos_fx(pose.yaw) as i64 * dist as i64) >> FRAC_BITS) as i32;
    try_move(ctx, key, nx, nz)
}

/// Unvalidated placement. The pose changes now; presence recomputes
/// in the tick's colliding batch, not in place.
pub fn teleport(ctx: &mut GameContext, key: i32, nx: i32, nz: i32) {
    if !ctx.is_live(key) {
        return;
    }
    let ent = &mut ctx.ents[key as usize];
    ent.prev_pose = ent.pose;
    ent.pose.x = nx;
    ent.pose.z = nz;
    ctx.colliding.push(key);
}

/// Return to the pose saved before the last committed move.
pub fn rollback_move(ctx: &mut GameContext, key: i32) {
    if !ctx.is_live(key) {
        return;
    }
    let prev = ctx.ents[key as usize].prev_pose;
    commit_move(ctx, key, prev.x, prev.z);
}

fn commit_move(ctx: &mut GameContext, key: i32, nx: i32, nz: i32) {
    let ent = &mut ctx.ents[key as usize];
    ent.prev_pose = ent.pose;
    ent.pose.x = nx;
    ent.pose.z = nz;
    ctx.world.move_collider(key, nx, nz);
}
