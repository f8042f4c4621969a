// g_spawn.rs — level setup: grid, world, and entity population

use crate::g_local::*;
use crate::g_script::set_anim;
use crate::g_utils::{alloc_entity, link_child};
use crate::game::LevelData;
use crate::game_import::EngineImport;

/// Build a fresh game context from one level's resource data. Entity
/// 0 is the world root and entity 1 the graveyard; placements follow
/// in order, so their keys are stable and scriptable.
pub fn spawn_level(
    imports: Box<dyn EngineImport>,
    level: &LevelData,
) -> Result<GameContext, WorldError> {
    let grid = Grid::from_cells(&level.cells)?;
    let mut ctx = GameContext::new(World::new(grid, MAX_ENTITIES), imports);
    ctx.cond = level.cond.clone();
    ctx.stmt = level.stmt.clone();
    ctx.anims = level.anims.clone();

    let root = alloc_entity(&mut ctx);
    let graveyard = alloc_entity(&mut ctx);
    ctx.root = root;
    ctx.graveyard = graveyard;
    link_child(&mut ctx, root, graveyard);
    ctx.ents[graveyard as usize].flags.insert(EntityFlags::INACTIVE);

    for p in &level.placements {
        let key = alloc_entity(&mut ctx);
        if key == -1 {
            break;
        }
        let parent = if p.parent >= 0 && ctx.is_live(p.parent) { p.parent } else { ctx.root };
        link_child(&mut ctx, parent, key);

        let ent = &mut ctx.ents[key as usize];
        ent.pose = Pose { x: p.x, y: p.y, z: p.z, yaw: angle_norm(p.yaw) };
        ent.prev_pose = ent.pose;
        ent.footprint = p.footprint;
        ent.flags = p.flags;
        ent.kind = p.kind;
        ent.channels = p.channels;

        ctx.world.add_collider(
            key,
            p.x,
            p.z,
            p.footprint,
            p.flags.collider_flags(),
            p.channels,
            p.kind,
        );
        if !ctx.world.register_presence(key) {
            tracing::debug!(key, x = p.x, z = p.z, "placement has no valid presence");
        }

        set_anim(&mut ctx, key, p.anim_table, p.anim_seq);
        // Spawning alone is not a trigger; the first tick's animation
        // phase decides who wakes up.
        ctx.ents[key as usize].flags.remove(EntityFlags::TRIGGERED);
    }

    Ok(ctx)
}
