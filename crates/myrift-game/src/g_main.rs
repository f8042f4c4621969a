// g_main.rs — the per-tick simulation frame

use crate::g_anim::{advance, seq_of};
use crate::g_local::*;
use crate::g_script::{run_entity, ScriptError};
use crate::g_utils::{age_messages, collect_active, reparent, vanish};

/// One discrete simulation step. Phases run in a fixed order:
///
/// 1. ambient — message aging, animation advance (sequence ends
///    trigger re-evaluation);
/// 2. input promotion — rising input edges matching the current
///    sequence's input mask trigger re-evaluation;
/// 3. traversal — depth-first over the entity graph, running the VM
///    on every eligible entity, loop-guarded;
/// 4. changed batch — deferred reparent/vanish requests;
/// 5. colliding batch — deferred presence recomputation.
///
/// Only a malformed script aborts the frame; everything else fails
/// open and the simulation continues.
pub fn run_frame(ctx: &mut GameContext, input: u8) -> Result<(), ScriptError> {
    ctx.tick = ctx.tick.wrapping_add(1);
    ctx.input_edges = input & !ctx.input;
    ctx.input = input;
    // The blocked side channel describes this tick's move attempts.
    ctx.world.take_blocker();

    // Phase 1 — ambient.
    age_messages(ctx);
    for key in 0..ctx.ents.len() {
        let ent = &ctx.ents[key];
        if !ent.in_use || ent.flags.contains(EntityFlags::INACTIVE) {
            continue;
        }
        let mut cursor = ent.anim;
        let ended = advance(&ctx.anims, &mut cursor);
        let ent = &mut ctx.ents[key];
        ent.anim = cursor;
        if ended {
            ent.flags.insert(EntityFlags::TRIGGERED);
        }
    }

    // Phase 2 — input promotion.
    if ctx.input_edges != 0 {
        for key in 0..ctx.ents.len() {
            let ent = &ctx.ents[key];
            if !ent.in_use || ent.flags.contains(EntityFlags::INACTIVE) {
                continue;
            }
            let mask = seq_of(&ctx.anims, &ent.anim).map(|s| s.input_mask).unwrap_or(0);
            if mask & ctx.input_edges != 0 {
                ctx.ents[key].flags.insert(EntityFlags::TRIGGERED);
            }
        }
    }

    // Phase 3 — traversal. The order is captured up front; structural
    // edits requested by scripts go through the changed batch, so the
    // iteration cannot be invalidated mid-walk.
    let order = collect_active(ctx);
    for key in order {
        let ent = &ctx.ents[key as usize];
        if !ent.in_use
            || ent.flags.contains(EntityFlags::INACTIVE)
            || ent.flags.contains(EntityFlags::INERT)
        {
            continue;
        }
        if ent.flags.contains(EntityFlags::TRIGGERED) || ent.msg_head != -1 {
            run_entity(ctx, key)?;
        }
    }

    // Phase 4 — changed batch.
    let changed = std::mem::take(&mut ctx.changed);
    for change in changed {
        match change {
            PendingChange::Reparent { ent, parent } => reparent(ctx, ent, parent),
            PendingChange::Vanish { ent } => vanish(ctx, ent),
        }
    }

    // Phase 5 — colliding batch.
    let colliding = std::mem::take(&mut ctx.colliding);
    for key in colliding {
        if !ctx.is_live(key) {
            continue;
        }
        let pose = ctx.ents[key as usize].pose;
        ctx.world.move_collider(key, pose.x, pose.z);
    }

    Ok(())
}
