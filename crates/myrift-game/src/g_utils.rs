// g_utils.rs — entity graph and message utilities

use crate::g_local::*;

// ============================================================
// Entity allocation and tree surgery
//
// Entities live in a level-lifetime arena and are addressed by their
// stable index; tree links are plain indices with -1 = none. Nothing
// is ever freed while the level runs; "deleting" an entity parks it
// under the graveyard.
// ============================================================

/// Allocate the next entity slot. Returns -1 when the arena is full
/// (the level loader over-populated the map; fail open).
pub fn alloc_entity(ctx: &mut GameContext) -> i32 {
    if ctx.ents.len() >= MAX_ENTITIES {
        tracing::warn!("entity arena exhausted at {}", MAX_ENTITIES);
        return -1;
    }
    let key = ctx.ents.len() as i32;
    ctx.ents.push(Entity { in_use: true, key, ..Entity::default() });
    key
}

/// Push `child` onto the front of `parent`'s child list.
pub fn link_child(ctx: &mut GameContext, parent: i32, child: i32) {
    ctx.ents[child as usize].parent = parent;
    let old_head = ctx.ents[parent as usize].first_child;
    ctx.ents[child as usize].next_sibling = old_head;
    ctx.ents[parent as usize].first_child = child;
}

/// Detach `child` from its parent's child list; no-op for roots.
pub fn unlink_from_parent(ctx: &mut GameContext, child: i32) {
    let parent = ctx.ents[child as usize].parent;
    if parent == -1 {
        return;
    }
    let mut link = ctx.ents[parent as usize].first_child;
    if link == child {
        ctx.ents[parent as usize].first_child = ctx.ents[child as usize].next_sibling;
    } else {
        while link != -1 {
            let next = ctx.ents[link as usize].next_sibling;
            if next == child {
                ctx.ents[link as usize].next_sibling = ctx.ents[child as usize].next_sibling;
                break;
            }
            link = next;
        }
    }
    ctx.ents[child as usize].parent = -1;
    ctx.ents[child as usize].next_sibling = -1;
}

/// Is `ancestor` on the parent chain of `key` (or `key` itself)?
pub fn is_ancestor(ctx: &GameContext, ancestor: i32, key: i32) -> bool {
    let mut cur = key;
    while cur != -1 {
        if cur == ancestor {
            return true;
        }
        cur = ctx.ents[cur as usize].parent;
    }
    false
}

/// Relink `child` beneath `new_parent` in O(1) plus the sibling scan
/// of the old parent. Reparenting beneath one's own subtree would cut
/// the entity loose from the graph, so it fails open instead.
pub fn reparent(ctx: &mut GameContext, child: i32, new_parent: i32) {
    if child <= 0
        || !ctx.is_live(new_parent) && new_parent != ctx.graveyard
        || is_ancestor(ctx, child, new_parent)
    {
        tracing::debug!(child, new_parent, "reparent refused");
        return;
    }
    unlink_from_parent(ctx, child);
    link_child(ctx, new_parent, child);
}

/// Pre-order listing of the live graph, skipping the graveyard
/// subtree. Captured before VM execution so structural edits (which
/// are deferred anyway) can never invalidate the iteration.
pub fn collect_active(ctx: &GameContext) -> Vec<i32> {
    let mut out = Vec::with_capacity(ctx.ents.len());
    let mut stack = vec![ctx.root];
    while let Some(key) = stack.pop() {
        if key == -1 || key == ctx.graveyard {
            continue;
        }
        out.push(key);
        // Push siblings in reverse so the first child pops first.
        let mut children = Vec::new();
        let mut c = ctx.ents[key as usize].first_child;
        while c != -1 {
            children.push(c);
            c = ctx.ents[c as usize].next_sibling;
        }
        while let Some(c) = children.pop() {
            stack.push(c);
        }
    }
    out
}

/// Remove an entity from play: presence cleared, messages dropped,
/// parked under the graveyard. Its key stays valid (and dead) for the
/// rest of the level.
pub fn vanish(ctx: &mut GameContext, key: i32) {
    if key <= 0 || key == ctx.graveyard || (key as usize) >= ctx.ents.len() {
        return;
    }
    ctx.world.clear_presence(key);
    clear_messages(ctx, key);
    unlink_from_parent(ctx, key);
    let graveyard = ctx.graveyard;
    link_child(ctx, graveyard, key);
    let ent = &mut ctx.ents[key as usize];
    ent.flags.insert(EntityFlags::INACTIVE);
    ent.flags.remove(EntityFlags::TRIGGERED);
}

// ============================================================
// Messages
// ============================================================

fn alloc_msg(ctx: &mut GameContext) -> i32 {
    if ctx.msg_free != -1 {
        let idx = ctx.msg_free;
        ctx.msg_free = ctx.msgs[idx as usize].next;
        idx
    } else {
        ctx.msgs.push(Msg { sender: -1, code: 0, age: 0, next: -1 });
        (ctx.msgs.len() - 1) as i32
    }
}

fn free_msg(ctx: &mut GameContext, idx: i32) {
    ctx.msgs[idx as usize].next = ctx.msg_free;
    ctx.msgs[idx as usize].sender = -1;
    ctx.msg_free = idx;
}

/// Post a message to an entity's pending list (newest first). A
/// duplicate (sender, code) pair refreshes the existing node's age
/// instead of adding another. Posting to a dead target is a no-op.
/// Returns whether anything was recorded.
pub fn post_message(ctx: &mut GameContext, target: i32, sender: i32, code: u16) -> bool {
    if !ctx.is_live(target) {
        return false;
    }

    let mut node = ctx.ents[target as usize].msg_head;
    while node != -1 {
        let m = &mut ctx.msgs[node as usize];
        if m.sender == sender && m.code == code {
            m.age = 0;
            ctx.ents[target as usize].flags.insert(EntityFlags::TRIGGERED);
            return true;
        }
        node = m.next;
    }

    let idx = alloc_msg(ctx);
    let head = ctx.ents[target as usize].msg_head;
    ctx.msgs[idx as usize] = Msg { sender, code, age: 0, next: head };
    ctx.ents[target as usize].msg_head = idx;
    ctx.ents[target as usize].flags.insert(EntityFlags::TRIGGERED);
    true
}

/// Bump the age of every pending message of every live entity.
pub fn age_messages(ctx: &mut GameContext) {
    for key in 0..ctx.ents.len() {
        if !ctx.ents[key].in_use {
            continue;
        }
        let mut node = ctx.ents[key].msg_head;
        while node != -1 {
            let m = &mut ctx.msgs[node as usize];
            m.age = m.age.saturating_add(1);
            node = m.next;
        }
    }
}

/// Move an entity's whole pending list into `ctx.cur_msgs` for the
/// script execution about to run, freeing the nodes. Messages posted
/// during that execution build a fresh list.
pub fn drain_messages(ctx: &mut GameContext, key: i32) {
    ctx.cur_msgs.clear();
    let mut node = ctx.ents[key as usize].msg_head;
    ctx.ents[key as usize].msg_head = -1;
    while node != -1 {
        let m = ctx.msgs[node as usize];
        ctx.cur_msgs.push(DrainedMsg { sender: m.sender, code: m.code, age: m.age });
        free_msg(ctx, node);
        node = m.next;
    }
}

/// Drop an entity's pending messages without exposing them.
pub fn clear_messages(ctx: &mut GameContext, key: i32) {
    let mut node = ctx.ents[key as usize].msg_head;
    ctx.ents[key as usize].msg_head = -1;
    while node != -1 {
        let next = ctx.msgs[node as usize].next;
        free_msg(ctx, node);
        node = next;
    }
}

/// Number of pending messages (the `msg_count` pseudo field).
pub fn pending_message_count(ctx: &GameContext, key: i32) -> i32 {
    let mut n = 0;
    let mut node = ctx.ents[key as usize].msg_head;
    while node != -1 {
        n += 1;
        node = ctx.msgs[node as usize].next;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::g_spawn::spawn_level;
    use crate::game::{LevelData, Placement};
    use crate::game_import::NullImport;

    fn small_ctx(n: usize) -> GameContext {
        let mut level = LevelData::default();
        for i in 0..n {
            level.placements.push(Placement {
                x: 2048 + 600 * i as i32,
                z: 2048,
                ..Placement::default()
            });
        }
        spawn_level(Box::<NullImport>::default(), &level).unwrap()
    }

    #[test]
    fn test_tree_links() {
        let mut ctx = small_ctx(3);
        // Keys 0 root, 1 graveyard, 2..=4 placements, children of root.
        assert_eq!(ctx.ents[2].parent, ctx.root);
        reparent(&mut ctx, 3, 2);
        assert_eq!(ctx.ents[3].parent, 2);
        assert_eq!(ctx.ents[2].first_child, 3);

        // Pre-order visits parents before their children.
        let order = collect_active(&ctx);
        let pos = |k: i32| order.iter().position(|&x| x == k).unwrap();
        assert!(pos(2) < pos(3));
        assert!(!order.contains(&ctx.graveyard));
    }

    #[test]
    fn test_reparent_refuses_cycles() {
        let mut ctx = small_ctx(3);
        reparent(&mut ctx, 3, 2);
        reparent(&mut ctx, 4, 3);
        // 2 -> 3 -> 4; moving 2 under 4 would orphan the chain.
        reparent(&mut ctx, 2, 4);
        assert_eq!(ctx.ents[2].parent, ctx.root);
    }

    #[test]
    fn test_vanish_parks_under_graveyard() {
        let mut ctx = small_ctx(2);
        assert!(!ctx.world.presence_cells(2).is_empty());
        vanish(&mut ctx, 2);
        assert_eq!(ctx.ents[2].parent, ctx.graveyard);
        assert!(ctx.ents[2].flags.contains(EntityFlags::INACTIVE));
        assert!(ctx.world.presence_cells(2).is_empty());
        assert!(!ctx.is_live(2));
        assert!(!collect_active(&ctx).contains(&2));
        // Vanishing again stays harmless.
        vanish(&mut ctx, 2);
    }

    #[test]
    fn test_post_message_dedup_refreshes_age() {
        let mut ctx = small_ctx(2);
        assert!(post_message(&mut ctx, 2, 5, 58));
        age_messages(&mut ctx);
        assert!(post_message(&mut ctx, 2, 5, 58));
        assert_eq!(pending_message_count(&ctx, 2), 1);

        drain_messages(&mut ctx, 2);
        assert_eq!(ctx.cur_msgs.len(), 1);
        assert_eq!(ctx.cur_msgs[0], DrainedMsg { sender: 5, code: 58, age: 0 });
        assert_eq!(pending_message_count(&ctx, 2), 0);
    }

    #[test]
    fn test_distinct_messages_coexist_newest_first() {
        let mut ctx = small_ctx(2);
        post_message(&mut ctx, 2, 5, 58);
        post_message(&mut ctx, 2, 5, 59);
        post_message(&mut ctx, 2, 6, 58);
        assert_eq!(pending_message_count(&ctx, 2), 3);
        drain_messages(&mut ctx, 2);
        assert_eq!(ctx.cur_msgs[0], DrainedMsg { sender: 6, code: 58, age: 0 });
        assert_eq!(ctx.cur_msgs.len(), 3);
    }

    #[test]
    fn test_post_to_dead_target_is_noop() {
        let mut ctx = small_ctx(2);
        assert!(!post_message(&mut ctx, 99, 2, 7));
        vanish(&mut ctx, 3);
        assert!(!post_message(&mut ctx, 3, 2, 7));
    }

    #[test]
    fn test_message_nodes_recycled() {
        let mut ctx = small_ctx(2);
        post_message(&mut ctx, 2, 5, 58);
        drain_messages(&mut ctx, 2);
        let before = ctx.msgs.len();
        post_message(&mut ctx, 2, 5, 60);
        assert_eq!(ctx.msgs.len(), before, "freed node must be reused");
    }

    #[test]
    fn test_posting_sets_triggered() {
        let mut ctx = small_ctx(2);
        ctx.ents[2].flags.remove(EntityFlags::TRIGGERED);
        post_message(&mut ctx, 2, 5, 58);
        assert!(ctx.ents[2].flags.contains(EntityFlags::TRIGGERED));
    }
}
