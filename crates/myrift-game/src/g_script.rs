// g_script.rs — the scripted-object bytecode interpreter
//
// Each entity's animation state binds it to a chain of condition
// records in the level's condition buffer. A record is a run of
// boolean opcodes ANDed together; the first record whose chain holds
// has its statement chain executed to completion. Both buffers are
// read-only level data.
//
// Record layout:   u16 op_len (0xFFFF ends the chain)
//                  u32 stmt_off
//                  op_len bytes of condition opcodes
// Opcode layout:   u8 code, u8 indirect_mask, fixed i16 args.
// Bit 7 of a condition code negates it; bit i of the mask resolves
// argument i through the entity field accessor instead of taking the
// literal.

use rand::Rng;
use thiserror::Error;

use crate::g_local::*;
use crate::g_phys;
use crate::g_utils::{drain_messages, pending_message_count, post_message};
use crate::game_import::EngineImport;
use myrift_common::cworld::Collider;
use myrift_common::rayscan::{OccVisit, RayPolicy};

// ============================================================
// Errors
//
// A malformed buffer is unrecoverable by design: it means broken
// level data, caught in development, not something to limp past.
// Everything else in here fails open.
// ============================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("malformed script: unknown condition opcode {op:#04x} at offset {off}")]
    UnknownCondOp { op: u8, off: usize },
    #[error("malformed script: unknown statement opcode {op:#04x} at offset {off}")]
    UnknownStmtOp { op: u8, off: usize },
    #[error("malformed script: truncated record at offset {off}")]
    Truncated { off: usize },
}

/// Execution context threaded through every evaluation in place of a
/// module-level "current entity" cursor; nested sub-evaluations get a
/// fresh value rather than save/restore.
#[derive(Debug, Clone, Copy)]
pub struct ExecCtx {
    pub current: i32,
    pub depth: u32,
}

// ============================================================
// Opcode numbering
// ============================================================

// Condition opcodes.
pub const CO_ALWAYS: u8 = 0x00;
pub const CO_ANIM_ENDED: u8 = 0x01;
pub const CO_GOT_MESSAGE: u8 = 0x02;
pub const CO_GOT_MESSAGE_FROM: u8 = 0x03;
pub const CO_FIELD_EQ: u8 = 0x04;
pub const CO_FIELD_LT: u8 = 0x05;
pub const CO_FIELD_GT: u8 = 0x06;
pub const CO_TEST_FLAGS: u8 = 0x07;
pub const CO_CAN_SEE: u8 = 0x08;
pub const CO_DIST_BELOW: u8 = 0x09;
pub const CO_SAME_ROOM: u8 = 0x0a;
pub const CO_INPUT: u8 = 0x0b;
pub const CO_BLOCKED: u8 = 0x0c;
pub const CO_BLOCKED_BY: u8 = 0x0d;
pub const CO_ANGLE_NEAR: u8 = 0x0e;
pub const CO_CHANCE: u8 = 0x0f;
/// High bit of a condition code inverts its result.
pub const CO_NEGATE: u8 = 0x80;

// Statement opcodes.
pub const SO_END: u8 = 0x00;
pub const SO_SET_FIELD: u8 = 0x01;
pub const SO_ADD_FIELD: u8 = 0x02;
pub const SO_SET_ANIM: u8 = 0x03;
pub const SO_SET_YAW: u8 = 0x04;
pub const SO_TURN_BY: u8 = 0x05;
pub const SO_TURN_TOWARD: u8 = 0x06;
pub const SO_STEP_FORWARD: u8 = 0x07;
pub const SO_STEP_MOVE: u8 = 0x08;
pub const SO_TELEPORT: u8 = 0x09;
pub const SO_POST_MESSAGE: u8 = 0x0a;
pub const SO_REPARENT: u8 = 0x0b;
pub const SO_VANISH: u8 = 0x0c;
pub const SO_SET_FLAGS: u8 = 0x0d;
pub const SO_CLEAR_FLAGS: u8 = 0x0e;
pub const SO_SET_CHANNELS: u8 = 0x0f;
pub const SO_PLAY_SOUND: u8 = 0x10;
pub const SO_START_CUTSCENE: u8 = 0x11;
pub const SO_FIRE_RAY: u8 = 0x12;
pub const SO_RANDOM: u8 = 0x13;

// Entity field ids addressable by opcodes.
pub const FID_SPECIAL_BASE: i32 = 0; // 0..=25
pub const FID_CUSTOM_BASE: i32 = 32; // 32..=43
pub const FID_POS_X: i32 = 64;
pub const FID_POS_Y: i32 = 65;
pub const FID_POS_Z: i32 = 66;
pub const FID_YAW: i32 = 67;
pub const FID_ROOM: i32 = 68;
pub const FID_KEY: i32 = 69;
pub const FID_PARENT: i32 = 70;
pub const FID_ANIM_SEQ: i32 = 71;
pub const FID_MSG_COUNT: i32 = 72;

// ============================================================
// Field accessor
// ============================================================

/// Read an opcode-addressable entity field. Unknown ids read as 0.
pub fn read_field(ctx: &GameContext, key: i32, fid: i32) -> i32 {
    let ent = &ctx.ents[key as usize];
    match fid {
        0..=25 => ent.special[fid as usize],
        32..=43 => ent.custom[(fid - FID_CUSTOM_BASE) as usize],
        FID_POS_X => ent.pose.x,
        FID_POS_Y => ent.pose.y,
        FID_POS_Z => ent.pose.z,
        FID_YAW => ent.pose.yaw,
        FID_ROOM => ctx.room_of(key) as i32,
        FID_KEY => ent.key,
        FID_PARENT => ent.parent,
        FID_ANIM_SEQ => ent.anim.seq,
        FID_MSG_COUNT => pending_message_count(ctx, key),
        _ => 0,
    }
}

/// Write an opcode-addressable entity field. Pose writes defer the
/// presence recompute to the colliding batch; read-only pseudo fields
/// ignore the write.
pub fn write_field(ctx: &mut GameContext, key: i32, fid: i32, value: i32) {
    let ent = &mut ctx.ents[key as usize];
    match fid {
        0..=25 => ent.special[fid as usize] = value,
        32..=43 => ent.custom[(fid - FID_CUSTOM_BASE) as usize] = value,
        FID_POS_X => {
            ent.pose.x = value;
            ctx.colliding.push(key);
        }
        FID_POS_Y => ent.pose.y = value,
        FID_POS_Z => {
            ent.pose.z = value;
            ctx.colliding.push(key);
        }
        FID_YAW => ent.pose.yaw = angle_norm(value),
        _ => tracing::debug!(key, fid, "write to read-only or unknown field ignored"),
    }
}

// ============================================================
// Bytecode readers
// ============================================================

fn rd_u8(buf: &[u8], off: &mut usize) -> Result<u8, ScriptError> {
    let v = *buf.get(*off).ok_or(ScriptError::Truncated { off: *off })?;
    *off += 1;
    Ok(v)
}

fn rd_u16(buf: &[u8], off: &mut usize) -> Result<u16, ScriptError> {
    let bytes = buf
        .get(*off..*off + 2)
        .ok_or(ScriptError::Truncated { off: *off })?;
    *off += 2;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn rd_i16(buf: &[u8], off: &mut usize) -> Result<i16, ScriptError> {
    Ok(rd_u16(buf, off)? as i16)
}

fn rd_u32(buf: &[u8], off: &mut usize) -> Result<u32, ScriptError> {
    let bytes = buf
        .get(*off..*off + 4)
        .ok_or(ScriptError::Truncated { off: *off })?;
    *off += 4;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read one argument, resolving it through the field accessor when its
/// bit is set in the opcode's indirect mask.
fn rd_arg(
    ctx: &GameContext,
    key: i32,
    buf: &[u8],
    off: &mut usize,
    mask: u8,
    slot: u8,
) -> Result<i32, ScriptError> {
    let raw = rd_i16(buf, off)? as i32;
    Ok(if mask & (1 << slot) != 0 { read_field(ctx, key, raw) } else { raw })
}

// ============================================================
// Condition opcodes
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CondOp {
    Always,
    AnimEnded,
    GotMessage { code: i32 },
    GotMessageFrom { sender: i32, code: i32 },
    FieldEq { fid: i32, value: i32 },
    FieldLt { fid: i32, value: i32 },
    FieldGt { fid: i32, value: i32 },
    TestFlags { mask: i32 },
    CanSee { target: i32 },
    DistanceBelow { target: i32, dist: i32 },
    SameRoom { target: i32 },
    InputPressed { mask: i32 },
    Blocked,
    BlockedBy { target: i32 },
    AngleNear { target: i32, tol: i32 },
    Chance { percent: i32 },
}

/// Outcome of one condition opcode. A missing target forces the whole
/// opcode false, negation included.
enum CondResult {
    Value(bool),
    MissingTarget,
}

fn decode_cond(
    ctx: &GameContext,
    key: i32,
    off: &mut usize,
) -> Result<(CondOp, bool), ScriptError> {
    let buf = &ctx.cond;
    let at = *off;
    let code = rd_u8(buf, off)?;
    let negate = code & CO_NEGATE != 0;
    let mask = rd_u8(buf, off)?;
    let arg = |off: &mut usize, slot: u8| rd_arg(ctx, key, buf, off, mask, slot);

    let op = match code & !CO_NEGATE {
        CO_ALWAYS => CondOp::Always,
        CO_ANIM_ENDED => CondOp::AnimEnded,
        CO_GOT_MESSAGE => CondOp::GotMessage { code: arg(off, 0)? },
        CO_GOT_MESSAGE_FROM => {
            CondOp::GotMessageFrom { sender: arg(off, 0)?, code: arg(off, 1)? }
        }
        CO_FIELD_EQ => CondOp::FieldEq { fid: arg(off, 0)?, value: arg(off, 1)? },
        CO_FIELD_LT => CondOp::FieldLt { fid: arg(off, 0)?, value: arg(off, 1)? },
        CO_FIELD_GT => CondOp::FieldGt { fid: arg(off, 0)?, value: arg(off, 1)? },
        CO_TEST_FLAGS => CondOp::TestFlags { mask: arg(off, 0)? },
        CO_CAN_SEE => CondOp::CanSee { target: arg(off, 0)? },
        CO_DIST_BELOW => CondOp::DistanceBelow { target: arg(off, 0)?, dist: arg(off, 1)? },
        CO_SAME_ROOM => CondOp::SameRoom { target: arg(off, 0)? },
        CO_INPUT => CondOp::InputPressed { mask: arg(off, 0)? },
        CO_BLOCKED => CondOp::Blocked,
        CO_BLOCKED_BY => CondOp::BlockedBy { target: arg(off, 0)? },
        CO_ANGLE_NEAR => CondOp::AngleNear { target: arg(off, 0)?, tol: arg(off, 1)? },
        CO_CHANCE => CondOp::Chance { percent: arg(off, 0)? },
        other => return Err(ScriptError::UnknownCondOp { op: other, off: at }),
    };
    Ok((op, negate))
}

/// Line-of-sight flavor used by `CanSee`: the looked-for entity is
/// always eligible (even when non-solid), everything else obstructs
/// under the plain sight rules.
struct LookRay {
    ignore: i32,
    target: i32,
}

impl RayPolicy for LookRay {
    fn visit_occupant(&mut self, key: i32, occ: &Collider) -> OccVisit {
        if key == self.target {
            OccVisit::Test
        } else if key == self.ignore
            || !occ.flags.contains(ColliderFlags::SOLID)
            || occ.flags.contains(ColliderFlags::DECOR)
        {
            OccVisit::Ignore
        } else {
            OccVisit::Test
        }
    }
}

fn eval_cond(ctx: &mut GameContext, ec: &ExecCtx, op: CondOp) -> CondResult {
    use CondResult::*;
    let key = ec.current;
    let live = |ctx: &GameContext, t: i32| ctx.is_live(t);

    match op {
        CondOp::Always => Value(true),
        CondOp::AnimEnded => Value(ctx.ents[key as usize].anim.ended),
        CondOp::GotMessage { code } => {
            Value(ctx.cur_msgs.iter().any(|m| m.code as i32 == code))
        }
        CondOp::GotMessageFrom { sender, code } => Value(
            ctx.cur_msgs
                .iter()
                .any(|m| m.sender == sender && m.code as i32 == code),
        ),
        CondOp::FieldEq { fid, value } => Value(read_field(ctx, key, fid) == value),
        CondOp::FieldLt { fid, value } => Value(read_field(ctx, key, fid) < value),
        CondOp::FieldGt { fid, value } => Value(read_field(ctx, key, fid) > value),
        CondOp::TestFlags { mask } => {
            Value(ctx.ents[key as usize].flags.bits() as i32 & mask != 0)
        }
        CondOp::CanSee { target } => {
            if !live(ctx, target) || target == key {
                return MissingTarget;
            }
            let pose = ctx.ents[key as usize].pose;
            let tpose = ctx.ents[target as usize].pose;
            let ray = Ray {
                x: pose.x,
                y: pose.y,
                z: pose.z,
                yaw: angle_from_delta(tpose.x - pose.x, tpose.z - pose.z),
                ..Ray::default()
            };
            let mut policy = LookRay { ignore: key, target };
            let hit = cast_ray(&mut ctx.world, ray, &mut policy);
            Value(matches!(hit, Some(h) if h.kind == RayHitKind::Occupant(target)))
        }
        CondOp::DistanceBelow { target, dist } => {
            if !live(ctx, target) {
                return MissingTarget;
            }
            let pose = ctx.ents[key as usize].pose;
            let tpose = ctx.ents[target as usize].pose;
            Value(dist_approx(tpose.x - pose.x, tpose.z - pose.z) < dist)
        }
        CondOp::SameRoom { target } => {
            if !live(ctx, target) {
                return MissingTarget;
            }
            let mine = ctx.room_of(key);
            let theirs = ctx.room_of(target);
            Value(mine != 0 && mine == theirs)
        }
        CondOp::InputPressed { mask } => Value(ctx.input_edges as i32 & mask != 0),
        CondOp::Blocked => Value(ctx.world.last_blocker().is_some()),
        CondOp::BlockedBy { target } => {
            Value(ctx.world.last_blocker() == Some(Blocker::Entity(target)))
        }
        CondOp::AngleNear { target, tol } => {
            if !live(ctx, target) {
                return MissingTarget;
            }
            let pose = ctx.ents[key as usize].pose;
            let tpose = ctx.ents[target as usize].pose;
            let bearing = angle_from_delta(tpose.x - pose.x, tpose.z - pose.z);
            Value(angle_diff(pose.yaw, bearing).abs() <= tol)
        }
        CondOp::Chance { percent } => Value(ctx.rng.gen_range(0..100) < percent),
    }
}

// ============================================================
// Statement opcodes
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StmtOp {
    End,
    SetField { fid: i32, value: i32 },
    AddField { fid: i32, delta: i32 },
    SetAnim { table: i32, seq: i32 },
    SetYaw { angle: i32 },
    TurnBy { delta: i32 },
    TurnToward { target: i32 },
    StepForward { dist: i32 },
    StepMove { dx: i32, dz: i32 },
    Teleport { x: i32, z: i32 },
    PostMessage { target: i32, code: i32 },
    Reparent { parent: i32 },
    Vanish,
    SetFlags { mask: i32 },
    ClearFlags { mask: i32 },
    SetChannels { mask: i32 },
    PlaySound { key: i32 },
    StartCutscene { key: i32 },
    FireRay { type_mask: i32, fid: i32 },
    Random { fid: i32, max: i32 },
}

fn decode_stmt(ctx: &GameContext, key: i32, off: &mut usize) -> Result<StmtOp, ScriptError> {
    let buf = &ctx.stmt;
    let at = *off;
    let code = rd_u8(buf, off)?;
    let mask = rd_u8(buf, off)?;
    let arg = |off: &mut usize, slot: u8| rd_arg(ctx, key, buf, off, mask, slot);

    Ok(match code {
        SO_END => StmtOp::End,
        SO_SET_FIELD => StmtOp::SetField { fid: arg(off, 0)?, value: arg(off, 1)? },
        SO_ADD_FIELD => StmtOp::AddField { fid: arg(off, 0)?, delta: arg(off, 1)? },
        SO_SET_ANIM => StmtOp::SetAnim { table: arg(off, 0)?, seq: arg(off, 1)? },
        SO_SET_YAW => StmtOp::SetYaw { angle: arg(off, 0)? },
        SO_TURN_BY => StmtOp::TurnBy { delta: arg(off, 0)? },
        SO_TURN_TOWARD => StmtOp::TurnToward { target: arg(off, 0)? },
        SO_STEP_FORWARD => StmtOp::StepForward { dist: arg(off, 0)? },
        SO_STEP_MOVE => StmtOp::StepMove { dx: arg(off, 0)?, dz: arg(off, 1)? },
        SO_TELEPORT => StmtOp::Teleport { x: arg(off, 0)?, z: arg(off, 1)? },
        SO_POST_MESSAGE => StmtOp::PostMessage { target: arg(off, 0)?, code: arg(off, 1)? },
        SO_REPARENT => StmtOp::Reparent { parent: arg(off, 0)? },
        SO_VANISH => StmtOp::Vanish,
        SO_SET_FLAGS => StmtOp::SetFlags { mask: arg(off, 0)? },
        SO_CLEAR_FLAGS => StmtOp::ClearFlags { mask: arg(off, 0)? },
        SO_SET_CHANNELS => StmtOp::SetChannels { mask: arg(off, 0)? },
        SO_PLAY_SOUND => StmtOp::PlaySound { key: arg(off, 0)? },
        SO_START_CUTSCENE => StmtOp::StartCutscene { key: arg(off, 0)? },
        SO_FIRE_RAY => StmtOp::FireRay { type_mask: arg(off, 0)?, fid: arg(off, 1)? },
        SO_RANDOM => StmtOp::Random { fid: arg(off, 0)?, max: arg(off, 1)? },
        other => return Err(ScriptError::UnknownStmtOp { op: other, off: at }),
    })
}

/// Bind an entity to an animation state: cursor restarted, condition
/// chain re-armed, a fresh evaluation requested. The loop-guard inert
/// state is lifted here, which is also the external re-arm path.
pub fn set_anim(ctx: &mut GameContext, key: i32, table: i32, seq: i32) {
    let Some((cond_off, first_ticks, empty)) = (table >= 0 && seq >= 0)
        .then(|| ctx.anims.get(table as usize))
        .flatten()
        .and_then(|t| t.seqs.get(seq as usize))
        .map(|s| (s.cond_off, s.frames.first().map(|f| f.ticks).unwrap_or(0), s.frames.is_empty()))
    else {
        tracing::debug!(key, table, seq, "set_anim on unknown sequence ignored");
        return;
    };
    let ent = &mut ctx.ents[key as usize];
    ent.anim.table = table;
    ent.anim.seq = seq;
    ent.anim.frame = 0;
    ent.anim.ticks_left = first_ticks;
    ent.anim.ended = empty;
    ent.cond_off = cond_off;
    ent.flags.insert(EntityFlags::TRIGGERED);
    ent.flags.remove(EntityFlags::INERT);
}

/// Push an entity-flag change out to its collider mirror.
fn sync_collider_flags(ctx: &mut GameContext, key: i32) {
    let flags = ctx.ents[key as usize].flags.collider_flags();
    let channels = ctx.ents[key as usize].channels;
    if let Some(col) = ctx.world.collider_mut(key) {
        col.flags = flags;
        col.channels = channels;
    }
}

fn exec_stmt(ctx: &mut GameContext, ec: &ExecCtx, op: StmtOp) -> Result<(), ScriptError> {
    let key = ec.current;
    match op {
        StmtOp::End => {}
        StmtOp::SetField { fid, value } => write_field(ctx, key, fid, value),
        StmtOp::AddField { fid, delta } => {
            let v = read_field(ctx, key, fid);
            write_field(ctx, key, fid, v.wrapping_add(delta));
        }
        StmtOp::SetAnim { table, seq } => set_anim(ctx, key, table, seq),
        StmtOp::SetYaw { angle } => {
            ctx.ents[key as usize].pose.yaw = angle_norm(angle);
        }
        StmtOp::TurnBy { delta } => {
            let yaw = ctx.ents[key as usize].pose.yaw;
            ctx.ents[key as usize].pose.yaw = angle_norm(yaw + delta);
        }
        StmtOp::TurnToward { target } => {
            if ctx.is_live(target) {
                let pose = ctx.ents[key as usize].pose;
                let tpose = ctx.ents[target as usize].pose;
                ctx.ents[key as usize].pose.yaw =
                    angle_from_delta(tpose.x - pose.x, tpose.z - pose.z);
            }
        }
        StmtOp::StepForward { dist } => {
            g_phys::step_forward(ctx, key, dist);
        }
        StmtOp::StepMove { dx, dz } => {
            let pose = ctx.ents[key as usize].pose;
            g_phys::try_move(ctx, key, pose.x + dx, pose.z + dz);
        }
        StmtOp::Teleport { x, z } => g_phys::teleport(ctx, key, x, z),
        StmtOp::PostMessage { target, code } => {
            post_message(ctx, target, key, code as u16);
        }
        StmtOp::Reparent { parent } => {
            ctx.changed.push(PendingChange::Reparent { ent: key, parent });
        }
        StmtOp::Vanish => {
            ctx.changed.push(PendingChange::Vanish { ent: key });
        }
        StmtOp::SetFlags { mask } => {
            ctx.ents[key as usize]
                .flags
                .insert(EntityFlags::from_bits_truncate(mask as u16));
            sync_collider_flags(ctx, key);
        }
        StmtOp::ClearFlags { mask } => {
            ctx.ents[key as usize]
                .flags
                .remove(EntityFlags::from_bits_truncate(mask as u16));
            sync_collider_flags(ctx, key);
        }
        StmtOp::SetChannels { mask } => {
            ctx.ents[key as usize].channels = mask as u16;
            sync_collider_flags(ctx, key);
        }
        StmtOp::PlaySound { key: snd } => ctx.imports.play_sound(key, snd),
        StmtOp::StartCutscene { key: scene } => ctx.imports.start_cutscene(scene),
        StmtOp::FireRay { type_mask, fid } => {
            let pose = ctx.ents[key as usize].pose;
            let ray = Ray { x: pose.x, y: pose.y, z: pose.z, yaw: pose.yaw, ..Ray::default() };
            let mut policy = TypedRay { ignore: key, type_mask: type_mask as u16 };
            let hit = cast_ray(&mut ctx.world, ray, &mut policy);
            match hit {
                Some(h) => {
                    if let RayHitKind::Occupant(victim) = h.kind {
                        write_field(ctx, key, fid, victim);
                        post_message(ctx, victim, key, MSG_RAY_HIT);
                    } else {
                        write_field(ctx, key, fid, -1);
                    }
                }
                None => write_field(ctx, key, fid, -1),
            }
        }
        StmtOp::Random { fid, max } => {
            let v = if max > 0 { ctx.rng.gen_range(0..max) } else { 0 };
            write_field(ctx, key, fid, v);
        }
    }
    Ok(())
}

// ============================================================
// Script execution
// ============================================================

/// One evaluation pass: drain the pending messages, walk the condition
/// chain, execute the first matching record's statements. Returns
/// whether any statements ran.
pub fn run_script(ctx: &mut GameContext, ec: &ExecCtx) -> Result<bool, ScriptError> {
    let key = ec.current;
    let start = ctx.ents[key as usize].cond_off;
    drain_messages(ctx, key);
    if start == NO_SCRIPT {
        return Ok(false);
    }

    let mut off = start as usize;
    loop {
        let op_len = rd_u16(&ctx.cond, &mut off)?;
        if op_len == 0xffff {
            return Ok(false);
        }
        let stmt_off = rd_u32(&ctx.cond, &mut off)?;
        let end = off + op_len as usize;

        let mut holds = true;
        while off < end {
            let (op, negate) = decode_cond(ctx, key, &mut off)?;
            if off > end {
                return Err(ScriptError::Truncated { off: end });
            }
            let v = match eval_cond(ctx, ec, op) {
                CondResult::Value(v) => v != negate,
                CondResult::MissingTarget => false,
            };
            if !v {
                holds = false;
                break;
            }
        }

        if holds {
            exec_stmts(ctx, ec, stmt_off as usize)?;
            return Ok(true);
        }
        off = end;
    }
}

fn exec_stmts(ctx: &mut GameContext, ec: &ExecCtx, mut off: usize) -> Result<(), ScriptError> {
    loop {
        let op = decode_stmt(ctx, ec.current, &mut off)?;
        if op == StmtOp::End {
            return Ok(());
        }
        exec_stmt(ctx, ec, op)?;
    }
}

/// Run an entity's script for this tick, re-evaluating while the
/// execution keeps re-triggering it (immediate state transitions,
/// self-posted messages), up to the loop guard. A guard trip forces
/// the entity inert instead of spinning the tick forever.
pub fn run_entity(ctx: &mut GameContext, key: i32) -> Result<(), ScriptError> {
    for _pass in 0..MAX_SCRIPT_PASSES {
        ctx.ents[key as usize].flags.remove(EntityFlags::TRIGGERED);
        let ec = ExecCtx { current: key, depth: 0 };
        run_script(ctx, &ec)?;
        if !ctx.ents[key as usize].flags.contains(EntityFlags::TRIGGERED) {
            return Ok(());
        }
    }
    tracing::warn!(entity = key, passes = MAX_SCRIPT_PASSES, "script loop guard tripped");
    let ent = &mut ctx.ents[key as usize];
    ent.flags.remove(EntityFlags::TRIGGERED);
    ent.flags.insert(EntityFlags::INERT);
    Ok(())
}

// ============================================================
// Tests
// ============================================================


#[cfg(test)]
mod tests {
    use super::build::*;
    use super::*;
    use crate::g_anim::{AnimFrame, AnimSeq, AnimTable};
    use crate::g_spawn::spawn_level;
    use crate::g_utils::pending_message_count;
    use crate::game::{LevelData, Placement};
    use crate::game_import::NullImport;
    use myrift_common::cgrid::CellInit;

    fn cell_center(cx: i32, cz: i32) -> (i32, i32) {
        (cx * CELL_SIZE + CELL_SIZE / 2, cz * CELL_SIZE + CELL_SIZE / 2)
    }

    /// Context whose placements all start in sequence (0,0) with the
    /// condition chain at offset 0.
    fn script_ctx(
        cond: Vec<u8>,
        stmt: Vec<u8>,
        cells: Vec<CellInit>,
        placements: Vec<Placement>,
    ) -> GameContext {
        let anims = vec![AnimTable {
            seqs: vec![AnimSeq {
                frames: vec![AnimFrame { model_frame: 0, ticks: 1 }],
                input_mask: 0,
                looping: true,
                cond_off: 0,
            }],
        }];
        let level = LevelData { cells, cond, stmt, anims, placements };
        spawn_level(Box::<NullImport>::default(), &level).unwrap()
    }

    fn one_entity_ctx(cond: Vec<u8>, stmt: Vec<u8>) -> GameContext {
        let (x, z) = cell_center(10, 10);
        script_ctx(cond, stmt, vec![], vec![Placement { x, z, ..Placement::default() }])
    }

    #[test]
    fn test_field_accessor_roundtrip() {
        let mut ctx = one_entity_ctx(vec![], vec![]);
        write_field(&mut ctx, 2, 3, 77);
        write_field(&mut ctx, 2, FID_CUSTOM_BASE + 1, -5);
        write_field(&mut ctx, 2, FID_YAW, 1030);
        assert_eq!(read_field(&ctx, 2, 3), 77);
        assert_eq!(read_field(&ctx, 2, FID_CUSTOM_BASE + 1), -5);
        assert_eq!(read_field(&ctx, 2, FID_YAW), 6);
        assert_eq!(read_field(&ctx, 2, FID_KEY), 2);
        assert_eq!(read_field(&ctx, 2, 99), 0, "unknown field reads 0");
        // Read-only pseudo field ignores the write.
        write_field(&mut ctx, 2, FID_KEY, 9);
        assert_eq!(read_field(&ctx, 2, FID_KEY), 2);
    }

    #[test]
    fn test_first_matching_record_wins() {
        let mut stmt = Vec::new();
        let s_a = stmt.len() as u32;
        op(&mut stmt, SO_SET_FIELD, 0, &[0, 11]);
        op(&mut stmt, SO_END, 0, &[]);
        let s_b = stmt.len() as u32;
        op(&mut stmt, SO_SET_FIELD, 0, &[0, 22]);
        op(&mut stmt, SO_END, 0, &[]);

        let mut cond = Vec::new();
        // First record: S1 == 5 (false initially).
        cond_record(&mut cond, s_a, |c| op(c, CO_FIELD_EQ, 0, &[1, 5]));
        // Second record: always.
        cond_record(&mut cond, s_b, |c| op(c, CO_ALWAYS, 0, &[]));
        end_chain(&mut cond);

        let mut ctx = one_entity_ctx(cond, stmt);
        let ec = ExecCtx { current: 2, depth: 0 };
        assert!(run_script(&mut ctx, &ec).unwrap());
        assert_eq!(read_field(&ctx, 2, 0), 22);

        // Arm the first record; it now shadows the second.
        write_field(&mut ctx, 2, 1, 5);
        assert!(run_script(&mut ctx, &ec).unwrap());
        assert_eq!(read_field(&ctx, 2, 0), 11);
    }

    #[test]
    fn test_negation_and_and_chain() {
        let mut stmt = Vec::new();
        op(&mut stmt, SO_SET_FIELD, 0, &[0, 1]);
        op(&mut stmt, SO_END, 0, &[]);

        // NOT(S1 == 5) AND S2 > 3
        let mut cond = Vec::new();
        cond_record(&mut cond, 0, |c| {
            op(c, CO_FIELD_EQ | CO_NEGATE, 0, &[1, 5]);
            op(c, CO_FIELD_GT, 0, &[2, 3]);
        });
        end_chain(&mut cond);

        let mut ctx = one_entity_ctx(cond, stmt);
        let ec = ExecCtx { current: 2, depth: 0 };

        assert!(!run_script(&mut ctx, &ec).unwrap(), "S2 not > 3 yet");
        write_field(&mut ctx, 2, 2, 10);
        assert!(run_script(&mut ctx, &ec).unwrap());
        write_field(&mut ctx, 2, 1, 5); // arms the negated opcode
        assert!(!run_script(&mut ctx, &ec).unwrap());
    }

    #[test]
    fn test_indirect_argument_resolution() {
        let mut stmt = Vec::new();
        // S0 = value of the field named by S1 (indirect arg 1).
        op(&mut stmt, SO_SET_FIELD, 0b10, &[0, 1]);
        op(&mut stmt, SO_END, 0, &[]);
        let mut cond = Vec::new();
        cond_record(&mut cond, 0, |c| op(c, CO_ALWAYS, 0, &[]));
        end_chain(&mut cond);

        let mut ctx = one_entity_ctx(cond, stmt);
        write_field(&mut ctx, 2, 1, 42);
        let ec = ExecCtx { current: 2, depth: 0 };
        assert!(run_script(&mut ctx, &ec).unwrap());
        // Indirect slot 1 resolved field id 1 -> 42.
        assert_eq!(read_field(&ctx, 2, 0), 42);
    }

    #[test]
    fn test_missing_target_false_even_negated() {
        let mut stmt = Vec::new();
        op(&mut stmt, SO_SET_FIELD, 0, &[0, 1]);
        op(&mut stmt, SO_END, 0, &[]);
        // NOT CanSee(99): target missing, so the opcode is false, not true.
        let mut cond = Vec::new();
        cond_record(&mut cond, 0, |c| op(c, CO_CAN_SEE | CO_NEGATE, 0, &[99]));
        end_chain(&mut cond);

        let mut ctx = one_entity_ctx(cond, stmt);
        let ec = ExecCtx { current: 2, depth: 0 };
        assert!(!run_script(&mut ctx, &ec).unwrap());
        assert_eq!(read_field(&ctx, 2, 0), 0);
    }

    #[test]
    fn test_unknown_opcodes_are_fatal() {
        let mut cond = Vec::new();
        cond_record(&mut cond, 0, |c| op(c, 0x7e, 0, &[]));
        end_chain(&mut cond);
        let mut ctx = one_entity_ctx(cond, vec![]);
        let ec = ExecCtx { current: 2, depth: 0 };
        assert_eq!(
            run_script(&mut ctx, &ec),
            Err(ScriptError::UnknownCondOp { op: 0x7e, off: 6 })
        );

        let mut stmt = Vec::new();
        op(&mut stmt, 0x44, 0, &[]);
        let mut cond = Vec::new();
        cond_record(&mut cond, 0, |c| op(c, CO_ALWAYS, 0, &[]));
        end_chain(&mut cond);
        let mut ctx = one_entity_ctx(cond, stmt);
        assert_eq!(
            run_script(&mut ctx, &ec),
            Err(ScriptError::UnknownStmtOp { op: 0x44, off: 0 })
        );
    }

    #[test]
    fn test_truncated_record_is_fatal() {
        let mut cond = Vec::new();
        // Declares a 1-byte chain but the opcode needs two header bytes.
        cond.extend(1u16.to_le_bytes());
        cond.extend(0u32.to_le_bytes());
        cond.push(CO_ALWAYS);
        let mut ctx = one_entity_ctx(cond, vec![]);
        let ec = ExecCtx { current: 2, depth: 0 };
        assert!(matches!(
            run_script(&mut ctx, &ec),
            Err(ScriptError::Truncated { .. })
        ));
    }

    #[test]
    fn test_got_message_drain_scenario() {
        let mut stmt = Vec::new();
        op(&mut stmt, SO_SET_FIELD, 0, &[0, 1]);
        op(&mut stmt, SO_END, 0, &[]);
        let mut cond = Vec::new();
        cond_record(&mut cond, 0, |c| op(c, CO_GOT_MESSAGE, 0, &[57]));
        end_chain(&mut cond);
        let mut ctx = one_entity_ctx(cond, stmt);

        // B posts code 57 to itself twice; the pair dedups.
        post_message(&mut ctx, 2, 2, 57);
        post_message(&mut ctx, 2, 2, 57);
        assert_eq!(pending_message_count(&ctx, 2), 1);

        let ec = ExecCtx { current: 2, depth: 0 };
        assert!(run_script(&mut ctx, &ec).unwrap());
        // The drained list seen by the execution held exactly one entry.
        assert_eq!(ctx.cur_msgs.len(), 1);
        assert_eq!(ctx.cur_msgs[0].code, 57);
        assert_eq!(pending_message_count(&ctx, 2), 0);
        assert_eq!(read_field(&ctx, 2, 0), 1);
    }

    #[test]
    fn test_loop_guard_bounds_cascade() {
        // Always -> (count the pass, rebind the same state), which
        // re-triggers immediately and would cascade forever.
        let mut stmt = Vec::new();
        op(&mut stmt, SO_ADD_FIELD, 0, &[0, 1]);
        op(&mut stmt, SO_SET_ANIM, 0, &[0, 0]);
        op(&mut stmt, SO_END, 0, &[]);
        let mut cond = Vec::new();
        cond_record(&mut cond, 0, |c| op(c, CO_ALWAYS, 0, &[]));
        end_chain(&mut cond);

        let mut ctx = one_entity_ctx(cond, stmt);
        run_entity(&mut ctx, 2).unwrap();
        assert_eq!(read_field(&ctx, 2, 0), MAX_SCRIPT_PASSES as i32);
        assert!(ctx.ents[2].flags.contains(EntityFlags::INERT));
        assert!(!ctx.ents[2].flags.contains(EntityFlags::TRIGGERED));

        // set_anim is the re-arm path.
        set_anim(&mut ctx, 2, 0, 0);
        assert!(!ctx.ents[2].flags.contains(EntityFlags::INERT));
    }

    #[test]
    fn test_step_forward_and_blocked_condition() {
        let mut stmt = Vec::new();
        let s_step = stmt.len() as u32;
        op(&mut stmt, SO_STEP_FORWARD, 0, &[512]);
        op(&mut stmt, SO_END, 0, &[]);
        let s_hit = stmt.len() as u32;
        op(&mut stmt, SO_SET_FIELD, 0, &[0, 1]);
        op(&mut stmt, SO_END, 0, &[]);

        let mut cond = Vec::new();
        // Blocked since the last tick boundary? Then note it; else walk.
        cond_record(&mut cond, s_hit, |c| op(c, CO_BLOCKED, 0, &[]));
        cond_record(&mut cond, s_step, |c| op(c, CO_ALWAYS, 0, &[]));
        end_chain(&mut cond);

        let (x, z) = cell_center(10, 10);
        let mut ctx = script_ctx(
            cond,
            stmt,
            vec![CellInit::terrain(10, 11, CellKind::Wall)],
            vec![Placement { x, z, footprint: Footprint::square(2), ..Placement::default() }],
        );
        // Facing +Z, straight into the wall.
        let ec = ExecCtx { current: 2, depth: 0 };
        assert!(run_script(&mut ctx, &ec).unwrap());
        assert_eq!(ctx.ents[2].pose.z, z, "rejected move leaves the pose");
        assert_eq!(ctx.world.last_blocker(), Some(Blocker::Terrain { cx: 10, cz: 11 }));

        // Next pass sees the blocked side channel.
        assert!(run_script(&mut ctx, &ec).unwrap());
        assert_eq!(read_field(&ctx, 2, 0), 1);
    }

    #[test]
    fn test_fire_ray_writes_victim_and_posts() {
        let mut stmt = Vec::new();
        op(&mut stmt, SO_FIRE_RAY, 0, &[1 << 3, 0]);
        op(&mut stmt, SO_END, 0, &[]);
        let mut cond = Vec::new();
        cond_record(&mut cond, 0, |c| op(c, CO_ALWAYS, 0, &[]));
        end_chain(&mut cond);

        let (sx, sz) = cell_center(10, 10);
        let (vx, vz) = cell_center(10, 13);
        let mut ctx = script_ctx(
            cond,
            stmt,
            vec![],
            vec![
                Placement { x: sx, z: sz, ..Placement::default() },
                Placement { x: vx, z: vz, kind: 3, ..Placement::default() },
            ],
        );
        // Shooter 2 faces +Z toward victim 3.
        let ec = ExecCtx { current: 2, depth: 0 };
        assert!(run_script(&mut ctx, &ec).unwrap());
        assert_eq!(read_field(&ctx, 2, 0), 3);
        assert_eq!(pending_message_count(&ctx, 3), 1);
        let mut drained = Vec::new();
        crate::g_utils::drain_messages(&mut ctx, 3);
        drained.extend(ctx.cur_msgs.iter().copied());
        assert_eq!(drained[0].code, MSG_RAY_HIT);
        assert_eq!(drained[0].sender, 2);
    }

    #[test]
    fn test_fire_ray_miss_writes_minus_one() {
        let mut stmt = Vec::new();
        op(&mut stmt, SO_FIRE_RAY, 0, &[1 << 3, 0]);
        op(&mut stmt, SO_END, 0, &[]);
        let mut cond = Vec::new();
        cond_record(&mut cond, 0, |c| op(c, CO_ALWAYS, 0, &[]));
        end_chain(&mut cond);
        let (sx, sz) = cell_center(10, 10);
        let mut ctx =
            one_entity_ctx_at(cond, stmt, sx, sz);
        write_field(&mut ctx, 2, 0, 123);
        let ec = ExecCtx { current: 2, depth: 0 };
        assert!(run_script(&mut ctx, &ec).unwrap());
        assert_eq!(read_field(&ctx, 2, 0), -1);
    }

    fn one_entity_ctx_at(cond: Vec<u8>, stmt: Vec<u8>, x: i32, z: i32) -> GameContext {
        script_ctx(cond, stmt, vec![], vec![Placement { x, z, ..Placement::default() }])
    }

    #[test]
    fn test_collaborator_calls_recorded() {
        let mut stmt = Vec::new();
        op(&mut stmt, SO_PLAY_SOUND, 0, &[41]);
        op(&mut stmt, SO_START_CUTSCENE, 0, &[7]);
        op(&mut stmt, SO_END, 0, &[]);
        let mut cond = Vec::new();
        cond_record(&mut cond, 0, |c| op(c, CO_ALWAYS, 0, &[]));
        end_chain(&mut cond);

        let mut ctx = one_entity_ctx(cond, stmt);
        let ec = ExecCtx { current: 2, depth: 0 };
        run_script(&mut ctx, &ec).unwrap();
        run_script(&mut ctx, &ec).unwrap();
        let imports = ctx.imports.as_any();
        let null = imports.downcast_ref::<NullImport>().unwrap();
        assert_eq!(null.sounds, vec![(2, 41), (2, 41)]);
        assert_eq!(null.cutscenes, vec![7, 7]);
    }

    #[test]
    fn test_chance_extremes() {
        let mut stmt = Vec::new();
        op(&mut stmt, SO_ADD_FIELD, 0, &[0, 1]);
        op(&mut stmt, SO_END, 0, &[]);
        let mut cond = Vec::new();
        cond_record(&mut cond, 0, |c| op(c, CO_CHANCE, 0, &[100]));
        end_chain(&mut cond);
        let mut ctx = one_entity_ctx(cond, stmt);
        let ec = ExecCtx { current: 2, depth: 0 };
        for _ in 0..8 {
            assert!(run_script(&mut ctx, &ec).unwrap());
        }

        let mut cond = Vec::new();
        cond_record(&mut cond, 0, |c| op(c, CO_CHANCE, 0, &[0]));
        end_chain(&mut cond);
        let mut ctx = one_entity_ctx(cond, stmt_clone());
        fn stmt_clone() -> Vec<u8> {
            let mut stmt = Vec::new();
            op(&mut stmt, SO_ADD_FIELD, 0, &[0, 1]);
            op(&mut stmt, SO_END, 0, &[]);
            stmt
        }
        for _ in 0..8 {
            assert!(!run_script(&mut ctx, &ec).unwrap());
        }
    }

    #[test]
    fn test_structural_edits_deferred() {
        let mut stmt = Vec::new();
        op(&mut stmt, SO_REPARENT, 0, &[3]);
        op(&mut stmt, SO_VANISH, 0, &[]);
        op(&mut stmt, SO_END, 0, &[]);
        let mut cond = Vec::new();
        cond_record(&mut cond, 0, |c| op(c, CO_ALWAYS, 0, &[]));
        end_chain(&mut cond);

        let (x, z) = cell_center(10, 10);
        let (x2, z2) = cell_center(20, 20);
        let mut ctx = script_ctx(
            cond,
            stmt,
            vec![],
            vec![
                Placement { x, z, ..Placement::default() },
                Placement { x: x2, z: z2, ..Placement::default() },
            ],
        );
        let ec = ExecCtx { current: 2, depth: 0 };
        run_script(&mut ctx, &ec).unwrap();
        // Nothing applied in place; both requests sit in the batch.
        assert_eq!(ctx.ents[2].parent, ctx.root);
        assert_eq!(
            ctx.changed,
            vec![
                PendingChange::Reparent { ent: 2, parent: 3 },
                PendingChange::Vanish { ent: 2 }
            ]
        );
    }
}
