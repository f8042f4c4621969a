// g_anim.rs — animation frame tables and per-entity cursors

/// One displayed frame: which model frame to show and for how many
/// ticks it holds.
#[derive(Debug, Clone, Copy)]
pub struct AnimFrame {
    pub model_frame: u16,
    pub ticks: u8,
}

/// One animation sequence (an entity "state"). `cond_off` binds the
/// state to its condition chain in the level's condition buffer;
/// `input_mask` selects which input edges promote the entity while it
/// is in this state.
#[derive(Debug, Clone, Default)]
pub struct AnimSeq {
    pub frames: Vec<AnimFrame>,
    pub input_mask: u8,
    pub looping: bool,
    pub cond_off: u32,
}

#[derive(Debug, Clone, Default)]
pub struct AnimTable {
    pub seqs: Vec<AnimSeq>,
}

/// An entity's position within its current sequence. `table`/`seq` of
/// -1 means "no animation bound" (the entity still scripts, it just
/// never produces sequence-end triggers).
#[derive(Debug, Clone, Copy)]
pub struct AnimCursor {
    pub table: i32,
    pub seq: i32,
    pub frame: u16,
    pub ticks_left: u8,
    /// The sequence finished (and wrapped, if looping) since the last
    /// state change; readable by condition opcodes.
    pub ended: bool,
}

impl Default for AnimCursor {
    fn default() -> Self {
        Self { table: -1, seq: -1, frame: 0, ticks_left: 0, ended: false }
    }
}

impl AnimCursor {
    /// Bind the cursor to a sequence, restarting it.
    pub fn rebind(&mut self, table: i32, seq: i32, seq_data: &AnimSeq) {
        self.table = table;
        self.seq = seq;
        self.frame = 0;
        self.ticks_left = seq_data.frames.first().map(|f| f.ticks).unwrap_or(0);
        self.ended = seq_data.frames.is_empty();
    }
}

/// Look up a cursor's sequence in the tables.
pub fn seq_of<'a>(anims: &'a [AnimTable], cursor: &AnimCursor) -> Option<&'a AnimSeq> {
    if cursor.table < 0 || cursor.seq < 0 {
        return None;
    }
    anims
        .get(cursor.table as usize)
        .and_then(|t| t.seqs.get(cursor.seq as usize))
}

/// Model frame to draw for a cursor (0 when unbound).
pub fn model_frame(anims: &[AnimTable], cursor: &AnimCursor) -> u16 {
    seq_of(anims, cursor)
        .and_then(|s| s.frames.get(cursor.frame as usize))
        .map(|f| f.model_frame)
        .unwrap_or(0)
}

/// Advance a cursor by one tick. Returns true when the sequence ended
/// this tick (looping sequences wrap and still report the end; a
/// non-looping sequence holds its last frame).
pub fn advance(anims: &[AnimTable], cursor: &mut AnimCursor) -> bool {
    let Some(seq) = seq_of(anims, cursor) else { return false };
    let nframes = seq.frames.len() as u16;
    if nframes == 0 {
        return false;
    }

    if cursor.ticks_left > 0 {
        cursor.ticks_left -= 1;
        if cursor.ticks_left > 0 {
            return false;
        }
    }

    if cursor.frame + 1 < nframes {
        cursor.frame += 1;
        cursor.ticks_left = seq.frames[cursor.frame as usize].ticks;
        false
    } else {
        if seq.looping {
            cursor.frame = 0;
            cursor.ticks_left = seq.frames[0].ticks;
            cursor.ended = true;
            return true;
        }
        // A held final frame reports its end once.
        let first = !cursor.ended;
        cursor.ended = true;
        first
    }
}
