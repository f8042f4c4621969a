// game_import.rs — functions provided by the engine shell to the game module
//
// Audio and cutscene playback live outside this core; scripts call
// them fire-and-forget and never observe a result. The import object
// is a field of the game context rather than a global, so tests can
// substitute their own.

/// Engine services consumed by script side effects.
pub trait EngineImport {
    /// Play a sound effect by resource key, attributed to an entity.
    fn play_sound(&mut self, ent: i32, key: i32);

    /// Request a cutscene by resource key.
    fn start_cutscene(&mut self, key: i32);

    /// Concrete-type escape hatch so the shell (and tests) can reach
    /// its own import object back out of the context.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Import stub that records calls; the default for tests and headless
/// simulation runs.
#[derive(Debug, Default)]
pub struct NullImport {
    pub sounds: Vec<(i32, i32)>,
    pub cutscenes: Vec<i32>,
}

impl EngineImport for NullImport {
    fn play_sound(&mut self, ent: i32, key: i32) {
        self.sounds.push((ent, key));
    }

    fn start_cutscene(&mut self, key: i32) {
        self.cutscenes.push(key);
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
