#![allow(clippy::too_many_arguments, clippy::manual_range_contains,
         clippy::collapsible_if, clippy::collapsible_else_if)]
// Game module: the entity graph, message system, animation cursors,
// the scripted-object VM, and the tick loop driving them.

pub mod game_import;
pub mod game;
pub mod g_local;
pub mod g_anim;
pub mod g_utils;
pub mod g_phys;
pub mod g_script;
pub mod g_spawn;
pub mod g_view;
pub mod g_main;
