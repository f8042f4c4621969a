#![allow(clippy::too_many_arguments, clippy::manual_range_contains,
         clippy::needless_range_loop, clippy::collapsible_if)]
// Simulation-core foundations: fixed-point math, the world grid, the
// collision engine, and the raycasting engine.

pub mod r_shared;
pub mod sintab;
pub mod cgrid;
pub mod cworld;
pub mod rayscan;
