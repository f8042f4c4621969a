// cgrid.rs — the fixed 64x64 world grid and its cells

use thiserror::Error;

use crate::r_shared::{world_to_cell, GRID_SIZE};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorldError {
    #[error("grid coordinate ({cx},{cz}) outside the {size}x{size} map", size = GRID_SIZE)]
    OutOfBounds { cx: i32, cz: i32 },
}

// ============================================================
// Cell terrain
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CellKind {
    #[default]
    Open = 0,
    /// Fully solid wall.
    Wall,
    /// Wall along the (x0,z0)-(x1,z1) diagonal.
    DiagonalA,
    /// Wall along the (x0,z1)-(x1,z0) diagonal.
    DiagonalB,
    /// Sliding door: blocking plane at the cell's mid-Z, opening
    /// along X parameterized by `Cell::data`.
    DoorX,
    /// Sliding door: blocking plane at the cell's mid-X, opening
    /// along Z parameterized by `Cell::data`.
    DoorZ,
    /// Barred opening; bar pattern parameterized by `Cell::data`.
    Grate,
    /// Decorative terrain: blocks movement, never blocks rays.
    Decor,
    /// Pass-through hole: blocks neither movement nor rays.
    Hole,
}

impl CellKind {
    /// Terrain that rejects movement into the cell.
    #[inline]
    pub fn blocks_move(self) -> bool {
        matches!(
            self,
            CellKind::Wall | CellKind::DiagonalA | CellKind::DiagonalB | CellKind::Decor
        )
    }

    #[inline]
    pub fn is_door(self) -> bool {
        matches!(self, CellKind::DoorX | CellKind::DoorZ)
    }

    /// Terrain whose geometry the raycaster must test. Open, hole and
    /// decorative cells never obstruct a ray.
    #[inline]
    pub fn ray_geometry(self) -> bool {
        !matches!(self, CellKind::Open | CellKind::Hole | CellKind::Decor)
    }
}

// ============================================================
// Cell
// ============================================================

/// One grid tile. `occ_head` is the head of the cell-owned occupancy
/// list and is mutated by the collision engine only; everything else is
/// level data loaded once and read thereafter.
#[derive(Debug, Clone)]
pub struct Cell {
    pub kind: CellKind,
    /// Door opening / grate pattern parameter.
    pub data: u8,
    /// Primary room id (0 = none).
    pub room: u8,
    /// Second room id when the cell straddles two rooms (0 = none).
    pub room2: u8,
    /// Directional wall texture keys (N, E, S, W), renderer-owned meaning.
    pub tex: [u16; 4],
    /// Texture scroll/offset for the renderer.
    pub tex_offset: i16,
    /// Occupancy list head, -1 = empty.
    pub occ_head: i32,
    /// Scan-generation stamp used to deduplicate multi-cell queries.
    pub scan_mark: u32,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            kind: CellKind::Open,
            data: 0,
            room: 0,
            room2: 0,
            tex: [0; 4],
            tex_offset: 0,
            occ_head: -1,
            scan_mark: 0,
        }
    }
}

impl Cell {
    /// Does this cell belong to `room` (counting a straddled second room)?
    #[inline]
    pub fn in_room(&self, room: u8) -> bool {
        room != 0 && (self.room == room || self.room2 == room)
    }
}

/// Per-cell initial data handed over by the level loader.
#[derive(Debug, Clone, Copy)]
pub struct CellInit {
    pub cx: i32,
    pub cz: i32,
    pub kind: CellKind,
    pub data: u8,
    pub room: u8,
    pub room2: u8,
    pub tex: [u16; 4],
    pub tex_offset: i16,
}

impl CellInit {
    pub fn terrain(cx: i32, cz: i32, kind: CellKind) -> Self {
        Self { cx, cz, kind, data: 0, room: 0, room2: 0, tex: [0; 4], tex_offset: 0 }
    }
}

// ============================================================
// Grid
// ============================================================

pub struct Grid {
    cells: Vec<Cell>,
}

impl Grid {
    /// An all-open grid.
    pub fn new() -> Self {
        Self { cells: vec![Cell::default(); (GRID_SIZE * GRID_SIZE) as usize] }
    }

    /// Build a grid from per-level initial data. Unlisted cells stay open.
    /// Out-of-range entries are a loader bug and are reported, not dropped.
    pub fn from_cells(init: &[CellInit]) -> Result<Self, WorldError> {
        let mut grid = Self::new();
        for ci in init {
            let idx = grid.index(ci.cx, ci.cz)?;
            let cell = &mut grid.cells[idx];
            cell.kind = ci.kind;
            cell.data = ci.data;
            cell.room = ci.room;
            cell.room2 = ci.room2;
            cell.tex = ci.tex;
            cell.tex_offset = ci.tex_offset;
        }
        Ok(grid)
    }

    #[inline]
    pub fn in_range(&self, cx: i32, cz: i32) -> bool {
        cx >= 0 && cx < GRID_SIZE && cz >= 0 && cz < GRID_SIZE
    }

    /// Flat index of an in-range cell.
    #[inline]
    pub fn index(&self, cx: i32, cz: i32) -> Result<usize, WorldError> {
        if self.in_range(cx, cz) {
            Ok((cz * GRID_SIZE + cx) as usize)
        } else {
            Err(WorldError::OutOfBounds { cx, cz })
        }
    }

    #[inline]
    pub fn cell(&self, cx: i32, cz: i32) -> Result<&Cell, WorldError> {
        self.index(cx, cz).map(|i| &self.cells[i])
    }

    #[inline]
    pub fn cell_mut(&mut self, cx: i32, cz: i32) -> Result<&mut Cell, WorldError> {
        self.index(cx, cz).map(move |i| &mut self.cells[i])
    }

    #[inline]
    pub fn cell_by_index(&self, idx: usize) -> &Cell {
        &self.cells[idx]
    }

    #[inline]
    pub fn cell_by_index_mut(&mut self, idx: usize) -> &mut Cell {
        &mut self.cells[idx]
    }

    /// Cell holding a fixed-point world coordinate.
    #[inline]
    pub fn cell_of(&self, x: i32, z: i32) -> Result<&Cell, WorldError> {
        self.cell(world_to_cell(x), world_to_cell(z))
    }
}

impl Default for Grid {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::r_shared::CELL_SIZE;

    #[test]
    fn test_new_grid_open() {
        let grid = Grid::new();
        let cell = grid.cell(0, 0).unwrap();
        assert_eq!(cell.kind, CellKind::Open);
        assert_eq!(cell.occ_head, -1);
        assert!(grid.cell(63, 63).is_ok());
    }

    #[test]
    fn test_out_of_range() {
        let grid = Grid::new();
        assert_eq!(grid.cell(64, 0).unwrap_err(), WorldError::OutOfBounds { cx: 64, cz: 0 });
        assert_eq!(grid.cell(0, -1).unwrap_err(), WorldError::OutOfBounds { cx: 0, cz: -1 });
        assert!(grid.cell_of(-1, 0).is_err());
        assert!(grid.cell_of(64 * CELL_SIZE, 0).is_err());
    }

    #[test]
    fn test_from_cells() {
        let init = [
            CellInit::terrain(3, 4, CellKind::Wall),
            CellInit {
                cx: 5,
                cz: 6,
                kind: CellKind::DoorX,
                data: 40,
                room: 2,
                room2: 3,
                tex: [7, 8, 9, 10],
                tex_offset: -4,
            },
        ];
        let grid = Grid::from_cells(&init).unwrap();
        assert_eq!(grid.cell(3, 4).unwrap().kind, CellKind::Wall);
        let door = grid.cell(5, 6).unwrap();
        assert_eq!(door.kind, CellKind::DoorX);
        assert_eq!(door.data, 40);
        assert!(door.in_room(2));
        assert!(door.in_room(3));
        assert!(!door.in_room(4));
        assert_eq!(grid.cell(0, 0).unwrap().kind, CellKind::Open);
    }

    #[test]
    fn test_from_cells_rejects_out_of_range() {
        let init = [CellInit::terrain(64, 0, CellKind::Wall)];
        assert!(Grid::from_cells(&init).is_err());
    }

    #[test]
    fn test_cell_of() {
        let grid = Grid::from_cells(&[CellInit::terrain(10, 11, CellKind::Wall)]).unwrap();
        let cell = grid.cell_of(10 * CELL_SIZE + 256, 11 * CELL_SIZE + 256).unwrap();
        assert_eq!(cell.kind, CellKind::Wall);
    }
}
