// g_view.rs — renderer and camera facing passes over the raycaster

use crate::g_anim::model_frame;
use crate::g_local::*;
use crate::game::{CamPose, DrawEntry};
use myrift_common::cworld::Collider;
use myrift_common::rayscan::{OccVisit, RayPolicy};

/// World units kept between the camera and whatever blocked it.
pub const CAMERA_MARGIN: i32 = 64;

/// Camera flavor: the watched entity is transparent, everything else
/// follows the plain sight rules.
pub struct CameraRay {
    pub target: i32,
}

impl RayPolicy for CameraRay {
    fn visit_occupant(&mut self, key: i32, occ: &Collider) -> OccVisit {
        if key == self.target
            || !occ.flags.contains(ColliderFlags::SOLID)
            || occ.flags.contains(ColliderFlags::DECOR)
        {
            OccVisit::Ignore
        } else {
            OccVisit::Test
        }
    }
}

/// Draw-list flavor: records every occupant the ray fan touches and
/// never lets one terminate the ray; only walls do that.
struct CullRay<'a> {
    seen: &'a mut [bool],
    touched: &'a mut Vec<i32>,
}

impl RayPolicy for CullRay<'_> {
    fn visit_occupant(&mut self, key: i32, _occ: &Collider) -> OccVisit {
        if !self.seen[key as usize] {
            self.seen[key as usize] = true;
            self.touched.push(key);
        }
        OccVisit::Ignore
    }
}

/// Fan `rays` raycasts across the camera's field of view, rebuilding
/// `ctx.draw_list` (entities with resolved poses for mesh placement)
/// and `ctx.visible_cells` (wall cells struck by the fan).
pub fn build_draw_list(ctx: &mut GameContext, cam: &CamPose, half_fov: i32, rays: i32) {
    ctx.draw_list.clear();
    ctx.visible_cells.clear();

    let mut seen = vec![false; ctx.ents.len()];
    let mut touched = Vec::new();
    let mut seen_cells = vec![false; (GRID_SIZE * GRID_SIZE) as usize];

    for i in 0..rays.max(1) {
        let yaw_offset = if rays <= 1 {
            0
        } else {
            -half_fov + (2 * half_fov * i) / (rays - 1)
        };
        let ray = Ray {
            x: cam.x,
            y: cam.y,
            z: cam.z,
            yaw: cam.yaw,
            yaw_offset,
            pitch: cam.pitch,
            lateral: 0,
        };
        let mut policy = CullRay { seen: &mut seen, touched: &mut touched };
        if let Some(hit) = cast_ray(&mut ctx.world, ray, &mut policy) {
            if let RayHitKind::Wall { cx, cz } = hit.kind {
                let idx = (cz * GRID_SIZE + cx) as usize;
                if !seen_cells[idx] {
                    seen_cells[idx] = true;
                    ctx.visible_cells.push((cx, cz));
                }
            }
        }
    }

    for key in touched {
        let ent = &ctx.ents[key as usize];
        let entry = DrawEntry {
            key,
            x: ent.pose.x,
            y: ent.pose.y,
            z: ent.pose.z,
            yaw: ent.pose.yaw,
            model_frame: model_frame(&ctx.anims, &ent.anim),
        };
        ctx.draw_list.push(entry);
    }
}

/// Clamp the camera's boom distance behind `target` along `yaw` so it
/// never sits inside a wall or another solid entity.
pub fn camera_clamp(ctx: &mut GameContext, target: i32, yaw: i32, desired: i32) -> i32 {
    if !ctx.is_live(target) {
        return desired;
    }
    let pose = ctx.ents[target as usize].pose;
    let ray = Ray { x: pose.x, y: pose.y, z: pose.z, yaw, ..Ray::default() };
    let mut policy = CameraRay { target };
    match cast_ray(&mut ctx.world, ray, &mut policy) {
        Some(hit) if hit.dist < desired => (hit.dist - CAMERA_MARGIN).max(0),
        _ => desired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::g_spawn::spawn_level;
    use crate::game::{LevelData, Placement};
    use crate::game_import::NullImport;
    use myrift_common::cgrid::CellInit;

    fn cell_center(cx: i32, cz: i32) -> (i32, i32) {
        (cx * CELL_SIZE + CELL_SIZE / 2, cz * CELL_SIZE + CELL_SIZE / 2)
    }

    fn view_ctx() -> GameContext {
        // A wall row across z=20, one entity before it, one behind it.
        let mut cells = Vec::new();
        for cx in 0..GRID_SIZE {
            cells.push(CellInit::terrain(cx, 20, CellKind::Wall));
        }
        let (ax, az) = cell_center(32, 12);
        let (bx, bz) = cell_center(32, 30);
        let level = LevelData {
            cells,
            placements: vec![
                Placement { x: ax, z: az, ..Placement::default() },
                Placement { x: bx, z: bz, ..Placement::default() },
            ],
            ..LevelData::default()
        };
        spawn_level(Box::<NullImport>::default(), &level).unwrap()
    }

    #[test]
    fn test_draw_list_culls_behind_walls() {
        let mut ctx = view_ctx();
        let (cx, cz) = cell_center(32, 2);
        let cam = CamPose { x: cx, z: cz, yaw: 0, ..CamPose::default() };
        build_draw_list(&mut ctx, &cam, 120, 33);

        let keys: Vec<i32> = ctx.draw_list.iter().map(|e| e.key).collect();
        assert!(keys.contains(&2), "entity before the wall is drawn");
        assert!(!keys.contains(&3), "entity behind the wall is culled");
        assert!(ctx.visible_cells.iter().any(|&(_, z)| z == 20));

        let entry = ctx.draw_list.iter().find(|e| e.key == 2).unwrap();
        assert_eq!((entry.x, entry.z), cell_center(32, 12));
    }

    #[test]
    fn test_draw_list_rebuilt_each_pass() {
        let mut ctx = view_ctx();
        let (cx, cz) = cell_center(32, 2);
        let cam = CamPose { x: cx, z: cz, yaw: 0, ..CamPose::default() };
        build_draw_list(&mut ctx, &cam, 120, 33);
        let first = ctx.draw_list.len();
        build_draw_list(&mut ctx, &cam, 120, 33);
        assert_eq!(ctx.draw_list.len(), first, "no accumulation across passes");
    }

    #[test]
    fn test_camera_clamp_against_wall() {
        let mut ctx = view_ctx();
        // Looking from entity 2 (z cell 12) toward the wall row at z=20:
        // the wall face is 8 cells minus half a cell away.
        let free = camera_clamp(&mut ctx, 2, 0, 1000);
        assert_eq!(free, 1000, "nothing within range leaves the boom alone");

        let blocked = camera_clamp(&mut ctx, 2, 0, 8000);
        let wall_dist = 20 * CELL_SIZE - (12 * CELL_SIZE + CELL_SIZE / 2);
        assert_eq!(blocked, wall_dist - CAMERA_MARGIN);
    }

    #[test]
    fn test_camera_clamp_missing_target() {
        let mut ctx = view_ctx();
        assert_eq!(camera_clamp(&mut ctx, 77, 0, 900), 900);
    }
}
