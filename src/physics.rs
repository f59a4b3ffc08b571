//! Fixed-step movement resolution against the collision map.
//!
//! Each step applies gravity (or flight control), consumes a jump, derives
//! horizontal velocity from intent, then resolves x before y. A blocked
//! axis falls back to one-pixel steps toward the target so the body ends
//! up touching the obstacle but never inside or past it.

use bevy::math::{IRect, Vec2};
use serde::Deserialize;

use crate::collision::{aabb_cells, CollisionMap};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PhysicsTuning {
    /// px/s² downward
    pub gravity: f32,
    pub max_fall_speed: f32,
    /// Horizontal speed, px/s.
    pub move_speed: f32,
    /// Upward impulse of a grounded jump, px/s.
    pub jump_velocity: f32,
    /// Vertical speed while flying, px/s.
    pub fly_speed: f32,
}

impl Default for PhysicsTuning {
    fn default() -> Self {
        Self {
            gravity: 1800.0,
            max_fall_speed: 1200.0,
            move_speed: 280.0,
            jump_velocity: 520.0,
            fly_speed: 300.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorldBounds {
    pub width: f32,
    pub height: f32,
}

impl Default for WorldBounds {
    fn default() -> Self {
        Self {
            width: 1920.0,
            height: 1200.0,
        }
    }
}

impl WorldBounds {
    pub fn rect(&self) -> IRect {
        IRect::new(0, 0, self.width as i32, self.height as i32)
    }
}

/// The character's kinematic state. `pos` is the top-left of its AABB.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Body {
    pub pos: Vec2,
    pub size: Vec2,
    pub vel: Vec2,
    pub facing_right: bool,
}

impl Body {
    pub fn new(pos: Vec2, size: Vec2) -> Self {
        Self {
            pos,
            size,
            vel: Vec2::ZERO,
            facing_right: true,
        }
    }

    /// Cells covered by the AABB.
    pub fn aabb(&self) -> IRect {
        aabb_cells(self.pos, self.size)
    }
}

/// Per-step movement intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepInput {
    pub left: bool,
    pub right: bool,
    /// Pending jump request; consumed by this step.
    pub jump: bool,
    pub ascend: bool,
    pub descend: bool,
    pub flying: bool,
}

/// What happened during one step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepReport {
    /// A grounded jump impulse was applied.
    pub jumped: bool,
    /// Standing on something after the step.
    pub grounded: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct Resolver {
    tuning: PhysicsTuning,
    world: WorldBounds,
    step_height: u32,
}

impl Resolver {
    pub fn new(tuning: PhysicsTuning, world: WorldBounds, step_height: u32) -> Self {
        Self {
            tuning,
            world,
            step_height,
        }
    }

    /// Something solid one pixel below the body (the world floor counts).
    pub fn is_grounded(&self, body: &Body, map: &CollisionMap) -> bool {
        let below = body.pos + Vec2::Y;
        below.y + body.size.y > self.world.height || map.collides(below, body.size)
    }

    pub fn step(&self, body: &mut Body, input: &StepInput, map: &CollisionMap, dt: f32) -> StepReport {
        let mut report = StepReport::default();
        let t = &self.tuning;

        // 1. gravity
        if !input.flying {
            body.vel.y = (body.vel.y + t.gravity * dt).min(t.max_fall_speed);
        }

        // 2. jump / flight control
        if input.flying {
            body.vel.y = match (input.ascend, input.descend) {
                (true, false) => -t.fly_speed,
                (false, true) => t.fly_speed,
                _ => 0.0,
            };
        } else if input.jump && self.is_grounded(body, map) {
            body.vel.y = -t.jump_velocity;
            report.jumped = true;
        }

        // 3. horizontal intent
        body.vel.x = match (input.left, input.right) {
            (true, false) => -t.move_speed,
            (false, true) => t.move_speed,
            _ => 0.0,
        };
        if body.vel.x < 0.0 {
            body.facing_right = false;
        } else if body.vel.x > 0.0 {
            body.facing_right = true;
        }

        // axis targets are clamped to the world before they are probed
        let max_x = (self.world.width - body.size.x).max(0.0);
        let max_y = (self.world.height - body.size.y).max(0.0);

        // 4. horizontal, ledge-tolerant
        let target_x = body.pos.x + body.vel.x * dt;
        let clamped_x = target_x.clamp(0.0, max_x);
        if clamped_x != target_x {
            body.vel.x = 0.0;
        }
        let dx = clamped_x - body.pos.x;
        if dx != 0.0 {
            match self.fit_horizontal(clamped_x, body.pos.y, body.size, map) {
                Some(y) => {
                    body.pos.x = clamped_x;
                    body.pos.y = y;
                }
                None => {
                    let (x, y) = self.walk_horizontal(body, dx, map);
                    body.pos.x = x;
                    body.pos.y = y;
                    body.vel.x = 0.0;
                }
            }
        }

        // 5. vertical, strict
        let target_y = body.pos.y + body.vel.y * dt;
        let clamped_y = target_y.clamp(0.0, max_y);
        if clamped_y != target_y {
            body.vel.y = 0.0;
        }
        let dy = clamped_y - body.pos.y;
        if dy != 0.0 {
            let (x, size) = (body.pos.x, body.size);
            if map.collides(Vec2::new(x, clamped_y), size) {
                body.pos.y = walk_axis(body.pos.y, dy, |y| map.collides(Vec2::new(x, y), size));
                body.vel.y = 0.0;
            } else {
                body.pos.y = clamped_y;
            }
        }

        report.grounded = self.is_grounded(body, map);
        report
    }

    /// Vertical position at which the body fits at `x`, climbing up to
    /// `step_height` pixels if only its bottom rows are blocked. A lift
    /// never takes the body above the top of the world.
    fn fit_horizontal(&self, x: f32, y: f32, size: Vec2, map: &CollisionMap) -> Option<f32> {
        let pos = Vec2::new(x, y);
        if !map.collides(pos, size) {
            return Some(y);
        }
        if map.collides_with_step(pos, size, self.step_height) {
            return None;
        }
        (1..=self.step_height)
            .map(|lift| y - lift as f32)
            .take_while(|&lifted| lifted >= 0.0)
            .find(|&lifted| !map.collides(Vec2::new(x, lifted), size))
    }

    /// Single-pixel walk toward `x + dx`, stopping before the first blocked step.
    fn walk_horizontal(&self, body: &Body, dx: f32, map: &CollisionMap) -> (f32, f32) {
        let step = dx.signum();
        let target = body.pos.x + dx;
        let (mut x, mut y) = (body.pos.x, body.pos.y);
        while (target - x) * step > 0.0 {
            let next = next_cell(x, step, target);
            match self.fit_horizontal(next, y, body.size, map) {
                Some(fitted) => {
                    x = next;
                    y = fitted;
                }
                None => break,
            }
        }
        (x, y)
    }
}

/// Next whole-pixel boundary from `cur` in direction `step`, capped at `target`.
#[inline]
fn next_cell(cur: f32, step: f32, target: f32) -> f32 {
    if step > 0.0 {
        (cur.floor() + 1.0).min(target)
    } else {
        (cur.ceil() - 1.0).max(target)
    }
}

/// Advance `from` by `delta` in unit steps until `blocked` reports a hit.
/// The result always lies between `from` and `from + delta`.
pub fn walk_axis(from: f32, delta: f32, blocked: impl Fn(f32) -> bool) -> f32 {
    let step = delta.signum();
    let target = from + delta;
    let mut cur = from;
    while (target - cur) * step > 0.0 {
        let next = next_cell(cur, step, target);
        if blocked(next) {
            break;
        }
        cur = next;
    }
    cur
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy::math::IVec2;

    const DT: f32 = 1.0 / 60.0;

    fn resolver() -> Resolver {
        Resolver::new(PhysicsTuning::default(), WorldBounds::default(), 12)
    }

    fn stickman(x: f32, y: f32) -> Body {
        Body::new(Vec2::new(x, y), Vec2::new(48.0, 80.0))
    }

    /// Permissive map over the whole world with the given solid cells.
    fn world_map(solid: impl IntoIterator<Item = (usize, usize)>) -> CollisionMap {
        let mut map = CollisionMap::permissive(WorldBounds::default().rect());
        for (x, y) in solid {
            map.set(x, y, true);
        }
        map
    }

    fn floor_at(row: usize) -> impl Iterator<Item = (usize, usize)> {
        (0..1920).map(move |x| (x, row))
    }

    #[test]
    fn one_tick_of_free_fall() {
        let mut body = stickman(1000.0, 200.0);
        resolver().step(&mut body, &StepInput::default(), &CollisionMap::empty(), DT);
        assert!((body.vel.y - 30.0).abs() < 1e-3);
        assert!((body.pos.y - 200.5).abs() < 1e-4);
        assert_eq!(body.pos.x, 1000.0);
    }

    #[test]
    fn fall_speed_grows_by_gravity_dt_then_clamps() {
        let r = resolver();
        let mut body = stickman(500.0, 0.0);
        let map = CollisionMap::empty();
        let mut prev = body.vel.y;
        for _ in 0..60 {
            r.step(&mut body, &StepInput::default(), &map, DT);
            if body.pos.y >= 1200.0 - 80.0 {
                break;
            }
            let expected = (prev + 1800.0 * DT).min(1200.0);
            assert!((body.vel.y - expected).abs() < 1e-3);
            assert!(body.vel.y > prev || body.vel.y == 1200.0);
            prev = body.vel.y;
        }
        assert_eq!(prev, 1200.0);
    }

    #[test]
    fn flying_ignores_gravity() {
        let r = resolver();
        let mut body = stickman(500.0, 500.0);
        let input = StepInput { flying: true, ..Default::default() };
        r.step(&mut body, &input, &CollisionMap::empty(), DT);
        assert_eq!(body.vel.y, 0.0);
        assert_eq!(body.pos.y, 500.0);

        let up = StepInput { flying: true, ascend: true, ..Default::default() };
        r.step(&mut body, &up, &CollisionMap::empty(), DT);
        assert_eq!(body.vel.y, -300.0);
        assert!((body.pos.y - 495.0).abs() < 1e-3);

        let down = StepInput { flying: true, descend: true, ..Default::default() };
        r.step(&mut body, &down, &CollisionMap::empty(), DT);
        assert_eq!(body.vel.y, 300.0);
    }

    #[test]
    fn jump_needs_ground() {
        let r = resolver();
        let map = world_map(floor_at(280));
        let jump = StepInput { jump: true, ..Default::default() };

        let mut standing = stickman(100.0, 200.0);
        let report = r.step(&mut standing, &jump, &map, DT);
        assert!(report.jumped);
        assert_eq!(standing.vel.y, -520.0);
        assert!(standing.pos.y < 200.0);

        let mut airborne = stickman(100.0, 100.0);
        let report = r.step(&mut airborne, &jump, &map, DT);
        assert!(!report.jumped);
        assert!(airborne.vel.y > 0.0);
    }

    #[test]
    fn standing_on_floor_stays_put() {
        let r = resolver();
        let map = world_map(floor_at(280));
        let mut body = stickman(100.0, 200.0);
        for _ in 0..10 {
            let report = r.step(&mut body, &StepInput::default(), &map, DT);
            assert!(report.grounded);
        }
        assert_eq!(body.pos, Vec2::new(100.0, 200.0));
        assert_eq!(body.vel, Vec2::ZERO);
    }

    #[test]
    fn opposing_intents_cancel() {
        let r = resolver();
        let mut body = stickman(100.0, 200.0);
        let both = StepInput { left: true, right: true, flying: true, ..Default::default() };
        r.step(&mut body, &both, &CollisionMap::empty(), DT);
        assert_eq!(body.vel.x, 0.0);
        assert_eq!(body.pos.x, 100.0);

        let left = StepInput { left: true, flying: true, ..Default::default() };
        r.step(&mut body, &left, &CollisionMap::empty(), DT);
        assert!(!body.facing_right);
        assert!(body.pos.x < 100.0);
    }

    #[test]
    fn walking_into_wall_stops_adjacent() {
        let r = resolver();
        let wall_x = 1000 + 48 + 1;
        let map = world_map(floor_at(280).chain((0..280).map(|y| (wall_x, y))));
        let mut body = stickman(1000.0, 200.0);
        let right = StepInput { right: true, ..Default::default() };
        for _ in 0..30 {
            r.step(&mut body, &right, &map, DT);
            assert!(body.pos.x + body.size.x <= wall_x as f32);
        }
        assert_eq!(body.vel.x, 0.0);
        assert_eq!(body.pos.x + body.size.x, wall_x as f32);
        assert_eq!(body.pos.y, 200.0);
    }

    #[test]
    fn low_ledge_is_climbed() {
        let r = resolver();
        // 8px step starting at x=1060
        let ledge = (1060..1920).flat_map(|x| (272..280).map(move |y| (x, y)));
        let map = world_map(floor_at(280).chain(ledge));
        let mut body = stickman(1000.0, 200.0);
        let right = StepInput { right: true, ..Default::default() };
        for _ in 0..30 {
            r.step(&mut body, &right, &map, DT);
        }
        assert!(body.pos.x > 1060.0);
        assert!(body.pos.y <= 192.0 + 1e-3);
        assert!(!map.collides(body.pos, body.size));
    }

    #[test]
    fn tall_wall_is_not_climbed() {
        let r = resolver();
        let wall = (1060..1100).flat_map(|x| (250..280).map(move |y| (x, y)));
        let map = world_map(floor_at(280).chain(wall));
        let mut body = stickman(1000.0, 200.0);
        let right = StepInput { right: true, ..Default::default() };
        for _ in 0..30 {
            r.step(&mut body, &right, &map, DT);
        }
        assert_eq!(body.pos.x + body.size.x, 1060.0);
        assert_eq!(body.pos.y, 200.0);
    }

    #[test]
    fn ceiling_stops_jump() {
        let r = resolver();
        let map = world_map(floor_at(280).chain((0..1920).map(|x| (x, 180))));
        let mut body = stickman(100.0, 200.0);
        let jump = StepInput { jump: true, ..Default::default() };
        r.step(&mut body, &jump, &map, DT);
        for _ in 0..5 {
            r.step(&mut body, &StepInput::default(), &map, DT);
            assert!(body.pos.y >= 181.0);
        }
    }

    #[test]
    fn position_stays_inside_world() {
        let r = resolver();
        let map = CollisionMap::empty();
        let mut body = stickman(1900.0, 1150.0);
        let right = StepInput { right: true, ..Default::default() };
        for _ in 0..120 {
            r.step(&mut body, &right, &map, DT);
            assert!(body.pos.x >= 0.0 && body.pos.x <= 1920.0 - 48.0);
            assert!(body.pos.y >= 0.0 && body.pos.y <= 1200.0 - 80.0);
        }
        assert_eq!(body.vel.x, 0.0);

        let mut flyer = stickman(5.0, 5.0);
        let up_left = StepInput { left: true, ascend: true, flying: true, ..Default::default() };
        for _ in 0..30 {
            r.step(&mut flyer, &up_left, &map, DT);
        }
        assert_eq!(flyer.pos, Vec2::ZERO);
    }

    #[test]
    fn right_edge_does_not_drop_body_onto_a_post() {
        let r = resolver();
        // two-pixel post under the last columns the body can reach
        let post = (1872..1874).flat_map(|x| (280..1200).map(move |y| (x, y)));
        let map = world_map(post);
        let mut body = stickman(1871.0, 150.0);
        let right = StepInput { right: true, ..Default::default() };
        for _ in 0..60 {
            r.step(&mut body, &right, &map, DT);
            assert!(!map.collides(body.pos, body.size), "{:?}", body.pos);
        }
        assert_eq!(body.pos, Vec2::new(1872.0, 200.0));
    }

    #[test]
    fn ledge_lift_stops_at_top_of_world() {
        let r = resolver();
        // 10 px of ledge in the body's bottom rows, but only 5 px of headroom
        let block = (1100..1200).flat_map(|x| (75..200).map(move |y| (x, y)));
        let map = world_map(block);
        let mut body = stickman(1040.0, 5.0);
        let right = StepInput { right: true, flying: true, ..Default::default() };
        for _ in 0..20 {
            r.step(&mut body, &right, &map, DT);
            assert!(!map.collides(body.pos, body.size), "{:?}", body.pos);
            assert!(body.pos.y >= 0.0);
        }
        assert_eq!(body.pos, Vec2::new(1052.0, 5.0));
    }

    #[test]
    fn world_floor_counts_as_ground() {
        let r = resolver();
        let body = stickman(10.0, 1200.0 - 80.0);
        assert!(r.is_grounded(&body, &CollisionMap::empty()));
        let offset_map = CollisionMap::permissive(IRect::from_corners(IVec2::ZERO, IVec2::splat(4)));
        assert!(!r.is_grounded(&stickman(10.0, 10.0), &offset_map));
    }

    #[test]
    fn walk_axis_never_passes_first_blocked_cell() {
        for delta in [0.4_f32, 3.0, 7.5, 20.0, -6.25, -15.0] {
            for wall in -20..=20 {
                let blocked = |p: f32| {
                    if delta > 0.0 {
                        p > wall as f32
                    } else {
                        p < wall as f32
                    }
                };
                if blocked(0.0) {
                    continue;
                }
                let end = walk_axis(0.0, delta, blocked);
                assert!(!blocked(end));
                if delta > 0.0 {
                    assert!(end >= 0.0 && end <= delta);
                } else {
                    assert!(end <= 0.0 && end >= delta);
                }
            }
        }
    }
}
