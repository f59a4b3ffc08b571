//! Offset-tagged obstacle grid built from a classified capture.

use bevy::math::{IRect, IVec2, Vec2};

/// Boolean grid (`true` = obstacle) plus the world position of its top-left cell.
///
/// Cells are stored in local coordinates only. World coordinates are
/// translated through `offset` on every query.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollisionMap {
    cells: Vec<bool>,
    width: usize,
    height: usize,
    offset: IVec2,
}

impl CollisionMap {
    pub fn new(width: usize, height: usize, offset: IVec2, cells: Vec<bool>) -> Self {
        debug_assert_eq!(cells.len(), width * height);
        Self {
            cells,
            width,
            height,
            offset,
        }
    }

    /// Map without any captured cells; every query is open space.
    pub fn empty() -> Self {
        Self::default()
    }

    /// All-background map covering `region`.
    pub fn permissive(region: IRect) -> Self {
        let width = region.width().max(0) as usize;
        let height = region.height().max(0) as usize;
        Self::new(width, height, region.min, vec![false; width * height])
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn offset(&self) -> IVec2 {
        self.offset
    }

    /// Cell at local `(x, y)`; out of range is open space.
    pub fn get(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height && self.cells[y * self.width + x]
    }

    pub fn set(&mut self, x: usize, y: usize, solid: bool) {
        if x < self.width && y < self.height {
            self.cells[y * self.width + x] = solid;
        }
    }

    /// Force every cell inside the world rectangle `rect` to background.
    pub fn clear_rect(&mut self, rect: IRect) {
        let Some((x0, y0, x1, y1)) = self.local_span(rect) else {
            return;
        };
        for y in y0..y1 {
            self.cells[y * self.width + x0..y * self.width + x1].fill(false);
        }
    }

    pub fn count_solid(&self) -> usize {
        self.cells.iter().filter(|c| **c).count()
    }

    /// Does an AABB at world `pos` with `size` overlap any obstacle?
    pub fn collides(&self, pos: Vec2, size: Vec2) -> bool {
        self.any_solid(aabb_cells(pos, size))
    }

    /// Like [`collides`](Self::collides) but ignores the bottom `step_rows`
    /// rows of the AABB, so low ledges do not block sideways movement.
    pub fn collides_with_step(&self, pos: Vec2, size: Vec2, step_rows: u32) -> bool {
        let mut rect = aabb_cells(pos, size);
        rect.max.y = (rect.max.y - step_rows as i32).max(rect.min.y);
        self.any_solid(rect)
    }

    fn any_solid(&self, rect: IRect) -> bool {
        let Some((x0, y0, x1, y1)) = self.local_span(rect) else {
            return false;
        };
        (y0..y1).any(|y| self.cells[y * self.width + x0..y * self.width + x1].contains(&true))
    }

    /// World rect → clamped local `[x0, x1) x [y0, y1)`, or `None` when nothing overlaps.
    fn local_span(&self, rect: IRect) -> Option<(usize, usize, usize, usize)> {
        let local = IRect::from_corners(rect.min - self.offset, rect.max - self.offset);
        let grid = IRect::new(0, 0, self.width as i32, self.height as i32);
        let clamped = local.intersect(grid);
        if clamped.is_empty() {
            return None;
        }
        Some((
            clamped.min.x as usize,
            clamped.min.y as usize,
            clamped.max.x as usize,
            clamped.max.y as usize,
        ))
    }
}

/// Integer cells touched by a float AABB (max exclusive).
pub fn aabb_cells(pos: Vec2, size: Vec2) -> IRect {
    IRect {
        min: IVec2::new(pos.x.floor() as i32, pos.y.floor() as i32),
        max: IVec2::new((pos.x + size.x).ceil() as i32, (pos.y + size.y).ceil() as i32),
    }
}
