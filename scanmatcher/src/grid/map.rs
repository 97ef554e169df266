//! Patch-sparse probabilistic occupancy grid.

use nalgebra::{Point2, Vector2};

use common::{math::Probability, robot::Pose};

use crate::{
    error::{Error, Result},
    grid::ray::RayIter,
    optimizer::LocalMap,
    reading::RangeReading,
};

/// Cells whose hit/visit ratio is at least this full count as obstacles.
const FULLNESS_THRESHOLD: f64 = 0.1;

/// Per-cell evidence: visit and hit counts plus the accumulated world
/// position of the hits. The mean hit position anchors the likelihood
/// kernel and the ICP correspondence search.
#[derive(Debug, Clone, Copy)]
pub struct Cell {
    hits: u32,
    visits: u32,
    acc: Vector2<f64>,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            hits: 0,
            visits: 0,
            acc: Vector2::zeros(),
        }
    }
}

impl Cell {
    fn register_hit(&mut self, endpoint: Point2<f64>) {
        self.hits += 1;
        self.visits += 1;
        self.acc += endpoint.coords;
    }

    fn register_miss(&mut self) {
        self.visits += 1;
    }

    pub fn visits(&self) -> u32 {
        self.visits
    }

    /// Fraction of visits that ended in a hit. Unvisited cells report 0.
    pub fn occupancy(&self) -> Probability {
        if self.visits == 0 {
            Probability::new_unchecked(0.0)
        } else {
            Probability::new(f64::from(self.hits) / f64::from(self.visits))
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.visits > 0 && self.occupancy().value() > FULLNESS_THRESHOLD
    }

    /// Mean world position of the accumulated hits, if any.
    pub fn mean(&self) -> Option<Point2<f64>> {
        (self.hits > 0).then(|| Point2::from(self.acc / f64::from(self.hits)))
    }
}

/// Flattened, read-only view of the map for an external publisher.
#[derive(Debug, Clone)]
pub struct MapSnapshot {
    pub width: usize,
    pub height: usize,
    pub resolution: f64,
    /// World position of the lower-left corner of cell (0, 0).
    pub origin: Point2<f64>,
    /// Row-major occupancy values, one per cell. Never-visited cells are 0.
    pub cells: Vec<f64>,
}

/// Probabilistic occupancy grid over a fixed world rectangle.
///
/// Storage is patch-sparse: the map keeps a dense table of patch slots but
/// allocates a patch's cells only when a beam first touches it, so memory
/// scales with the visited area instead of the configured extent.
///
/// Coordinate accesses resolve deterministically via
/// `floor((coord - min) / delta)`. Cells outside the configured bounds are
/// rejected (beams are clipped) unless auto-extend is enabled, in which
/// case the patch table grows by whole patches.
pub struct OccupancyGridMap {
    xmin: f64,
    ymin: f64,
    delta: f64,
    patch_side: usize,
    patches_x: usize,
    patches_y: usize,
    patches: Vec<Option<Box<[Cell]>>>,
    auto_extend: bool,
}

impl OccupancyGridMap {
    pub fn new(
        xmin: f64,
        ymin: f64,
        xmax: f64,
        ymax: f64,
        delta: f64,
        patch_delta: f64,
    ) -> Result<Self> {
        if ![xmin, ymin, xmax, ymax, delta, patch_delta]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(Error::configuration("map bounds must be finite"));
        }
        if delta <= 0.0 {
            return Err(Error::configuration("map resolution delta must be positive"));
        }
        if patch_delta < delta {
            return Err(Error::configuration(
                "patch resolution must not be finer than the cell resolution",
            ));
        }
        if xmin >= xmax || ymin >= ymax {
            return Err(Error::configuration("map bounds must span a non-empty area"));
        }

        let patch_side = ((patch_delta / delta).round() as usize).max(1);
        let cells_x = (((xmax - xmin) / delta).ceil() as usize).max(1);
        let cells_y = (((ymax - ymin) / delta).ceil() as usize).max(1);
        let patches_x = cells_x.div_ceil(patch_side);
        let patches_y = cells_y.div_ceil(patch_side);

        Ok(Self {
            xmin,
            ymin,
            delta,
            patch_side,
            patches_x,
            patches_y,
            patches: vec![None; patches_x * patches_y],
            auto_extend: false,
        })
    }

    /// Grow the patch table instead of clipping beams that leave the
    /// configured bounds.
    pub fn with_auto_extend(mut self, enabled: bool) -> Self {
        self.auto_extend = enabled;
        self
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn xmin(&self) -> f64 {
        self.xmin
    }

    pub fn ymin(&self) -> f64 {
        self.ymin
    }

    pub fn xmax(&self) -> f64 {
        self.xmin + (self.width() as f64) * self.delta
    }

    pub fn ymax(&self) -> f64 {
        self.ymin + (self.height() as f64) * self.delta
    }

    /// Width in cells.
    pub fn width(&self) -> usize {
        self.patches_x * self.patch_side
    }

    /// Height in cells.
    pub fn height(&self) -> usize {
        self.patches_y * self.patch_side
    }

    /// Number of patches whose cells have been allocated.
    pub fn allocated_patches(&self) -> usize {
        self.patches.iter().filter(|p| p.is_some()).count()
    }

    pub fn world_to_cell(&self, p: Point2<f64>) -> (i64, i64) {
        (
            ((p.x - self.xmin) / self.delta).floor() as i64,
            ((p.y - self.ymin) / self.delta).floor() as i64,
        )
    }

    fn contains(&self, cx: i64, cy: i64) -> bool {
        cx >= 0 && cy >= 0 && (cx as usize) < self.width() && (cy as usize) < self.height()
    }

    pub fn cell(&self, cx: i64, cy: i64) -> Option<&Cell> {
        if !self.contains(cx, cy) {
            return None;
        }
        let (cx, cy) = (cx as usize, cy as usize);
        let patch = self.patches[(cy / self.patch_side) * self.patches_x + cx / self.patch_side]
            .as_ref()?;
        Some(&patch[(cy % self.patch_side) * self.patch_side + cx % self.patch_side])
    }

    fn cell_mut(&mut self, cx: i64, cy: i64) -> Option<&mut Cell> {
        if !self.contains(cx, cy) {
            return None;
        }
        let (cx, cy) = (cx as usize, cy as usize);
        let side = self.patch_side;
        let slot = (cy / side) * self.patches_x + cx / side;
        let patch = self.patches[slot]
            .get_or_insert_with(|| vec![Cell::default(); side * side].into_boxed_slice());
        Some(&mut patch[(cy % side) * side + cx % side])
    }

    /// Extends the patch table so that the world point `p` falls inside the
    /// bounds, preserving all existing evidence.
    fn grow_to_include(&mut self, p: Point2<f64>) {
        let (cx, cy) = self.world_to_cell(p);
        if self.contains(cx, cy) {
            return;
        }

        let side = self.patch_side as i64;
        let px = cx.div_euclid(side);
        let py = cy.div_euclid(side);

        let add_left = (-px).max(0) as usize;
        let add_bottom = (-py).max(0) as usize;
        let add_right = (px - (self.patches_x as i64 - 1)).max(0) as usize;
        let add_top = (py - (self.patches_y as i64 - 1)).max(0) as usize;

        let new_patches_x = self.patches_x + add_left + add_right;
        let new_patches_y = self.patches_y + add_bottom + add_top;
        let mut patches = vec![None; new_patches_x * new_patches_y];

        for y in 0..self.patches_y {
            for x in 0..self.patches_x {
                patches[(y + add_bottom) * new_patches_x + (x + add_left)] =
                    self.patches[y * self.patches_x + x].take();
            }
        }

        self.patches = patches;
        self.patches_x = new_patches_x;
        self.patches_y = new_patches_y;
        self.xmin -= (add_left * self.patch_side) as f64 * self.delta;
        self.ymin -= (add_bottom * self.patch_side) as f64 * self.delta;
    }

    /// Resets all evidence and releases the allocated patches.
    pub fn clear(&mut self) {
        for patch in &mut self.patches {
            *patch = None;
        }
    }

    /// Integrates one reading taken from `pose`.
    ///
    /// Each beam is traced on the cell grid from the pose to its endpoint:
    /// intervening cells register a miss (free evidence); the endpoint cell
    /// registers a hit when the beam is within `usable_range`. Beams longer
    /// than `max_range` are discarded; beams in between carve free space up
    /// to `usable_range` only. Identical (reading, pose) pairs always
    /// produce identical evidence deltas.
    pub fn update(
        &mut self,
        reading: &RangeReading,
        pose: Pose,
        usable_range: f64,
        max_range: f64,
    ) {
        if self.auto_extend {
            self.grow_to_include(Point2::new(pose.x, pose.y));
            for beam in reading.beams() {
                if beam.distance > max_range || beam.distance <= 0.0 {
                    continue;
                }
                let reach = beam.distance.min(usable_range);
                self.grow_to_include(pose.project(beam.angle, reach));
            }
        }

        let (sx, sy) = self.world_to_cell(Point2::new(pose.x, pose.y));
        for beam in reading.beams() {
            if beam.distance > max_range || beam.distance <= 0.0 {
                continue;
            }
            let hit = beam.distance <= usable_range;
            let reach = beam.distance.min(usable_range);
            let endpoint = pose.project(beam.angle, reach);
            let (ex, ey) = self.world_to_cell(endpoint);

            for (cx, cy) in RayIter::new(sx, sy, ex, ey) {
                let is_endpoint = cx == ex && cy == ey;
                // cells outside the bounds are skipped, neighbors stay untouched
                if let Some(cell) = self.cell_mut(cx, cy) {
                    if is_endpoint && hit {
                        cell.register_hit(endpoint);
                    } else {
                        cell.register_miss();
                    }
                }
            }
        }
    }

    /// Mean hit positions of all occupied cells within `radius` of `center`.
    pub fn occupied_points(&self, center: Point2<f64>, radius: f64) -> Vec<Point2<f64>> {
        let radius_sq = radius * radius;
        let mut points = Vec::new();
        for patch in self.patches.iter().flatten() {
            for cell in patch.iter() {
                if !cell.is_occupied() {
                    continue;
                }
                if let Some(mean) = cell.mean() {
                    if (mean - center).norm_squared() <= radius_sq {
                        points.push(mean);
                    }
                }
            }
        }
        points
    }

    /// Flattens the map for an external publisher.
    pub fn snapshot(&self) -> MapSnapshot {
        let (width, height) = (self.width(), self.height());
        let mut cells = Vec::with_capacity(width * height);
        for cy in 0..height {
            for cx in 0..width {
                let occupancy = self
                    .cell(cx as i64, cy as i64)
                    .map_or(0.0, |c| c.occupancy().value());
                cells.push(occupancy);
            }
        }

        MapSnapshot {
            width,
            height,
            resolution: self.delta,
            origin: Point2::new(self.xmin, self.ymin),
            cells,
        }
    }
}

impl LocalMap for OccupancyGridMap {
    fn clear(&mut self) {
        OccupancyGridMap::clear(self);
    }

    fn update(&mut self, reading: &RangeReading, pose: Pose, usable_range: f64, max_range: f64) {
        OccupancyGridMap::update(self, reading, pose, usable_range, max_range);
    }
}
