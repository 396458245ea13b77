// Flat cost grid with per-source layers and rolling-window index arithmetic.

use std::ops::BitOr;

use crate::common::{Aabb, Point2D, Timestamp};

/// Set of sensing sources that currently contribute to a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct SourceMask(u8);

impl SourceMask {
    pub const NONE: SourceMask = SourceMask(0);
    pub const FREE_SPACE: SourceMask = SourceMask(0b001);
    pub const OBSTACLE: SourceMask = SourceMask(0b010);
    pub const RANGE: SourceMask = SourceMask(0b100);
    pub const VISION: SourceMask = SourceMask(0b011);

    pub fn contains(self, other: SourceMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: SourceMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: SourceMask) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SourceMask {
    type Output = SourceMask;

    fn bitor(self, rhs: SourceMask) -> SourceMask {
        SourceMask(self.0 | rhs.0)
    }
}

/// One cost source stored per cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layer {
    FreeSpace,
    Obstacle,
    Range,
}

impl Layer {
    pub const ALL: [Layer; 3] = [Layer::FreeSpace, Layer::Obstacle, Layer::Range];

    fn index(self) -> usize {
        match self {
            Layer::FreeSpace => 0,
            Layer::Obstacle => 1,
            Layer::Range => 2,
        }
    }

    pub fn mask(self) -> SourceMask {
        match self {
            Layer::FreeSpace => SourceMask::FREE_SPACE,
            Layer::Obstacle => SourceMask::OBSTACLE,
            Layer::Range => SourceMask::RANGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerValue {
    pub cost: f64,
    pub stamp: Timestamp,
}

/// A grid cell: the fused cost plus the source layers it was fused from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostCell {
    pub cost: f64,
    pub last_updated: Option<Timestamp>,
    pub source_mask: SourceMask,
    layers: [Option<LayerValue>; 3],
}

impl CostCell {
    /// Cell that has never been observed.
    pub fn unknown(baseline: f64) -> Self {
        Self {
            cost: baseline,
            last_updated: None,
            source_mask: SourceMask::NONE,
            layers: [None; 3],
        }
    }

    pub fn layer(&self, layer: Layer) -> Option<LayerValue> {
        self.layers[layer.index()]
    }

    pub fn is_unknown(&self) -> bool {
        self.last_updated.is_none()
    }

    pub(crate) fn set_layer(&mut self, layer: Layer, cost: f64, now: Timestamp) {
        self.layers[layer.index()] = Some(LayerValue {
            cost: cost.clamp(0.0, 1.0),
            stamp: now,
        });
    }

    /// Age the cell by one tick. Layers in `refreshed` were written this tick.
    pub(crate) fn age(
        &mut self,
        refreshed: SourceMask,
        now: Timestamp,
        baseline: f64,
        decay_factor: f64,
        stale_after: f64,
    ) {
        let newest = self
            .layers
            .iter()
            .flatten()
            .map(|l| l.stamp)
            .fold(f64::NEG_INFINITY, f64::max);
        if refreshed.is_empty() && (newest == f64::NEG_INFINITY || now - newest > stale_after) {
            *self = CostCell::unknown(baseline);
            return;
        }
        for layer in Layer::ALL {
            if refreshed.contains(layer.mask()) {
                continue;
            }
            let slot = &mut self.layers[layer.index()];
            if let Some(value) = slot {
                if !refreshed.is_empty() && now - value.stamp > stale_after {
                    *slot = None;
                } else {
                    value.cost = baseline + (value.cost - baseline) * decay_factor;
                }
            }
        }
        self.last_updated = if newest == f64::NEG_INFINITY { None } else { Some(newest) };
    }

    /// Recompute the fused cost: max over layers not in `excluded`.
    pub(crate) fn fuse(&mut self, baseline: f64, excluded: SourceMask) {
        let mut cost: Option<f64> = None;
        let mut mask = SourceMask::NONE;
        for layer in Layer::ALL {
            if excluded.contains(layer.mask()) {
                continue;
            }
            if let Some(value) = self.layers[layer.index()] {
                cost = Some(cost.map_or(value.cost, |c: f64| c.max(value.cost)));
                mask.insert(layer.mask());
            }
        }
        self.cost = cost.unwrap_or(baseline);
        self.source_mask = mask;
    }
}

/// Area of the grid to inspect.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Region {
    Point(Point2D),
    Disc { center: Point2D, radius: f64 },
    Rect(Aabb),
}

impl Region {
    pub fn bounds(&self) -> Aabb {
        match self {
            Region::Point(p) => Aabb::new(*p, *p),
            Region::Disc { center, radius } => Aabb::from_center(*center, *radius, *radius),
            Region::Rect(b) => *b,
        }
    }

    fn contains(&self, p: Point2D) -> bool {
        match self {
            Region::Point(c) => c == &p,
            Region::Disc { center, radius } => center.distance(&p) <= *radius,
            Region::Rect(b) => b.contains(p),
        }
    }

    fn anchor_point(&self) -> Point2D {
        match self {
            Region::Point(p) => *p,
            Region::Disc { center, .. } => *center,
            Region::Rect(b) => b.center(),
        }
    }
}

/// Rolling window of cells stored row-major in one flat vector.
///
/// Cells are addressed by global integer indices `floor(world / resolution)`
/// so that re-anchoring the window keeps every surviving cell aligned.
#[derive(Debug, Clone)]
pub struct CostGrid {
    resolution: f64,
    width: usize,
    height: usize,
    anchor: (i64, i64),
    cells: Vec<CostCell>,
}

impl CostGrid {
    pub fn new(width: usize, height: usize, resolution: f64, baseline: f64) -> Self {
        Self {
            resolution,
            width,
            height,
            anchor: (-(width as i64) / 2, -(height as i64) / 2),
            cells: vec![CostCell::unknown(baseline); width * height],
        }
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// World coordinates of the window's lower-left corner.
    pub fn origin(&self) -> Point2D {
        Point2D::new(
            self.anchor.0 as f64 * self.resolution,
            self.anchor.1 as f64 * self.resolution,
        )
    }

    pub fn bounds(&self) -> Aabb {
        let o = self.origin();
        Aabb::new(
            o,
            Point2D::new(
                o.x + self.width as f64 * self.resolution,
                o.y + self.height as f64 * self.resolution,
            ),
        )
    }

    pub fn cells(&self) -> &[CostCell] {
        &self.cells
    }

    pub fn cell(&self, idx: usize) -> &CostCell {
        &self.cells[idx]
    }

    pub(crate) fn cell_mut(&mut self, idx: usize) -> &mut CostCell {
        &mut self.cells[idx]
    }

    pub fn global_index(&self, p: Point2D) -> (i64, i64) {
        (
            (p.x / self.resolution).floor() as i64,
            (p.y / self.resolution).floor() as i64,
        )
    }

    /// Window anchor that centres the grid on `center`.
    pub fn anchor_for(&self, center: Point2D) -> (i64, i64) {
        let (gx, gy) = self.global_index(center);
        (gx - self.width as i64 / 2, gy - self.height as i64 / 2)
    }

    fn local_from_global(&self, gx: i64, gy: i64) -> Option<usize> {
        let ix = gx - self.anchor.0;
        let iy = gy - self.anchor.1;
        if ix < 0 || iy < 0 || ix >= self.width as i64 || iy >= self.height as i64 {
            None
        } else {
            Some(iy as usize * self.width + ix as usize)
        }
    }

    pub fn index_of(&self, p: Point2D) -> Option<usize> {
        let (gx, gy) = self.global_index(p);
        self.local_from_global(gx, gy)
    }

    pub fn cell_center(&self, idx: usize) -> Point2D {
        let ix = (idx % self.width) as i64 + self.anchor.0;
        let iy = (idx / self.width) as i64 + self.anchor.1;
        Point2D::new(
            (ix as f64 + 0.5) * self.resolution,
            (iy as f64 + 0.5) * self.resolution,
        )
    }

    /// Indices of the cells whose extent overlaps `area`, clipped to the window.
    pub fn indices_in(&self, area: &Aabb) -> impl Iterator<Item = usize> {
        let (gx0, gy0) = self.global_index(area.min);
        let (gx1, gy1) = self.global_index(area.max);
        let ix0 = (gx0 - self.anchor.0).max(0);
        let iy0 = (gy0 - self.anchor.1).max(0);
        let ix1 = (gx1 - self.anchor.0).min(self.width as i64 - 1);
        let iy1 = (gy1 - self.anchor.1).min(self.height as i64 - 1);
        let width = self.width;
        (iy0..=iy1)
            .filter(move |_| ix0 <= ix1)
            .flat_map(move |iy| (ix0..=ix1).map(move |ix| iy as usize * width + ix as usize))
    }

    /// Copy `src` into this buffer re-anchored at `anchor`; cells that
    /// enter the window start unknown.
    pub(crate) fn reanchor_from(&mut self, src: &CostGrid, anchor: (i64, i64), baseline: f64) {
        self.anchor = anchor;
        if src.anchor == anchor && src.width == self.width && src.height == self.height {
            self.cells.copy_from_slice(&src.cells);
            return;
        }
        for iy in 0..self.height {
            for ix in 0..self.width {
                let gx = anchor.0 + ix as i64;
                let gy = anchor.1 + iy as i64;
                let cell = match src.local_from_global(gx, gy) {
                    Some(si) => src.cells[si],
                    None => CostCell::unknown(baseline),
                };
                self.cells[iy * self.width + ix] = cell;
            }
        }
    }

    /// Highest fused cost in `region`; space outside the window reads as `baseline`.
    pub fn query(&self, region: &Region, baseline: f64) -> f64 {
        let area = region.bounds();
        let window = self.bounds();
        let mut worst = if window.contains(area.min) && window.contains(area.max) {
            0.0
        } else {
            baseline
        };
        if let Some(idx) = self.index_of(region.anchor_point()) {
            worst = worst.max(self.cells[idx].cost);
        }
        for idx in self.indices_in(&area) {
            if region.contains(self.cell_center(idx)) {
                worst = worst.max(self.cells[idx].cost);
            }
        }
        worst
    }

    pub fn cost_at(&self, p: Point2D, baseline: f64) -> f64 {
        self.index_of(p).map_or(baseline, |idx| self.cells[idx].cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: f64 = 0.5;

    #[test]
    fn test_source_mask_ops() {
        let mut m = SourceMask::FREE_SPACE;
        m.insert(SourceMask::RANGE);
        assert!(m.contains(SourceMask::RANGE));
        assert!(!m.contains(SourceMask::OBSTACLE));
        assert!(m.intersects(SourceMask::VISION));
        assert_eq!(SourceMask::FREE_SPACE | SourceMask::OBSTACLE, SourceMask::VISION);
    }

    #[test]
    fn test_fuse_takes_max_not_average() {
        let mut cell = CostCell::unknown(BASE);
        cell.set_layer(Layer::FreeSpace, 0.0, 1.0);
        cell.set_layer(Layer::Obstacle, 0.0, 1.0);
        cell.set_layer(Layer::Range, 0.9, 1.0);
        cell.fuse(BASE, SourceMask::NONE);
        assert_eq!(cell.cost, 0.9);
        assert!(cell.source_mask.contains(SourceMask::RANGE));
    }

    #[test]
    fn test_fuse_excluding_layers() {
        let mut cell = CostCell::unknown(BASE);
        cell.set_layer(Layer::Obstacle, 1.0, 1.0);
        cell.set_layer(Layer::Range, 0.1, 1.0);
        cell.fuse(BASE, SourceMask::VISION);
        assert!((cell.cost - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_age_decays_toward_baseline_then_resets() {
        let mut cell = CostCell::unknown(BASE);
        cell.set_layer(Layer::Range, 1.0, 0.0);
        cell.fuse(BASE, SourceMask::NONE);
        let mut last = cell.cost;
        let mut t = 0.0;
        for _ in 0..5 {
            t += 0.1;
            cell.age(SourceMask::NONE, t, BASE, 0.8, 1.0);
            cell.fuse(BASE, SourceMask::NONE);
            assert!(cell.cost < last && cell.cost > BASE);
            last = cell.cost;
        }
        cell.age(SourceMask::NONE, 2.0, BASE, 0.8, 1.0);
        cell.fuse(BASE, SourceMask::NONE);
        assert_eq!(cell.cost, BASE);
        assert!(cell.is_unknown());
    }

    #[test]
    fn test_index_roundtrip_and_bounds() {
        let grid = CostGrid::new(10, 10, 0.5, BASE);
        let idx = grid.index_of(Point2D::new(0.2, 0.2)).unwrap();
        let c = grid.cell_center(idx);
        assert!((c.x - 0.25).abs() < 1e-12 && (c.y - 0.25).abs() < 1e-12);
        assert!(grid.index_of(Point2D::new(100.0, 0.0)).is_none());
    }

    #[test]
    fn test_reanchor_keeps_world_alignment() {
        let mut a = CostGrid::new(10, 10, 1.0, BASE);
        let p = Point2D::new(1.5, 1.5);
        let idx = a.index_of(p).unwrap();
        a.cell_mut(idx).set_layer(Layer::Range, 1.0, 0.0);
        a.cell_mut(idx).fuse(BASE, SourceMask::NONE);

        let mut b = CostGrid::new(10, 10, 1.0, BASE);
        let anchor = a.anchor_for(Point2D::new(3.0, 0.0));
        b.reanchor_from(&a, anchor, BASE);
        assert_eq!(b.cost_at(p, BASE), 1.0);
        // a cell that just entered the window
        assert_eq!(b.cost_at(Point2D::new(7.5, 0.5), BASE), BASE);
    }

    #[test]
    fn test_query_outside_window_reads_baseline() {
        let grid = CostGrid::new(4, 4, 1.0, BASE);
        let far = Region::Disc { center: Point2D::new(50.0, 50.0), radius: 1.0 };
        assert_eq!(grid.query(&far, BASE), BASE);
    }
}
