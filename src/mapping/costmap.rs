//! Rolling, double-buffered local costmap fused from vision and range sensing.
//!
//! Every tick the back buffer is re-anchored on the robot, stamped with the
//! sources that arrived this tick, aged, and then published by swapping it
//! with the front buffer. Consumers only ever read the front buffer.

use serde::Deserialize;
use tracing::{debug, warn};

use crate::common::{CostQuery, NavError, NavResult, Point2D, StampedPose, Timestamp};
use crate::mapping::grid::{CostGrid, Layer, Region, SourceMask};
use crate::perception::{FreeSpaceMask, ObstacleFootprint, RangeScan};

/// Costmap configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct CostmapConfig {
    /// Window width in meters
    #[serde(default = "default_window_size")]
    pub width_m: f64,
    /// Window height in meters
    #[serde(default = "default_window_size")]
    pub height_m: f64,
    /// Cell size in meters
    #[serde(default = "default_resolution")]
    pub resolution: f64,
    /// Cost of unknown space
    #[serde(default = "default_baseline")]
    pub baseline: f64,
    /// Per-tick decay of unrefreshed layers toward baseline
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
    /// Seconds without refresh after which a cell is unknown again
    #[serde(default = "default_stale_after")]
    pub stale_after: f64,
    /// Scale applied to (1 - p_free) from the free-space mask
    #[serde(default = "default_free_space_weight")]
    pub free_space_weight: f64,
    /// Mask probability at or above which vision clears the obstacle layer
    #[serde(default = "default_free_clear_threshold")]
    pub free_clear_threshold: f64,
    /// Scale applied to range hits
    #[serde(default = "default_range_weight")]
    pub range_weight: f64,
    /// Cost stamped at a range endpoint
    #[serde(default = "default_range_hit_cost")]
    pub range_hit_cost: f64,
    /// Radius of the range endpoint spike (meters)
    #[serde(default = "default_range_hit_radius")]
    pub range_hit_radius: f64,
    /// Falloff distance around obstacle footprints before class scaling (meters)
    #[serde(default = "default_obstacle_margin")]
    pub obstacle_margin: f64,
    /// Consecutive ticks without a modality before it counts as dropped
    #[serde(default = "default_dropout_ticks")]
    pub dropout_ticks: u32,
}

fn default_window_size() -> f64 {
    16.0
}
fn default_resolution() -> f64 {
    0.1
}
fn default_baseline() -> f64 {
    0.5
}
fn default_decay_factor() -> f64 {
    0.85
}
fn default_stale_after() -> f64 {
    2.0
}
fn default_free_space_weight() -> f64 {
    1.0
}
fn default_free_clear_threshold() -> f64 {
    0.8
}
fn default_range_weight() -> f64 {
    1.0
}
fn default_range_hit_cost() -> f64 {
    1.0
}
fn default_range_hit_radius() -> f64 {
    0.15
}
fn default_obstacle_margin() -> f64 {
    0.4
}
fn default_dropout_ticks() -> u32 {
    10
}

impl Default for CostmapConfig {
    fn default() -> Self {
        Self {
            width_m: default_window_size(),
            height_m: default_window_size(),
            resolution: default_resolution(),
            baseline: default_baseline(),
            decay_factor: default_decay_factor(),
            stale_after: default_stale_after(),
            free_space_weight: default_free_space_weight(),
            free_clear_threshold: default_free_clear_threshold(),
            range_weight: default_range_weight(),
            range_hit_cost: default_range_hit_cost(),
            range_hit_radius: default_range_hit_radius(),
            obstacle_margin: default_obstacle_margin(),
            dropout_ticks: default_dropout_ticks(),
        }
    }
}

impl CostmapConfig {
    pub fn validate(&self) -> NavResult<()> {
        if !(self.resolution > 0.0) || !(self.width_m > self.resolution) || !(self.height_m > self.resolution) {
            return Err(NavError::Config(
                "costmap window must span more than one cell".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.baseline) {
            return Err(NavError::Config("costmap baseline must be in [0, 1]".to_string()));
        }
        if !(self.decay_factor > 0.0 && self.decay_factor < 1.0) {
            return Err(NavError::Config("decay_factor must be in (0, 1)".to_string()));
        }
        if !(0.0..=1.0).contains(&self.free_space_weight) {
            return Err(NavError::Config("free_space_weight must be in [0, 1]".to_string()));
        }
        if !(self.free_clear_threshold > 0.0 && self.free_clear_threshold <= 1.0) {
            return Err(NavError::Config("free_clear_threshold must be in (0, 1]".to_string()));
        }
        if !(self.stale_after > 0.0) {
            return Err(NavError::Config("stale_after must be positive".to_string()));
        }
        Ok(())
    }

    fn cells(&self) -> (usize, usize) {
        (
            (self.width_m / self.resolution).round() as usize,
            (self.height_m / self.resolution).round() as usize,
        )
    }
}

/// Per-modality input bookkeeping used for graceful degradation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorHealth {
    pub vision_missed_ticks: u32,
    pub range_missed_ticks: u32,
    pub vision_dropped: bool,
    pub range_dropped: bool,
}

impl SensorHealth {
    fn record(&mut self, vision: bool, range: bool, dropout_ticks: u32) {
        self.vision_missed_ticks = if vision { 0 } else { self.vision_missed_ticks.saturating_add(1) };
        self.range_missed_ticks = if range { 0 } else { self.range_missed_ticks.saturating_add(1) };

        let vision_dropped = self.vision_missed_ticks >= dropout_ticks;
        let range_dropped = self.range_missed_ticks >= dropout_ticks;
        if vision_dropped && !self.vision_dropped {
            warn!("vision input missing for {} ticks, using range only", self.vision_missed_ticks);
        }
        if range_dropped && !self.range_dropped {
            warn!("range input missing for {} ticks, using vision only", self.range_missed_ticks);
        }
        self.vision_dropped = vision_dropped;
        self.range_dropped = range_dropped;
    }

    /// No usable modality left.
    pub fn is_blind(&self) -> bool {
        self.vision_dropped && self.range_dropped
    }

    /// Layers left out of the fused cost.
    pub fn excluded(&self) -> SourceMask {
        let mut mask = SourceMask::NONE;
        if self.vision_dropped {
            mask.insert(SourceMask::VISION);
        }
        if self.range_dropped {
            mask.insert(SourceMask::RANGE);
        }
        mask
    }
}

/// Double-buffered rolling costmap.
pub struct Costmap {
    config: CostmapConfig,
    buffers: [CostGrid; 2],
    front: usize,
    refreshed: Vec<SourceMask>,
    health: SensorHealth,
}

impl Costmap {
    pub fn new(config: CostmapConfig) -> NavResult<Self> {
        config.validate()?;
        let (w, h) = config.cells();
        let grid = CostGrid::new(w, h, config.resolution, config.baseline);
        Ok(Self {
            buffers: [grid.clone(), grid],
            front: 0,
            refreshed: vec![SourceMask::NONE; w * h],
            health: SensorHealth::default(),
            config,
        })
    }

    pub fn config(&self) -> &CostmapConfig {
        &self.config
    }

    pub fn baseline(&self) -> f64 {
        self.config.baseline
    }

    pub fn health(&self) -> SensorHealth {
        self.health
    }

    /// The published buffer.
    pub fn front(&self) -> &CostGrid {
        &self.buffers[self.front]
    }

    /// Fuse this tick's inputs into the back buffer and publish it.
    ///
    /// Any input may be missing; the grid then only re-anchors and decays.
    pub fn fuse(
        &mut self,
        free_space: Option<&FreeSpaceMask>,
        footprints: Option<&[ObstacleFootprint]>,
        ranges: Option<&RangeScan>,
        pose: Option<&StampedPose>,
        now: Timestamp,
    ) {
        let vision_present = free_space.is_some() || footprints.is_some();
        let range_present = ranges.is_some() && pose.is_some();
        self.health.record(vision_present, range_present, self.config.dropout_ticks);

        let back_index = 1 - self.front;
        let (first, second) = self.buffers.split_at_mut(1);
        let (front, back) = if back_index == 1 {
            (&first[0], &mut second[0])
        } else {
            (&second[0], &mut first[0])
        };

        let anchor = match pose {
            Some(p) => front.anchor_for(p.position()),
            None => front.anchor_for(front.bounds().center()),
        };
        back.reanchor_from(front, anchor, self.config.baseline);
        self.refreshed.fill(SourceMask::NONE);

        let mut pass = FusionPass {
            grid: &mut *back,
            refreshed: &mut self.refreshed,
            config: &self.config,
            now,
        };
        if let Some(mask) = free_space {
            pass.free_space(mask);
        }
        if let Some(footprints) = footprints {
            for fp in footprints {
                pass.footprint(fp);
            }
        }
        if let (Some(scan), Some(pose)) = (ranges, pose) {
            pass.ranges(scan, pose);
        }

        let excluded = self.health.excluded();
        let cfg = &self.config;
        for (idx, refreshed) in self.refreshed.iter().enumerate() {
            let cell = back.cell_mut(idx);
            cell.age(*refreshed, now, cfg.baseline, cfg.decay_factor, cfg.stale_after);
            cell.fuse(cfg.baseline, excluded);
        }
        self.front = back_index;
        debug!("costmap fused at t={:.2} anchor=({}, {})", now, anchor.0, anchor.1);
    }
}

impl CostQuery for Costmap {
    fn cost_at(&self, p: Point2D) -> f64 {
        self.front().cost_at(p, self.config.baseline)
    }

    fn query(&self, region: &Region) -> f64 {
        self.front().query(region, self.config.baseline)
    }
}

/// Stamps one tick's sources into the back buffer.
struct FusionPass<'a> {
    grid: &'a mut CostGrid,
    refreshed: &'a mut [SourceMask],
    config: &'a CostmapConfig,
    now: Timestamp,
}

impl FusionPass<'_> {
    // Several writes to the same layer within a tick keep the maximum.
    fn stamp(&mut self, idx: usize, layer: Layer, cost: f64) {
        let cell = self.grid.cell_mut(idx);
        let cost = if self.refreshed[idx].contains(layer.mask()) {
            cell.layer(layer).map_or(cost, |v| v.cost.max(cost))
        } else {
            cost
        };
        cell.set_layer(layer, cost, self.now);
        self.refreshed[idx].insert(layer.mask());
    }

    fn free_space(&mut self, mask: &FreeSpaceMask) {
        let area = mask.bounds();
        for idx in self.grid.indices_in(&area) {
            let center = self.grid.cell_center(idx);
            if let Some(p_free) = mask.p_free_at(center) {
                let cost = (1.0 - p_free) * self.config.free_space_weight;
                self.stamp(idx, Layer::FreeSpace, cost);
                // only a confidently free cell clears what detection no longer reports
                if p_free >= self.config.free_clear_threshold {
                    self.stamp(idx, Layer::Obstacle, 0.0);
                }
            }
        }
    }

    fn footprint(&mut self, obstacle: &ObstacleFootprint) {
        let margin = self.config.obstacle_margin * obstacle.class.margin_scale();
        let area = obstacle.footprint.bounding_box().inflate(margin);
        for idx in self.grid.indices_in(&area) {
            let d = obstacle.footprint.distance_to(self.grid.cell_center(idx));
            let cost = if d <= 0.0 {
                1.0
            } else if d < margin {
                1.0 - d / margin
            } else {
                continue;
            };
            self.stamp(idx, Layer::Obstacle, cost);
        }
    }

    fn ranges(&mut self, scan: &RangeScan, pose: &StampedPose) {
        let origin = pose.position();
        let step = self.grid.resolution() * 0.5;
        let hit_radius = self.config.range_hit_radius;
        let hit_cost = (self.config.range_hit_cost * self.config.range_weight).clamp(0.0, 1.0);

        for reading in scan.readings.iter().filter(|r| r.is_valid()) {
            let heading = pose.pose.yaw + reading.angle;
            let hit = reading.is_hit();
            let clear_len = if hit {
                (reading.distance - hit_radius).max(0.0)
            } else {
                reading.max_range
            };

            let mut t = 0.0;
            while t <= clear_len {
                if let Some(idx) = self.grid.index_of(origin.offset(heading, t)) {
                    self.stamp(idx, Layer::Range, 0.0);
                }
                t += step;
            }

            if hit {
                let end = origin.offset(heading, reading.distance);
                let area = Region::Disc { center: end, radius: hit_radius }.bounds();
                for idx in self.grid.indices_in(&area) {
                    if self.grid.cell_center(idx).distance(&end) <= hit_radius {
                        self.stamp(idx, Layer::Range, hit_cost);
                    }
                }
                if let Some(idx) = self.grid.index_of(end) {
                    self.stamp(idx, Layer::Range, hit_cost);
                }
            }
        }
    }
}
