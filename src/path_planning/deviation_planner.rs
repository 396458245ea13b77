//! Local deviation planner.
//!
//! Watches the route ahead of the robot for blocked stretches and, once a
//! block has persisted long enough, synthesizes a lateral bypass in the
//! route's Frenet frame. The candidate search is bounded by `search_radius`
//! in both directions, so the cost of one evaluation has a fixed ceiling.

use std::fmt;

use ordered_float::OrderedFloat;
use serde::Deserialize;
use tracing::{debug, info};

use crate::common::{CostQuery, NavError, NavResult, Point2D, Timestamp};
use crate::mapping::Region;
use crate::path_planning::route::{BlockedSegment, Route};
use crate::perception::TrackSnapshot;

/// Deviation planner configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct PlannerConfig {
    /// Robot radius (meters)
    #[serde(default = "default_robot_radius")]
    pub robot_radius: f64,
    /// Extra clearance added to the robot radius for blockage checks (meters)
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
    /// Cost above which a cell is not traversable
    #[serde(default = "default_blocking_threshold")]
    pub blocking_threshold: f64,
    /// Route distance examined ahead of the robot (meters)
    #[serde(default = "default_lookahead_distance")]
    pub lookahead_distance: f64,
    /// Route and candidate sampling step (meters)
    #[serde(default = "default_sample_step")]
    pub sample_step: f64,
    /// Consecutive blocked evaluations before a block is acted upon
    #[serde(default = "default_persistence_ticks")]
    pub persistence_ticks: u32,
    /// Route distance used to ramp out to the bypass offset (meters)
    #[serde(default = "default_ramp_length")]
    pub ramp_length: f64,
    /// Route distance past the obstacle where the detour rejoins (meters)
    #[serde(default = "default_rejoin_clearance")]
    pub rejoin_clearance: f64,
    /// Route length checked beyond the rejoin point (meters)
    #[serde(default = "default_rejoin_region")]
    pub rejoin_region: f64,
    /// Lateral step between bypass candidates (meters)
    #[serde(default = "default_lateral_step")]
    pub lateral_step: f64,
    /// Largest lateral offset and forward extension searched (meters)
    #[serde(default = "default_search_radius")]
    pub search_radius: f64,
    /// Weight of path length in the candidate score
    #[serde(default = "default_length_penalty")]
    pub length_penalty: f64,
    /// Seconds moving obstacles are swept along their velocity
    #[serde(default = "default_prediction_horizon")]
    pub prediction_horizon: f64,
    /// Spacing of detour waypoints (meters)
    #[serde(default = "default_waypoint_spacing")]
    pub waypoint_spacing: f64,
}

fn default_robot_radius() -> f64 {
    0.3
}
fn default_safety_margin() -> f64 {
    0.2
}
fn default_blocking_threshold() -> f64 {
    0.7
}
fn default_lookahead_distance() -> f64 {
    4.0
}
fn default_sample_step() -> f64 {
    0.1
}
fn default_persistence_ticks() -> u32 {
    3
}
fn default_ramp_length() -> f64 {
    1.0
}
fn default_rejoin_clearance() -> f64 {
    1.5
}
fn default_rejoin_region() -> f64 {
    0.5
}
fn default_lateral_step() -> f64 {
    0.2
}
fn default_search_radius() -> f64 {
    3.0
}
fn default_length_penalty() -> f64 {
    0.1
}
fn default_prediction_horizon() -> f64 {
    1.5
}
fn default_waypoint_spacing() -> f64 {
    0.25
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            robot_radius: default_robot_radius(),
            safety_margin: default_safety_margin(),
            blocking_threshold: default_blocking_threshold(),
            lookahead_distance: default_lookahead_distance(),
            sample_step: default_sample_step(),
            persistence_ticks: default_persistence_ticks(),
            ramp_length: default_ramp_length(),
            rejoin_clearance: default_rejoin_clearance(),
            rejoin_region: default_rejoin_region(),
            lateral_step: default_lateral_step(),
            search_radius: default_search_radius(),
            length_penalty: default_length_penalty(),
            prediction_horizon: default_prediction_horizon(),
            waypoint_spacing: default_waypoint_spacing(),
        }
    }
}

impl PlannerConfig {
    /// Radius of the disc checked around each route sample.
    pub fn clearance(&self) -> f64 {
        self.robot_radius + self.safety_margin
    }

    pub fn validate(&self) -> NavResult<()> {
        let positive = [
            ("robot_radius", self.robot_radius),
            ("lookahead_distance", self.lookahead_distance),
            ("sample_step", self.sample_step),
            ("rejoin_clearance", self.rejoin_clearance),
            ("lateral_step", self.lateral_step),
            ("search_radius", self.search_radius),
            ("waypoint_spacing", self.waypoint_spacing),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| !(*v > 0.0)) {
            return Err(NavError::Config(format!("{} must be positive", name)));
        }
        if self.safety_margin < 0.0 || self.ramp_length < 0.0 || self.prediction_horizon < 0.0 {
            return Err(NavError::Config(
                "safety_margin, ramp_length and prediction_horizon must not be negative".to_string(),
            ));
        }
        if !(self.blocking_threshold > 0.0 && self.blocking_threshold < 1.0) {
            return Err(NavError::Config("blocking_threshold must be in (0, 1)".to_string()));
        }
        if self.persistence_ticks == 0 {
            return Err(NavError::Config("persistence_ticks must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    /// Sign of the lateral offset in the route frame.
    pub fn sign(&self) -> f64 {
        match self {
            Side::Left => 1.0,
            Side::Right => -1.0,
        }
    }

    fn from_lateral(lateral: f64) -> Self {
        if lateral >= 0.0 {
            Side::Left
        } else {
            Side::Right
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

/// A locally synthesized bypass around a blocked stretch of route.
#[derive(Debug, Clone, PartialEq)]
pub struct DetourPlan {
    /// Route position where the robot leaves the route
    pub origin_s: f64,
    /// Route position where the robot is back on the route
    pub rejoin_s: f64,
    /// Bypass waypoints, ending where the ramp back to the route begins
    pub waypoints: Vec<Point2D>,
    pub rejoin_point: Point2D,
    pub side: Side,
    pub lateral_offset: f64,
    pub cost: f64,
    /// The stretch this plan bypasses; `None` for a plain merge
    pub blocked: Option<BlockedSegment>,
    pub created_at: Timestamp,
}

impl DetourPlan {
    /// Polyline length from the first waypoint to the rejoin point.
    pub fn length(&self) -> f64 {
        let bypass: f64 = self
            .waypoints
            .windows(2)
            .map(|w| w[0].distance(&w[1]))
            .sum();
        bypass
            + self
                .waypoints
                .last()
                .map_or(0.0, |p| p.distance(&self.rejoin_point))
    }
}

/// Outcome of one planner evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Clear,
    Blocked(BlockedSegment),
    Detour(DetourPlan),
}

impl Decision {
    pub fn is_clear(&self) -> bool {
        matches!(self, Decision::Clear)
    }

    pub fn plan(&self) -> Option<&DetourPlan> {
        match self {
            Decision::Detour(plan) => Some(plan),
            _ => None,
        }
    }
}

// Blocked span plus tracked obstacles touching it, in route coordinates.
#[derive(Debug, Clone, Copy)]
struct Extent {
    start_s: f64,
    end_s: f64,
    lateral_min: f64,
    lateral_max: f64,
}

struct Candidate {
    side: Side,
    offset: f64,
    waypoints: Vec<Point2D>,
    score: f64,
}

pub struct DeviationPlanner {
    config: PlannerConfig,
    streak: u32,
}

impl DeviationPlanner {
    pub fn new(config: PlannerConfig) -> NavResult<Self> {
        config.validate()?;
        Ok(Self { config, streak: 0 })
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Consecutive blocked evaluations seen so far, saturating at the
    /// persistence threshold.
    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn reset_persistence(&mut self) {
        self.streak = 0;
    }

    /// Blocked stretch ahead of `current_s`, if any. Never confirmed.
    pub fn assess<C: CostQuery>(&self, route: &Route, current_s: f64, costmap: &C) -> Option<BlockedSegment> {
        let cfg = &self.config;
        let radius = cfg.clearance();
        let horizon = (current_s + cfg.lookahead_distance).min(route.length());
        let cost_at = |p: Point2D| costmap.query(&Region::Disc { center: p, radius });

        let (start_s, mut peak, mut end_s) = route
            .sample(current_s, horizon, cfg.sample_step)
            .into_iter()
            .map(|(s, p)| (s, cost_at(p)))
            .find(|(_, c)| *c > cfg.blocking_threshold)
            .map(|(s, c)| (s, c, s))?;

        // walk forward to the end of the blocked span, past the lookahead if needed
        let limit = (start_s + cfg.lookahead_distance.max(cfg.search_radius)).min(route.length());
        for (s, p) in route.sample(start_s, limit, cfg.sample_step).into_iter().skip(1) {
            let c = cost_at(p);
            if c <= cfg.blocking_threshold {
                break;
            }
            peak = peak.max(c);
            end_s = s;
        }

        Some(BlockedSegment {
            start_s,
            end_s,
            peak_cost: peak,
            confirmed: false,
        })
    }

    /// One evaluation while following the route.
    ///
    /// A block is only confirmed after `persistence_ticks` consecutive
    /// blocked evaluations; before that it is reported unconfirmed.
    pub fn evaluate<C: CostQuery>(
        &mut self,
        route: &Route,
        current_s: f64,
        costmap: &C,
        obstacles: &TrackSnapshot,
        now: Timestamp,
    ) -> Decision {
        let Some(mut segment) = self.assess(route, current_s, costmap) else {
            if self.streak > 0 {
                debug!("route ahead clear again after {} blocked evaluations", self.streak);
            }
            self.streak = 0;
            return Decision::Clear;
        };

        self.streak = (self.streak + 1).min(self.config.persistence_ticks);
        if self.streak < self.config.persistence_ticks {
            debug!("blocked {} ({}/{})", segment, self.streak, self.config.persistence_ticks);
            return Decision::Blocked(segment);
        }
        segment.confirmed = true;

        let start = route.point_at(current_s);
        match self.synthesize(route, current_s, 0.0, start, &segment, costmap, obstacles, now) {
            Some(plan) => Decision::Detour(plan),
            None => {
                info!("no feasible detour around {}", segment);
                Decision::Blocked(segment)
            }
        }
    }

    /// Plan from the robot's actual position, skipping hysteresis.
    ///
    /// Used at checkpoints (rejoin blocked, detour invalidated). When the
    /// route ahead is clear this yields a short merge back onto the route.
    pub fn replan<C: CostQuery>(
        &mut self,
        route: &Route,
        current_s: f64,
        start: Point2D,
        costmap: &C,
        obstacles: &TrackSnapshot,
        now: Timestamp,
    ) -> Decision {
        let cfg = &self.config;
        let window = cfg.search_radius + cfg.lookahead_distance;
        let (s, lateral) = route.to_frenet(start, current_s, window);

        if let Some(mut segment) = self.assess(route, s, costmap) {
            self.streak = self.config.persistence_ticks;
            segment.confirmed = true;
            return match self.synthesize(route, s, lateral, start, &segment, costmap, obstacles, now) {
                Some(plan) => Decision::Detour(plan),
                None => {
                    info!("replan from ({:.2}, {:.2}) found no detour around {}", start.x, start.y, segment);
                    Decision::Blocked(segment)
                }
            };
        }

        self.streak = 0;
        match self.merge_plan(route, s, lateral, start, costmap, obstacles, now) {
            Some(plan) => Decision::Detour(plan),
            None => Decision::Blocked(BlockedSegment {
                start_s: s,
                end_s: (s + cfg.ramp_length).min(route.length()),
                peak_cost: 1.0,
                confirmed: true,
            }),
        }
    }

    fn merge_plan<C: CostQuery>(
        &self,
        route: &Route,
        s: f64,
        lateral: f64,
        start: Point2D,
        costmap: &C,
        obstacles: &TrackSnapshot,
        now: Timestamp,
    ) -> Option<DetourPlan> {
        let cfg = &self.config;
        let rejoin_s = (s + cfg.ramp_length.max(cfg.sample_step)).min(route.length());
        if rejoin_s <= s {
            return None;
        }
        let waypoints = vec![start];
        let score = self.score_path(route, &waypoints, rejoin_s, costmap, obstacles)?;
        debug!("merge plan from lateral {:.2} to s={:.2}", lateral, rejoin_s);
        Some(DetourPlan {
            origin_s: s,
            rejoin_s,
            waypoints,
            rejoin_point: route.point_at(rejoin_s),
            side: Side::from_lateral(lateral),
            lateral_offset: lateral,
            cost: score,
            blocked: None,
            created_at: now,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn synthesize<C: CostQuery>(
        &self,
        route: &Route,
        current_s: f64,
        start_lateral: f64,
        start: Point2D,
        segment: &BlockedSegment,
        costmap: &C,
        obstacles: &TrackSnapshot,
        now: Timestamp,
    ) -> Option<DetourPlan> {
        let cfg = &self.config;
        let extent = self.extent(route, segment, obstacles);

        let origin_s = current_s.max(extent.start_s - cfg.ramp_length);
        let rejoin_s = (extent.end_s + cfg.rejoin_clearance).min(route.length());
        if rejoin_s <= extent.end_s || rejoin_s <= origin_s {
            debug!("rejoin point past the route end, blocked span {}", segment);
            return None;
        }
        let bypass_end = (extent.end_s + cfg.clearance()).min(rejoin_s - cfg.sample_step);

        let feasible: Vec<Candidate> = self
            .calc_candidates(route, origin_s, start_lateral, start, &extent, bypass_end)
            .into_iter()
            .filter_map(|mut c| {
                c.score = self.score_path(route, &c.waypoints, rejoin_s, costmap, obstacles)?;
                Some(c)
            })
            .collect();
        // ties go left, then to the smaller offset
        let min_score = feasible.iter().map(|c| c.score).fold(f64::INFINITY, f64::min);
        let best = feasible
            .into_iter()
            .filter(|c| c.score <= min_score + 1e-9)
            .min_by_key(|c| (c.side, OrderedFloat(c.offset)))?;

        let plan = DetourPlan {
            origin_s,
            rejoin_s,
            rejoin_point: route.point_at(rejoin_s),
            side: best.side,
            lateral_offset: best.side.sign() * best.offset,
            cost: best.score,
            waypoints: best.waypoints,
            blocked: Some(*segment),
            created_at: now,
        };
        info!(
            "detour {} offset {:.2} from s={:.2} to s={:.2}, cost {:.2}",
            plan.side, plan.lateral_offset, plan.origin_s, plan.rejoin_s, plan.cost
        );
        Some(plan)
    }

    fn extent(&self, route: &Route, segment: &BlockedSegment, obstacles: &TrackSnapshot) -> Extent {
        let cfg = &self.config;
        let clear = cfg.clearance();
        let mut extent = Extent {
            start_s: segment.start_s,
            end_s: segment.end_s,
            lateral_min: 0.0,
            lateral_max: 0.0,
        };
        let hint = 0.5 * (segment.start_s + segment.end_s);
        let window = segment.length() + cfg.search_radius + cfg.lookahead_distance;

        for obstacle in obstacles.iter() {
            let mut vertices = obstacle.footprint.vertices();
            if obstacle.speed() > 0.0 {
                vertices.extend(obstacle.predicted_footprint(cfg.prediction_horizon).vertices());
            }
            let (mut s_lo, mut s_hi) = (f64::INFINITY, f64::NEG_INFINITY);
            let (mut l_lo, mut l_hi) = (f64::INFINITY, f64::NEG_INFINITY);
            for v in vertices {
                let (s, l) = route.to_frenet(v, hint, window);
                s_lo = s_lo.min(s);
                s_hi = s_hi.max(s);
                l_lo = l_lo.min(l);
                l_hi = l_hi.max(l);
            }
            let touches = segment.overlaps(s_lo - clear, s_hi + clear) && l_lo <= clear && l_hi >= -clear;
            if !touches {
                continue;
            }
            extent.start_s = extent.start_s.min(s_lo - clear);
            extent.end_s = extent.end_s.max(s_hi + clear);
            extent.lateral_min = extent.lateral_min.min(l_lo);
            extent.lateral_max = extent.lateral_max.max(l_hi);
        }
        extent
    }

    // Lateral offsets on both sides, nearest first, bounded by search_radius.
    fn calc_candidates(
        &self,
        route: &Route,
        origin_s: f64,
        start_lateral: f64,
        start: Point2D,
        extent: &Extent,
        bypass_end: f64,
    ) -> Vec<Candidate> {
        let cfg = &self.config;
        let bypass_start = extent.start_s.max(origin_s).min(bypass_end);
        let mut candidates = Vec::new();
        for side in [Side::Left, Side::Right] {
            let edge = match side {
                Side::Left => extent.lateral_max.max(0.0),
                Side::Right => (-extent.lateral_min).max(0.0),
            };
            let mut offset = edge + cfg.clearance();
            while offset <= cfg.search_radius + 1e-9 {
                let lateral = side.sign() * offset;
                let mut waypoints = vec![start];
                let n = ((bypass_end - origin_s) / cfg.waypoint_spacing).ceil().max(1.0) as usize;
                for i in 1..=n {
                    let s = origin_s + (bypass_end - origin_s) * i as f64 / n as f64;
                    let l = if s < bypass_start {
                        let t = (s - origin_s) / (bypass_start - origin_s);
                        start_lateral + (lateral - start_lateral) * t
                    } else {
                        lateral
                    };
                    waypoints.push(route.from_frenet(s, l));
                }
                candidates.push(Candidate {
                    side,
                    offset,
                    waypoints,
                    score: f64::INFINITY,
                });
                offset += cfg.lateral_step;
            }
        }
        candidates
    }

    /// Integrated cost plus length penalty of the path through `waypoints`,
    /// the rejoin point and the rejoin region; `None` when any sample is
    /// over threshold or inside an inflated tracked obstacle.
    fn score_path<C: CostQuery>(
        &self,
        route: &Route,
        waypoints: &[Point2D],
        rejoin_s: f64,
        costmap: &C,
        obstacles: &TrackSnapshot,
    ) -> Option<f64> {
        let cfg = &self.config;
        let radius = cfg.clearance();
        let mut path: Vec<Point2D> = waypoints.to_vec();
        path.extend(
            route
                .sample(rejoin_s, rejoin_s + cfg.rejoin_region, cfg.sample_step)
                .into_iter()
                .map(|(_, p)| p),
        );

        let mut integral = 0.0;
        let mut length = 0.0;
        for pair in path.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let seg_len = a.distance(&b);
            let n = (seg_len / cfg.sample_step).ceil().max(1.0) as usize;
            let ds = seg_len / n as f64;
            for i in 1..=n {
                let p = a.lerp(&b, i as f64 / n as f64);
                if costmap.query(&Region::Disc { center: p, radius }) > cfg.blocking_threshold {
                    return None;
                }
                if self.hits_tracked(p, obstacles) {
                    return None;
                }
                integral += costmap.cost_at(p) * ds;
            }
            length += seg_len;
        }
        Some(integral + cfg.length_penalty * length)
    }

    fn hits_tracked(&self, p: Point2D, obstacles: &TrackSnapshot) -> bool {
        let cfg = &self.config;
        obstacles.iter().any(|o| {
            let margin = cfg.robot_radius + cfg.safety_margin * o.class.margin_scale();
            if o.footprint.distance_to(p) < margin {
                return true;
            }
            o.speed() > 0.0
                && [0.5, 1.0].iter().any(|k| {
                    o.predicted_footprint(k * cfg.prediction_horizon).distance_to(p) < margin
                })
        })
    }
}
