//! Detour execution and rejoin supervision.
//!
//! Tracks the bypass waypoints with pure pursuit, then steers to the rejoin
//! point once the rejoin region reads clear. It never forces a merge into a
//! blocked stretch: it holds and asks for a replan instead.

use serde::Deserialize;
use tracing::{debug, info};

use crate::common::{ControlInput, CostQuery, NavError, NavResult, Point2D, StampedPose, Timestamp};
use crate::mapping::Region;
use crate::path_planning::{DetourPlan, PlannerConfig, Route};
use crate::path_tracking::pure_pursuit::{pure_pursuit_steer_control, PursuitGains, TargetCourse};

/// Controller configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ReturnConfig {
    /// Lookahead growth with speed (s)
    #[serde(default = "default_lookahead_gain")]
    pub lookahead_gain: f64,
    /// Minimum lookahead distance (meters)
    #[serde(default = "default_min_lookahead")]
    pub min_lookahead: f64,
    /// Forward speed while following or deviating (m/s)
    #[serde(default = "default_cruise_speed")]
    pub cruise_speed: f64,
    /// Angular velocity limit (rad/s)
    #[serde(default = "default_max_omega")]
    pub max_omega: f64,
    /// Distance at which the last bypass waypoint counts as reached (meters)
    #[serde(default = "default_waypoint_tolerance")]
    pub waypoint_tolerance: f64,
    /// Distance at which the robot counts as back on the route (meters)
    #[serde(default = "default_rejoin_tolerance")]
    pub rejoin_tolerance: f64,
    /// Half-length of the route stretch around the rejoin point that must be clear (meters)
    #[serde(default = "default_rejoin_region")]
    pub rejoin_region: f64,
    /// Remaining detour length re-checked for new obstacles each tick (meters)
    #[serde(default = "default_check_distance")]
    pub check_distance: f64,
}

fn default_lookahead_gain() -> f64 {
    0.5
}
fn default_min_lookahead() -> f64 {
    0.6
}
fn default_cruise_speed() -> f64 {
    0.5
}
fn default_max_omega() -> f64 {
    1.5
}
fn default_waypoint_tolerance() -> f64 {
    0.25
}
fn default_rejoin_tolerance() -> f64 {
    0.3
}
fn default_rejoin_region() -> f64 {
    0.75
}
fn default_check_distance() -> f64 {
    2.0
}

impl Default for ReturnConfig {
    fn default() -> Self {
        Self {
            lookahead_gain: default_lookahead_gain(),
            min_lookahead: default_min_lookahead(),
            cruise_speed: default_cruise_speed(),
            max_omega: default_max_omega(),
            waypoint_tolerance: default_waypoint_tolerance(),
            rejoin_tolerance: default_rejoin_tolerance(),
            rejoin_region: default_rejoin_region(),
            check_distance: default_check_distance(),
        }
    }
}

impl ReturnConfig {
    pub fn validate(&self) -> NavResult<()> {
        if !(self.cruise_speed > 0.0) || !(self.max_omega > 0.0) || !(self.min_lookahead > 0.0) {
            return Err(NavError::Config(
                "cruise_speed, max_omega and min_lookahead must be positive".to_string(),
            ));
        }
        if !(self.waypoint_tolerance > 0.0) || !(self.rejoin_tolerance > 0.0) {
            return Err(NavError::Config("tolerances must be positive".to_string()));
        }
        if self.rejoin_region < 0.0 || self.check_distance < 0.0 || self.lookahead_gain < 0.0 {
            return Err(NavError::Config(
                "rejoin_region, check_distance and lookahead_gain must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn gains(&self) -> PursuitGains {
        PursuitGains {
            k: self.lookahead_gain,
            lfc: self.min_lookahead,
            speed: self.cruise_speed,
            max_omega: self.max_omega,
        }
    }
}

/// Result of one controller tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReturnStep {
    pub command_waypoint: Point2D,
    pub control: ControlInput,
    /// Back on the route at the rejoin point
    pub rejoined: bool,
    /// Last bypass waypoint reached
    pub detour_complete: bool,
    /// Route around `rejoin_s` is below the blocking threshold
    pub rejoin_clear: bool,
    /// Remaining path ahead crosses a blocked cell
    pub path_blocked: bool,
    /// The plan cannot be finished as is
    pub replan_required: bool,
}

// Identifies the plan the controller is currently tracking.
type PlanKey = (u64, u64, u64);

fn plan_key(plan: &DetourPlan) -> PlanKey {
    (
        plan.created_at.to_bits(),
        plan.origin_s.to_bits(),
        plan.rejoin_s.to_bits(),
    )
}

pub struct ReturnController {
    config: ReturnConfig,
    robot_radius: f64,
    clearance: f64,
    blocking_threshold: f64,
    sample_step: f64,
    course: TargetCourse,
    active: Option<PlanKey>,
    complete: bool,
}

impl ReturnController {
    pub fn new(config: ReturnConfig, planner: &PlannerConfig) -> NavResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            robot_radius: planner.robot_radius,
            clearance: planner.clearance(),
            blocking_threshold: planner.blocking_threshold,
            sample_step: planner.sample_step,
            course: TargetCourse::new(Vec::new()),
            active: None,
            complete: false,
        })
    }

    pub fn config(&self) -> &ReturnConfig {
        &self.config
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Start tracking `plan` from its first waypoint.
    pub fn begin(&mut self, plan: &DetourPlan) {
        self.course = TargetCourse::new(plan.waypoints.clone());
        self.active = Some(plan_key(plan));
        self.complete = false;
        debug!("tracking detour with {} waypoints", plan.waypoints.len());
    }

    pub fn reset(&mut self) {
        self.course = TargetCourse::new(Vec::new());
        self.active = None;
        self.complete = false;
    }

    pub fn step<C: CostQuery>(
        &mut self,
        plan: &DetourPlan,
        route: &Route,
        costmap: &C,
        pose: &StampedPose,
        now: Timestamp,
    ) -> ReturnStep {
        if self.active != Some(plan_key(plan)) {
            self.begin(plan);
        }
        let position = pose.position();
        let gains = self.config.gains();
        let rejoin_clear = self.rejoin_clear(plan, route, costmap);

        if !self.complete && self.reached_end(plan, route, position) {
            self.complete = true;
            info!("detour bypass finished at t={:.2}", now);
        }

        if !self.complete {
            let lf = gains.lookahead(gains.speed);
            let ind = self
                .course
                .search_target_index(position, lf)
                .unwrap_or(0);
            let target = self.course.points().get(ind).copied().unwrap_or(plan.rejoin_point);
            let path_blocked = self.bypass_blocked(position, costmap);
            return ReturnStep {
                command_waypoint: target,
                control: pure_pursuit_steer_control(&pose.pose, target, &gains),
                rejoined: false,
                detour_complete: false,
                rejoin_clear,
                path_blocked,
                replan_required: path_blocked,
            };
        }

        if !rejoin_clear {
            // hold position until the rejoin region clears or a replan succeeds
            return ReturnStep {
                command_waypoint: position,
                control: ControlInput::zero(),
                rejoined: false,
                detour_complete: true,
                rejoin_clear,
                path_blocked: false,
                replan_required: true,
            };
        }

        let (s, lateral) = route.to_frenet(position, plan.rejoin_s, self.config.rejoin_region + self.config.check_distance);
        let rejoined = position.distance(&plan.rejoin_point) <= self.config.rejoin_tolerance
            || (s >= plan.rejoin_s - self.config.rejoin_tolerance && lateral.abs() <= self.config.rejoin_tolerance);
        let path_blocked = !rejoined
            && costmap.max_cost_along(position, plan.rejoin_point, self.robot_radius, self.sample_step)
                > self.blocking_threshold;
        ReturnStep {
            command_waypoint: plan.rejoin_point,
            control: pure_pursuit_steer_control(&pose.pose, plan.rejoin_point, &gains),
            rejoined,
            detour_complete: true,
            rejoin_clear,
            path_blocked,
            replan_required: path_blocked,
        }
    }

    fn reached_end(&self, plan: &DetourPlan, route: &Route, position: Point2D) -> bool {
        let Some(last) = plan.waypoints.last() else {
            return true;
        };
        if position.distance(last) <= self.config.waypoint_tolerance {
            return true;
        }
        // passed the last waypoint along the route without touching it
        let window = self.config.check_distance + self.config.rejoin_region;
        let (s_last, _) = route.to_frenet(*last, plan.origin_s, plan.rejoin_s - plan.origin_s + window);
        let (s_robot, _) = route.to_frenet(position, s_last, window);
        self.course.nearest_index() == Some(self.course.last_index()) && s_robot >= s_last
    }

    fn rejoin_clear<C: CostQuery>(&self, plan: &DetourPlan, route: &Route, costmap: &C) -> bool {
        let from = plan.rejoin_s - self.config.rejoin_region;
        let to = plan.rejoin_s + self.config.rejoin_region;
        route.sample(from, to, self.sample_step).into_iter().all(|(_, p)| {
            costmap.query(&Region::Disc {
                center: p,
                radius: self.clearance,
            }) <= self.blocking_threshold
        })
    }

    // Remaining bypass within check_distance: robot to next waypoint, then the polyline.
    fn bypass_blocked<C: CostQuery>(&self, position: Point2D, costmap: &C) -> bool {
        let points = self.course.points();
        let next = self.course.nearest_index().map_or(0, |i| (i + 1).min(points.len().saturating_sub(1)));
        let Some(first) = points.get(next) else {
            return false;
        };
        if costmap.max_cost_along(position, *first, self.robot_radius, self.sample_step) > self.blocking_threshold {
            return true;
        }
        let mut budget = self.config.check_distance - position.distance(first);
        for pair in points[next..].windows(2) {
            if budget <= 0.0 {
                break;
            }
            if costmap.max_cost_along(pair[0], pair[1], self.clearance, self.sample_step) > self.blocking_threshold {
                return true;
            }
            budget -= pair[0].distance(&pair[1]);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Aabb, Footprint, Pose2D};
    use crate::mapping::{Costmap, CostmapConfig};
    use crate::path_planning::Side;
    use crate::path_tracking::pure_pursuit::unicycle_update;
    use crate::perception::{ObstacleClass, ObstacleFootprint};

    fn route() -> Route {
        Route::new(&[Point2D::new(0.0, 0.0), Point2D::new(12.0, 0.0)]).unwrap()
    }

    fn plan() -> DetourPlan {
        let mut waypoints = vec![Point2D::new(1.0, 0.0)];
        for i in 1..=4 {
            waypoints.push(Point2D::new(1.0 + i as f64 * 0.25, i as f64 * 0.25));
        }
        for i in 1..=8 {
            waypoints.push(Point2D::new(2.0 + i as f64 * 0.25, 1.0));
        }
        DetourPlan {
            origin_s: 1.0,
            rejoin_s: 5.5,
            waypoints,
            rejoin_point: Point2D::new(5.5, 0.0),
            side: Side::Left,
            lateral_offset: 1.0,
            cost: 0.0,
            blocked: None,
            created_at: 0.0,
        }
    }

    fn costmap_with(boxes: &[Aabb]) -> Costmap {
        let mut map = Costmap::new(CostmapConfig::default()).unwrap();
        let footprints: Vec<ObstacleFootprint> = boxes
            .iter()
            .map(|b| ObstacleFootprint {
                footprint: Footprint::Box(*b),
                class: ObstacleClass::Static,
            })
            .collect();
        let pose = StampedPose::new(Pose2D::new(3.0, 0.0, 0.0), 0.0);
        map.fuse(None, Some(&footprints), None, Some(&pose), 0.0);
        map
    }

    fn controller() -> ReturnController {
        ReturnController::new(ReturnConfig::default(), &PlannerConfig::default()).unwrap()
    }

    #[test]
    fn test_tracks_detour_then_rejoins() {
        let map = costmap_with(&[Aabb::new(Point2D::new(3.0, -0.3), Point2D::new(3.6, 0.3))]);
        let mut ctrl = controller();
        let plan = plan();
        ctrl.begin(&plan);

        let mut pose = Pose2D::new(1.0, 0.0, 0.0);
        let mut completed_at = None;
        let mut rejoined_at = None;
        for k in 0..400 {
            let now = k as f64 * 0.1;
            let step = ctrl.step(&plan, &route(), &map, &StampedPose::new(pose, now), now);
            assert!(!step.path_blocked, "blocked at {:?}", pose);
            if step.detour_complete && completed_at.is_none() {
                completed_at = Some(k);
            }
            if step.rejoined {
                rejoined_at = Some(k);
                break;
            }
            pose = unicycle_update(&pose, step.control, 0.1);
        }
        let (done, back) = (completed_at.unwrap(), rejoined_at.unwrap());
        assert!(done <= back);
        assert!(pose.x > 4.5 && pose.y.abs() < 0.5, "rejoined at {:?}", pose);
    }

    #[test]
    fn test_holds_when_rejoin_blocked() {
        let map = costmap_with(&[Aabb::new(Point2D::new(5.3, -0.3), Point2D::new(5.7, 0.3))]);
        let mut ctrl = controller();
        let plan = plan();
        let at_end = StampedPose::new(Pose2D::new(4.0, 1.0, 0.0), 1.0);
        let step = ctrl.step(&plan, &route(), &map, &at_end, 1.0);
        assert!(step.detour_complete);
        assert!(!step.rejoin_clear);
        assert!(step.replan_required);
        assert!(!step.rejoined);
        assert_eq!(step.control, ControlInput::zero());
    }

    #[test]
    fn test_new_obstacle_blocks_bypass() {
        let map = costmap_with(&[Aabb::new(Point2D::new(2.6, 0.8), Point2D::new(3.0, 1.2))]);
        let mut ctrl = controller();
        let plan = plan();
        let step = ctrl.step(&plan, &route(), &map, &StampedPose::new(Pose2D::new(1.5, 0.5, 0.7), 0.5), 0.5);
        assert!(!step.detour_complete);
        assert!(step.path_blocked);
        assert!(step.replan_required);
    }

    #[test]
    fn test_new_plan_restarts_tracking() {
        let map = costmap_with(&[]);
        let mut ctrl = controller();
        let plan = plan();
        let end = StampedPose::new(Pose2D::new(4.0, 1.0, 0.0), 1.0);
        assert!(ctrl.step(&plan, &route(), &map, &end, 1.0).detour_complete);

        let mut replanned = plan.clone();
        replanned.created_at = 2.0;
        let start = StampedPose::new(Pose2D::new(1.0, 0.0, 0.0), 2.0);
        assert!(!ctrl.step(&replanned, &route(), &map, &start, 2.0).detour_complete);
    }
}
