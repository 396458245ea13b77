// Pure pursuit target search and steering for a unicycle robot.

use crate::common::{normalize_angle, ControlInput, Point2D, Pose2D};
use crate::path_planning::Route;

/// Lookahead and speed limits shared by route following and detour tracking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PursuitGains {
    /// look forward gain
    pub k: f64,
    /// minimum look-ahead distance [m]
    pub lfc: f64,
    /// cruise speed [m/s]
    pub speed: f64,
    /// angular velocity limit [rad/s]
    pub max_omega: f64,
}

impl PursuitGains {
    pub fn lookahead(&self, v: f64) -> f64 {
        self.k * v.abs() + self.lfc
    }
}

/// Polyline being tracked, with the monotone nearest-point search.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetCourse {
    points: Vec<Point2D>,
    old_nearest_point_index: Option<usize>,
}

impl TargetCourse {
    pub fn new(points: Vec<Point2D>) -> TargetCourse {
        TargetCourse {
            points,
            old_nearest_point_index: None,
        }
    }

    pub fn points(&self) -> &[Point2D] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn last_index(&self) -> usize {
        self.points.len().saturating_sub(1)
    }

    pub fn nearest_index(&self) -> Option<usize> {
        self.old_nearest_point_index
    }

    /// Index of the first point beyond the lookahead `lf`.
    ///
    /// The nearest index only ever moves forward after the first call.
    pub fn search_target_index(&mut self, position: Point2D, lf: f64) -> Option<usize> {
        if self.points.is_empty() {
            return None;
        }
        let mut ind = match self.old_nearest_point_index {
            None => self
                .points
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| position.distance(a).total_cmp(&position.distance(b)))
                .map(|(i, _)| i)
                .unwrap_or(0),
            Some(old) => {
                let mut ind = old;
                let mut distance_this_index = position.distance(&self.points[ind]);
                while ind + 1 < self.points.len() {
                    let distance_next_index = position.distance(&self.points[ind + 1]);
                    if distance_this_index < distance_next_index {
                        break;
                    }
                    ind += 1;
                    distance_this_index = distance_next_index;
                }
                ind
            }
        };
        self.old_nearest_point_index = Some(ind);

        while ind + 1 < self.points.len() && lf > position.distance(&self.points[ind]) {
            ind += 1;
        }
        Some(ind)
    }
}

/// Route lookahead point: `lf` ahead of `s`, clamped to the route end.
pub fn route_target(route: &Route, s: f64, lf: f64) -> Point2D {
    route.point_at(s + lf)
}

/// Unicycle pure pursuit towards `target`.
///
/// Curvature `2 sin(alpha) / lf`; the forward speed shrinks with the
/// heading error so large corrections turn in place.
pub fn pure_pursuit_steer_control(pose: &Pose2D, target: Point2D, gains: &PursuitGains) -> ControlInput {
    let dx = target.x - pose.x;
    let dy = target.y - pose.y;
    let distance = (dx * dx + dy * dy).sqrt();
    if distance < 1e-6 {
        return ControlInput::zero();
    }
    let alpha = normalize_angle(dy.atan2(dx) - pose.yaw);
    let lf = distance.max(gains.lfc);
    let v = gains.speed * alpha.cos().max(0.0);
    let omega = (2.0 * gains.speed * alpha.sin() / lf).clamp(-gains.max_omega, gains.max_omega);
    ControlInput::new(v, omega)
}

/// Differential-drive kinematic update used by the simulator and tests.
pub fn unicycle_update(pose: &Pose2D, control: ControlInput, dt: f64) -> Pose2D {
    let mut next = Pose2D::new(
        pose.x + control.v * pose.yaw.cos() * dt,
        pose.y + control.v * pose.yaw.sin() * dt,
        pose.yaw + control.omega * dt,
    );
    next.normalize_yaw();
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gains() -> PursuitGains {
        PursuitGains {
            k: 0.5,
            lfc: 0.6,
            speed: 0.5,
            max_omega: 1.5,
        }
    }

    fn line(n: usize) -> Vec<Point2D> {
        (0..n).map(|i| Point2D::new(i as f64 * 0.5, 0.0)).collect()
    }

    #[test]
    fn test_target_beyond_lookahead() {
        let mut course = TargetCourse::new(line(10));
        let ind = course.search_target_index(Point2D::new(0.1, 0.0), 1.2).unwrap();
        assert_eq!(course.nearest_index(), Some(0));
        assert_eq!(ind, 3);
    }

    #[test]
    fn test_nearest_index_is_monotone() {
        let mut course = TargetCourse::new(line(10));
        course.search_target_index(Point2D::new(2.0, 0.0), 0.1);
        assert_eq!(course.nearest_index(), Some(4));
        // moving backwards does not rewind the nearest index
        course.search_target_index(Point2D::new(0.0, 0.0), 0.1);
        assert_eq!(course.nearest_index(), Some(4));
    }

    #[test]
    fn test_target_clamped_at_end() {
        let mut course = TargetCourse::new(line(4));
        let ind = course.search_target_index(Point2D::new(1.4, 0.0), 5.0).unwrap();
        assert_eq!(ind, course.last_index());
        assert!(TargetCourse::new(Vec::new()).search_target_index(Point2D::origin(), 1.0).is_none());
    }

    #[test]
    fn test_steer_towards_left_target() {
        let pose = Pose2D::new(0.0, 0.0, 0.0);
        let u = pure_pursuit_steer_control(&pose, Point2D::new(1.0, 1.0), &gains());
        assert!(u.omega > 0.0);
        assert!(u.v > 0.0 && u.v < 0.5);

        let behind = pure_pursuit_steer_control(&pose, Point2D::new(-1.0, 0.1), &gains());
        assert_eq!(behind.v, 0.0);
    }

    #[test]
    fn test_closed_loop_tracks_line() {
        let mut course = TargetCourse::new(line(60));
        let g = gains();
        let mut pose = Pose2D::new(0.0, 0.5, 0.0);
        for _ in 0..200 {
            let ind = course.search_target_index(pose.position(), g.lookahead(g.speed)).unwrap();
            let u = pure_pursuit_steer_control(&pose, course.points()[ind], &g);
            pose = unicycle_update(&pose, u, 0.1);
        }
        assert!(pose.y.abs() < 0.1, "lateral error {}", pose.y);
        assert!(pose.x > 5.0);
    }
}
