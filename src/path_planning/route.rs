//! Route representation: an arc-length parameterized polyline with
//! Frenet-style conversions used by the deviation planner.

use std::f64::consts::FRAC_PI_2;
use std::fmt;

use crate::common::{normalize_angle, segment_distance, NavError, NavResult, Point2D};

/// A route vertex with its arc length from the route start.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Waypoint {
    pub position: Point2D,
    pub s: f64,
}

/// Stretch of the route whose cost exceeds the blocking threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockedSegment {
    pub start_s: f64,
    pub end_s: f64,
    pub peak_cost: f64,
    /// Seen on enough consecutive evaluations to act on
    pub confirmed: bool,
}

impl BlockedSegment {
    pub fn length(&self) -> f64 {
        self.end_s - self.start_s
    }

    pub fn contains(&self, s: f64) -> bool {
        s >= self.start_s && s <= self.end_s
    }

    pub fn overlaps(&self, start_s: f64, end_s: f64) -> bool {
        self.start_s <= end_s && start_s <= self.end_s
    }
}

impl fmt::Display for BlockedSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.2}, {:.2}] peak {:.2}{}",
            self.start_s,
            self.end_s,
            self.peak_cost,
            if self.confirmed { "" } else { " (unconfirmed)" }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    waypoints: Vec<Waypoint>,
    blocked: Option<BlockedSegment>,
}

impl Route {
    /// Build a route from ordered points. Needs at least two finite points
    /// and no zero-length steps.
    pub fn new(points: &[Point2D]) -> NavResult<Self> {
        if points.len() < 2 {
            return Err(NavError::InvalidRoute(format!(
                "route needs at least two waypoints, got {}",
                points.len()
            )));
        }
        if let Some(i) = points.iter().position(|p| !p.is_finite()) {
            return Err(NavError::InvalidRoute(format!("waypoint {} is not finite", i)));
        }

        let mut waypoints = Vec::with_capacity(points.len());
        let mut s = 0.0;
        waypoints.push(Waypoint { position: points[0], s });
        for (i, pair) in points.windows(2).enumerate() {
            let step = pair[0].distance(&pair[1]);
            if step <= 1e-9 {
                return Err(NavError::InvalidRoute(format!(
                    "waypoints {} and {} coincide",
                    i,
                    i + 1
                )));
            }
            s += step;
            waypoints.push(Waypoint { position: pair[1], s });
        }
        Ok(Self {
            waypoints,
            blocked: None,
        })
    }

    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    pub fn length(&self) -> f64 {
        self.waypoints.last().map_or(0.0, |w| w.s)
    }

    pub fn start(&self) -> Point2D {
        self.waypoints[0].position
    }

    pub fn end(&self) -> Point2D {
        self.waypoints[self.waypoints.len() - 1].position
    }

    pub fn blocked(&self) -> Option<&BlockedSegment> {
        self.blocked.as_ref()
    }

    pub fn annotate_blocked(&mut self, segment: BlockedSegment) {
        self.blocked = Some(segment);
    }

    pub fn clear_blocked(&mut self) {
        self.blocked = None;
    }

    // index i such that waypoints[i].s <= s < waypoints[i + 1].s
    fn segment_index(&self, s: f64) -> usize {
        let i = self.waypoints.partition_point(|w| w.s <= s);
        i.saturating_sub(1).min(self.waypoints.len() - 2)
    }

    /// Point on the route at arc length `s`, clamped to the route ends.
    pub fn point_at(&self, s: f64) -> Point2D {
        let s = s.clamp(0.0, self.length());
        let i = self.segment_index(s);
        let (a, b) = (self.waypoints[i], self.waypoints[i + 1]);
        a.position.lerp(&b.position, (s - a.s) / (b.s - a.s))
    }

    pub fn heading_at(&self, s: f64) -> f64 {
        let i = self.segment_index(s.clamp(0.0, self.length()));
        let (a, b) = (self.waypoints[i].position, self.waypoints[i + 1].position);
        (b.y - a.y).atan2(b.x - a.x)
    }

    /// Project `p` onto the route: returns `(s, lateral)` with lateral
    /// positive to the left of the direction of travel.
    ///
    /// Only segments intersecting `[hint_s - window, hint_s + window]` are
    /// searched, which keeps the projection on the right branch of routes
    /// that fold back on themselves.
    pub fn to_frenet(&self, p: Point2D, hint_s: f64, window: f64) -> (f64, f64) {
        let (lo, hi) = (hint_s - window, hint_s + window);
        let mut best = (f64::INFINITY, 0.0, 0.0);
        for pair in self.waypoints.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if b.s < lo || a.s > hi {
                continue;
            }
            let d = segment_distance(p, a.position, b.position);
            if d < best.0 {
                let ab = b.position.to_vector() - a.position.to_vector();
                let ap = p.to_vector() - a.position.to_vector();
                let t = (ap.dot(&ab) / ab.norm_squared()).clamp(0.0, 1.0);
                let cross = ab.x * ap.y - ab.y * ap.x;
                best = (d, a.s + t * (b.s - a.s), d.copysign(cross));
            }
        }
        if best.0.is_infinite() {
            return self.to_frenet(p, hint_s, f64::INFINITY);
        }
        (best.1, best.2)
    }

    /// Frenet projection over the whole route.
    pub fn project(&self, p: Point2D) -> (f64, f64) {
        self.to_frenet(p, 0.0, f64::INFINITY)
    }

    pub fn from_frenet(&self, s: f64, lateral: f64) -> Point2D {
        let heading = normalize_angle(self.heading_at(s) + FRAC_PI_2);
        self.point_at(s).offset(heading, lateral)
    }

    /// Samples `(s, point)` every `step` from `from` to `to`, both included.
    pub fn sample(&self, from: f64, to: f64, step: f64) -> Vec<(f64, Point2D)> {
        let from = from.clamp(0.0, self.length());
        let to = to.clamp(0.0, self.length());
        if to < from {
            return Vec::new();
        }
        let n = ((to - from) / step.max(1e-3)).ceil().max(1.0) as usize;
        (0..=n)
            .map(|i| {
                let s = from + (to - from) * i as f64 / n as f64;
                (s, self.point_at(s))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn l_route() -> Route {
        Route::new(&[Point2D::new(0.0, 0.0), Point2D::new(4.0, 0.0), Point2D::new(4.0, 3.0)]).unwrap()
    }

    #[test]
    fn test_route_validation() {
        assert!(matches!(Route::new(&[]), Err(NavError::InvalidRoute(_))));
        assert!(Route::new(&[Point2D::origin()]).is_err());
        assert!(Route::new(&[Point2D::origin(), Point2D::new(f64::NAN, 0.0)]).is_err());
        assert!(Route::new(&[Point2D::origin(), Point2D::origin()]).is_err());
    }

    #[test]
    fn test_arc_length() {
        let route = l_route();
        assert_eq!(route.length(), 7.0);
        assert!(route.waypoints().windows(2).all(|w| w[1].s > w[0].s));
        assert_eq!(route.point_at(2.0), Point2D::new(2.0, 0.0));
        assert_eq!(route.point_at(5.0), Point2D::new(4.0, 1.0));
        assert_eq!(route.point_at(100.0), Point2D::new(4.0, 3.0));
        assert!((route.heading_at(6.0) - FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn test_frenet_round_trip() {
        let route = l_route();
        let (s, d) = route.project(Point2D::new(2.0, 0.5));
        assert!((s - 2.0).abs() < 1e-12);
        assert!((d - 0.5).abs() < 1e-12);
        let (s, d) = route.project(Point2D::new(2.0, -0.5));
        assert!((s - 2.0).abs() < 1e-12 && (d + 0.5).abs() < 1e-12);

        let p = route.from_frenet(5.5, 1.0);
        assert!(p.distance(&Point2D::new(3.0, 1.5)) < 1e-9);
    }

    #[test]
    fn test_frenet_window() {
        // hairpin: the return leg passes 1 m above the outbound leg
        let route = Route::new(&[
            Point2D::new(0.0, 0.0),
            Point2D::new(5.0, 0.0),
            Point2D::new(5.0, 1.0),
            Point2D::new(0.0, 1.0),
        ])
        .unwrap();
        let p = Point2D::new(2.0, 0.6);
        let (s_near, _) = route.to_frenet(p, 2.0, 2.0);
        assert!((s_near - 2.0).abs() < 1e-9);
        let (s_far, _) = route.project(p);
        assert!((s_far - 9.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_includes_ends() {
        let route = l_route();
        let samples = route.sample(1.0, 3.0, 0.5);
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0].0, 1.0);
        assert_eq!(samples[4].0, 3.0);
        assert!(route.sample(3.0, 1.0, 0.5).is_empty());
    }

    #[test]
    fn test_blocked_annotation() {
        let mut route = l_route();
        let seg = BlockedSegment {
            start_s: 2.0,
            end_s: 3.0,
            peak_cost: 1.0,
            confirmed: true,
        };
        route.annotate_blocked(seg);
        assert!(route.blocked().unwrap().contains(2.5));
        assert!(seg.overlaps(2.9, 4.0));
        route.clear_blocked();
        assert!(route.blocked().is_none());
    }
}
