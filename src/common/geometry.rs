//! Planar geometry shared by the costmap, the tracker and the planner.

use itertools::Itertools;
use crate::common::types::Point2D;

/// Axis-aligned bounding box in world coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Point2D,
    pub max: Point2D,
}

impl Aabb {
    /// Build from two opposite corners in any order.
    pub fn new(a: Point2D, b: Point2D) -> Self {
        Self {
            min: Point2D::new(a.x.min(b.x), a.y.min(b.y)),
            max: Point2D::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    pub fn from_center(center: Point2D, half_width: f64, half_height: f64) -> Self {
        Self::new(
            Point2D::new(center.x - half_width, center.y - half_height),
            Point2D::new(center.x + half_width, center.y + half_height),
        )
    }

    /// Tightest box around a point set, `None` when empty.
    pub fn from_points(points: &[Point2D]) -> Option<Self> {
        let (min_x, max_x) = points.iter().map(|p| p.x).minmax().into_option()?;
        let (min_y, max_y) = points.iter().map(|p| p.y).minmax().into_option()?;
        Some(Self::new(Point2D::new(min_x, min_y), Point2D::new(max_x, max_y)))
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> Point2D {
        self.min.lerp(&self.max, 0.5)
    }

    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }

    pub fn contains(&self, p: Point2D) -> bool {
        p.x >= self.min.x && p.x <= self.max.x && p.y >= self.min.y && p.y <= self.max.y
    }

    pub fn inflate(&self, margin: f64) -> Aabb {
        Aabb {
            min: Point2D::new(self.min.x - margin, self.min.y - margin),
            max: Point2D::new(self.max.x + margin, self.max.y + margin),
        }
    }

    pub fn translate(&self, dx: f64, dy: f64) -> Aabb {
        Aabb {
            min: Point2D::new(self.min.x + dx, self.min.y + dy),
            max: Point2D::new(self.max.x + dx, self.max.y + dy),
        }
    }

    pub fn union(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: Point2D::new(self.min.x.min(other.min.x), self.min.y.min(other.min.y)),
            max: Point2D::new(self.max.x.max(other.max.x), self.max.y.max(other.max.y)),
        }
    }

    pub fn intersection_area(&self, other: &Aabb) -> f64 {
        let w = self.max.x.min(other.max.x) - self.min.x.max(other.min.x);
        let h = self.max.y.min(other.max.y) - self.min.y.max(other.min.y);
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }

    /// Intersection over union; 0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &Aabb) -> f64 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }

    /// Euclidean distance from `p` to the box, zero inside.
    pub fn distance_to(&self, p: Point2D) -> f64 {
        let dx = (self.min.x - p.x).max(0.0).max(p.x - self.max.x);
        let dy = (self.min.y - p.y).max(0.0).max(p.y - self.max.y);
        (dx * dx + dy * dy).sqrt()
    }

    pub fn corners(&self) -> [Point2D; 4] {
        [
            self.min,
            Point2D::new(self.max.x, self.min.y),
            self.max,
            Point2D::new(self.min.x, self.max.y),
        ]
    }
}

/// Ground footprint of an obstacle: a box or a simple polygon.
#[derive(Debug, Clone, PartialEq)]
pub enum Footprint {
    Box(Aabb),
    Polygon(Vec<Point2D>),
}

impl Footprint {
    /// Bounding box; a polygon collapses to its min/max extent.
    pub fn bounding_box(&self) -> Aabb {
        match self {
            Footprint::Box(b) => *b,
            Footprint::Polygon(pts) => Aabb::from_points(pts)
                .unwrap_or_else(|| Aabb::new(Point2D::origin(), Point2D::origin())),
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            Footprint::Box(b) => b.is_finite(),
            Footprint::Polygon(pts) => pts.len() >= 3 && pts.iter().all(|p| p.is_finite()),
        }
    }

    /// Area centroid for polygons (vertex mean when degenerate), center for boxes.
    pub fn centroid(&self) -> Point2D {
        match self {
            Footprint::Box(b) => b.center(),
            Footprint::Polygon(pts) => polygon_centroid(pts),
        }
    }

    pub fn contains(&self, p: Point2D) -> bool {
        match self {
            Footprint::Box(b) => b.contains(p),
            Footprint::Polygon(pts) => polygon_contains(pts, p),
        }
    }

    /// Distance from `p` to the footprint boundary, zero inside.
    pub fn distance_to(&self, p: Point2D) -> f64 {
        match self {
            Footprint::Box(b) => b.distance_to(p),
            Footprint::Polygon(pts) => {
                if polygon_contains(pts, p) {
                    return 0.0;
                }
                pts.iter()
                    .circular_tuple_windows()
                    .map(|(a, b)| segment_distance(p, *a, *b))
                    .fold(f64::INFINITY, f64::min)
            }
        }
    }

    pub fn translated(&self, dx: f64, dy: f64) -> Footprint {
        match self {
            Footprint::Box(b) => Footprint::Box(b.translate(dx, dy)),
            Footprint::Polygon(pts) => Footprint::Polygon(
                pts.iter().map(|p| Point2D::new(p.x + dx, p.y + dy)).collect(),
            ),
        }
    }

    pub fn vertices(&self) -> Vec<Point2D> {
        match self {
            Footprint::Box(b) => b.corners().to_vec(),
            Footprint::Polygon(pts) => pts.clone(),
        }
    }
}

impl From<Aabb> for Footprint {
    fn from(b: Aabb) -> Self {
        Footprint::Box(b)
    }
}

/// Shortest distance from `p` to segment `ab`.
pub fn segment_distance(p: Point2D, a: Point2D, b: Point2D) -> f64 {
    let ab = b.to_vector() - a.to_vector();
    let len2 = ab.norm_squared();
    if len2 <= f64::EPSILON {
        return p.distance(&a);
    }
    let t = ((p.to_vector() - a.to_vector()).dot(&ab) / len2).clamp(0.0, 1.0);
    p.distance(&a.lerp(&b, t))
}

// even-odd ray casting
fn polygon_contains(pts: &[Point2D], p: Point2D) -> bool {
    let mut inside = false;
    for (a, b) in pts.iter().circular_tuple_windows() {
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
            if p.x < x_cross {
                inside = !inside;
            }
        }
    }
    inside
}

fn polygon_centroid(pts: &[Point2D]) -> Point2D {
    if pts.is_empty() {
        return Point2D::origin();
    }
    let mut area2 = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for (a, b) in pts.iter().circular_tuple_windows() {
        let cross = a.x * b.y - b.x * a.y;
        area2 += cross;
        cx += (a.x + b.x) * cross;
        cy += (a.y + b.y) * cross;
    }
    if area2.abs() < 1e-12 {
        let n = pts.len() as f64;
        let (sx, sy) = pts.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
        return Point2D::new(sx / n, sy / n);
    }
    Point2D::new(cx / (3.0 * area2), cy / (3.0 * area2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Footprint {
        Footprint::Polygon(vec![
            Point2D::new(0.0, 0.0),
            Point2D::new(2.0, 0.0),
            Point2D::new(2.0, 2.0),
            Point2D::new(0.0, 2.0),
        ])
    }

    #[test]
    fn test_polygon_bounding_box() {
        let poly = Footprint::Polygon(vec![
            Point2D::new(1.0, 3.0),
            Point2D::new(4.0, 1.0),
            Point2D::new(2.0, 5.0),
        ]);
        let b = poly.bounding_box();
        assert_eq!(b.min, Point2D::new(1.0, 1.0));
        assert_eq!(b.max, Point2D::new(4.0, 5.0));
    }

    #[test]
    fn test_iou_partial_overlap() {
        let a = Aabb::new(Point2D::new(0.0, 0.0), Point2D::new(2.0, 2.0));
        let b = Aabb::new(Point2D::new(1.0, 0.0), Point2D::new(3.0, 2.0));
        // overlap 2, union 6
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-12);
        let far = a.translate(10.0, 0.0);
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn test_box_distance() {
        let b = Aabb::new(Point2D::new(0.0, 0.0), Point2D::new(1.0, 1.0));
        assert_eq!(b.distance_to(Point2D::new(0.5, 0.5)), 0.0);
        assert!((b.distance_to(Point2D::new(4.0, 5.0)) - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_polygon_contains_and_distance() {
        let sq = square();
        assert!(sq.contains(Point2D::new(1.0, 1.0)));
        assert!(!sq.contains(Point2D::new(3.0, 1.0)));
        assert!((sq.distance_to(Point2D::new(3.0, 1.0)) - 1.0).abs() < 1e-12);
        assert_eq!(sq.distance_to(Point2D::new(1.0, 1.5)), 0.0);
    }

    #[test]
    fn test_polygon_centroid() {
        let c = square().centroid();
        assert!((c.x - 1.0).abs() < 1e-12);
        assert!((c.y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_polygon_is_invalid() {
        let line = Footprint::Polygon(vec![Point2D::new(0.0, 0.0), Point2D::new(1.0, 0.0)]);
        assert!(!line.is_valid());
        assert!(square().is_valid());
    }
}
