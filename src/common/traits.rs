//! Common traits defining the seams between navigation components

use crate::common::types::Point2D;
use crate::mapping::Region;

/// Read-only view of traversal cost, implemented by the costmap.
///
/// The planner, the return controller and the safety gate only ever see
/// the costmap through this trait, which keeps them testable against
/// synthetic cost fields.
pub trait CostQuery {
    /// Fused cost of the cell containing `p`; unknown space reads as baseline.
    fn cost_at(&self, p: Point2D) -> f64;

    /// Highest cost inside `region`.
    fn query(&self, region: &Region) -> f64;

    /// Highest cost of a disc of `radius` swept from `a` to `b`, sampled every `step`.
    fn max_cost_along(&self, a: Point2D, b: Point2D, radius: f64, step: f64) -> f64 {
        let length = a.distance(&b);
        let n = (length / step.max(1e-3)).ceil().max(1.0) as usize;
        (0..=n)
            .map(|i| {
                let center = a.lerp(&b, i as f64 / n as f64);
                self.query(&Region::Disc { center, radius })
            })
            .fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Cost field that is lethal for x in [2, 3].
    struct WallField;

    impl CostQuery for WallField {
        fn cost_at(&self, p: Point2D) -> f64 {
            if (2.0..=3.0).contains(&p.x) {
                1.0
            } else {
                0.0
            }
        }

        fn query(&self, region: &Region) -> f64 {
            match region {
                Region::Point(p) => self.cost_at(*p),
                Region::Disc { center, radius } => {
                    if center.x + radius >= 2.0 && center.x - radius <= 3.0 {
                        1.0
                    } else {
                        0.0
                    }
                }
                Region::Rect(b) => {
                    if b.max.x >= 2.0 && b.min.x <= 3.0 {
                        1.0
                    } else {
                        0.0
                    }
                }
            }
        }
    }

    #[test]
    fn test_max_cost_along_crosses_wall() {
        let field = WallField;
        let hit = field.max_cost_along(Point2D::new(0.0, 0.0), Point2D::new(5.0, 0.0), 0.1, 0.1);
        assert_eq!(hit, 1.0);
        let miss = field.max_cost_along(Point2D::new(0.0, 0.0), Point2D::new(1.5, 0.0), 0.1, 0.1);
        assert_eq!(miss, 0.0);
    }
}
