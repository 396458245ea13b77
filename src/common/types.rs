//! Common types used throughout rust_local_nav

use nalgebra::{Rotation2, Vector2, Vector3};
use std::f64::consts::PI;

/// Seconds on the external monotonic clock that stamps every input.
pub type Timestamp = f64;

/// 2D point representation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}

impl Point2D {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn origin() -> Self {
        Self { x: 0.0, y: 0.0 }
    }

    pub fn distance(&self, other: &Point2D) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }

    pub fn to_vector(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Point moved by `distance` along `heading`.
    pub fn offset(&self, heading: f64, distance: f64) -> Point2D {
        Point2D::new(
            self.x + distance * heading.cos(),
            self.y + distance * heading.sin(),
        )
    }

    /// Linear interpolation, `t = 0` gives `self`.
    pub fn lerp(&self, other: &Point2D, t: f64) -> Point2D {
        Point2D::new(
            self.x + (other.x - self.x) * t,
            self.y + (other.y - self.y) * t,
        )
    }
}

impl From<(f64, f64)> for Point2D {
    fn from(tuple: (f64, f64)) -> Self {
        Self { x: tuple.0, y: tuple.1 }
    }
}

impl From<Vector2<f64>> for Point2D {
    fn from(v: Vector2<f64>) -> Self {
        Self { x: v[0], y: v[1] }
    }
}

/// 2D pose (position + orientation)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub yaw: f64,
}

impl Pose2D {
    pub fn new(x: f64, y: f64, yaw: f64) -> Self {
        Self { x, y, yaw }
    }

    pub fn origin() -> Self {
        Self { x: 0.0, y: 0.0, yaw: 0.0 }
    }

    pub fn position(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }

    pub fn to_vector(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.yaw)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.yaw.is_finite()
    }

    /// Map a point given in the robot frame into the world frame.
    pub fn transform_point(&self, local: Vector2<f64>) -> Point2D {
        let world = Rotation2::new(self.yaw) * local;
        Point2D::new(self.x + world[0], self.y + world[1])
    }

    /// Normalize yaw to [-pi, pi]
    pub fn normalize_yaw(&mut self) {
        self.yaw = normalize_angle(self.yaw);
    }
}

impl From<Vector3<f64>> for Pose2D {
    fn from(v: Vector3<f64>) -> Self {
        Self { x: v[0], y: v[1], yaw: v[2] }
    }
}

/// Pose as published by the external localization source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StampedPose {
    pub pose: Pose2D,
    pub stamp: Timestamp,
}

impl StampedPose {
    pub fn new(pose: Pose2D, stamp: Timestamp) -> Self {
        Self { pose, stamp }
    }

    pub fn position(&self) -> Point2D {
        self.pose.position()
    }

    pub fn age(&self, now: Timestamp) -> f64 {
        now - self.stamp
    }
}

/// Control input for differential drive robot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlInput {
    pub v: f64,      // linear velocity
    pub omega: f64,  // angular velocity
}

impl ControlInput {
    pub fn new(v: f64, omega: f64) -> Self {
        Self { v, omega }
    }

    pub fn zero() -> Self {
        Self { v: 0.0, omega: 0.0 }
    }

    pub fn to_vector(&self) -> Vector2<f64> {
        Vector2::new(self.v, self.omega)
    }
}

impl From<Vector2<f64>> for ControlInput {
    fn from(v: Vector2<f64>) -> Self {
        Self { v: v[0], omega: v[1] }
    }
}

/// Wrap an angle into [-pi, pi].
pub fn normalize_angle(mut angle: f64) -> f64 {
    while angle > PI {
        angle -= 2.0 * PI;
    }
    while angle < -PI {
        angle += 2.0 * PI;
    }
    angle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point2d_distance() {
        let p1 = Point2D::new(0.0, 0.0);
        let p2 = Point2D::new(3.0, 4.0);
        assert!((p1.distance(&p2) - 5.0).abs() < 1e-10);
    }

    #[test]
    fn test_pose2d_normalize_yaw() {
        let mut pose = Pose2D::new(0.0, 0.0, 4.0);
        pose.normalize_yaw();
        assert!(pose.yaw >= -PI && pose.yaw <= PI);
        assert!((pose.yaw - (4.0 - 2.0 * PI)).abs() < 1e-12);
    }

    #[test]
    fn test_transform_point_rotates_into_world() {
        let pose = Pose2D::new(1.0, 2.0, PI / 2.0);
        let p = pose.transform_point(Vector2::new(1.0, 0.0));
        assert!((p.x - 1.0).abs() < 1e-9);
        assert!((p.y - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_stamped_pose_age() {
        let pose = StampedPose::new(Pose2D::origin(), 1.5);
        assert!((pose.age(2.0) - 0.5).abs() < 1e-12);
    }
}
