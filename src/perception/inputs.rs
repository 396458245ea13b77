//! Typed perception inputs consumed by the navigation core.

use std::fmt;

use crate::common::{Aabb, Footprint, NavError, NavResult, Point2D, Timestamp};

/// Obstacle category reported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObstacleClass {
    Static,
    Human,
    Robot,
    Unknown,
}

impl ObstacleClass {
    pub const ALL: [ObstacleClass; 4] = [
        ObstacleClass::Static,
        ObstacleClass::Human,
        ObstacleClass::Robot,
        ObstacleClass::Unknown,
    ];

    /// Map a detector label onto a class.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "person" | "human" => ObstacleClass::Human,
            "shelf" | "static" => ObstacleClass::Static,
            "robot" => ObstacleClass::Robot,
            _ => ObstacleClass::Unknown,
        }
    }

    /// Multiplier on the costmap safety margin. Things that move get more room.
    pub fn margin_scale(&self) -> f64 {
        match self {
            ObstacleClass::Static => 1.0,
            ObstacleClass::Human => 1.5,
            ObstacleClass::Robot => 1.25,
            ObstacleClass::Unknown => 1.25,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            ObstacleClass::Static => 0,
            ObstacleClass::Human => 1,
            ObstacleClass::Robot => 2,
            ObstacleClass::Unknown => 3,
        }
    }
}

impl fmt::Display for ObstacleClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObstacleClass::Static => "static",
            ObstacleClass::Human => "human",
            ObstacleClass::Robot => "robot",
            ObstacleClass::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// One classified detection in world coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub footprint: Footprint,
    pub class: ObstacleClass,
    pub score: f64,
}

impl Detection {
    pub fn new(footprint: Footprint, class: ObstacleClass, score: f64) -> Self {
        Self { footprint, class, score }
    }

    pub fn from_label(footprint: Footprint, label: &str, score: f64) -> Self {
        Self::new(footprint, ObstacleClass::from_label(label), score)
    }

    pub fn is_valid(&self) -> bool {
        self.footprint.is_valid() && self.score.is_finite()
    }
}

/// Detections produced from a single camera frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionFrame {
    pub stamp: Timestamp,
    pub detections: Vec<Detection>,
}

impl DetectionFrame {
    pub fn new(stamp: Timestamp, detections: Vec<Detection>) -> Self {
        Self { stamp, detections }
    }

    /// Drop detections with degenerate geometry or scores.
    pub fn sanitized(mut self) -> Self {
        self.detections.retain(Detection::is_valid);
        self
    }
}

/// Footprint to be stamped into the costmap.
#[derive(Debug, Clone, PartialEq)]
pub struct ObstacleFootprint {
    pub footprint: Footprint,
    pub class: ObstacleClass,
}

impl From<&Detection> for ObstacleFootprint {
    fn from(d: &Detection) -> Self {
        Self {
            footprint: d.footprint.clone(),
            class: d.class,
        }
    }
}

/// Probability-of-free grid projected onto the ground plane.
#[derive(Debug, Clone, PartialEq)]
pub struct FreeSpaceMask {
    pub origin: Point2D,
    pub resolution: f64,
    pub width: usize,
    pub height: usize,
    pub p_free: Vec<f32>,
    pub stamp: Timestamp,
}

impl FreeSpaceMask {
    pub fn new(
        origin: Point2D,
        resolution: f64,
        width: usize,
        height: usize,
        p_free: Vec<f32>,
        stamp: Timestamp,
    ) -> NavResult<Self> {
        if !(resolution > 0.0) || !origin.is_finite() {
            return Err(NavError::MalformedInput(format!(
                "free-space mask with resolution {} at ({}, {})",
                resolution, origin.x, origin.y
            )));
        }
        if p_free.len() != width * height {
            return Err(NavError::MalformedInput(format!(
                "free-space mask has {} cells, expected {}x{}",
                p_free.len(),
                width,
                height
            )));
        }
        if p_free.iter().any(|p| !p.is_finite()) {
            return Err(NavError::MalformedInput(
                "free-space mask contains non-finite probabilities".to_string(),
            ));
        }
        Ok(Self {
            origin,
            resolution,
            width,
            height,
            p_free,
            stamp,
        })
    }

    /// Mask with the same probability everywhere.
    pub fn uniform(
        origin: Point2D,
        resolution: f64,
        width: usize,
        height: usize,
        p_free: f32,
        stamp: Timestamp,
    ) -> NavResult<Self> {
        Self::new(origin, resolution, width, height, vec![p_free; width * height], stamp)
    }

    /// Binary segmentation output: `true` is free.
    pub fn from_bools(
        origin: Point2D,
        resolution: f64,
        width: usize,
        height: usize,
        free: &[bool],
        stamp: Timestamp,
    ) -> NavResult<Self> {
        let p_free = free.iter().map(|&f| if f { 1.0 } else { 0.0 }).collect();
        Self::new(origin, resolution, width, height, p_free, stamp)
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::new(
            self.origin,
            Point2D::new(
                self.origin.x + self.width as f64 * self.resolution,
                self.origin.y + self.height as f64 * self.resolution,
            ),
        )
    }

    /// Free probability at `p`, `None` outside the mask.
    pub fn p_free_at(&self, p: Point2D) -> Option<f64> {
        let fx = ((p.x - self.origin.x) / self.resolution).floor();
        let fy = ((p.y - self.origin.y) / self.resolution).floor();
        if fx < 0.0 || fy < 0.0 {
            return None;
        }
        let (ix, iy) = (fx as usize, fy as usize);
        if ix >= self.width || iy >= self.height {
            return None;
        }
        Some((self.p_free[iy * self.width + ix] as f64).clamp(0.0, 1.0))
    }
}

/// A single range return relative to the robot heading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeReading {
    pub angle: f64,
    pub distance: f64,
    pub max_range: f64,
}

impl RangeReading {
    pub fn new(angle: f64, distance: f64, max_range: f64) -> Self {
        Self { angle, distance, max_range }
    }

    pub fn is_valid(&self) -> bool {
        self.angle.is_finite()
            && self.distance.is_finite()
            && self.max_range.is_finite()
            && self.distance >= 0.0
            && self.max_range > 0.0
    }

    /// The beam returned before reaching its maximum range.
    pub fn is_hit(&self) -> bool {
        self.distance < self.max_range
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeScan {
    pub stamp: Timestamp,
    pub readings: Vec<RangeReading>,
}

impl RangeScan {
    pub fn new(stamp: Timestamp, readings: Vec<RangeReading>) -> Self {
        Self { stamp, readings }
    }

    pub fn valid_count(&self) -> usize {
        self.readings.iter().filter(|r| r.is_valid()).count()
    }
}
