//! Short-lived obstacle tracks built from per-tick detections.
//!
//! Detections are associated to existing tracks greedily (best IoU first,
//! then nearest centroid), class beliefs are smoothed with an EWMA plus a
//! hysteresis margin, and velocities come from a finite difference over a
//! short centroid history.

use std::cmp::Reverse;
use std::collections::VecDeque;

use itertools::iproduct;
use nalgebra::Vector2;
use ordered_float::OrderedFloat;
use serde::Deserialize;
use tracing::{debug, info};

use crate::common::{Footprint, NavError, NavResult, Point2D, Timestamp};
use crate::perception::inputs::{Detection, ObstacleClass};

pub type TrackId = u64;

/// Tracker configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct TrackerConfig {
    /// Detections scoring below this are ignored
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    /// Minimum bounding-box IoU for an association candidate
    #[serde(default = "default_iou_gate")]
    pub iou_gate: f64,
    /// Maximum centroid distance for an association candidate (meters)
    #[serde(default = "default_gating_distance")]
    pub gating_distance: f64,
    /// EWMA weight of a new class observation
    #[serde(default = "default_class_alpha")]
    pub class_alpha: f64,
    /// Margin a challenger class must win by
    #[serde(default = "default_class_hysteresis")]
    pub class_hysteresis: f64,
    /// Confidence at which the class is frozen
    #[serde(default = "default_lock_in_confidence")]
    pub lock_in_confidence: f64,
    /// Centroid samples kept for velocity estimation
    #[serde(default = "default_velocity_window")]
    pub velocity_window: usize,
    /// Velocity magnitude clamp (m/s)
    #[serde(default = "default_max_speed")]
    pub max_speed: f64,
    /// Seconds without a match before a track is pruned
    #[serde(default = "default_track_timeout")]
    pub track_timeout: f64,
}

fn default_min_score() -> f64 {
    0.3
}
fn default_iou_gate() -> f64 {
    0.1
}
fn default_gating_distance() -> f64 {
    1.0
}
fn default_class_alpha() -> f64 {
    0.3
}
fn default_class_hysteresis() -> f64 {
    0.2
}
fn default_lock_in_confidence() -> f64 {
    0.9
}
fn default_velocity_window() -> usize {
    5
}
fn default_max_speed() -> f64 {
    2.5
}
fn default_track_timeout() -> f64 {
    1.0
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            iou_gate: default_iou_gate(),
            gating_distance: default_gating_distance(),
            class_alpha: default_class_alpha(),
            class_hysteresis: default_class_hysteresis(),
            lock_in_confidence: default_lock_in_confidence(),
            velocity_window: default_velocity_window(),
            max_speed: default_max_speed(),
            track_timeout: default_track_timeout(),
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> NavResult<()> {
        if !(self.class_alpha > 0.0 && self.class_alpha <= 1.0) {
            return Err(NavError::Config("class_alpha must be in (0, 1]".to_string()));
        }
        if self.velocity_window < 2 {
            return Err(NavError::Config("velocity_window needs at least two samples".to_string()));
        }
        if !(self.track_timeout > 0.0) || !(self.max_speed > 0.0) || self.gating_distance < 0.0 {
            return Err(NavError::Config(
                "track_timeout and max_speed must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Running per-class confidence with hysteresis and lock-in.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassBelief {
    scores: [f64; 4],
    current: ObstacleClass,
    locked: bool,
}

impl ClassBelief {
    pub fn new(class: ObstacleClass, score: f64, lock_in: f64) -> Self {
        let mut scores = [0.0; 4];
        scores[class.index()] = score.clamp(0.0, 1.0);
        Self {
            scores,
            current: class,
            locked: scores[class.index()] >= lock_in,
        }
    }

    pub fn class(&self) -> ObstacleClass {
        self.current
    }

    pub fn confidence(&self) -> f64 {
        self.scores[self.current.index()]
    }

    pub fn score(&self, class: ObstacleClass) -> f64 {
        self.scores[class.index()]
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Fold in one observation. Returns true when the reported class changed.
    pub fn observe(&mut self, class: ObstacleClass, score: f64, cfg: &TrackerConfig) -> bool {
        let score = score.clamp(0.0, 1.0);
        for c in ObstacleClass::ALL {
            let target = if c == class { score } else { 0.0 };
            let s = &mut self.scores[c.index()];
            *s = (1.0 - cfg.class_alpha) * *s + cfg.class_alpha * target;
        }
        if self.locked {
            return false;
        }

        let challenger = ObstacleClass::ALL
            .iter()
            .copied()
            .filter(|c| *c != self.current)
            .max_by_key(|c| OrderedFloat(self.scores[c.index()]));
        let mut changed = false;
        if let Some(challenger) = challenger {
            if self.score(challenger) > self.confidence() + cfg.class_hysteresis {
                self.current = challenger;
                changed = true;
            }
        }
        if self.confidence() >= cfg.lock_in_confidence {
            self.locked = true;
        }
        changed
    }
}

/// A tracked obstacle.
#[derive(Debug, Clone, PartialEq)]
pub struct ObstacleInstance {
    pub track_id: TrackId,
    pub class: ObstacleClass,
    pub confidence: f64,
    pub footprint: Footprint,
    pub velocity: Vector2<f64>,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub hits: u32,
    belief: ClassBelief,
    history: VecDeque<(Timestamp, Point2D)>,
}

impl ObstacleInstance {
    pub fn new(track_id: TrackId, detection: &Detection, now: Timestamp, lock_in: f64) -> Self {
        let belief = ClassBelief::new(detection.class, detection.score, lock_in);
        let mut history = VecDeque::new();
        history.push_back((now, detection.footprint.centroid()));
        Self {
            track_id,
            class: belief.class(),
            confidence: belief.confidence(),
            footprint: detection.footprint.clone(),
            velocity: Vector2::zeros(),
            first_seen: now,
            last_seen: now,
            hits: 1,
            belief,
            history,
        }
    }

    pub fn centroid(&self) -> Point2D {
        self.footprint.centroid()
    }

    pub fn belief(&self) -> &ClassBelief {
        &self.belief
    }

    pub fn speed(&self) -> f64 {
        self.velocity.norm()
    }

    /// Footprint shifted along the velocity estimate by `dt` seconds.
    pub fn predicted_footprint(&self, dt: f64) -> Footprint {
        self.footprint
            .translated(self.velocity.x * dt, self.velocity.y * dt)
    }

    fn absorb(&mut self, detection: &Detection, now: Timestamp, cfg: &TrackerConfig) {
        if self.belief.observe(detection.class, detection.score, cfg) {
            info!(
                "track {} reclassified {} -> {}",
                self.track_id,
                self.class,
                self.belief.class()
            );
        }
        self.class = self.belief.class();
        self.confidence = self.belief.confidence();
        self.footprint = detection.footprint.clone();
        self.last_seen = now;
        self.hits += 1;

        self.history.push_back((now, self.footprint.centroid()));
        while self.history.len() > cfg.velocity_window {
            self.history.pop_front();
        }
        self.velocity = estimate_velocity(&self.history, cfg.max_speed);
    }
}

fn estimate_velocity(history: &VecDeque<(Timestamp, Point2D)>, max_speed: f64) -> Vector2<f64> {
    let (Some((t0, p0)), Some((t1, p1))) = (history.front(), history.back()) else {
        return Vector2::zeros();
    };
    let dt = t1 - t0;
    if dt <= 1e-6 {
        return Vector2::zeros();
    }
    let v = (p1.to_vector() - p0.to_vector()) / dt;
    let speed = v.norm();
    if speed > max_speed {
        v * (max_speed / speed)
    } else {
        v
    }
}

/// Read-only copy of the tracks handed to the planner each tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackSnapshot {
    pub stamp: Timestamp,
    pub instances: Vec<ObstacleInstance>,
}

impl TrackSnapshot {
    pub fn empty(stamp: Timestamp) -> Self {
        Self {
            stamp,
            instances: Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObstacleInstance> {
        self.instances.iter()
    }

    pub fn get(&self, id: TrackId) -> Option<&ObstacleInstance> {
        self.instances.iter().find(|i| i.track_id == id)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Owner of all obstacle tracks.
pub struct ObstacleTracker {
    config: TrackerConfig,
    tracks: Vec<ObstacleInstance>,
    next_id: TrackId,
}

impl ObstacleTracker {
    pub fn new(config: TrackerConfig) -> NavResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            tracks: Vec::new(),
            next_id: 1,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Associate `detections`, spawn and prune tracks, and return a snapshot.
    ///
    /// `None` means no detector output arrived this tick: tracks only age.
    pub fn update(&mut self, detections: Option<&[Detection]>, now: Timestamp) -> TrackSnapshot {
        if let Some(detections) = detections {
            self.associate(detections, now);
        }

        let timeout = self.config.track_timeout;
        self.tracks.retain(|t| {
            let keep = now - t.last_seen <= timeout;
            if !keep {
                debug!("pruning track {} ({}), unseen for {:.2}s", t.track_id, t.class, now - t.last_seen);
            }
            keep
        });

        TrackSnapshot {
            stamp: now,
            instances: self.tracks.clone(),
        }
    }

    fn associate(&mut self, detections: &[Detection], now: Timestamp) {
        let detections: Vec<&Detection> = detections
            .iter()
            .filter(|d| d.is_valid() && d.score >= self.config.min_score)
            .collect();

        let mut candidates: Vec<(usize, usize, f64, f64)> = iproduct!(0..self.tracks.len(), 0..detections.len())
            .filter_map(|(ti, di)| {
                let track = &self.tracks[ti];
                let det = detections[di];
                let iou = track.footprint.bounding_box().iou(&det.footprint.bounding_box());
                let dist = track.centroid().distance(&det.footprint.centroid());
                if iou >= self.config.iou_gate || dist <= self.config.gating_distance {
                    Some((ti, di, iou, dist))
                } else {
                    None
                }
            })
            .collect();
        candidates.sort_by_key(|&(_, _, iou, dist)| (Reverse(OrderedFloat(iou)), OrderedFloat(dist)));

        let mut track_taken = vec![false; self.tracks.len()];
        let mut det_taken = vec![false; detections.len()];
        for (ti, di, _, _) in candidates {
            if track_taken[ti] || det_taken[di] {
                continue;
            }
            track_taken[ti] = true;
            det_taken[di] = true;
            self.tracks[ti].absorb(detections[di], now, &self.config);
        }

        for (det, _) in detections.iter().zip(det_taken).filter(|(_, taken)| !taken) {
            let id = self.next_id;
            self.next_id += 1;
            debug!("new track {} ({}) score {:.2}", id, det.class, det.score);
            self.tracks
                .push(ObstacleInstance::new(id, det, now, self.config.lock_in_confidence));
        }
    }
}
