//! Message passing from asynchronous perception producers into one
//! consistent snapshot per control tick.

use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::common::{NavError, NavResult, StampedPose, Timestamp};
use crate::perception::inputs::{DetectionFrame, FreeSpaceMask, ObstacleFootprint, RangeScan};

/// Snapshot buffer configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct InputsConfig {
    /// Bounded channel size; producers drop messages when it is full
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Inputs older than this (seconds) are discarded at drain time
    #[serde(default = "default_max_input_age")]
    pub max_input_age: f64,
}

fn default_channel_capacity() -> usize {
    64
}
fn default_max_input_age() -> f64 {
    0.5
}

impl Default for InputsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            max_input_age: default_max_input_age(),
        }
    }
}

impl InputsConfig {
    pub fn validate(&self) -> NavResult<()> {
        if self.channel_capacity == 0 {
            return Err(NavError::Config("channel_capacity must be positive".to_string()));
        }
        if !(self.max_input_age > 0.0) {
            return Err(NavError::Config("max_input_age must be positive".to_string()));
        }
        Ok(())
    }
}

/// A single message from a perception producer or the operator.
#[derive(Debug, Clone)]
pub enum InputMessage {
    FreeSpace(FreeSpaceMask),
    Detections(DetectionFrame),
    Ranges(RangeScan),
    Pose(StampedPose),
    Stop,
}

impl InputMessage {
    fn stamp(&self) -> Option<Timestamp> {
        match self {
            InputMessage::FreeSpace(m) => Some(m.stamp),
            InputMessage::Detections(d) => Some(d.stamp),
            InputMessage::Ranges(r) => Some(r.stamp),
            InputMessage::Pose(p) => Some(p.stamp),
            InputMessage::Stop => None,
        }
    }
}

/// Producer handle. Sending never blocks.
#[derive(Clone)]
pub struct InputSender {
    tx: SyncSender<InputMessage>,
}

impl InputSender {
    /// Returns false when the message was dropped.
    pub fn send(&self, msg: InputMessage) -> bool {
        match self.tx.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(msg)) => {
                debug!("input queue full, dropping message stamped {:?}", msg.stamp());
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Everything the core sees in one tick.
#[derive(Debug, Clone, Default)]
pub struct SensorSnapshot {
    pub now: Timestamp,
    pub pose: Option<StampedPose>,
    pub free_space: Option<FreeSpaceMask>,
    pub detections: Option<DetectionFrame>,
    pub ranges: Option<RangeScan>,
    pub stop_requested: bool,
}

impl SensorSnapshot {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now,
            ..Self::default()
        }
    }

    pub fn with_pose(mut self, pose: StampedPose) -> Self {
        self.pose = Some(pose);
        self
    }

    pub fn with_free_space(mut self, mask: FreeSpaceMask) -> Self {
        self.free_space = Some(mask);
        self
    }

    pub fn with_detections(mut self, frame: DetectionFrame) -> Self {
        self.detections = Some(frame);
        self
    }

    pub fn with_ranges(mut self, scan: RangeScan) -> Self {
        self.ranges = Some(scan);
        self
    }

    /// Detection footprints to stamp into the costmap.
    pub fn footprints(&self) -> Option<Vec<ObstacleFootprint>> {
        self.detections
            .as_ref()
            .map(|f| f.detections.iter().map(ObstacleFootprint::from).collect())
    }
}

/// Consumer side: collapses queued messages into one snapshot per tick.
pub struct SnapshotBuffer {
    rx: Receiver<InputMessage>,
    config: InputsConfig,
    latest_pose: Option<StampedPose>,
}

impl SnapshotBuffer {
    pub fn new(config: InputsConfig) -> NavResult<(InputSender, SnapshotBuffer)> {
        config.validate()?;
        let (tx, rx) = mpsc::sync_channel(config.channel_capacity);
        Ok((
            InputSender { tx },
            SnapshotBuffer {
                rx,
                config,
                latest_pose: None,
            },
        ))
    }

    /// Take everything queued so far without blocking.
    ///
    /// The newest message of each kind wins; anything older than
    /// `max_input_age` is discarded. The last pose is kept across ticks so
    /// that its age can be judged downstream.
    pub fn drain(&mut self, now: Timestamp) -> SensorSnapshot {
        let mut snapshot = SensorSnapshot::new(now);
        loop {
            let msg = match self.rx.try_recv() {
                Ok(msg) => msg,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            };
            if let Some(stamp) = msg.stamp() {
                if now - stamp > self.config.max_input_age {
                    debug!("discarding input stamped {:.3} at {:.3}", stamp, now);
                    continue;
                }
            }
            match msg {
                InputMessage::FreeSpace(m) => keep_newest(&mut snapshot.free_space, m, |m| m.stamp),
                InputMessage::Detections(d) => {
                    let before = d.detections.len();
                    let d = d.sanitized();
                    if d.detections.len() < before {
                        warn!("dropped {} malformed detections", before - d.detections.len());
                    }
                    keep_newest(&mut snapshot.detections, d, |d| d.stamp)
                }
                InputMessage::Ranges(r) => keep_newest(&mut snapshot.ranges, r, |r| r.stamp),
                InputMessage::Pose(p) => {
                    if p.pose.is_finite() {
                        keep_newest(&mut self.latest_pose, p, |p| p.stamp)
                    } else {
                        warn!("dropping non-finite pose stamped {:.3}", p.stamp);
                    }
                }
                InputMessage::Stop => snapshot.stop_requested = true,
            }
        }
        snapshot.pose = self.latest_pose;
        snapshot
    }
}

fn keep_newest<T>(slot: &mut Option<T>, candidate: T, stamp: impl Fn(&T) -> Timestamp) {
    let newer = slot.as_ref().map_or(true, |cur| stamp(&candidate) >= stamp(cur));
    if newer {
        *slot = Some(candidate);
    }
}
