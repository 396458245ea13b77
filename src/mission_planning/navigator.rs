//! Per-tick orchestration: fuse sensing, track obstacles, step the state machine.

use std::thread;

use tracing::{debug, error};

use crate::common::NavResult;
use crate::config::NavConfig;
use crate::mapping::Costmap;
use crate::mission_planning::state_machine::{
    MotionCommand, NavContext, NavStatus, NavigationStateMachine, StepInput,
};
use crate::perception::{ObstacleTracker, SensorSnapshot, TrackSnapshot};

/// Result of one control tick.
#[derive(Debug, Clone)]
pub struct TickOutput {
    pub command: MotionCommand,
    pub status: NavStatus,
    pub tracks: TrackSnapshot,
}

/// Owns the costmap, the tracker and the state machine.
pub struct Navigator {
    costmap: Costmap,
    tracker: ObstacleTracker,
    machine: NavigationStateMachine,
    parallel_update: bool,
}

impl Navigator {
    pub fn new(config: &NavConfig) -> NavResult<Self> {
        config.validate()?;
        Ok(Self {
            costmap: Costmap::new(config.costmap.clone())?,
            tracker: ObstacleTracker::new(config.tracker.clone())?,
            machine: NavigationStateMachine::new(
                config.machine.clone(),
                config.planner.clone(),
                config.controller.clone(),
            )?,
            parallel_update: config.parallel_update,
        })
    }

    pub fn costmap(&self) -> &Costmap {
        &self.costmap
    }

    pub fn machine(&self) -> &NavigationStateMachine {
        &self.machine
    }

    /// One control tick. Always yields exactly one command.
    pub fn tick(&mut self, ctx: &mut NavContext, snapshot: &SensorSnapshot) -> TickOutput {
        let now = snapshot.now;
        let detections = snapshot.detections.as_ref().map(|f| f.detections.as_slice());
        let footprints = snapshot.footprints();
        let fuse = |costmap: &mut Costmap| {
            costmap.fuse(
                snapshot.free_space.as_ref(),
                footprints.as_deref(),
                snapshot.ranges.as_ref(),
                snapshot.pose.as_ref(),
                now,
            )
        };

        let tracks = if self.parallel_update {
            let tracker = &mut self.tracker;
            let costmap = &mut self.costmap;
            thread::scope(|scope| {
                let tracking = scope.spawn(move || tracker.update(detections, now));
                fuse(costmap);
                tracking.join().unwrap_or_else(|_| {
                    error!("obstacle tracking failed at t={:.2}, planning without tracks", now);
                    TrackSnapshot::empty(now)
                })
            })
        } else {
            fuse(&mut self.costmap);
            self.tracker.update(detections, now)
        };

        let health = self.costmap.health();
        let input = StepInput {
            costmap: &self.costmap,
            obstacles: &tracks,
            pose: snapshot.pose.as_ref(),
            health,
            stop_requested: snapshot.stop_requested,
            now,
        };
        let command = self.machine.step(ctx, &input);
        let status = ctx.status(health);
        debug!(
            "tick {} state={} s={:.2} tracks={} command={:?}",
            status.tick,
            status.state,
            status.current_s,
            tracks.len(),
            command
        );
        TickOutput {
            command,
            status,
            tracks,
        }
    }
}
