// Local navigation simulation: a shelf on the route and a person crossing it.
//
// usage: nav_sim [config.toml]

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::{error, info, warn};

use rust_local_nav::common::{Aabb, Footprint, NavResult, Point2D, Pose2D, StampedPose};
use rust_local_nav::mission_planning::{NavContext, NavStateKind, Navigator};
use rust_local_nav::path_tracking::unicycle_update;
use rust_local_nav::perception::{
    Detection, DetectionFrame, FreeSpaceMask, InputMessage, RangeReading, RangeScan, SnapshotBuffer,
};
use rust_local_nav::NavConfig;

const DT: f64 = 0.1;
const SIM_TIME: f64 = 90.0;
const MAX_RANGE: f64 = 5.0;
const FRAME_DROP: f64 = 0.05;
const MASK_HALF_SIZE: f64 = 3.0;
const MASK_RESOLUTION: f64 = 0.1;

struct World {
    shelf: Aabb,
    person_start: Point2D,
    person_velocity: (f64, f64),
}

impl World {
    fn person(&self, t: f64) -> Aabb {
        let t = (t - 10.0).clamp(0.0, 20.0);
        let c = Point2D::new(
            self.person_start.x + self.person_velocity.0 * t,
            self.person_start.y + self.person_velocity.1 * t,
        );
        Aabb::from_center(c, 0.25, 0.25)
    }

    fn obstacles(&self, t: f64) -> [(Aabb, &'static str); 2] {
        [(self.shelf, "shelf"), (self.person(t), "person")]
    }

    // Ground-truth segmentation of a square patch around the robot.
    fn free_space(&self, pose: &Pose2D, t: f64) -> NavResult<FreeSpaceMask> {
        let boxes = self.obstacles(t);
        let n = (2.0 * MASK_HALF_SIZE / MASK_RESOLUTION).round() as usize;
        let origin = Point2D::new(pose.x - MASK_HALF_SIZE, pose.y - MASK_HALF_SIZE);
        let free: Vec<bool> = (0..n * n)
            .map(|i| {
                let c = Point2D::new(
                    origin.x + ((i % n) as f64 + 0.5) * MASK_RESOLUTION,
                    origin.y + ((i / n) as f64 + 0.5) * MASK_RESOLUTION,
                );
                !boxes.iter().any(|(b, _)| b.contains(c))
            })
            .collect();
        FreeSpaceMask::from_bools(origin, MASK_RESOLUTION, n, n, &free, t)
    }

    // March each ray until it enters an obstacle.
    fn scan(&self, pose: &Pose2D, t: f64) -> RangeScan {
        let boxes = self.obstacles(t);
        let readings = (-9..=9)
            .map(|i| {
                let angle = i as f64 * 10.0_f64.to_radians();
                let heading = pose.yaw + angle;
                let mut d = 0.0;
                while d < MAX_RANGE {
                    let p = pose.position().offset(heading, d);
                    if boxes.iter().any(|(b, _)| b.contains(p)) {
                        break;
                    }
                    d += 0.05;
                }
                RangeReading::new(angle, d.min(MAX_RANGE), MAX_RANGE)
            })
            .collect();
        RangeScan::new(t, readings)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rust_local_nav=info".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let config = if args.len() > 1 {
        match NavConfig::load(Path::new(&args[1])) {
            Ok(c) => c,
            Err(e) => {
                error!("failed to load config {}: {}", args[1], e);
                std::process::exit(1);
            }
        }
    } else {
        NavConfig::default()
    };

    let mut navigator = match Navigator::new(&config) {
        Ok(n) => n,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let (sender, mut buffer) = match SnapshotBuffer::new(config.inputs.clone()) {
        Ok(pair) => pair,
        Err(e) => {
            error!("invalid input configuration: {}", e);
            std::process::exit(1);
        }
    };

    let route = [
        Point2D::new(0.0, 0.0),
        Point2D::new(10.0, 0.0),
        Point2D::new(14.0, 3.0),
        Point2D::new(20.0, 3.0),
    ];
    let mut ctx = NavContext::idle();
    if let Err(e) = ctx.assign_route(&route, 0.0) {
        error!("route rejected: {}", e);
        std::process::exit(1);
    }

    let world = World {
        shelf: Aabb::new(Point2D::new(4.0, -0.35), Point2D::new(4.7, 0.35)),
        person_start: Point2D::new(16.5, 0.0),
        person_velocity: (0.0, 0.3),
    };
    let mut rng = StdRng::seed_from_u64(42);
    let pixel_noise = Normal::new(0.0, 0.03).unwrap();

    let mut pose = Pose2D::origin();
    let mut last_state = ctx.state().kind();
    let mut t = 0.0;
    while t < SIM_TIME {
        sender.send(InputMessage::Pose(StampedPose::new(pose, t)));
        if !rng.gen_bool(FRAME_DROP) {
            match world.free_space(&pose, t) {
                Ok(mask) => {
                    sender.send(InputMessage::FreeSpace(mask));
                }
                Err(e) => warn!("skipping free-space frame: {}", e),
            }
            let detections = world
                .obstacles(t)
                .iter()
                .map(|(b, label)| {
                    let (dx, dy) = (pixel_noise.sample(&mut rng), pixel_noise.sample(&mut rng));
                    Detection::from_label(Footprint::Box(b.translate(dx, dy)), label, rng.gen_range(0.7..0.99))
                })
                .collect();
            sender.send(InputMessage::Detections(DetectionFrame::new(t, detections)));
        }
        sender.send(InputMessage::Ranges(world.scan(&pose, t)));

        let snapshot = buffer.drain(t);
        let out = navigator.tick(&mut ctx, &snapshot);
        if out.status.state != last_state {
            info!(
                "t={:.1} {} -> {} at s={:.2} pose=({:.2}, {:.2})",
                t, last_state, out.status.state, out.status.current_s, pose.x, pose.y
            );
            last_state = out.status.state;
        }
        if out.status.state == NavStateKind::Stopped {
            break;
        }
        pose = unicycle_update(&pose, out.command.control(), DT);
        t += DT;
    }

    info!("finished at t={:.1} in {}, {} detours", t, ctx.state(), ctx.detours_created());
    println!("{}", ctx.render_history());
}
