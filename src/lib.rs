//! rust_local_nav - real-time local navigation for a ground robot
//!
//! This crate fuses vision and range sensing into a rolling costmap, tracks
//! obstacles, and decides each control tick whether to follow the global
//! route, deviate around a blockage, return to the route, or stop.

// Core modules
pub mod common;
pub mod config;

// Navigation components
pub mod mapping;
pub mod perception;
pub mod path_planning;
pub mod path_tracking;
pub mod mission_planning;

// Re-export common types for convenience
pub use common::{Aabb, ControlInput, Footprint, Point2D, Pose2D, StampedPose, Timestamp};
pub use common::{CostQuery, NavError, NavResult};
pub use config::NavConfig;
pub use mission_planning::{MotionCommand, NavContext, NavState, NavStateKind, NavStatus, Navigator, TickOutput};
