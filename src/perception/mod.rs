// Perception boundary: typed inputs, obstacle tracking, per-tick snapshots

pub mod inputs;
pub mod obstacle_tracker;
pub mod snapshot;

pub use inputs::*;
pub use obstacle_tracker::*;
pub use snapshot::*;
