// Path planning module: route model and local deviation planning

pub mod route;
pub mod deviation_planner;

pub use route::*;
pub use deviation_planner::*;
