// Mapping module: rolling local costmap

pub mod grid;
pub mod costmap;

pub use grid::{CostCell, CostGrid, Layer, LayerValue, Region, SourceMask};
pub use costmap::{Costmap, CostmapConfig, SensorHealth};
