// Path tracking module: pure pursuit and detour execution

pub mod pure_pursuit;
pub mod return_controller;

pub use pure_pursuit::*;
pub use return_controller::*;
