// Mission Planning module: navigation state machine and per-tick orchestration

pub mod state_machine;
pub mod navigator;

pub use state_machine::*;
pub use navigator::*;
