//! External engine control: case layout, the launch/handshake runner and the
//! resource monitor that samples a run while it executes.

pub mod case;
pub mod monitor;
pub mod runner;

pub use case::{Case, Platform};
pub use runner::{RunnerOptions, SimulationRunner};
