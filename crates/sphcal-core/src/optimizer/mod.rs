//! Bayesian optimization over parameter contracts: the surrogate seam, the
//! bundled Gaussian-process surrogate, the case-backed objective and the
//! session driver.

pub mod driver;
pub mod gp;
pub mod objective;
pub mod surrogate;

pub use driver::{
    DriverOptions, OptimizationDriver, OptimizationSession, SessionOutcome, SessionStatus,
    TerminationSignal,
};
pub use gp::{GaussianProcessSurrogate, GpSettings};
pub use objective::{window_parameters, CaseObjective, Evaluation, Objective};
pub use surrogate::Surrogate;
