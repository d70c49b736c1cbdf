//! Hyperparameter contracts and the ordered parameter set built from them.

pub mod contract;
pub mod contract_file;
pub mod kind;
pub mod set;

pub use contract::{ParameterContract, SecondaryKey};
pub use kind::ScalarKind;
pub use set::ParameterSet;
