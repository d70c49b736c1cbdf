//! sphcal core library: Bayesian calibration of flume simulation parameters.
//!
//! Parameter contracts map optimizer dimensions onto attributes of a case
//! definition document. Each evaluation binds a candidate into that
//! document, runs the external engine, scores its measurements against
//! recorded flume data and feeds the score back to a Gaussian-process
//! surrogate. Sessions are logged to SQLite and can be resumed.
//!
//! With the `python` feature the crate also builds as the `_sphcal_core`
//! extension module for the plotting scripts.

pub mod config;
pub mod document;
pub mod errors;
pub mod models;
pub mod optimizer;
pub mod params;
pub mod scoring;
pub mod simulation;
pub mod store;

#[cfg(feature = "python")]
mod python;
