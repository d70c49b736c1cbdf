//! Per-session SQLite persistence: the resumable optimization log and the
//! catalogue of simulation runs.

pub mod schema;
pub mod session;

pub use session::{list_sessions, session_path, SessionInfo, SessionStore, SessionSummary};
