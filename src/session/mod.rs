//! Per-sender conversational and workflow state.

mod manager;
mod model;

pub use manager::{SessionManager, spawn_sweep_task};
pub use model::{Session, SessionState};
