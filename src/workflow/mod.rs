//! Compliance pipeline: stage types, validation, the stage client seam and
//! the orchestrator that sequences them.

pub mod client;
pub mod orchestrator;
pub mod retry;
pub mod types;
pub mod validate;

pub use client::{OrchestrateClient, StageClient, StageRequest};
pub use orchestrator::Orchestrator;
pub use retry::RetryPolicy;
pub use types::{ComplianceRoadmap, Stage};
