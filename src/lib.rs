//! Autonomic
//!
//! A self-operating control plane for generated services:
//! - Hybrid metric and vision anomaly detection with deduplication
//! - OODA-loop incident investigation with an escalation ladder
//! - Requirement-to-deployment development cycles with self-repair
//! - Bounded, reviewable and revertible code evolutions
//! - Crash recovery from persisted run state

pub mod agent;
pub mod detection;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod safety;
pub mod services;
pub mod store;
pub mod utils;

// Re-exports for convenience
pub use error::{OpsError, OpsResult};
pub use orchestrator::{ControlPlaneConfig, Supervisor};
