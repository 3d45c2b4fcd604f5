//! Detection Module
//!
//! Anomaly detection over the monitored applications, deduplication and
//! rate limiting of what becomes an incident.

pub mod detector;
pub mod service;
pub mod state;

pub use detector::{AnomalyHandler, Comparison, DetectorSettings, HybridAnomalyDetector, MetricRule};
pub use service::{DetectionOutcome, DetectionService, EvolutionCodeFixer, InvestigationLauncher};
pub use state::{
    fingerprint, DetectionLimits, DetectionState, DetectionStats, SuppressionReason, SweepReport, TriggerDecision,
};
