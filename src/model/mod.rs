//! Domain Model
//!
//! Entities owned by the repositories. The orchestrators only hold
//! in-process run state on top of these.

pub mod anomaly;
pub mod cycle;
pub mod evolution;
pub mod incident;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use anomaly::{AnomalySignal, AnomalySource};
pub use cycle::{
    BuildResult, CodeSummary, CyclePhase, DeploymentInfo, DevelopmentCycle, FileKind, FileVersion,
    GeneratedFile, ServiceType, SourceFile, StorageMode, TestResults, VerificationResult, VersionReason,
};
pub use evolution::{
    ChangeKind, Evolution, EvolutionAnalysis, EvolutionScope, EvolutionStatus, ImpactLevel, ProposedChange,
};
pub use incident::{
    ActionKind, Evidence, EvidenceKind, Hypothesis, Incident, IncidentStatus, InvestigationClaim, LearnedPattern,
    OodaPhase, Postmortem, RemediationAction, Severity, TimelineEntry,
};

/// Structured context attached to whatever entity ended in a failed state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub phase: String,
    pub retries: BTreeMap<String, u32>,
    pub last_action: Option<String>,
    pub last_verification: Option<String>,
    pub error: String,
    pub at: DateTime<Utc>,
}

impl FailureContext {
    pub fn new(phase: impl ToString, error: impl ToString) -> Self {
        Self {
            phase: phase.to_string(),
            retries: BTreeMap::new(),
            last_action: None,
            last_verification: None,
            error: error.to_string(),
            at: Utc::now(),
        }
    }

    pub fn with_retries<K: ToString>(mut self, retries: impl IntoIterator<Item = (K, u32)>) -> Self {
        self.retries = retries.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        self
    }

    pub fn with_last_action(mut self, action: Option<String>) -> Self {
        self.last_action = action;
        self
    }

    pub fn with_last_verification(mut self, verification: Option<String>) -> Self {
        self.last_verification = verification;
        self
    }
}
