//! Reasoning / code-generation service contract.
//!
//! Every operation returns its data plus an optional [`ThoughtSignature`]
//! that the caller threads into the next call of the same run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::OpsResult;
use crate::model::{
    ActionKind, Evidence, Evolution, EvolutionAnalysis, Incident, ProposedChange, RemediationAction, ServiceType,
    Severity, SourceFile, StorageMode, TimelineEntry,
};
use crate::services::build::BuildError;

/// Opaque continuity token. Never parsed or validated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThoughtSignature(String);

impl ThoughtSignature {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// For transport back to the service only.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct Reasoned<T> {
    pub data: T,
    pub signature: Option<ThoughtSignature>,
}

impl<T> Reasoned<T> {
    pub fn new(data: T) -> Self {
        Self { data, signature: None }
    }

    pub fn with_signature(mut self, signature: Option<ThoughtSignature>) -> Self {
        self.signature = signature;
        self
    }

    /// Split into data and signature, keeping `current` when no new one came back.
    pub fn thread(self, current: &mut Option<ThoughtSignature>) -> T {
        if self.signature.is_some() {
            *current = self.signature;
        }
        self.data
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequirementBrief {
    pub requirement: String,
    pub app_name: String,
    pub service_type: ServiceType,
    pub storage_mode: StorageMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeFix {
    /// The service's own claim of whether it changed anything.
    pub changed: bool,
    pub content: String,
    pub explanation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionFrame {
    pub app_name: String,
    pub namespace: String,
    pub url: String,
    /// PNG, base64 encoded.
    pub image_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionFinding {
    pub anomaly_type: String,
    pub severity: Severity,
    pub confidence: f64,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypothesisDraft {
    pub title: String,
    pub description: String,
    pub confidence: f64,
    #[serde(default)]
    pub supporting_evidence: Vec<String>,
    #[serde(default)]
    pub contradicting_evidence: Vec<String>,
    #[serde(default)]
    pub suggested_action: Option<ActionKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostmortemDraft {
    pub summary: String,
    pub root_cause: String,
    #[serde(default)]
    pub lessons: Vec<String>,
}

#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn analyze_requirement(
        &self,
        brief: &RequirementBrief,
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Value>>;

    async fn design_architecture(
        &self,
        analyzed: &Value,
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Value>>;

    async fn generate_code(
        &self,
        architecture: &Value,
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Vec<SourceFile>>>;

    async fn fix_code(
        &self,
        file: &SourceFile,
        errors: &[BuildError],
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<CodeFix>>;

    async fn generate_tests(
        &self,
        files: &[SourceFile],
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Vec<SourceFile>>>;

    async fn analyze_frame(&self, frame: &VisionFrame) -> OpsResult<Reasoned<Vec<VisionFinding>>>;

    async fn generate_hypotheses(
        &self,
        incident: &Incident,
        evidence: &[Evidence],
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Vec<HypothesisDraft>>>;

    async fn generate_postmortem(
        &self,
        incident: &Incident,
        timeline: &[TimelineEntry],
        actions: &[RemediationAction],
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<PostmortemDraft>>;

    async fn analyze_evolution(
        &self,
        evolution: &Evolution,
        files: &[SourceFile],
    ) -> OpsResult<Reasoned<EvolutionAnalysis>>;

    async fn generate_evolution_changes(
        &self,
        evolution: &Evolution,
        files: &[SourceFile],
    ) -> OpsResult<Reasoned<Vec<ProposedChange>>>;
}
