//! Development-cycle entities: the pipeline record, the files it generates
//! and their version history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::FailureContext;
use crate::services::reasoning::ThoughtSignature;

/// Declaration order is pipeline order; `Ord` is used to assert forward progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CyclePhase {
    Idle,
    Analyzing,
    Designing,
    Coding,
    Testing,
    Building,
    Deploying,
    Verifying,
    Completed,
    Failed,
}

impl CyclePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CyclePhase::Completed | CyclePhase::Failed)
    }

    /// The phase that follows a successful run of this one.
    pub fn next(&self) -> CyclePhase {
        match self {
            CyclePhase::Idle => CyclePhase::Analyzing,
            CyclePhase::Analyzing => CyclePhase::Designing,
            CyclePhase::Designing => CyclePhase::Coding,
            CyclePhase::Coding => CyclePhase::Testing,
            CyclePhase::Testing => CyclePhase::Building,
            CyclePhase::Building => CyclePhase::Deploying,
            CyclePhase::Deploying => CyclePhase::Verifying,
            CyclePhase::Verifying => CyclePhase::Completed,
            CyclePhase::Completed => CyclePhase::Completed,
            CyclePhase::Failed => CyclePhase::Failed,
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CyclePhase::Idle => "IDLE",
            CyclePhase::Analyzing => "ANALYZING",
            CyclePhase::Designing => "DESIGNING",
            CyclePhase::Coding => "CODING",
            CyclePhase::Testing => "TESTING",
            CyclePhase::Building => "BUILDING",
            CyclePhase::Deploying => "DEPLOYING",
            CyclePhase::Verifying => "VERIFYING",
            CyclePhase::Completed => "COMPLETED",
            CyclePhase::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    #[default]
    Api,
    Worker,
    Web,
    Scheduled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Stateless,
    Ephemeral,
    Persistent,
    Database,
}

/// A path and its full content, the unit exchanged with the reasoning and
/// build collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    #[default]
    Source,
    Test,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub cycle_id: String,
    pub path: String,
    pub content: String,
    pub kind: FileKind,
    pub updated_at: DateTime<Utc>,
}

impl GeneratedFile {
    pub fn new(cycle_id: &str, file: SourceFile, kind: FileKind) -> Self {
        Self {
            cycle_id: cycle_id.to_string(),
            path: file.path,
            content: file.content,
            kind,
            updated_at: Utc::now(),
        }
    }

    pub fn as_source(&self) -> SourceFile {
        SourceFile::new(self.path.clone(), self.content.clone())
    }
}

/// Why a file version was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum VersionReason {
    Generated,
    Repair { attempt: u32 },
    /// Content immediately before an evolution touched the file.
    PreEvolution { evolution_id: String },
    Evolution { evolution_id: String },
    Revert { evolution_id: String },
}

/// `content == None` records that the file did not exist at that point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersion {
    pub id: String,
    pub cycle_id: String,
    pub path: String,
    pub version: u32,
    pub content: Option<String>,
    pub reason: VersionReason,
    pub created_at: DateTime<Utc>,
}

impl FileVersion {
    /// The repository assigns `version` on save.
    pub fn new(cycle_id: &str, path: &str, content: Option<String>, reason: VersionReason) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            cycle_id: cycle_id.to_string(),
            path: path.to_string(),
            version: 0,
            content,
            reason,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeSummary {
    pub file_count: usize,
    pub paths: Vec<String>,
    pub total_bytes: usize,
}

impl CodeSummary {
    pub fn from_files(files: &[SourceFile]) -> Self {
        Self {
            file_count: files.len(),
            paths: files.iter().map(|f| f.path.clone()).collect(),
            total_bytes: files.iter().map(|f| f.content.len()).sum(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestResults {
    pub generated: usize,
    pub passed: u32,
    pub failed: u32,
    pub output: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildResult {
    pub success: bool,
    pub image_tag: Option<String>,
    pub logs: String,
    pub repair_attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentInfo {
    pub name: String,
    pub namespace: String,
    pub image_tag: String,
    pub url: Option<String>,
    pub deployed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub healthy: bool,
    pub attempts: u32,
    pub detail: Value,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevelopmentCycle {
    pub id: String,
    pub phase: CyclePhase,
    pub service_type: ServiceType,
    pub storage_mode: StorageMode,
    pub app_name: String,
    pub namespace: String,
    pub requirement: String,
    pub analyzed_requirement: Option<Value>,
    pub architecture: Option<Value>,
    pub generated_code: Option<CodeSummary>,
    pub test_results: Option<TestResults>,
    pub build_result: Option<BuildResult>,
    pub deployment: Option<DeploymentInfo>,
    pub verification: Option<VerificationResult>,
    pub iterations: u32,
    pub max_iterations: u32,
    /// Cumulative since creation; never reset on resume.
    pub phase_retries: BTreeMap<CyclePhase, u32>,
    pub thought_signature: Option<ThoughtSignature>,
    pub error: Option<FailureContext>,
    /// Set when an operator stopped the cycle; recovery leaves it alone.
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DevelopmentCycle {
    pub fn new(requirement: impl Into<String>, app_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            phase: CyclePhase::Idle,
            service_type: ServiceType::default(),
            storage_mode: StorageMode::default(),
            app_name: app_name.into(),
            namespace: namespace.into(),
            requirement: requirement.into(),
            analyzed_requirement: None,
            architecture: None,
            generated_code: None,
            test_results: None,
            build_result: None,
            deployment: None,
            verification: None,
            iterations: 0,
            max_iterations: 3,
            phase_retries: BTreeMap::new(),
            thought_signature: None,
            error: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn retries_for(&self, phase: CyclePhase) -> u32 {
        self.phase_retries.get(&phase).copied().unwrap_or(0)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Neither finished nor stopped on purpose, so a restart should pick it up.
    pub fn is_interrupted(&self) -> bool {
        !self.phase.is_terminal() && self.cancelled_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order_is_pipeline_order() {
        let mut phase = CyclePhase::Idle;
        let mut seen = vec![phase];
        while !phase.is_terminal() {
            let next = phase.next();
            assert!(next > phase);
            phase = next;
            seen.push(phase);
        }
        assert_eq!(seen.last(), Some(&CyclePhase::Completed));
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn test_phase_retries_round_trip_as_json_map() {
        let mut cycle = DevelopmentCycle::new("todo api", "todo", "apps");
        cycle.phase_retries.insert(CyclePhase::Building, 2);
        let json = serde_json::to_value(&cycle).unwrap();
        assert_eq!(json["phase_retries"]["BUILDING"], 2);
        let back: DevelopmentCycle = serde_json::from_value(json).unwrap();
        assert_eq!(back.retries_for(CyclePhase::Building), 2);
        assert_eq!(back.retries_for(CyclePhase::Coding), 0);
    }
}
