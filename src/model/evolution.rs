//! Code evolutions: bounded, reviewable, revertible AI-proposed change sets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::FailureContext;
use crate::error::{OpsError, OpsResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionStatus {
    Pending,
    Analyzing,
    Generating,
    Review,
    Approved,
    Applied,
    Rejected,
    Reverted,
    Failed,
}

impl EvolutionStatus {
    /// Counts toward the per-cycle pending limit.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            EvolutionStatus::Pending
                | EvolutionStatus::Analyzing
                | EvolutionStatus::Generating
                | EvolutionStatus::Review
                | EvolutionStatus::Approved
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_pending()
    }

    pub fn can_transition_to(&self, to: EvolutionStatus) -> bool {
        use EvolutionStatus::*;
        match (self, to) {
            (Pending, Analyzing) | (Pending, Rejected) | (Pending, Failed) => true,
            (Analyzing, Generating) | (Analyzing, Review) | (Analyzing, Failed) => true,
            (Generating, Review) | (Generating, Failed) => true,
            (Review, Approved) | (Review, Rejected) | (Review, Failed) => true,
            (Approved, Applied) | (Approved, Rejected) | (Approved, Failed) => true,
            // the only move out of a terminal state
            (Applied, Reverted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for EvolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvolutionStatus::Pending => "pending",
            EvolutionStatus::Analyzing => "analyzing",
            EvolutionStatus::Generating => "generating",
            EvolutionStatus::Review => "review",
            EvolutionStatus::Approved => "approved",
            EvolutionStatus::Applied => "applied",
            EvolutionStatus::Rejected => "rejected",
            EvolutionStatus::Reverted => "reverted",
            EvolutionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionScope {
    #[default]
    Fix,
    Feature,
    Refactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvolutionAnalysis {
    pub affected_files: Vec<String>,
    pub impact: ImpactLevel,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedChange {
    pub path: String,
    pub kind: ChangeKind,
    pub old_content: Option<String>,
    pub new_content: Option<String>,
}

impl ProposedChange {
    /// Create and modify changes must carry real content. A blank body is what a
    /// truncated reasoning response looks like.
    pub fn validate(&self) -> OpsResult<()> {
        if self.path.trim().is_empty() {
            return Err(OpsError::Validation("proposed change has an empty path".into()));
        }
        match self.kind {
            ChangeKind::Create | ChangeKind::Modify => {
                let blank = self
                    .new_content
                    .as_deref()
                    .map(|c| c.trim().is_empty())
                    .unwrap_or(true);
                if blank {
                    return Err(OpsError::Validation(format!(
                        "{:?} change for '{}' has no new content",
                        self.kind, self.path
                    )));
                }
                Ok(())
            }
            ChangeKind::Delete => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evolution {
    pub id: String,
    pub cycle_id: String,
    pub prompt: String,
    pub scope: EvolutionScope,
    pub status: EvolutionStatus,
    pub analysis: Option<EvolutionAnalysis>,
    pub proposed_changes: Vec<ProposedChange>,
    pub files_affected: usize,
    /// Set when the change set is too large to proceed without a human.
    pub human_review_required: bool,
    pub triggered_by_incident_id: Option<String>,
    pub app_name: Option<String>,
    pub error: Option<FailureContext>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
    pub reverted_at: Option<DateTime<Utc>>,
}

impl Evolution {
    pub fn new(cycle_id: impl Into<String>, prompt: impl Into<String>, scope: EvolutionScope) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            cycle_id: cycle_id.into(),
            prompt: prompt.into(),
            scope,
            status: EvolutionStatus::Pending,
            analysis: None,
            proposed_changes: Vec::new(),
            files_affected: 0,
            human_review_required: false,
            triggered_by_incident_id: None,
            app_name: None,
            error: None,
            created_at: now,
            updated_at: now,
            applied_at: None,
            reverted_at: None,
        }
    }

    pub fn transition(&mut self, to: EvolutionStatus) -> OpsResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(OpsError::InvalidTransition {
                entity: "evolution",
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}
