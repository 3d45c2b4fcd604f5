//! Incident-side entities: the incident itself and everything an
//! investigation attaches to it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::FailureContext;

/// Ordered from least to most severe so comparisons are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" | "info" => Ok(Severity::Low),
            "medium" | "warning" => Ok(Severity::Medium),
            "high" | "error" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Active,
    Investigating,
    Mitigating,
    Resolved,
    Closed,
}

impl IncidentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::Closed)
    }
}

/// Investigation state machine position. Observe-Orient-Decide-Act plus Verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OodaPhase {
    Idle,
    Observing,
    Orienting,
    Deciding,
    Acting,
    Verifying,
    Done,
    Failed,
}

impl OodaPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OodaPhase::Done | OodaPhase::Failed)
    }
}

impl fmt::Display for OodaPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OodaPhase::Idle => "IDLE",
            OodaPhase::Observing => "OBSERVING",
            OodaPhase::Orienting => "ORIENTING",
            OodaPhase::Deciding => "DECIDING",
            OodaPhase::Acting => "ACTING",
            OodaPhase::Verifying => "VERIFYING",
            OodaPhase::Done => "DONE",
            OodaPhase::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Who currently drives the investigation and when it last proved it was alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationClaim {
    pub owner_id: String,
    pub heartbeat_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl InvestigationClaim {
    pub fn new(owner_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            owner_id: owner_id.into(),
            heartbeat_at: now,
            started_at: now,
        }
    }

    /// A zero threshold makes every claim stale, which is what whole-process
    /// restart recovery relies on.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: std::time::Duration) -> bool {
        let threshold = ChronoDuration::from_std(stale_after).unwrap_or(ChronoDuration::zero());
        now.signed_duration_since(self.heartbeat_at) >= threshold
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub namespace: String,
    pub status: IncidentStatus,
    pub ooda_phase: OodaPhase,
    /// The monitored application this incident is about, if known.
    pub app_name: Option<String>,
    /// Anomaly type that created the incident, used to look up learned patterns.
    pub anomaly_type: Option<String>,
    pub claim: Option<InvestigationClaim>,
    pub failure: Option<FailureContext>,
    /// Set when an operator stopped the investigation; recovery leaves it alone.
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn new(title: impl Into<String>, severity: Severity, namespace: impl Into<String>) -> Self {
        let now = Utc::now();
        let title = title.into();
        Self {
            id: Uuid::new_v4().to_string(),
            description: title.clone(),
            title,
            severity,
            namespace: namespace.into(),
            status: IncidentStatus::Active,
            ooda_phase: OodaPhase::Idle,
            app_name: None,
            anomaly_type: None,
            claim: None,
            failure: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        }
    }

    pub fn with_app(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_anomaly_type(mut self, anomaly_type: impl Into<String>) -> Self {
        self.anomaly_type = Some(anomaly_type.into());
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Neither closed nor stopped on purpose, so a restart should pick it up.
    pub fn is_interrupted(&self) -> bool {
        !self.status.is_terminal() && !self.ooda_phase.is_terminal() && self.cancelled_at.is_none()
    }

    /// The name remediation actions are aimed at.
    pub fn target(&self) -> String {
        self.app_name.clone().unwrap_or_else(|| self.namespace.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Metrics,
    Logs,
    Events,
    Vision,
    Platform,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub id: String,
    pub incident_id: String,
    pub kind: EvidenceKind,
    /// Name of the collector that produced it.
    pub source: String,
    pub summary: String,
    pub data: Value,
    pub collected_at: DateTime<Utc>,
}

impl Evidence {
    pub fn new(incident_id: &str, kind: EvidenceKind, source: &str, summary: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            incident_id: incident_id.to_string(),
            kind,
            source: source.to_string(),
            summary: summary.into(),
            data,
            collected_at: Utc::now(),
        }
    }
}

/// Remediation action kinds, also the rungs of the escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Restart,
    Scale,
    Rollback,
    CodeFix,
    Manual,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::Restart => "restart",
            ActionKind::Scale => "scale",
            ActionKind::Rollback => "rollback",
            ActionKind::CodeFix => "code_fix",
            ActionKind::Manual => "manual",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: String,
    pub incident_id: String,
    pub title: String,
    pub description: String,
    pub confidence: f64,
    pub supporting_evidence: Vec<String>,
    pub contradicting_evidence: Vec<String>,
    pub suggested_action: Option<ActionKind>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationAction {
    pub id: String,
    pub incident_id: String,
    pub kind: ActionKind,
    pub target: String,
    pub namespace: String,
    pub parameters: Value,
    pub dry_run: bool,
    pub success: bool,
    pub detail: Value,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub id: String,
    pub incident_id: String,
    pub phase: OodaPhase,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl TimelineEntry {
    pub fn new(incident_id: &str, phase: OodaPhase, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            incident_id: incident_id.to_string(),
            phase,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Postmortem {
    pub id: String,
    pub incident_id: String,
    pub summary: String,
    pub root_cause: String,
    pub actions_taken: Vec<String>,
    pub lessons: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A remediation that worked before for the same kind of anomaly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub id: String,
    pub signature: String,
    pub hypothesis_title: String,
    pub action: ActionKind,
    pub success_count: u32,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_severity_ordering_and_parsing() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!("HIGH".parse::<Severity>().unwrap(), Severity::High);
        assert_eq!("warning".parse::<Severity>().unwrap(), Severity::Medium);
        assert!("bogus".parse::<Severity>().is_err());
    }

    #[test]
    fn test_claim_staleness() {
        let mut claim = InvestigationClaim::new("node-a");
        let now = Utc::now();
        claim.heartbeat_at = now - ChronoDuration::seconds(30);
        assert!(!claim.is_stale(now, Duration::from_secs(60)));
        claim.heartbeat_at = now - ChronoDuration::seconds(90);
        assert!(claim.is_stale(now, Duration::from_secs(60)));
        // Restart recovery reclaims unconditionally
        claim.heartbeat_at = now;
        assert!(claim.is_stale(now, Duration::ZERO));
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&OodaPhase::Verifying).unwrap();
        assert_eq!(json, "\"VERIFYING\"");
        assert!(OodaPhase::Failed.is_terminal());
        assert!(!OodaPhase::Acting.is_terminal());
    }
}
