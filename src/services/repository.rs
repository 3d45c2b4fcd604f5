//! Persistence contracts. The core needs create/update/get/list primitives
//! and one compare-and-set for investigation ownership; nothing about the
//! storage engine.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::OpsResult;
use crate::model::{
    DevelopmentCycle, Evidence, Evolution, FileVersion, GeneratedFile, Hypothesis, Incident, LearnedPattern,
    Postmortem, RemediationAction, TimelineEntry,
};

#[async_trait]
pub trait IncidentRepository: Send + Sync {
    async fn create_incident(&self, incident: &Incident) -> OpsResult<()>;
    async fn update_incident(&self, incident: &Incident) -> OpsResult<()>;
    async fn get_incident(&self, id: &str) -> OpsResult<Option<Incident>>;
    async fn list_incidents(&self) -> OpsResult<Vec<Incident>>;

    /// Take ownership if unclaimed, already ours, or the current heartbeat is
    /// at least `stale_after` old. Returns whether `owner_id` now owns it.
    async fn claim_investigation(&self, incident_id: &str, owner_id: &str, stale_after: Duration) -> OpsResult<bool>;
    /// False when the claim was lost to another owner.
    async fn renew_heartbeat(&self, incident_id: &str, owner_id: &str) -> OpsResult<bool>;
    async fn release_claim(&self, incident_id: &str, owner_id: &str) -> OpsResult<()>;

    async fn add_evidence(&self, evidence: &Evidence) -> OpsResult<()>;
    async fn list_evidence(&self, incident_id: &str) -> OpsResult<Vec<Evidence>>;
    async fn add_hypothesis(&self, hypothesis: &Hypothesis) -> OpsResult<()>;
    async fn list_hypotheses(&self, incident_id: &str) -> OpsResult<Vec<Hypothesis>>;
    async fn record_action(&self, action: &RemediationAction) -> OpsResult<()>;
    async fn list_actions(&self, incident_id: &str) -> OpsResult<Vec<RemediationAction>>;
    async fn append_timeline(&self, entry: &TimelineEntry) -> OpsResult<()>;
    async fn list_timeline(&self, incident_id: &str) -> OpsResult<Vec<TimelineEntry>>;
    async fn save_postmortem(&self, postmortem: &Postmortem) -> OpsResult<()>;
    async fn get_postmortem(&self, incident_id: &str) -> OpsResult<Option<Postmortem>>;
    async fn upsert_pattern(&self, pattern: &LearnedPattern) -> OpsResult<()>;
    async fn find_pattern(&self, signature: &str) -> OpsResult<Option<LearnedPattern>>;
}

#[async_trait]
pub trait CycleRepository: Send + Sync {
    async fn create_cycle(&self, cycle: &DevelopmentCycle) -> OpsResult<()>;
    async fn update_cycle(&self, cycle: &DevelopmentCycle) -> OpsResult<()>;
    async fn get_cycle(&self, id: &str) -> OpsResult<Option<DevelopmentCycle>>;
    async fn list_cycles(&self) -> OpsResult<Vec<DevelopmentCycle>>;

    /// Insert or replace by (cycle, path).
    async fn save_file(&self, file: &GeneratedFile) -> OpsResult<()>;
    async fn get_file(&self, cycle_id: &str, path: &str) -> OpsResult<Option<GeneratedFile>>;
    async fn list_files(&self, cycle_id: &str) -> OpsResult<Vec<GeneratedFile>>;
    async fn delete_file(&self, cycle_id: &str, path: &str) -> OpsResult<()>;

    /// Assigns the next version number for the path and returns the stored record.
    async fn save_file_version(&self, version: FileVersion) -> OpsResult<FileVersion>;
    /// Oldest first.
    async fn list_file_versions(&self, cycle_id: &str, path: &str) -> OpsResult<Vec<FileVersion>>;
}

#[async_trait]
pub trait EvolutionRepository: Send + Sync {
    async fn create_evolution(&self, evolution: &Evolution) -> OpsResult<()>;
    async fn update_evolution(&self, evolution: &Evolution) -> OpsResult<()>;
    async fn get_evolution(&self, id: &str) -> OpsResult<Option<Evolution>>;
    async fn list_evolutions(&self, cycle_id: &str) -> OpsResult<Vec<Evolution>>;
}
