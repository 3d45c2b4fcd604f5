//! In-process store. Used by tests and by `autonomicd --memory`.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{OpsError, OpsResult};
use crate::model::{
    DevelopmentCycle, Evidence, Evolution, FileVersion, GeneratedFile, Hypothesis, Incident, InvestigationClaim,
    LearnedPattern, Postmortem, RemediationAction, TimelineEntry,
};
use crate::services::repository::{CycleRepository, EvolutionRepository, IncidentRepository};

#[derive(Default)]
struct Tables {
    incidents: HashMap<String, Incident>,
    evidence: Vec<Evidence>,
    hypotheses: Vec<Hypothesis>,
    actions: Vec<RemediationAction>,
    timeline: Vec<TimelineEntry>,
    postmortems: HashMap<String, Postmortem>,
    patterns: HashMap<String, LearnedPattern>,
    cycles: HashMap<String, DevelopmentCycle>,
    files: HashMap<(String, String), GeneratedFile>,
    versions: Vec<FileVersion>,
    evolutions: HashMap<String, Evolution>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IncidentRepository for MemoryStore {
    async fn create_incident(&self, incident: &Incident) -> OpsResult<()> {
        self.tables
            .write()
            .await
            .incidents
            .insert(incident.id.clone(), incident.clone());
        Ok(())
    }

    /// The stored claim is kept; ownership only moves through the claim calls.
    async fn update_incident(&self, incident: &Incident) -> OpsResult<()> {
        let mut t = self.tables.write().await;
        let stored = t
            .incidents
            .get_mut(&incident.id)
            .ok_or_else(|| OpsError::not_found("incident", &incident.id))?;
        let claim = stored.claim.take();
        *stored = incident.clone();
        stored.claim = claim;
        Ok(())
    }

    async fn get_incident(&self, id: &str) -> OpsResult<Option<Incident>> {
        Ok(self.tables.read().await.incidents.get(id).cloned())
    }

    async fn list_incidents(&self) -> OpsResult<Vec<Incident>> {
        let mut all: Vec<Incident> = self.tables.read().await.incidents.values().cloned().collect();
        all.sort_by_key(|i| i.created_at);
        Ok(all)
    }

    async fn claim_investigation(&self, incident_id: &str, owner_id: &str, stale_after: Duration) -> OpsResult<bool> {
        let mut t = self.tables.write().await;
        let incident = t
            .incidents
            .get_mut(incident_id)
            .ok_or_else(|| OpsError::not_found("incident", incident_id))?;
        let now = Utc::now();
        let started_at = match &incident.claim {
            None => None,
            Some(c) if c.owner_id == owner_id => Some(c.started_at),
            Some(c) if c.is_stale(now, stale_after) => None,
            Some(_) => return Ok(false),
        };
        let mut claim = InvestigationClaim::new(owner_id);
        if let Some(started) = started_at {
            claim.started_at = started;
        }
        incident.claim = Some(claim);
        Ok(true)
    }

    async fn renew_heartbeat(&self, incident_id: &str, owner_id: &str) -> OpsResult<bool> {
        let mut t = self.tables.write().await;
        let incident = t
            .incidents
            .get_mut(incident_id)
            .ok_or_else(|| OpsError::not_found("incident", incident_id))?;
        match incident.claim.as_mut() {
            Some(c) if c.owner_id == owner_id => {
                c.heartbeat_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claim(&self, incident_id: &str, owner_id: &str) -> OpsResult<()> {
        let mut t = self.tables.write().await;
        if let Some(incident) = t.incidents.get_mut(incident_id) {
            if incident.claim.as_ref().is_some_and(|c| c.owner_id == owner_id) {
                incident.claim = None;
            }
        }
        Ok(())
    }

    async fn add_evidence(&self, evidence: &Evidence) -> OpsResult<()> {
        self.tables.write().await.evidence.push(evidence.clone());
        Ok(())
    }

    async fn list_evidence(&self, incident_id: &str) -> OpsResult<Vec<Evidence>> {
        let t = self.tables.read().await;
        Ok(t.evidence.iter().filter(|e| e.incident_id == incident_id).cloned().collect())
    }

    async fn add_hypothesis(&self, hypothesis: &Hypothesis) -> OpsResult<()> {
        self.tables.write().await.hypotheses.push(hypothesis.clone());
        Ok(())
    }

    async fn list_hypotheses(&self, incident_id: &str) -> OpsResult<Vec<Hypothesis>> {
        let t = self.tables.read().await;
        Ok(t.hypotheses.iter().filter(|h| h.incident_id == incident_id).cloned().collect())
    }

    async fn record_action(&self, action: &RemediationAction) -> OpsResult<()> {
        self.tables.write().await.actions.push(action.clone());
        Ok(())
    }

    async fn list_actions(&self, incident_id: &str) -> OpsResult<Vec<RemediationAction>> {
        let t = self.tables.read().await;
        Ok(t.actions.iter().filter(|a| a.incident_id == incident_id).cloned().collect())
    }

    async fn append_timeline(&self, entry: &TimelineEntry) -> OpsResult<()> {
        self.tables.write().await.timeline.push(entry.clone());
        Ok(())
    }

    async fn list_timeline(&self, incident_id: &str) -> OpsResult<Vec<TimelineEntry>> {
        let t = self.tables.read().await;
        Ok(t.timeline.iter().filter(|e| e.incident_id == incident_id).cloned().collect())
    }

    async fn save_postmortem(&self, postmortem: &Postmortem) -> OpsResult<()> {
        self.tables
            .write()
            .await
            .postmortems
            .insert(postmortem.incident_id.clone(), postmortem.clone());
        Ok(())
    }

    async fn get_postmortem(&self, incident_id: &str) -> OpsResult<Option<Postmortem>> {
        Ok(self.tables.read().await.postmortems.get(incident_id).cloned())
    }

    async fn upsert_pattern(&self, pattern: &LearnedPattern) -> OpsResult<()> {
        self.tables
            .write()
            .await
            .patterns
            .insert(pattern.signature.clone(), pattern.clone());
        Ok(())
    }

    async fn find_pattern(&self, signature: &str) -> OpsResult<Option<LearnedPattern>> {
        Ok(self.tables.read().await.patterns.get(signature).cloned())
    }
}

#[async_trait]
impl CycleRepository for MemoryStore {
    async fn create_cycle(&self, cycle: &DevelopmentCycle) -> OpsResult<()> {
        self.tables.write().await.cycles.insert(cycle.id.clone(), cycle.clone());
        Ok(())
    }

    async fn update_cycle(&self, cycle: &DevelopmentCycle) -> OpsResult<()> {
        let mut t = self.tables.write().await;
        match t.cycles.get_mut(&cycle.id) {
            Some(stored) => {
                *stored = cycle.clone();
                Ok(())
            }
            None => Err(OpsError::not_found("development cycle", &cycle.id)),
        }
    }

    async fn get_cycle(&self, id: &str) -> OpsResult<Option<DevelopmentCycle>> {
        Ok(self.tables.read().await.cycles.get(id).cloned())
    }

    async fn list_cycles(&self) -> OpsResult<Vec<DevelopmentCycle>> {
        let mut all: Vec<DevelopmentCycle> = self.tables.read().await.cycles.values().cloned().collect();
        all.sort_by_key(|c| c.created_at);
        Ok(all)
    }

    async fn save_file(&self, file: &GeneratedFile) -> OpsResult<()> {
        self.tables
            .write()
            .await
            .files
            .insert((file.cycle_id.clone(), file.path.clone()), file.clone());
        Ok(())
    }

    async fn get_file(&self, cycle_id: &str, path: &str) -> OpsResult<Option<GeneratedFile>> {
        let t = self.tables.read().await;
        Ok(t.files.get(&(cycle_id.to_string(), path.to_string())).cloned())
    }

    async fn list_files(&self, cycle_id: &str) -> OpsResult<Vec<GeneratedFile>> {
        let t = self.tables.read().await;
        let mut files: Vec<GeneratedFile> = t.files.values().filter(|f| f.cycle_id == cycle_id).cloned().collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn delete_file(&self, cycle_id: &str, path: &str) -> OpsResult<()> {
        self.tables
            .write()
            .await
            .files
            .remove(&(cycle_id.to_string(), path.to_string()));
        Ok(())
    }

    async fn save_file_version(&self, mut version: FileVersion) -> OpsResult<FileVersion> {
        let mut t = self.tables.write().await;
        let latest = t
            .versions
            .iter()
            .filter(|v| v.cycle_id == version.cycle_id && v.path == version.path)
            .map(|v| v.version)
            .max()
            .unwrap_or(0);
        version.version = latest + 1;
        t.versions.push(version.clone());
        Ok(version)
    }

    async fn list_file_versions(&self, cycle_id: &str, path: &str) -> OpsResult<Vec<FileVersion>> {
        let t = self.tables.read().await;
        let mut versions: Vec<FileVersion> = t
            .versions
            .iter()
            .filter(|v| v.cycle_id == cycle_id && v.path == path)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }
}

#[async_trait]
impl EvolutionRepository for MemoryStore {
    async fn create_evolution(&self, evolution: &Evolution) -> OpsResult<()> {
        self.tables
            .write()
            .await
            .evolutions
            .insert(evolution.id.clone(), evolution.clone());
        Ok(())
    }

    async fn update_evolution(&self, evolution: &Evolution) -> OpsResult<()> {
        let mut t = self.tables.write().await;
        match t.evolutions.get_mut(&evolution.id) {
            Some(stored) => {
                *stored = evolution.clone();
                Ok(())
            }
            None => Err(OpsError::not_found("evolution", &evolution.id)),
        }
    }

    async fn get_evolution(&self, id: &str) -> OpsResult<Option<Evolution>> {
        Ok(self.tables.read().await.evolutions.get(id).cloned())
    }

    async fn list_evolutions(&self, cycle_id: &str) -> OpsResult<Vec<Evolution>> {
        let t = self.tables.read().await;
        let mut all: Vec<Evolution> = t.evolutions.values().filter(|e| e.cycle_id == cycle_id).cloned().collect();
        all.sort_by_key(|e| e.created_at);
        Ok(all)
    }
}
