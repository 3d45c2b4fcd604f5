//! Restart recovery: find runs a previous process left mid-flight and hand
//! them back to whoever can resume them. Runs an operator cancelled stay put.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::OpsResult;
use crate::model::{DevelopmentCycle, Incident};
use crate::services::repository::{CycleRepository, IncidentRepository};

#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn resume_cycle_run(&self, cycle: DevelopmentCycle) -> OpsResult<()>;
    /// Resumed with a zero stale window: the previous owner is gone.
    async fn resume_incident_run(&self, incident: Incident) -> OpsResult<()>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub cycles: Vec<String>,
    pub incidents: Vec<String>,
    /// (id, error) for runs that could not be handed back.
    pub skipped: Vec<(String, String)>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty() && self.incidents.is_empty() && self.skipped.is_empty()
    }
}

pub struct Recovery {
    cycles: Arc<dyn CycleRepository>,
    incidents: Arc<dyn IncidentRepository>,
}

impl Recovery {
    pub fn new(cycles: Arc<dyn CycleRepository>, incidents: Arc<dyn IncidentRepository>) -> Self {
        Self { cycles, incidents }
    }

    pub async fn interrupted_cycles(&self) -> OpsResult<Vec<DevelopmentCycle>> {
        let mut cycles: Vec<DevelopmentCycle> = self
            .cycles
            .list_cycles()
            .await?
            .into_iter()
            .filter(DevelopmentCycle::is_interrupted)
            .collect();
        cycles.sort_by_key(|c| c.created_at);
        Ok(cycles)
    }

    pub async fn interrupted_incidents(&self) -> OpsResult<Vec<Incident>> {
        let mut incidents: Vec<Incident> = self
            .incidents
            .list_incidents()
            .await?
            .into_iter()
            .filter(Incident::is_interrupted)
            .collect();
        incidents.sort_by_key(|i| i.created_at);
        Ok(incidents)
    }

    pub async fn run(&self, handler: &dyn RecoveryHandler) -> OpsResult<RecoveryReport> {
        let mut report = RecoveryReport::default();

        for cycle in self.interrupted_cycles().await? {
            let id = cycle.id.clone();
            match handler.resume_cycle_run(cycle).await {
                Ok(()) => report.cycles.push(id),
                Err(e) => {
                    warn!(cycle_id = %id, error = %e, "could not resume development cycle");
                    report.skipped.push((id, e.to_string()));
                }
            }
        }

        for incident in self.interrupted_incidents().await? {
            let id = incident.id.clone();
            match handler.resume_incident_run(incident).await {
                Ok(()) => report.incidents.push(id),
                Err(e) => {
                    warn!(incident_id = %id, error = %e, "could not resume investigation");
                    report.skipped.push((id, e.to_string()));
                }
            }
        }

        if !report.is_empty() {
            info!(
                cycles = report.cycles.len(),
                incidents = report.incidents.len(),
                skipped = report.skipped.len(),
                "recovered interrupted runs"
            );
        }
        Ok(report)
    }
}
