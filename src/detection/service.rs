//! Detection Service
//!
//! Turns admitted anomaly signals into incidents and investigations, and
//! bridges the code-fix rung to the evolution engine while keeping the
//! pending-evolution cooldown in step.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::detection::detector::AnomalyHandler;
use crate::detection::state::{DetectionState, SuppressionReason, TriggerDecision};
use crate::error::{OpsError, OpsResult};
use crate::model::{
    CyclePhase, DevelopmentCycle, EvolutionScope, Hypothesis, Incident, OodaPhase, TimelineEntry, AnomalySignal,
};
use crate::orchestrator::development::{CycleOutcome, Redeploy};
use crate::orchestrator::event_bus::{Listeners, RunEvent};
use crate::orchestrator::evolution::{EvolutionEngine, FullCycleResult};
use crate::orchestrator::investigation::{CodeFixer, InvestigationOutcome};
use crate::services::platform::ActionOutcome;
use crate::services::repository::{CycleRepository, IncidentRepository};
use crate::utils::CancellationToken;

/// Runs an investigation to completion.
#[async_trait]
pub trait InvestigationLauncher: Send + Sync {
    async fn run_investigation(&self, incident: Incident) -> OpsResult<InvestigationOutcome>;
}

#[derive(Debug)]
pub enum DetectionOutcome {
    Created { incident_id: String, run: JoinHandle<()> },
    Suppressed(SuppressionReason),
}

pub struct DetectionService {
    state: Arc<DetectionState>,
    incidents: Arc<dyn IncidentRepository>,
    launcher: Arc<dyn InvestigationLauncher>,
    listeners: Listeners,
    /// Held from the trigger decision until the investigation is counted, so
    /// two identical signals cannot both pass.
    admission: Mutex<()>,
}

impl DetectionService {
    pub fn new(
        state: Arc<DetectionState>,
        incidents: Arc<dyn IncidentRepository>,
        launcher: Arc<dyn InvestigationLauncher>,
    ) -> Self {
        Self {
            state,
            incidents,
            launcher,
            listeners: Listeners::new(),
            admission: Mutex::new(()),
        }
    }

    pub fn with_listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn state(&self) -> &Arc<DetectionState> {
        &self.state
    }

    #[instrument(skip_all, fields(anomaly_type = %signal.anomaly_type, app = signal.app_name.as_deref().unwrap_or("-")))]
    pub async fn process(&self, signal: AnomalySignal) -> OpsResult<DetectionOutcome> {
        let app = signal.app_name.clone();
        let incident = {
            let _admission = self.admission.lock().await;
            let decision = self
                .state
                .should_trigger_incident(&signal.anomaly_type, signal.severity, &signal.description, app.as_deref())
                .await;
            if let TriggerDecision::Suppressed(reason) = decision {
                self.listeners.emit(RunEvent::AnomalySuppressed {
                    anomaly_type: signal.anomaly_type.clone(),
                    app_name: app.clone(),
                    reason: reason.to_string(),
                });
                return Ok(DetectionOutcome::Suppressed(reason));
            }

            let mut incident = Incident::new(signal.incident_title(), signal.severity, signal.namespace.clone())
                .with_description(signal.description.clone())
                .with_anomaly_type(signal.anomaly_type.clone());
            if let Some(app) = &app {
                incident = incident.with_app(app.clone());
            }
            self.incidents.create_incident(&incident).await?;
            self.state
                .record_anomaly(&signal.anomaly_type, &signal.description, app.as_deref(), &incident.id)
                .await;
            self.state.start_investigation(&incident.id).await;
            incident
        };

        let note = format!(
            "opened from {} anomaly '{}' (confidence {:.2})",
            signal.source, signal.anomaly_type, signal.confidence
        );
        if let Err(e) = self
            .incidents
            .append_timeline(&TimelineEntry::new(&incident.id, OodaPhase::Idle, note))
            .await
        {
            warn!(incident_id = %incident.id, error = %e, "could not record incident origin");
        }
        info!(incident_id = %incident.id, title = %incident.title, severity = %incident.severity, "incident created");
        self.listeners.emit(RunEvent::IncidentCreated {
            incident_id: incident.id.clone(),
            title: incident.title.clone(),
            app_name: app.clone(),
        });

        let incident_id = incident.id.clone();
        let state = self.state.clone();
        let launcher = self.launcher.clone();
        let run = tokio::spawn(async move {
            let id = incident.id.clone();
            match launcher.run_investigation(incident).await {
                Ok(outcome) => info!(incident_id = %id, ?outcome, "investigation finished"),
                Err(e) => warn!(incident_id = %id, error = %e, "investigation did not run"),
            }
            state.complete_investigation(&id, app.as_deref(), None).await;
        });
        Ok(DetectionOutcome::Created { incident_id, run })
    }
}

#[async_trait]
impl AnomalyHandler for DetectionService {
    async fn handle(&self, signal: AnomalySignal) -> OpsResult<()> {
        self.process(signal).await.map(|_| ())
    }
}

/// The code-fix rung: evolve the app's generated code, redeploy it, and roll
/// the evolution back if the redeploy fails.
pub struct EvolutionCodeFixer {
    cycles: Arc<dyn CycleRepository>,
    engine: Arc<EvolutionEngine>,
    state: Arc<DetectionState>,
    redeploy: Option<Arc<dyn Redeploy>>,
}

impl EvolutionCodeFixer {
    pub fn new(cycles: Arc<dyn CycleRepository>, engine: Arc<EvolutionEngine>, state: Arc<DetectionState>) -> Self {
        Self {
            cycles,
            engine,
            state,
            redeploy: None,
        }
    }

    pub fn with_redeploy(mut self, redeploy: Arc<dyn Redeploy>) -> Self {
        self.redeploy = Some(redeploy);
        self
    }

    /// Most recent completed cycle for the app, else the most recent one at all.
    async fn cycle_for(&self, app: &str) -> OpsResult<DevelopmentCycle> {
        let mut cycles: Vec<DevelopmentCycle> = self
            .cycles
            .list_cycles()
            .await?
            .into_iter()
            .filter(|c| c.app_name == app || c.deployment.as_ref().is_some_and(|d| d.name == app))
            .collect();
        cycles.sort_by_key(|c| (c.phase == CyclePhase::Completed, c.updated_at));
        cycles.pop().ok_or_else(|| OpsError::not_found("development cycle for app", app))
    }
}

#[async_trait]
impl CodeFixer for EvolutionCodeFixer {
    async fn fix(&self, incident: &Incident, hypothesis: &Hypothesis, token: &CancellationToken) -> OpsResult<ActionOutcome> {
        let Some(app) = incident.app_name.as_deref() else {
            return Ok(ActionOutcome::failed("incident is not tied to a generated app", false));
        };
        let cycle = self.cycle_for(app).await?;
        let prompt = format!(
            "Incident: {}\n{}\n\nMost likely cause: {} - {}\nChange the code so this no longer happens.",
            incident.title, incident.description, hypothesis.title, hypothesis.description
        );
        let evolution = self
            .engine
            .request_evolution(&cycle.id, prompt, EvolutionScope::Fix, Some(incident.id.clone()))
            .await?;
        self.state.register_pending_evolution(app, &evolution.id).await;

        match self.engine.run_full_evolution_cycle(&evolution.id, token).await? {
            FullCycleResult::Applied(evo) => {
                let Some(redeploy) = &self.redeploy else {
                    return Ok(ActionOutcome::ok(format!("evolution {} applied", evo.id), false));
                };
                match redeploy.redeploy(&cycle.id, token).await {
                    Ok(CycleOutcome::Completed { .. }) => Ok(ActionOutcome::ok(
                        format!("evolution {} applied and redeployed", evo.id),
                        false,
                    )),
                    Ok(CycleOutcome::Cancelled) => Err(OpsError::Cancelled),
                    Ok(CycleOutcome::Failed(ctx)) => {
                        self.engine.auto_revert_on_failure(&evo.id, &ctx.error).await?;
                        Ok(ActionOutcome::failed(
                            format!("redeploy failed, evolution {} reverted: {}", evo.id, ctx.error),
                            false,
                        ))
                    }
                    Err(e) => {
                        self.engine.auto_revert_on_failure(&evo.id, &e.to_string()).await?;
                        Ok(ActionOutcome::failed(
                            format!("redeploy failed, evolution {} reverted: {}", evo.id, e),
                            false,
                        ))
                    }
                }
            }
            FullCycleResult::AwaitingApproval(evo) => Ok(ActionOutcome::failed(
                format!("evolution {} is waiting for human review", evo.id),
                false,
            )),
            FullCycleResult::Failed { step, error, .. } => Ok(ActionOutcome::failed(
                format!("evolution failed at {}: {}", step, error),
                false,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::state::DetectionLimits;
    use crate::model::{AnomalySource, Severity};
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingLauncher {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl InvestigationLauncher for CountingLauncher {
        async fn run_investigation(&self, _incident: Incident) -> OpsResult<InvestigationOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(InvestigationOutcome::Resolved)
        }
    }

    fn signal() -> AnomalySignal {
        AnomalySignal::new(
            "high_error_rate",
            Severity::High,
            "Error rate 42% exceeds 5% threshold",
            AnomalySource::Metrics,
        )
        .for_app("checkout-svc", "shop")
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_starts_app_cooldown() {
        let store = Arc::new(MemoryStore::new());
        let launcher = Arc::new(CountingLauncher::default());
        let state = Arc::new(DetectionState::new(DetectionLimits::default()));
        let service = DetectionService::new(state.clone(), store.clone(), launcher.clone());

        let DetectionOutcome::Created { run, .. } = service.process(signal()).await.unwrap() else {
            panic!("first signal must open an incident");
        };
        run.await.unwrap();
        assert_eq!(launcher.runs.load(Ordering::SeqCst), 1);
        assert_eq!(state.stats().await.active_investigations, 0);

        // a different anomaly on the same app is held back by the app cooldown
        let mut other = signal();
        other.anomaly_type = "high_latency".into();
        other.description = "p95 latency 3.1s exceeds 2s".into();
        assert!(matches!(
            service.process(other.clone()).await.unwrap(),
            DetectionOutcome::Suppressed(SuppressionReason::AppCooldown)
        ));

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(matches!(
            service.process(other).await.unwrap(),
            DetectionOutcome::Created { .. }
        ));
    }
}
