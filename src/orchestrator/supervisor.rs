//! Supervisor
//!
//! The long-lived control plane. Owns the shared detection state, the run
//! registry and the event bus, and starts every investigation, development
//! cycle and evolution through them.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::detection::{
    DetectionOutcome, DetectionService, DetectionState, DetectionStats, EvolutionCodeFixer, HybridAnomalyDetector,
    InvestigationLauncher,
};
use crate::error::{OpsError, OpsResult};
use crate::model::{AnomalySignal, DevelopmentCycle, Evolution, EvolutionScope, Incident};
use crate::orchestrator::development::{
    CycleOutcome, CycleRedeployer, DevelopmentDeps, DevelopmentOrchestrator, DevelopmentRequest, DevelopmentSettings,
    Redeploy,
};
use crate::orchestrator::event_bus::{EventBus, Listeners, RunEvent, TracingObserver};
use crate::orchestrator::evolution::{EvolutionEngine, EvolutionSettings};
use crate::orchestrator::investigation::{
    InvestigationDeps, InvestigationOrchestrator, InvestigationOutcome, InvestigationSettings,
};
use crate::orchestrator::profile::ControlPlaneConfig;
use crate::orchestrator::recovery::{Recovery, RecoveryHandler, RecoveryReport};
use crate::orchestrator::registry::{RunKind, RunRegistry};
use crate::safety::{ActionGuard, GuardLimits};
use crate::services::build::BuildExecutor;
use crate::services::metrics::MetricsQuery;
use crate::services::platform::PlatformExecutor;
use crate::services::reasoning::ReasoningService;
use crate::services::repository::{CycleRepository, EvolutionRepository, IncidentRepository};
use crate::services::source_control::SourceControl;
use crate::services::sources::{AppCatalog, EvidenceCollector, FrameSource};
use crate::utils::CancellationToken;

/// Everything the control plane talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub incidents: Arc<dyn IncidentRepository>,
    pub cycles: Arc<dyn CycleRepository>,
    pub evolutions: Arc<dyn EvolutionRepository>,
    pub reasoning: Arc<dyn ReasoningService>,
    pub platform: Arc<dyn PlatformExecutor>,
    pub builder: Arc<dyn BuildExecutor>,
    pub metrics: Arc<dyn MetricsQuery>,
    pub catalog: Arc<dyn AppCatalog>,
    pub collectors: Vec<Arc<dyn EvidenceCollector>>,
    pub frames: Option<Arc<dyn FrameSource>>,
    pub source_control: Option<Arc<dyn SourceControl>>,
}

pub struct Supervisor {
    config: ControlPlaneConfig,
    registry: Arc<RunRegistry>,
    state: Arc<DetectionState>,
    incidents: Arc<dyn IncidentRepository>,
    cycles: Arc<dyn CycleRepository>,
    investigation: InvestigationDeps,
    investigation_settings: InvestigationSettings,
    development: DevelopmentDeps,
    development_settings: DevelopmentSettings,
    redeployer: Arc<CycleRedeployer>,
    engine: Arc<EvolutionEngine>,
    detector: Arc<HybridAnomalyDetector>,
    detection: Arc<DetectionService>,
    bus: Arc<EventBus>,
    listeners: Listeners,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(config: ControlPlaneConfig, deps: Collaborators) -> Arc<Self> {
        Self::with_registry(config, deps, RunRegistry::new())
    }

    pub fn with_registry(config: ControlPlaneConfig, deps: Collaborators, registry: RunRegistry) -> Arc<Self> {
        let registry = Arc::new(registry);
        let bus = Arc::new(EventBus::default());
        let listeners = Listeners::new().with(bus.clone()).with(Arc::new(TracingObserver));
        let state = Arc::new(DetectionState::new(config.detection.limits()));

        let inv = &config.investigation;
        let guard = Arc::new(ActionGuard::new(
            deps.platform.clone(),
            GuardLimits {
                dry_run: inv.dry_run,
                max_actions: inv.max_actions,
                cooldown: inv.action_cooldown(),
            },
        ));

        let mut engine = EvolutionEngine::new(
            deps.evolutions.clone(),
            deps.cycles.clone(),
            deps.reasoning.clone(),
            EvolutionSettings::from_config(&config.evolution),
        )
        .with_detection_state(state.clone())
        .with_listeners(listeners.clone());
        if let Some(source_control) = &deps.source_control {
            engine = engine.with_source_control(source_control.clone());
        }
        let engine = Arc::new(engine);

        let development = DevelopmentDeps {
            cycles: deps.cycles.clone(),
            reasoning: deps.reasoning.clone(),
            builder: deps.builder.clone(),
        };
        let development_settings = DevelopmentSettings::from_config(&config.development);
        let redeployer = Arc::new(CycleRedeployer::new(
            development.clone(),
            development_settings.clone(),
            registry.clone(),
            listeners.clone(),
        ));
        let fixer = EvolutionCodeFixer::new(deps.cycles.clone(), engine.clone(), state.clone())
            .with_redeploy(redeployer.clone() as Arc<dyn Redeploy>);

        let investigation = InvestigationDeps {
            incidents: deps.incidents.clone(),
            reasoning: deps.reasoning.clone(),
            guard,
            collectors: deps.collectors.clone(),
            code_fixer: Some(Arc::new(fixer)),
        };

        let mut detector = HybridAnomalyDetector::new(
            config.detection.detector_settings(),
            deps.catalog.clone(),
            deps.metrics.clone(),
            deps.reasoning.clone(),
        )
        .with_rules(config.detection.metric_rules.clone())
        .with_listeners(listeners.clone());
        if config.detection.vision_enabled {
            if let Some(frames) = &deps.frames {
                detector = detector.with_frames(frames.clone());
            }
        }

        Arc::new_cyclic(|me: &Weak<Supervisor>| {
            let launcher = Arc::new(SupervisorHandle(me.clone()));
            let detection = DetectionService::new(state.clone(), deps.incidents.clone(), launcher)
                .with_listeners(listeners.clone());
            Supervisor {
                investigation_settings: InvestigationSettings::from_config(&config.investigation),
                config,
                registry,
                state,
                incidents: deps.incidents.clone(),
                cycles: deps.cycles.clone(),
                investigation,
                development,
                development_settings,
                redeployer,
                engine,
                detector: Arc::new(detector),
                detection: Arc::new(detection),
                bus,
                listeners,
                shutdown: CancellationToken::new(),
            }
        })
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn detection_state(&self) -> &Arc<DetectionState> {
        &self.state
    }

    pub fn engine(&self) -> &Arc<EvolutionEngine> {
        &self.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.bus.subscribe()
    }

    pub async fn stats(&self) -> DetectionStats {
        self.state.stats().await
    }

    /// Feed one anomaly through deduplication into a new incident.
    pub async fn report_anomaly(&self, signal: AnomalySignal) -> OpsResult<DetectionOutcome> {
        self.detection.process(signal).await
    }

    async fn run_investigation_with(&self, incident: Incident, stale_after: Option<Duration>) -> OpsResult<InvestigationOutcome> {
        let run = self.registry.begin(RunKind::Investigation, &incident.id)?;
        let orchestrator = InvestigationOrchestrator::new(
            self.investigation.clone(),
            self.investigation_settings.clone(),
            self.registry.instance_id(),
            run.token(),
        )
        .with_listeners(self.listeners.clone());
        match stale_after {
            None => orchestrator.investigate(incident).await,
            Some(stale) => orchestrator.resume(incident, stale).await,
        }
    }

    /// Investigate a stored incident now, outside the detection loop. It takes
    /// a concurrency slot like a detected incident does and starts the app
    /// cooldown when it ends.
    #[instrument(skip(self))]
    pub async fn investigate(&self, incident_id: &str) -> OpsResult<InvestigationOutcome> {
        let incident = self
            .incidents
            .get_incident(incident_id)
            .await?
            .ok_or_else(|| OpsError::not_found("incident", incident_id))?;
        self.state.admit_investigation(&incident.id).await?;
        let app = incident.app_name.clone();
        let result = self.run_investigation_with(incident, None).await;
        self.state.complete_investigation(incident_id, app.as_deref(), None).await;
        result
    }

    pub fn cancel_investigation(&self, incident_id: &str) -> bool {
        self.registry.cancel(RunKind::Investigation, incident_id)
    }

    fn development_run(&self, token: CancellationToken) -> DevelopmentOrchestrator {
        DevelopmentOrchestrator::new(self.development.clone(), self.development_settings.clone(), token)
            .with_listeners(self.listeners.clone())
    }

    pub fn new_cycle(&self, request: DevelopmentRequest) -> DevelopmentCycle {
        request.into_cycle(&self.development_settings)
    }

    /// Run a new development cycle to completion.
    #[instrument(skip_all, fields(app = %request.app_name))]
    pub async fn develop(&self, request: DevelopmentRequest) -> OpsResult<CycleOutcome> {
        let cycle = self.new_cycle(request);
        self.run_cycle(cycle, false).await
    }

    async fn run_cycle(&self, cycle: DevelopmentCycle, resume: bool) -> OpsResult<CycleOutcome> {
        let guard = self.registry.begin(RunKind::Cycle, &cycle.id)?;
        let run = self.development_run(guard.token());
        if resume {
            run.resume(cycle).await
        } else {
            run.develop(cycle).await
        }
    }

    #[instrument(skip(self))]
    pub async fn resume_cycle(&self, cycle_id: &str) -> OpsResult<CycleOutcome> {
        let cycle = self
            .cycles
            .get_cycle(cycle_id)
            .await?
            .ok_or_else(|| OpsError::not_found("development cycle", cycle_id))?;
        self.run_cycle(cycle, true).await
    }

    pub fn cancel_cycle(&self, cycle_id: &str) -> bool {
        self.registry.cancel(RunKind::Cycle, cycle_id)
    }

    pub async fn rebuild_and_redeploy(&self, cycle_id: &str) -> OpsResult<CycleOutcome> {
        self.redeployer.redeploy(cycle_id, &self.shutdown).await
    }

    pub async fn request_evolution(
        &self,
        cycle_id: &str,
        prompt: impl Into<String> + Send,
        scope: EvolutionScope,
    ) -> OpsResult<Evolution> {
        self.engine.request_evolution(cycle_id, prompt, scope, None).await
    }

    /// Hand every run a previous process left unfinished back to a task.
    pub async fn recover(self: &Arc<Self>) -> OpsResult<RecoveryReport> {
        let recovery = Recovery::new(self.cycles.clone(), self.incidents.clone());
        recovery.run(&SupervisorHandle(Arc::downgrade(self))).await
    }

    /// Detector loops and the detection-state sweeper, stopped by [`shutdown`](Self::shutdown).
    pub fn start_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = self
            .detector
            .start(self.detection.clone(), self.shutdown.clone());
        handles.push(
            self.state
                .spawn_sweeper(self.config.detection.sweep_interval(), self.shutdown.clone()),
        );
        info!(instance = %self.registry.instance_id(), loops = handles.len(), "background loops started");
        handles
    }

    pub fn shutdown(&self) {
        info!("shutting down control plane");
        self.shutdown.interrupt();
        self.registry.cancel_all();
    }
}

/// Non-owning handle the detection service and recovery call back through.
struct SupervisorHandle(Weak<Supervisor>);

impl SupervisorHandle {
    fn get(&self) -> OpsResult<Arc<Supervisor>> {
        self.0.upgrade().ok_or(OpsError::Cancelled)
    }
}

#[async_trait]
impl InvestigationLauncher for SupervisorHandle {
    async fn run_investigation(&self, incident: Incident) -> OpsResult<InvestigationOutcome> {
        self.get()?.run_investigation_with(incident, None).await
    }
}

#[async_trait]
impl RecoveryHandler for SupervisorHandle {
    async fn resume_cycle_run(&self, cycle: DevelopmentCycle) -> OpsResult<()> {
        let supervisor = self.get()?;
        tokio::spawn(async move {
            let id = cycle.id.clone();
            match supervisor.run_cycle(cycle, true).await {
                Ok(outcome) => info!(cycle_id = %id, ?outcome, "recovered cycle finished"),
                Err(e) => warn!(cycle_id = %id, error = %e, "recovered cycle did not run"),
            }
        });
        Ok(())
    }

    async fn resume_incident_run(&self, incident: Incident) -> OpsResult<()> {
        let supervisor = self.get()?;
        supervisor.state.start_investigation(&incident.id).await;
        tokio::spawn(async move {
            let id = incident.id.clone();
            let app = incident.app_name.clone();
            match supervisor.run_investigation_with(incident, Some(Duration::ZERO)).await {
                Ok(outcome) => info!(incident_id = %id, ?outcome, "recovered investigation finished"),
                Err(e) => warn!(incident_id = %id, error = %e, "recovered investigation did not run"),
            }
            supervisor.state.complete_investigation(&id, app.as_deref(), None).await;
        });
        Ok(())
    }
}
