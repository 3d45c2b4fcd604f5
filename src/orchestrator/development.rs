//! Development Orchestrator
//!
//! Drives a requirement through ANALYZING, DESIGNING, CODING, TESTING,
//! BUILDING, DEPLOYING and VERIFYING. Every phase persists what it produced, so
//! a resumed cycle only regenerates what is missing. Retry counts are stored on
//! the cycle and accumulate across resumes.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::{OpsError, OpsResult};
use crate::model::{
    BuildResult, CodeSummary, CyclePhase, DevelopmentCycle, FailureContext, FileKind, FileVersion, GeneratedFile,
    ServiceType, SourceFile, StorageMode, TestResults, VerificationResult, VersionReason,
};
use crate::orchestrator::event_bus::{Listeners, RunEvent};
use crate::orchestrator::profile::DevelopmentConfig;
use crate::orchestrator::registry::{RunKind, RunRegistry};
use crate::orchestrator::repair::SelfRepair;
use crate::services::build::{BuildExecutor, DeployRequest};
use crate::services::reasoning::{Reasoned, ReasoningService, RequirementBrief, ThoughtSignature};
use crate::services::repository::CycleRepository;
use crate::utils::{truncate_middle, CancellationToken, PhaseRetry};

#[derive(Debug, Clone)]
pub struct DevelopmentRequest {
    pub requirement: String,
    pub app_name: String,
    pub namespace: Option<String>,
    pub service_type: ServiceType,
    pub storage_mode: StorageMode,
}

impl DevelopmentRequest {
    pub fn new(requirement: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            requirement: requirement.into(),
            app_name: app_name.into(),
            namespace: None,
            service_type: ServiceType::default(),
            storage_mode: StorageMode::default(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_service_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    pub fn with_storage_mode(mut self, storage_mode: StorageMode) -> Self {
        self.storage_mode = storage_mode;
        self
    }

    pub fn into_cycle(self, settings: &DevelopmentSettings) -> DevelopmentCycle {
        let namespace = self.namespace.unwrap_or_else(|| settings.namespace.clone());
        let mut cycle = DevelopmentCycle::new(self.requirement, self.app_name, namespace);
        cycle.service_type = self.service_type;
        cycle.storage_mode = self.storage_mode;
        cycle.max_iterations = settings.repair_attempts;
        cycle
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Completed { url: Option<String> },
    Failed(FailureContext),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DevelopmentSettings {
    pub namespace: String,
    pub phase_retries: u32,
    pub phase_retry_overrides: BTreeMap<CyclePhase, u32>,
    pub retry_backoff: Duration,
    pub repair_attempts: u32,
    pub generate_tests: bool,
    pub verify_delay: Duration,
    pub verify_attempts: u32,
}

impl DevelopmentSettings {
    pub fn from_config(config: &DevelopmentConfig) -> Self {
        Self {
            namespace: config.namespace.clone(),
            phase_retries: config.phase_retries,
            phase_retry_overrides: config.phase_retry_overrides.clone(),
            retry_backoff: config.retry_backoff(),
            repair_attempts: config.repair_attempts,
            generate_tests: config.generate_tests,
            verify_delay: config.deploy_verify_delay(),
            verify_attempts: config.deploy_verify_attempts,
        }
    }

    pub fn retry_for(&self, phase: CyclePhase) -> PhaseRetry {
        let max = self.phase_retry_overrides.get(&phase).copied().unwrap_or(self.phase_retries);
        PhaseRetry::new(max, self.retry_backoff)
    }
}

impl Default for DevelopmentSettings {
    fn default() -> Self {
        Self::from_config(&DevelopmentConfig::default())
    }
}

#[derive(Clone)]
pub struct DevelopmentDeps {
    pub cycles: Arc<dyn CycleRepository>,
    pub reasoning: Arc<dyn ReasoningService>,
    pub builder: Arc<dyn BuildExecutor>,
}

fn terminal(cycle: &DevelopmentCycle, phase: CyclePhase, message: impl ToString) -> OpsError {
    OpsError::Terminal(FailureContext::new(phase, message).with_retries(
        cycle.phase_retries.iter().map(|(p, n)| (p.to_string(), *n)),
    ))
}

/// Persists the cycle with `phase`'s retry count each time it grows, so a
/// crash inside a phase does not hand the resumed run a fresh budget.
pub(crate) fn retry_recorder(
    cycles: Arc<dyn CycleRepository>,
    cycle: &DevelopmentCycle,
    phase: CyclePhase,
) -> impl FnMut(u32) -> BoxFuture<'static, OpsResult<()>> {
    let mut snapshot = cycle.clone();
    move |used| {
        snapshot.phase_retries.insert(phase, used);
        snapshot.touch();
        let (cycles, stored) = (cycles.clone(), snapshot.clone());
        Box::pin(async move { cycles.update_cycle(&stored).await })
    }
}

/// The phase a FAILED cycle failed in, read back from its failure context.
fn failed_phase(cycle: &DevelopmentCycle) -> Option<CyclePhase> {
    let ctx = cycle.error.as_ref()?;
    serde_json::from_value::<CyclePhase>(Value::String(ctx.phase.clone()))
        .ok()
        .filter(|p| !p.is_terminal() && *p != CyclePhase::Idle)
}

pub struct DevelopmentOrchestrator {
    deps: DevelopmentDeps,
    settings: DevelopmentSettings,
    listeners: Listeners,
    token: CancellationToken,
}

impl DevelopmentOrchestrator {
    pub fn new(deps: DevelopmentDeps, settings: DevelopmentSettings, token: CancellationToken) -> Self {
        Self {
            deps,
            settings,
            listeners: Listeners::new(),
            token,
        }
    }

    pub fn with_listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Persist a new cycle and run it from ANALYZING.
    #[instrument(skip_all, fields(cycle_id = %cycle.id, app = %cycle.app_name))]
    pub async fn develop(&self, cycle: DevelopmentCycle) -> OpsResult<CycleOutcome> {
        if cycle.phase != CyclePhase::Idle {
            return Err(OpsError::Validation(format!(
                "a new cycle must start at IDLE, got {}",
                cycle.phase
            )));
        }
        self.deps.cycles.create_cycle(&cycle).await?;
        info!(cycle_id = %cycle.id, requirement = %truncate_middle(&cycle.requirement, 120), "development cycle created");
        self.run_from(cycle, CyclePhase::Analyzing).await
    }

    /// Continue from the persisted phase. A FAILED cycle restarts the phase it
    /// failed in, with whatever retry budget it has left.
    #[instrument(skip_all, fields(cycle_id = %cycle.id, phase = %cycle.phase))]
    pub async fn resume(&self, cycle: DevelopmentCycle) -> OpsResult<CycleOutcome> {
        let start = match cycle.phase {
            CyclePhase::Completed => {
                return Ok(CycleOutcome::Completed {
                    url: cycle.deployment.as_ref().and_then(|d| d.url.clone()),
                })
            }
            CyclePhase::Failed => failed_phase(&cycle).unwrap_or(CyclePhase::Analyzing),
            CyclePhase::Idle => CyclePhase::Analyzing,
            phase => phase,
        };
        info!(cycle_id = %cycle.id, from = %start, "resuming development cycle");
        self.run_from(cycle, start).await
    }

    /// Build, deploy and verify an already-coded cycle again.
    #[instrument(skip(self))]
    pub async fn rebuild_and_redeploy(&self, cycle_id: &str) -> OpsResult<CycleOutcome> {
        let cycle = self
            .deps
            .cycles
            .get_cycle(cycle_id)
            .await?
            .ok_or_else(|| OpsError::not_found("development cycle", cycle_id))?;
        if self.deps.cycles.list_files(cycle_id).await?.is_empty() {
            return Err(OpsError::Validation(format!("cycle {} has no generated code to rebuild", cycle_id)));
        }
        self.run_from(cycle, CyclePhase::Building).await
    }

    async fn run_from(&self, mut cycle: DevelopmentCycle, start: CyclePhase) -> OpsResult<CycleOutcome> {
        cycle.error = None;
        cycle.cancelled_at = None;
        let deployed_before = cycle.deployment.as_ref().map(|d| d.image_tag.clone());

        match self.run_phases(&mut cycle, start).await {
            Ok(()) => {
                let url = cycle.deployment.as_ref().and_then(|d| d.url.clone());
                self.enter(&mut cycle, CyclePhase::Completed).await?;
                info!(cycle_id = %cycle.id, url = url.as_deref().unwrap_or("-"), "development cycle completed");
                self.listeners.emit(RunEvent::CycleCompleted {
                    cycle_id: cycle.id.clone(),
                    url: url.clone(),
                });
                Ok(CycleOutcome::Completed { url })
            }
            Err(OpsError::Cancelled) => {
                if !self.token.is_interrupted() {
                    cycle.cancelled_at = Some(Utc::now());
                }
                cycle.touch();
                self.deps.cycles.update_cycle(&cycle).await?;
                info!(
                    cycle_id = %cycle.id,
                    phase = %cycle.phase,
                    resumable = cycle.cancelled_at.is_none(),
                    "development cycle cancelled"
                );
                self.listeners.emit(RunEvent::CycleCancelled {
                    cycle_id: cycle.id.clone(),
                });
                Ok(CycleOutcome::Cancelled)
            }
            Err(e) => {
                let ctx = self.fail(&mut cycle, e).await?;
                self.cleanup_image(&cycle, deployed_before.as_deref()).await;
                Ok(CycleOutcome::Failed(ctx))
            }
        }
    }

    async fn enter(&self, cycle: &mut DevelopmentCycle, to: CyclePhase) -> OpsResult<()> {
        let from = cycle.phase;
        cycle.phase = to;
        cycle.touch();
        self.deps.cycles.update_cycle(cycle).await?;
        if from != to {
            debug!(cycle_id = %cycle.id, %from, %to, "cycle phase changed");
            self.listeners.emit(RunEvent::CyclePhaseChanged {
                cycle_id: cycle.id.clone(),
                from,
                to,
            });
        }
        Ok(())
    }

    async fn run_phases(&self, cycle: &mut DevelopmentCycle, start: CyclePhase) -> OpsResult<()> {
        let mut phase = start;
        while !phase.is_terminal() {
            self.token.check()?;
            self.enter(cycle, phase).await?;
            match phase {
                CyclePhase::Idle => {}
                CyclePhase::Analyzing => self.analyze(cycle).await?,
                CyclePhase::Designing => self.design(cycle).await?,
                CyclePhase::Coding => self.code(cycle).await?,
                CyclePhase::Testing => self.generate_tests(cycle).await?,
                CyclePhase::Building => self.build(cycle).await?,
                CyclePhase::Deploying => self.deploy(cycle).await?,
                CyclePhase::Verifying => self.verify(cycle).await?,
                CyclePhase::Completed | CyclePhase::Failed => {}
            }
            phase = phase.next();
        }
        Ok(())
    }

    /// One reasoning call under the phase's retry budget, threading the
    /// cycle's thought signature.
    async fn reason<T, F, Fut>(&self, cycle: &mut DevelopmentCycle, phase: CyclePhase, f: F) -> OpsResult<T>
    where
        F: Fn(Option<ThoughtSignature>) -> Fut,
        Fut: Future<Output = OpsResult<Reasoned<T>>>,
    {
        let signature = cycle.thought_signature.clone();
        let label = phase.to_string();
        let mut used = cycle.retries_for(phase);
        let record = retry_recorder(self.deps.cycles.clone(), cycle, phase);
        let result = self
            .settings
            .retry_for(phase)
            .run_recorded(&label, &mut used, &self.token, || f(signature.clone()), record)
            .await;
        cycle.phase_retries.insert(phase, used);
        Ok(result?.thread(&mut cycle.thought_signature))
    }

    async fn analyze(&self, cycle: &mut DevelopmentCycle) -> OpsResult<()> {
        if cycle.analyzed_requirement.is_some() {
            return Ok(());
        }
        let brief = RequirementBrief {
            requirement: cycle.requirement.clone(),
            app_name: cycle.app_name.clone(),
            service_type: cycle.service_type,
            storage_mode: cycle.storage_mode,
        };
        let reasoning = &self.deps.reasoning;
        let analyzed = self
            .reason(cycle, CyclePhase::Analyzing, |sig| {
                let brief = &brief;
                async move { reasoning.analyze_requirement(brief, sig.as_ref()).await }
            })
            .await?;
        cycle.analyzed_requirement = Some(analyzed);
        Ok(())
    }

    async fn design(&self, cycle: &mut DevelopmentCycle) -> OpsResult<()> {
        if cycle.architecture.is_some() {
            return Ok(());
        }
        let analyzed = cycle.analyzed_requirement.clone().unwrap_or(Value::Null);
        let reasoning = &self.deps.reasoning;
        let architecture = self
            .reason(cycle, CyclePhase::Designing, |sig| {
                let analyzed = &analyzed;
                async move { reasoning.design_architecture(analyzed, sig.as_ref()).await }
            })
            .await?;
        cycle.architecture = Some(architecture);
        Ok(())
    }

    async fn store_files(&self, cycle: &DevelopmentCycle, files: &[SourceFile], kind: FileKind) -> OpsResult<()> {
        for file in files {
            if file.path.trim().is_empty() || file.path.contains("..") {
                return Err(OpsError::Validation(format!("generated file has an invalid path '{}'", file.path)));
            }
        }
        for file in files {
            self.deps
                .cycles
                .save_file(&GeneratedFile::new(&cycle.id, file.clone(), kind))
                .await?;
            self.deps
                .cycles
                .save_file_version(FileVersion::new(
                    &cycle.id,
                    &file.path,
                    Some(file.content.clone()),
                    VersionReason::Generated,
                ))
                .await?;
        }
        Ok(())
    }

    async fn code(&self, cycle: &mut DevelopmentCycle) -> OpsResult<()> {
        let existing: Vec<SourceFile> = self
            .deps
            .cycles
            .list_files(&cycle.id)
            .await?
            .iter()
            .filter(|f| f.kind == FileKind::Source)
            .map(GeneratedFile::as_source)
            .collect();
        if !existing.is_empty() {
            debug!(cycle_id = %cycle.id, files = existing.len(), "code already generated");
            if cycle.generated_code.is_none() {
                cycle.generated_code = Some(CodeSummary::from_files(&existing));
            }
            return Ok(());
        }

        let architecture = cycle.architecture.clone().unwrap_or(Value::Null);
        let reasoning = &self.deps.reasoning;
        let files = self
            .reason(cycle, CyclePhase::Coding, |sig| {
                let architecture = &architecture;
                async move { reasoning.generate_code(architecture, sig.as_ref()).await }
            })
            .await?;
        if files.is_empty() {
            return Err(OpsError::Validation("code generation returned no files".into()));
        }
        self.store_files(cycle, &files, FileKind::Source).await?;
        info!(cycle_id = %cycle.id, files = files.len(), "code generated");
        cycle.generated_code = Some(CodeSummary::from_files(&files));
        Ok(())
    }

    async fn generate_tests(&self, cycle: &mut DevelopmentCycle) -> OpsResult<()> {
        if !self.settings.generate_tests {
            return Ok(());
        }
        let all = self.deps.cycles.list_files(&cycle.id).await?;
        if all.iter().any(|f| f.kind == FileKind::Test) {
            return Ok(());
        }
        let sources: Vec<SourceFile> = all
            .iter()
            .filter(|f| f.kind == FileKind::Source)
            .map(GeneratedFile::as_source)
            .collect();
        let reasoning = &self.deps.reasoning;
        let tests = self
            .reason(cycle, CyclePhase::Testing, |sig| {
                let sources = &sources;
                async move { reasoning.generate_tests(sources, sig.as_ref()).await }
            })
            .await?;
        self.store_files(cycle, &tests, FileKind::Test).await?;
        cycle.test_results = Some(TestResults {
            generated: tests.len(),
            ..TestResults::default()
        });
        Ok(())
    }

    async fn build(&self, cycle: &mut DevelopmentCycle) -> OpsResult<()> {
        let repair = SelfRepair {
            cycles: self.deps.cycles.clone(),
            reasoning: self.deps.reasoning.clone(),
            builder: self.deps.builder.clone(),
            max_attempts: self.settings.repair_attempts,
            retry: self.settings.retry_for(CyclePhase::Building),
        };
        let short: String = cycle.id.chars().take(8).collect();
        let tag = format!("{}-{}", short, Utc::now().format("%Y%m%d%H%M%S"));
        let report = repair.build(cycle, &tag, &self.listeners, &self.token).await?;

        let build = report.build;
        let image_tag = build
            .image_tag
            .clone()
            .ok_or_else(|| terminal(cycle, CyclePhase::Building, "build succeeded without an image tag"))?;
        if let Some(executed) = build.test_results {
            let generated = cycle.test_results.as_ref().map(|t| t.generated).unwrap_or(0);
            cycle.test_results = Some(TestResults { generated, ..executed });
        }
        cycle.iterations = report.attempts;
        cycle.build_result = Some(BuildResult {
            success: true,
            image_tag: Some(image_tag),
            logs: truncate_middle(&build.logs, 4000),
            repair_attempts: report.attempts,
            error: None,
        });
        Ok(())
    }

    async fn deploy(&self, cycle: &mut DevelopmentCycle) -> OpsResult<()> {
        let Some(image_tag) = cycle.build_result.as_ref().and_then(|b| b.image_tag.clone()) else {
            return Err(terminal(cycle, CyclePhase::Deploying, "no built image to deploy"));
        };
        let request = DeployRequest {
            cycle_id: cycle.id.clone(),
            app_name: cycle.app_name.clone(),
            namespace: cycle.namespace.clone(),
            image_tag,
            service_type: cycle.service_type,
            storage_mode: cycle.storage_mode,
        };
        let builder = &self.deps.builder;
        let mut used = cycle.retries_for(CyclePhase::Deploying);
        let record = retry_recorder(self.deps.cycles.clone(), cycle, CyclePhase::Deploying);
        let result = self
            .settings
            .retry_for(CyclePhase::Deploying)
            .run_recorded("DEPLOYING", &mut used, &self.token, || builder.deploy(&request), record)
            .await;
        cycle.phase_retries.insert(CyclePhase::Deploying, used);
        let deployment = result?;
        info!(cycle_id = %cycle.id, image = %deployment.image_tag, "deployed");
        cycle.deployment = Some(deployment);
        Ok(())
    }

    async fn verify(&self, cycle: &mut DevelopmentCycle) -> OpsResult<()> {
        let Some(deployment) = cycle.deployment.clone() else {
            return Err(terminal(cycle, CyclePhase::Verifying, "nothing deployed to verify"));
        };
        let builder = &self.deps.builder;
        let attempts = self.settings.verify_attempts;
        let mut last_detail = Value::Null;

        for attempt in 1..=attempts {
            self.token.sleep(self.settings.verify_delay).await?;
            let mut used = cycle.retries_for(CyclePhase::Verifying);
            let record = retry_recorder(self.deps.cycles.clone(), cycle, CyclePhase::Verifying);
            let result = self
                .settings
                .retry_for(CyclePhase::Verifying)
                .run_recorded("VERIFYING", &mut used, &self.token, || builder.check_health(&deployment), record)
                .await;
            cycle.phase_retries.insert(CyclePhase::Verifying, used);
            let report = result?;
            if report.healthy {
                cycle.verification = Some(VerificationResult {
                    healthy: true,
                    attempts: attempt,
                    detail: report.detail,
                    checked_at: Utc::now(),
                });
                return Ok(());
            }
            debug!(cycle_id = %cycle.id, attempt, "deployment not healthy yet");
            last_detail = report.detail;
        }

        cycle.verification = Some(VerificationResult {
            healthy: false,
            attempts,
            detail: last_detail.clone(),
            checked_at: Utc::now(),
        });
        Err(terminal(
            cycle,
            CyclePhase::Verifying,
            format!("deployment unhealthy after {} checks: {}", attempts, last_detail),
        ))
    }

    async fn fail(&self, cycle: &mut DevelopmentCycle, error: OpsError) -> OpsResult<FailureContext> {
        let from = cycle.phase;
        let retries = cycle.phase_retries.iter().map(|(p, n)| (p.to_string(), *n));
        let mut ctx = match error {
            OpsError::Terminal(ctx) => ctx,
            other => FailureContext::new(from, other),
        };
        ctx.phase = from.to_string();
        ctx = ctx
            .with_retries(retries)
            .with_last_action(cycle.build_result.as_ref().and_then(|b| b.image_tag.clone()).map(|t| format!("built {}", t)))
            .with_last_verification(cycle.verification.as_ref().map(|v| json!(v).to_string()));

        warn!(cycle_id = %cycle.id, phase = %from, error = %ctx.error, "development cycle failed");
        cycle.error = Some(ctx.clone());
        self.enter(cycle, CyclePhase::Failed).await?;
        self.listeners.emit(RunEvent::CycleFailed {
            cycle_id: cycle.id.clone(),
            failure: ctx.clone(),
        });
        Ok(ctx)
    }

    /// Best effort removal of an image this run built but never deployed.
    async fn cleanup_image(&self, cycle: &DevelopmentCycle, deployed_before: Option<&str>) {
        let Some(tag) = cycle.build_result.as_ref().and_then(|b| b.image_tag.as_deref()) else {
            return;
        };
        let deployed_now = cycle.deployment.as_ref().map(|d| d.image_tag.as_str());
        if deployed_now == Some(tag) || deployed_before == Some(tag) {
            return;
        }
        match self.deps.builder.delete_image(tag).await {
            Ok(()) => info!(cycle_id = %cycle.id, image = tag, "removed undeployed image"),
            Err(e) => warn!(cycle_id = %cycle.id, image = tag, error = %e, "could not remove undeployed image"),
        }
    }
}

/// Rebuild-and-redeploy as a registered run of its own.
#[async_trait]
pub trait Redeploy: Send + Sync {
    async fn redeploy(&self, cycle_id: &str, token: &CancellationToken) -> OpsResult<CycleOutcome>;
}

pub struct CycleRedeployer {
    deps: DevelopmentDeps,
    settings: DevelopmentSettings,
    registry: Arc<RunRegistry>,
    listeners: Listeners,
}

impl CycleRedeployer {
    pub fn new(deps: DevelopmentDeps, settings: DevelopmentSettings, registry: Arc<RunRegistry>, listeners: Listeners) -> Self {
        Self {
            deps,
            settings,
            registry,
            listeners,
        }
    }
}

#[async_trait]
impl Redeploy for CycleRedeployer {
    async fn redeploy(&self, cycle_id: &str, token: &CancellationToken) -> OpsResult<CycleOutcome> {
        let run = self.registry.begin(RunKind::Cycle, cycle_id)?;
        // the caller's cancellation reaches this run too
        let forward = {
            let outer = token.clone();
            let inner = run.token();
            tokio::spawn(async move {
                outer.cancelled().await;
                if outer.is_interrupted() {
                    inner.interrupt();
                } else {
                    inner.cancel();
                }
            })
        };
        let orchestrator = DevelopmentOrchestrator::new(self.deps.clone(), self.settings.clone(), run.token())
            .with_listeners(self.listeners.clone());
        let result = orchestrator.rebuild_and_redeploy(cycle_id).await;
        forward.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_override_per_phase() {
        let mut settings = DevelopmentSettings {
            phase_retries: 2,
            ..DevelopmentSettings::default()
        };
        settings.phase_retry_overrides.insert(CyclePhase::Building, 5);
        assert_eq!(settings.retry_for(CyclePhase::Building).max_retries, 5);
        assert_eq!(settings.retry_for(CyclePhase::Deploying).max_retries, 2);
    }

    #[test]
    fn test_failed_phase_read_back() {
        let mut cycle = DevelopmentCycle::new("todo API", "todo-api", "apps");
        assert_eq!(failed_phase(&cycle), None);

        cycle.error = Some(FailureContext::new(CyclePhase::Deploying, "quota"));
        assert_eq!(failed_phase(&cycle), Some(CyclePhase::Deploying));

        cycle.error = Some(FailureContext::new("deploy", "not a phase"));
        assert_eq!(failed_phase(&cycle), None);
    }

    #[test]
    fn test_request_defaults_namespace_and_repair_budget() {
        let settings = DevelopmentSettings {
            repair_attempts: 4,
            ..DevelopmentSettings::default()
        };
        let cycle = DevelopmentRequest::new("todo API", "todo-api").into_cycle(&settings);
        assert_eq!(cycle.namespace, settings.namespace);
        assert_eq!(cycle.max_iterations, 4);
        assert_eq!(cycle.phase, CyclePhase::Idle);

        let cycle = DevelopmentRequest::new("todo API", "todo-api")
            .with_namespace("team-a")
            .into_cycle(&settings);
        assert_eq!(cycle.namespace, "team-a");
    }
}
