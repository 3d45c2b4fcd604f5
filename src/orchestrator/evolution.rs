//! Code Evolution Engine
//!
//! Proposes, reviews, applies and reverts AI-generated change sets against a
//! cycle's stored files. Every path an evolution touches is snapshotted before
//! the first write, so a revert restores the exact prior bytes.

use chrono::Utc;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::detection::DetectionState;
use crate::error::{OpsError, OpsResult};
use crate::model::{
    ChangeKind, Evolution, EvolutionScope, EvolutionStatus, FailureContext, FileKind, FileVersion, GeneratedFile,
    ProposedChange, SourceFile, VersionReason,
};
use crate::orchestrator::event_bus::{Listeners, RunEvent};
use crate::orchestrator::profile::EvolutionConfig;
use crate::services::reasoning::ReasoningService;
use crate::services::repository::{CycleRepository, EvolutionRepository};
use crate::services::source_control::SourceControl;
use crate::utils::CancellationToken;

#[derive(Debug, Clone)]
pub struct EvolutionSettings {
    pub max_pending: usize,
    pub max_files: usize,
    pub analysis_timeout: Duration,
    pub autonomous: bool,
}

impl EvolutionSettings {
    pub fn from_config(config: &EvolutionConfig) -> Self {
        Self {
            max_pending: config.max_pending,
            max_files: config.max_files,
            analysis_timeout: config.analysis_timeout(),
            autonomous: config.autonomous,
        }
    }
}

impl Default for EvolutionSettings {
    fn default() -> Self {
        Self::from_config(&EvolutionConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    Applied { files: Vec<String> },
    AwaitingApproval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvolutionStep {
    Analyze,
    Generate,
    Apply,
}

impl fmt::Display for EvolutionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EvolutionStep::Analyze => "analyze",
            EvolutionStep::Generate => "generate",
            EvolutionStep::Apply => "apply",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone)]
pub enum FullCycleResult {
    Applied(Evolution),
    AwaitingApproval(Evolution),
    Failed {
        evolution: Evolution,
        step: EvolutionStep,
        error: String,
    },
}

enum Restored {
    Written(SourceFile),
    Deleted(String),
}

#[derive(Default)]
struct RestoreReport {
    restored: Vec<SourceFile>,
    deleted: Vec<String>,
    failed: Vec<(String, String)>,
}

pub struct EvolutionEngine {
    evolutions: Arc<dyn EvolutionRepository>,
    cycles: Arc<dyn CycleRepository>,
    reasoning: Arc<dyn ReasoningService>,
    settings: EvolutionSettings,
    detection: Option<Arc<DetectionState>>,
    source_control: Option<Arc<dyn SourceControl>>,
    listeners: Listeners,
}

impl EvolutionEngine {
    pub fn new(
        evolutions: Arc<dyn EvolutionRepository>,
        cycles: Arc<dyn CycleRepository>,
        reasoning: Arc<dyn ReasoningService>,
        settings: EvolutionSettings,
    ) -> Self {
        Self {
            evolutions,
            cycles,
            reasoning,
            settings,
            detection: None,
            source_control: None,
            listeners: Listeners::new(),
        }
    }

    /// Terminal evolutions clear the app's pending-evolution cooldown here.
    pub fn with_detection_state(mut self, state: Arc<DetectionState>) -> Self {
        self.detection = Some(state);
        self
    }

    pub fn with_source_control(mut self, source_control: Arc<dyn SourceControl>) -> Self {
        self.source_control = Some(source_control);
        self
    }

    pub fn with_listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn settings(&self) -> &EvolutionSettings {
        &self.settings
    }

    pub async fn get(&self, id: &str) -> OpsResult<Evolution> {
        self.evolutions
            .get_evolution(id)
            .await?
            .ok_or_else(|| OpsError::not_found("evolution", id))
    }

    async fn transition(&self, evolution: &mut Evolution, to: EvolutionStatus) -> OpsResult<()> {
        evolution.transition(to)?;
        self.evolutions.update_evolution(evolution).await?;
        debug!(evolution_id = %evolution.id, status = %to, "evolution status changed");
        self.listeners.emit(RunEvent::EvolutionStatusChanged {
            evolution_id: evolution.id.clone(),
            cycle_id: evolution.cycle_id.clone(),
            status: to,
        });
        if to.is_terminal() {
            self.release_cooldown(evolution).await;
        }
        Ok(())
    }

    async fn release_cooldown(&self, evolution: &Evolution) {
        let (Some(state), Some(app)) = (&self.detection, evolution.app_name.as_deref()) else {
            return;
        };
        if let Some(pending) = state.pending_evolution_id(app).await {
            debug!(evolution_id = %evolution.id, %pending, app, "releasing pending-evolution cooldown");
        }
        state.clear_pending_evolution(app).await;
    }

    /// Mark the evolution failed if it still can be, keeping the original error.
    async fn fail(&self, evolution: &mut Evolution, step: EvolutionStep, error: &OpsError) {
        warn!(evolution_id = %evolution.id, %step, error = %error, "evolution step failed");
        if !evolution.status.can_transition_to(EvolutionStatus::Failed) {
            return;
        }
        evolution.error = Some(FailureContext::new(step, error));
        if let Err(e) = self.transition(evolution, EvolutionStatus::Failed).await {
            warn!(evolution_id = %evolution.id, error = %e, "could not record evolution failure");
        }
    }

    async fn current_files(&self, cycle_id: &str) -> OpsResult<Vec<SourceFile>> {
        Ok(self
            .cycles
            .list_files(cycle_id)
            .await?
            .iter()
            .map(GeneratedFile::as_source)
            .collect())
    }

    /// Register a new evolution for a cycle. Rejected when the cycle already
    /// has `max_pending` evolutions in flight.
    #[instrument(skip(self, prompt))]
    pub async fn request_evolution(
        &self,
        cycle_id: &str,
        prompt: impl Into<String> + Send,
        scope: EvolutionScope,
        incident_id: Option<String>,
    ) -> OpsResult<Evolution> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(OpsError::Validation("evolution prompt is empty".into()));
        }
        let cycle = self
            .cycles
            .get_cycle(cycle_id)
            .await?
            .ok_or_else(|| OpsError::not_found("development cycle", cycle_id))?;

        let pending = self
            .evolutions
            .list_evolutions(cycle_id)
            .await?
            .iter()
            .filter(|e| e.status.is_pending())
            .count();
        if pending >= self.settings.max_pending {
            return Err(OpsError::ResourceLimit(format!(
                "cycle {} already has {} pending evolutions (max {})",
                cycle_id, pending, self.settings.max_pending
            )));
        }

        let mut evolution = Evolution::new(cycle_id, prompt, scope);
        evolution.app_name = Some(cycle.app_name.clone());
        evolution.triggered_by_incident_id = incident_id;
        self.evolutions.create_evolution(&evolution).await?;
        info!(evolution_id = %evolution.id, cycle_id, ?scope, "evolution requested");
        self.listeners.emit(RunEvent::EvolutionStatusChanged {
            evolution_id: evolution.id.clone(),
            cycle_id: evolution.cycle_id.clone(),
            status: evolution.status,
        });
        Ok(evolution)
    }

    /// PENDING -> ANALYZING -> GENERATING, or straight to REVIEW when the
    /// analysis already names more files than a single evolution may touch.
    #[instrument(skip(self))]
    pub async fn analyze(&self, id: &str) -> OpsResult<Evolution> {
        let mut evolution = self.get(id).await?;
        self.transition(&mut evolution, EvolutionStatus::Analyzing).await?;

        let result = async {
            let files = self.current_files(&evolution.cycle_id).await?;
            match tokio::time::timeout(
                self.settings.analysis_timeout,
                self.reasoning.analyze_evolution(&evolution, &files),
            )
            .await
            {
                Ok(reply) => Ok(reply?.data),
                Err(_) => Err(OpsError::transient(
                    "reasoning",
                    format!("evolution analysis timed out after {:?}", self.settings.analysis_timeout),
                )),
            }
        }
        .await;

        let analysis = match result {
            Ok(analysis) => analysis,
            Err(e) => {
                self.fail(&mut evolution, EvolutionStep::Analyze, &e).await;
                return Err(e);
            }
        };

        evolution.files_affected = analysis.affected_files.len();
        let oversized = evolution.files_affected > self.settings.max_files;
        evolution.analysis = Some(analysis);
        if oversized {
            evolution.human_review_required = true;
            info!(evolution_id = %evolution.id, files = evolution.files_affected, "evolution too large, needs review");
            self.transition(&mut evolution, EvolutionStatus::Review).await?;
        } else {
            self.transition(&mut evolution, EvolutionStatus::Generating).await?;
        }
        Ok(evolution)
    }

    fn check_changes(&self, evolution: &Evolution, changes: &[ProposedChange], existing: &[SourceFile]) -> OpsResult<()> {
        if changes.is_empty() {
            return Err(OpsError::Validation("no changes were proposed".into()));
        }
        let mut seen = BTreeSet::new();
        for change in changes {
            change.validate()?;
            if !seen.insert(change.path.as_str()) {
                return Err(OpsError::Validation(format!("'{}' is changed more than once", change.path)));
            }
            let exists = existing.iter().any(|f| f.path == change.path);
            match change.kind {
                ChangeKind::Modify | ChangeKind::Delete if !exists => {
                    return Err(OpsError::Validation(format!(
                        "evolution {} changes '{}' which does not exist",
                        evolution.id, change.path
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Ask for the concrete change set. Runs from GENERATING, or from APPROVED
    /// when a human approved an oversized analysis before any changes existed.
    #[instrument(skip(self))]
    pub async fn generate_changes(&self, id: &str) -> OpsResult<Evolution> {
        let mut evolution = self.get(id).await?;
        let allowed = evolution.status == EvolutionStatus::Generating
            || (evolution.status == EvolutionStatus::Approved && evolution.proposed_changes.is_empty());
        if !allowed {
            return Err(OpsError::InvalidTransition {
                entity: "evolution",
                from: evolution.status.to_string(),
                to: "generating".into(),
            });
        }

        let result = async {
            let files = self.current_files(&evolution.cycle_id).await?;
            let changes = self
                .reasoning
                .generate_evolution_changes(&evolution, &files)
                .await?
                .data;
            self.check_changes(&evolution, &changes, &files)?;
            Ok(changes)
        }
        .await;

        let changes = match result {
            Ok(changes) => changes,
            Err(e) => {
                self.fail(&mut evolution, EvolutionStep::Generate, &e).await;
                return Err(e);
            }
        };

        evolution.files_affected = changes.len();
        evolution.proposed_changes = changes;
        if evolution.status == EvolutionStatus::Generating {
            if evolution.files_affected > self.settings.max_files {
                evolution.human_review_required = true;
            }
            self.transition(&mut evolution, EvolutionStatus::Review).await?;
        } else {
            evolution.updated_at = Utc::now();
            self.evolutions.update_evolution(&evolution).await?;
        }
        Ok(evolution)
    }

    #[instrument(skip(self))]
    pub async fn approve(&self, id: &str) -> OpsResult<Evolution> {
        let mut evolution = self.get(id).await?;
        self.transition(&mut evolution, EvolutionStatus::Approved).await?;
        info!(evolution_id = %evolution.id, "evolution approved");
        Ok(evolution)
    }

    #[instrument(skip(self))]
    pub async fn reject(&self, id: &str, reason: &str) -> OpsResult<Evolution> {
        let mut evolution = self.get(id).await?;
        evolution.error = Some(FailureContext::new("review", format!("rejected: {}", reason)));
        self.transition(&mut evolution, EvolutionStatus::Rejected).await?;
        info!(evolution_id = %evolution.id, reason, "evolution rejected");
        Ok(evolution)
    }

    /// Write the change set. An unflagged evolution in REVIEW is approved
    /// automatically in autonomous mode; otherwise it waits for a human.
    #[instrument(skip(self))]
    pub async fn apply(&self, id: &str) -> OpsResult<ApplyResult> {
        let mut evolution = self.get(id).await?;
        if evolution.status == EvolutionStatus::Review {
            if !self.settings.autonomous || evolution.human_review_required {
                return Ok(ApplyResult::AwaitingApproval);
            }
            self.transition(&mut evolution, EvolutionStatus::Approved).await?;
        }
        if evolution.status != EvolutionStatus::Approved {
            return Err(OpsError::InvalidTransition {
                entity: "evolution",
                from: evolution.status.to_string(),
                to: EvolutionStatus::Applied.to_string(),
            });
        }
        if evolution.proposed_changes.is_empty() {
            return Err(OpsError::Validation(format!(
                "evolution {} has no generated changes to apply",
                evolution.id
            )));
        }

        match self.write_changes(&evolution).await {
            Ok(files) => {
                evolution.applied_at = Some(Utc::now());
                self.transition(&mut evolution, EvolutionStatus::Applied).await?;
                info!(evolution_id = %evolution.id, files = files.len(), "evolution applied");
                Ok(ApplyResult::Applied { files })
            }
            Err(e) => {
                // put back whatever was already written
                let restore = self.restore_snapshots(&evolution).await;
                if !restore.failed.is_empty() {
                    warn!(evolution_id = %evolution.id, failed = restore.failed.len(), "partial apply could not be rolled back");
                }
                self.fail(&mut evolution, EvolutionStep::Apply, &e).await;
                Err(e)
            }
        }
    }

    async fn write_changes(&self, evolution: &Evolution) -> OpsResult<Vec<String>> {
        let cycle_id = evolution.cycle_id.as_str();
        let existing = self.current_files(cycle_id).await?;
        self.check_changes(evolution, &evolution.proposed_changes, &existing)?;

        for change in &evolution.proposed_changes {
            self.snapshot(evolution, &change.path).await?;
        }

        let mut written = Vec::with_capacity(evolution.proposed_changes.len());
        for change in &evolution.proposed_changes {
            let current = self.cycles.get_file(cycle_id, &change.path).await?;
            let content = match change.kind {
                ChangeKind::Delete => {
                    self.cycles.delete_file(cycle_id, &change.path).await?;
                    None
                }
                ChangeKind::Create | ChangeKind::Modify => {
                    let content = change.new_content.clone().unwrap_or_default();
                    let kind = current.map(|f| f.kind).unwrap_or(FileKind::Source);
                    let file = SourceFile::new(change.path.clone(), content.clone());
                    self.cycles.save_file(&GeneratedFile::new(cycle_id, file, kind)).await?;
                    Some(content)
                }
            };
            self.cycles
                .save_file_version(FileVersion::new(
                    cycle_id,
                    &change.path,
                    content,
                    VersionReason::Evolution {
                        evolution_id: evolution.id.clone(),
                    },
                ))
                .await?;
            written.push(change.path.clone());
        }
        Ok(written)
    }

    /// Record the path's content before this evolution's first write to it.
    async fn snapshot(&self, evolution: &Evolution, path: &str) -> OpsResult<()> {
        if self.pre_evolution(evolution, path).await?.is_some() {
            return Ok(());
        }
        let current = self.cycles.get_file(&evolution.cycle_id, path).await?;
        self.cycles
            .save_file_version(FileVersion::new(
                &evolution.cycle_id,
                path,
                current.map(|f| f.content),
                VersionReason::PreEvolution {
                    evolution_id: evolution.id.clone(),
                },
            ))
            .await?;
        Ok(())
    }

    async fn pre_evolution(&self, evolution: &Evolution, path: &str) -> OpsResult<Option<FileVersion>> {
        Ok(self
            .cycles
            .list_file_versions(&evolution.cycle_id, path)
            .await?
            .into_iter()
            .find(|v| matches!(&v.reason, VersionReason::PreEvolution { evolution_id } if *evolution_id == evolution.id)))
    }

    /// Put one snapshotted path back. `None` when the evolution never touched it.
    async fn restore_path(&self, evolution: &Evolution, path: &str) -> OpsResult<Option<Restored>> {
        let cycle_id = evolution.cycle_id.as_str();
        let Some(snapshot) = self.pre_evolution(evolution, path).await? else {
            return Ok(None);
        };
        let current = self.cycles.get_file(cycle_id, path).await?;
        let restored = match &snapshot.content {
            Some(content) => {
                let kind = current.map(|f| f.kind).unwrap_or(FileKind::Source);
                let file = SourceFile::new(path, content.clone());
                self.cycles.save_file(&GeneratedFile::new(cycle_id, file.clone(), kind)).await?;
                Restored::Written(file)
            }
            None => {
                if current.is_some() {
                    self.cycles.delete_file(cycle_id, path).await?;
                }
                Restored::Deleted(path.to_string())
            }
        };
        self.cycles
            .save_file_version(FileVersion::new(
                cycle_id,
                path,
                snapshot.content.clone(),
                VersionReason::Revert {
                    evolution_id: evolution.id.clone(),
                },
            ))
            .await?;
        Ok(Some(restored))
    }

    /// Try every snapshotted path; one failed path does not stop the rest.
    async fn restore_snapshots(&self, evolution: &Evolution) -> RestoreReport {
        let mut report = RestoreReport::default();
        for change in &evolution.proposed_changes {
            match self.restore_path(evolution, &change.path).await {
                Ok(Some(Restored::Written(file))) => report.restored.push(file),
                Ok(Some(Restored::Deleted(path))) => report.deleted.push(path),
                Ok(None) => {}
                Err(e) => {
                    warn!(evolution_id = %evolution.id, path = %change.path, error = %e, "could not restore file");
                    report.failed.push((change.path.clone(), e.to_string()));
                }
            }
        }
        report
    }

    /// Restore every file the evolution touched to its pre-evolution bytes.
    ///
    /// If some paths cannot be restored the evolution stays APPLIED with the
    /// partial result in its error, and the revert can be run again.
    #[instrument(skip(self))]
    pub async fn revert(&self, id: &str) -> OpsResult<Evolution> {
        let mut evolution = self.get(id).await?;
        if !evolution.status.can_transition_to(EvolutionStatus::Reverted) {
            return Err(OpsError::InvalidTransition {
                entity: "evolution",
                from: evolution.status.to_string(),
                to: EvolutionStatus::Reverted.to_string(),
            });
        }

        let RestoreReport { restored, deleted, failed } = self.restore_snapshots(&evolution).await;
        if !failed.is_empty() {
            let done: Vec<&str> = restored
                .iter()
                .map(|f| f.path.as_str())
                .chain(deleted.iter().map(String::as_str))
                .collect();
            let missing: Vec<String> = failed.iter().map(|(path, e)| format!("{} ({})", path, e)).collect();
            let ctx = FailureContext::new(
                "revert",
                format!("partial revert: restored [{}], not restored [{}]", done.join(", "), missing.join("; ")),
            );
            evolution.error = Some(ctx.clone());
            evolution.updated_at = Utc::now();
            self.evolutions.update_evolution(&evolution).await?;
            warn!(evolution_id = %evolution.id, restored = done.len(), failed = failed.len(), "evolution only partly reverted");
            return Err(OpsError::Terminal(ctx));
        }

        if let Some(source_control) = &self.source_control {
            match source_control.commit_revert(&evolution, &restored, &deleted).await {
                Ok(commit) => info!(evolution_id = %evolution.id, %commit, "revert committed to source control"),
                Err(e) => warn!(evolution_id = %evolution.id, error = %e, "revert not committed to source control"),
            }
        }

        evolution.error = None;
        evolution.reverted_at = Some(Utc::now());
        self.transition(&mut evolution, EvolutionStatus::Reverted).await?;
        info!(
            evolution_id = %evolution.id,
            restored = restored.len(),
            deleted = deleted.len(),
            "evolution reverted"
        );
        Ok(evolution)
    }

    /// Called when the deployment carrying an evolution failed. Applied
    /// evolutions are reverted; anything still in flight is failed.
    #[instrument(skip(self))]
    pub async fn auto_revert_on_failure(&self, id: &str, reason: &str) -> OpsResult<Evolution> {
        let evolution = self.get(id).await?;
        let mut evolution = match evolution.status {
            EvolutionStatus::Applied => self.revert(id).await?,
            status if status.is_pending() => {
                let mut evolution = evolution;
                self.fail(&mut evolution, EvolutionStep::Apply, &OpsError::Validation(reason.to_string()))
                    .await;
                return Ok(evolution);
            }
            _ => return Ok(evolution),
        };
        evolution.error = Some(FailureContext::new("deploy", reason));
        evolution.updated_at = Utc::now();
        self.evolutions.update_evolution(&evolution).await?;
        warn!(evolution_id = %evolution.id, reason, "evolution rolled back after failed deployment");
        Ok(evolution)
    }

    /// Analyze, generate and apply in one go. Step failures come back as
    /// [`FullCycleResult::Failed`] with the evolution already marked failed.
    #[instrument(skip(self, token))]
    pub async fn run_full_evolution_cycle(&self, id: &str, token: &CancellationToken) -> OpsResult<FullCycleResult> {
        if let Err(e) = token.check() {
            self.abandon(id).await;
            return Err(e);
        }
        let evolution = match self.analyze(id).await {
            Ok(evolution) => evolution,
            Err(e) => return self.step_failed(id, EvolutionStep::Analyze, e).await,
        };
        if evolution.status == EvolutionStatus::Review {
            return Ok(FullCycleResult::AwaitingApproval(evolution));
        }

        if let Err(e) = token.check() {
            self.abandon(id).await;
            return Err(e);
        }
        if let Err(e) = self.generate_changes(id).await {
            return self.step_failed(id, EvolutionStep::Generate, e).await;
        }

        if let Err(e) = token.check() {
            self.abandon(id).await;
            return Err(e);
        }
        match self.apply(id).await {
            Ok(ApplyResult::Applied { .. }) => Ok(FullCycleResult::Applied(self.get(id).await?)),
            Ok(ApplyResult::AwaitingApproval) => Ok(FullCycleResult::AwaitingApproval(self.get(id).await?)),
            Err(e) => self.step_failed(id, EvolutionStep::Apply, e).await,
        }
    }

    async fn step_failed(&self, id: &str, step: EvolutionStep, error: OpsError) -> OpsResult<FullCycleResult> {
        if error.is_cancelled() {
            self.abandon(id).await;
            return Err(error);
        }
        Ok(FullCycleResult::Failed {
            evolution: self.get(id).await?,
            step,
            error: error.to_string(),
        })
    }

    /// A cancelled run leaves nothing pending behind.
    async fn abandon(&self, id: &str) {
        match self.get(id).await {
            Ok(mut evolution) => {
                self.fail(&mut evolution, EvolutionStep::Analyze, &OpsError::Cancelled).await;
            }
            Err(e) => warn!(evolution_id = id, error = %e, "could not abandon evolution"),
        }
    }
}
