//! Investigation Orchestrator
//!
//! Drives one incident through OBSERVING, ORIENTING, DECIDING, ACTING and
//! VERIFYING to DONE or FAILED. One orchestrator instance (and one listener
//! set) per run. Progress is persisted at every phase boundary so a run can be
//! resumed by any instance that wins the investigation claim.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{OpsError, OpsResult};
use crate::model::{
    ActionKind, Evidence, FailureContext, Hypothesis, Incident, IncidentStatus, LearnedPattern, OodaPhase, Postmortem,
    RemediationAction, TimelineEntry,
};
use crate::orchestrator::event_bus::{Listeners, RunEvent};
use crate::orchestrator::ladder::EscalationLadder;
use crate::orchestrator::profile::InvestigationConfig;
use crate::safety::ActionGuard;
use crate::services::platform::{ActionOutcome, ActionRequest, PlatformExecutor};
use crate::services::reasoning::{ReasoningService, ThoughtSignature};
use crate::services::repository::IncidentRepository;
use crate::services::sources::EvidenceCollector;
use crate::utils::{CancellationToken, PhaseRetry};

/// The AI-code-fix rung of the escalation ladder.
#[async_trait]
pub trait CodeFixer: Send + Sync {
    async fn fix(&self, incident: &Incident, hypothesis: &Hypothesis, token: &CancellationToken) -> OpsResult<ActionOutcome>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvestigationOutcome {
    Resolved,
    Failed(FailureContext),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct InvestigationSettings {
    pub evidence_budget: usize,
    pub confidence_threshold: f64,
    pub max_verification_attempts: u32,
    pub verification_delay: Duration,
    pub retry: PhaseRetry,
    pub heartbeat: Duration,
    pub stale_claim: Duration,
    pub ladder: EscalationLadder,
}

impl InvestigationSettings {
    pub fn from_config(config: &InvestigationConfig) -> Self {
        Self {
            evidence_budget: config.evidence_budget,
            confidence_threshold: config.confidence_threshold,
            max_verification_attempts: config.max_verification_attempts,
            verification_delay: config.verification_delay(),
            retry: PhaseRetry::new(config.phase_retries, config.retry_backoff()),
            heartbeat: config.heartbeat(),
            stale_claim: config.stale_claim(),
            ladder: EscalationLadder::new(config.ladder.clone()),
        }
    }
}

impl Default for InvestigationSettings {
    fn default() -> Self {
        Self::from_config(&InvestigationConfig::default())
    }
}

/// Shared collaborators; cloned into every run.
#[derive(Clone)]
pub struct InvestigationDeps {
    pub incidents: Arc<dyn IncidentRepository>,
    pub reasoning: Arc<dyn ReasoningService>,
    pub guard: Arc<ActionGuard>,
    pub collectors: Vec<Arc<dyn EvidenceCollector>>,
    pub code_fixer: Option<Arc<dyn CodeFixer>>,
}

/// In-process state of one run. Discarded when the run ends.
#[derive(Default)]
struct RunState {
    evidence: Vec<Evidence>,
    hypotheses: Vec<Hypothesis>,
    chosen: Option<Hypothesis>,
    tried: Vec<ActionKind>,
    next_rung: Option<usize>,
    signature: Option<ThoughtSignature>,
    retries: BTreeMap<String, u32>,
    last_action: Option<String>,
    last_verification: Option<String>,
}

impl RunState {
    fn retries_mut(&mut self, phase: OodaPhase) -> &mut u32 {
        self.retries.entry(phase.to_string()).or_insert(0)
    }

    fn failure(&self, phase: OodaPhase, error: &OpsError) -> FailureContext {
        let message = match error {
            OpsError::Terminal(ctx) => ctx.error.clone(),
            other => other.to_string(),
        };
        FailureContext::new(phase, message)
            .with_retries(self.retries.clone())
            .with_last_action(self.last_action.clone())
            .with_last_verification(self.last_verification.clone())
    }
}

/// Timeline prefix of a health check result, read back on resume.
const HEALTH_CHECK_NOTE: &str = "health check ";

fn terminal(phase: OodaPhase, message: impl ToString) -> OpsError {
    OpsError::Terminal(FailureContext::new(phase, message))
}

/// Learned-pattern key: what broke and where.
pub fn pattern_signature(incident: &Incident) -> String {
    format!(
        "{}:{}",
        incident.anomaly_type.as_deref().unwrap_or("incident"),
        incident.target()
    )
}

pub struct InvestigationOrchestrator {
    deps: InvestigationDeps,
    settings: InvestigationSettings,
    owner_id: String,
    listeners: Listeners,
    token: CancellationToken,
}

impl InvestigationOrchestrator {
    pub fn new(
        deps: InvestigationDeps,
        settings: InvestigationSettings,
        owner_id: impl Into<String>,
        token: CancellationToken,
    ) -> Self {
        Self {
            deps,
            settings,
            owner_id: owner_id.into(),
            listeners: Listeners::new(),
            token,
        }
    }

    pub fn with_listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    /// Observed at the next phase boundary or internal wait.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Start a fresh run on a stored incident.
    #[instrument(skip_all, fields(incident_id = %incident.id))]
    pub async fn investigate(&self, mut incident: Incident) -> OpsResult<InvestigationOutcome> {
        incident.ooda_phase = OodaPhase::Idle;
        incident.failure = None;
        self.drive(incident, RunState::default(), self.settings.stale_claim).await
    }

    /// Continue from the persisted phase with the stored evidence, hypotheses
    /// and actions. `stale_after` is zero during whole-process restart recovery.
    #[instrument(skip_all, fields(incident_id = %incident.id, phase = %incident.ooda_phase))]
    pub async fn resume(&self, incident: Incident, stale_after: Duration) -> OpsResult<InvestigationOutcome> {
        match incident.ooda_phase {
            OodaPhase::Done => return Ok(InvestigationOutcome::Resolved),
            OodaPhase::Failed => {
                let ctx = incident
                    .failure
                    .clone()
                    .unwrap_or_else(|| FailureContext::new(OodaPhase::Failed, "investigation already failed"));
                return Ok(InvestigationOutcome::Failed(ctx));
            }
            _ => {}
        }

        let repo = &self.deps.incidents;
        let actions = repo.list_actions(&incident.id).await?;
        let timeline = repo.list_timeline(&incident.id).await?;
        let mut state = RunState {
            evidence: repo.list_evidence(&incident.id).await?,
            hypotheses: repo.list_hypotheses(&incident.id).await?,
            tried: actions.iter().map(|a| a.kind).collect(),
            last_action: actions.last().map(|a| format!("{} {}", a.kind, a.target)),
            last_verification: timeline
                .iter()
                .rev()
                .filter(|e| e.phase == OodaPhase::Verifying)
                .find_map(|e| e.message.strip_prefix(HEALTH_CHECK_NOTE).map(str::to_string)),
            ..RunState::default()
        };
        // DECIDING always acts on the top hypothesis
        if !actions.is_empty() {
            state.chosen = Self::top_hypothesis(&state).cloned();
        }
        self.drive(incident, state, stale_after).await
    }

    async fn drive(&self, mut incident: Incident, mut state: RunState, stale_after: Duration) -> OpsResult<InvestigationOutcome> {
        let repo = self.deps.incidents.clone();
        if !repo.claim_investigation(&incident.id, &self.owner_id, stale_after).await? {
            return Err(OpsError::ResourceLimit(format!(
                "incident {} is owned by a live investigation elsewhere",
                incident.id
            )));
        }
        if incident.status == IncidentStatus::Active {
            incident.status = IncidentStatus::Investigating;
        }
        incident.cancelled_at = None;

        let lost = Arc::new(AtomicBool::new(false));
        let heartbeat = self.spawn_heartbeat(&incident.id, lost.clone());

        let start = Self::resume_point(&incident, &state);
        let result = self.run_phases(&mut incident, &mut state, start).await;
        heartbeat.abort();

        if lost.load(Ordering::SeqCst) {
            warn!(incident_id = %incident.id, "investigation claim lost, abandoning run");
            return Ok(InvestigationOutcome::Cancelled);
        }

        let outcome = match result {
            Ok(()) => {
                self.resolve(&mut incident, &state).await?;
                InvestigationOutcome::Resolved
            }
            Err(OpsError::Cancelled) => {
                let resumable = self.token.is_interrupted();
                info!(incident_id = %incident.id, phase = %incident.ooda_phase, resumable, "investigation cancelled");
                if !resumable {
                    incident.cancelled_at = Some(Utc::now());
                    incident.touch();
                    if let Err(e) = repo.update_incident(&incident).await {
                        warn!(incident_id = %incident.id, error = %e, "could not record cancellation");
                    }
                }
                let note = if resumable { "investigation interrupted" } else { "investigation cancelled" };
                let entry = TimelineEntry::new(&incident.id, incident.ooda_phase, note);
                if let Err(e) = repo.append_timeline(&entry).await {
                    warn!(incident_id = %incident.id, error = %e, "could not record cancellation");
                }
                self.listeners.emit(RunEvent::InvestigationCancelled {
                    incident_id: incident.id.clone(),
                });
                InvestigationOutcome::Cancelled
            }
            Err(e) => {
                let ctx = state.failure(incident.ooda_phase, &e);
                self.fail(&mut incident, &state, ctx.clone()).await?;
                InvestigationOutcome::Failed(ctx)
            }
        };

        if outcome != InvestigationOutcome::Cancelled {
            self.deps.guard.forget(&incident.id).await;
        }
        if let Err(e) = repo.release_claim(&incident.id, &self.owner_id).await {
            warn!(incident_id = %incident.id, error = %e, "could not release investigation claim");
        }
        Ok(outcome)
    }

    fn resume_point(incident: &Incident, state: &RunState) -> OodaPhase {
        match incident.ooda_phase {
            OodaPhase::Idle | OodaPhase::Observing => OodaPhase::Observing,
            OodaPhase::Orienting => OodaPhase::Orienting,
            OodaPhase::Deciding => OodaPhase::Deciding,
            // an action may or may not have gone out before the crash
            OodaPhase::Acting | OodaPhase::Verifying if state.tried.is_empty() => OodaPhase::Deciding,
            OodaPhase::Acting | OodaPhase::Verifying => OodaPhase::Verifying,
            OodaPhase::Done | OodaPhase::Failed => incident.ooda_phase,
        }
    }

    fn spawn_heartbeat(&self, incident_id: &str, lost: Arc<AtomicBool>) -> JoinHandle<()> {
        let repo = self.deps.incidents.clone();
        let owner = self.owner_id.clone();
        let id = incident_id.to_string();
        let every = self.settings.heartbeat;
        let token = self.token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match repo.renew_heartbeat(&id, &owner).await {
                    Ok(true) => debug!(incident_id = %id, "heartbeat renewed"),
                    Ok(false) => {
                        lost.store(true, Ordering::SeqCst);
                        token.cancel();
                        return;
                    }
                    Err(e) => warn!(incident_id = %id, error = %e, "heartbeat renewal failed"),
                }
            }
        })
    }

    async fn enter(&self, incident: &mut Incident, to: OodaPhase, note: impl Into<String>) -> OpsResult<()> {
        let from = incident.ooda_phase;
        incident.ooda_phase = to;
        match to {
            OodaPhase::Acting => incident.status = IncidentStatus::Mitigating,
            OodaPhase::Done => {
                incident.status = IncidentStatus::Resolved;
                incident.resolved_at = Some(Utc::now());
            }
            _ => {}
        }
        incident.touch();
        self.deps.incidents.update_incident(incident).await?;
        self.deps
            .incidents
            .append_timeline(&TimelineEntry::new(&incident.id, to, note))
            .await?;
        info!(incident_id = %incident.id, %from, %to, "investigation phase changed");
        self.listeners.emit(RunEvent::PhaseChanged {
            incident_id: incident.id.clone(),
            from,
            to,
        });
        Ok(())
    }

    async fn run_phases(&self, incident: &mut Incident, state: &mut RunState, start: OodaPhase) -> OpsResult<()> {
        let mut phase = start;
        loop {
            self.token.check()?;
            phase = match phase {
                OodaPhase::Observing => {
                    self.enter(incident, OodaPhase::Observing, "collecting evidence").await?;
                    self.observe(incident, state).await?;
                    OodaPhase::Orienting
                }
                OodaPhase::Orienting => {
                    self.enter(incident, OodaPhase::Orienting, "generating hypotheses").await?;
                    self.orient(incident, state).await?;
                    OodaPhase::Deciding
                }
                OodaPhase::Deciding => {
                    self.enter(incident, OodaPhase::Deciding, "selecting remediation").await?;
                    self.decide(incident, state).await?;
                    OodaPhase::Acting
                }
                OodaPhase::Acting => {
                    let rung = state.next_rung.unwrap_or_else(|| self.settings.ladder.after(&state.tried));
                    let note = match self.settings.ladder.get(rung) {
                        Some(kind) => format!("executing {}", kind),
                        None => "escalation ladder exhausted".to_string(),
                    };
                    self.enter(incident, OodaPhase::Acting, note).await?;
                    self.act(incident, state).await?;
                    OodaPhase::Verifying
                }
                OodaPhase::Verifying => {
                    self.enter(incident, OodaPhase::Verifying, "verifying health").await?;
                    if self.verify(incident, state).await? {
                        self.enter(incident, OodaPhase::Done, "target healthy").await?;
                        return Ok(());
                    }
                    state.next_rung = Some(self.settings.ladder.after(&state.tried));
                    OodaPhase::Acting
                }
                OodaPhase::Idle | OodaPhase::Done | OodaPhase::Failed => return Ok(()),
            };
        }
    }

    async fn observe(&self, incident: &Incident, state: &mut RunState) -> OpsResult<()> {
        if !state.evidence.is_empty() {
            debug!(incident_id = %incident.id, count = state.evidence.len(), "reusing stored evidence");
            return Ok(());
        }

        let budget = self.settings.evidence_budget;
        let mut collected = Vec::new();
        let mut sources = Vec::new();
        for collector in &self.deps.collectors {
            let remaining = budget.saturating_sub(collected.len());
            if remaining == 0 {
                break;
            }
            self.token.check()?;
            let used = state.retries_mut(OodaPhase::Observing);
            let items = match self
                .settings
                .retry
                .run("OBSERVING", used, &self.token, || collector.collect(incident, remaining))
                .await
            {
                Ok(items) => items,
                Err(OpsError::Cancelled) => return Err(OpsError::Cancelled),
                Err(e) => {
                    warn!(incident_id = %incident.id, collector = collector.name(), error = %e, "evidence source failed, continuing without it");
                    continue;
                }
            };
            if !items.is_empty() {
                sources.push(collector.name().to_string());
            }
            collected.extend(items.into_iter().take(remaining));
        }

        for evidence in &collected {
            self.deps.incidents.add_evidence(evidence).await?;
        }
        self.listeners.emit(RunEvent::EvidenceCollected {
            incident_id: incident.id.clone(),
            count: collected.len(),
            sources,
        });
        state.evidence = collected;
        Ok(())
    }

    async fn orient(&self, incident: &Incident, state: &mut RunState) -> OpsResult<()> {
        if !state.hypotheses.is_empty() {
            debug!(incident_id = %incident.id, count = state.hypotheses.len(), "reusing stored hypotheses");
            return Ok(());
        }

        let reasoning = &self.deps.reasoning;
        let evidence = &state.evidence;
        let signature = state.signature.clone();
        let mut used = state.retries.get("ORIENTING").copied().unwrap_or(0);
        let result = self
            .settings
            .retry
            .run("ORIENTING", &mut used, &self.token, || {
                reasoning.generate_hypotheses(incident, evidence, signature.as_ref())
            })
            .await;
        state.retries.insert(OodaPhase::Orienting.to_string(), used);
        let mut drafts = result?.thread(&mut state.signature);

        drafts.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let mut hypotheses = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let hypothesis = Hypothesis {
                id: Uuid::new_v4().to_string(),
                incident_id: incident.id.clone(),
                title: draft.title,
                description: draft.description,
                confidence: draft.confidence.clamp(0.0, 1.0),
                supporting_evidence: draft.supporting_evidence,
                contradicting_evidence: draft.contradicting_evidence,
                suggested_action: draft.suggested_action,
                created_at: Utc::now(),
            };
            self.deps.incidents.add_hypothesis(&hypothesis).await?;
            self.listeners.emit(RunEvent::HypothesisGenerated {
                incident_id: incident.id.clone(),
                hypothesis_id: hypothesis.id.clone(),
                title: hypothesis.title.clone(),
                confidence: hypothesis.confidence,
            });
            hypotheses.push(hypothesis);
        }
        state.hypotheses = hypotheses;
        Ok(())
    }

    fn top_hypothesis(state: &RunState) -> Option<&Hypothesis> {
        state
            .hypotheses
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }

    async fn decide(&self, incident: &Incident, state: &mut RunState) -> OpsResult<()> {
        let threshold = self.settings.confidence_threshold;
        let Some(top) = Self::top_hypothesis(state).cloned() else {
            return Err(terminal(OodaPhase::Deciding, "reasoning produced no hypotheses"));
        };
        if top.confidence < threshold {
            return Err(terminal(
                OodaPhase::Deciding,
                format!(
                    "no hypothesis reached confidence {:.2} (best '{}' at {:.2})",
                    threshold, top.title, top.confidence
                ),
            ));
        }

        let learned = self
            .deps
            .incidents
            .find_pattern(&pattern_signature(incident))
            .await?
            .map(|p| p.action);
        let preferred = top.suggested_action.or(learned);
        let rung = self.settings.ladder.start(preferred, &state.tried);
        info!(
            incident_id = %incident.id,
            hypothesis = %top.title,
            confidence = top.confidence,
            rung,
            learned = learned.is_some(),
            "remediation decided"
        );
        state.next_rung = Some(rung);
        state.chosen = Some(top);
        Ok(())
    }

    /// Execute rungs until one reports success. Failed actions escalate in place.
    async fn act(&self, incident: &Incident, state: &mut RunState) -> OpsResult<()> {
        let guard = &self.deps.guard;
        loop {
            self.token.check()?;
            let rung = state.next_rung.take().unwrap_or_else(|| self.settings.ladder.after(&state.tried));
            let Some(kind) = self.settings.ladder.get(rung) else {
                return Err(terminal(
                    OodaPhase::Acting,
                    format!("escalation ladder exhausted after {} actions", state.tried.len()),
                ));
            };
            if guard.remaining(&incident.id).await == 0 {
                return Err(terminal(
                    OodaPhase::Acting,
                    format!("action limit of {} reached", guard.limits().max_actions),
                ));
            }
            let wait = guard.ready_in(&incident.id).await;
            if !wait.is_zero() {
                debug!(incident_id = %incident.id, wait_secs = wait.as_secs(), "waiting out action cooldown");
                self.token.sleep(wait).await?;
            }

            let request = ActionRequest {
                incident_id: incident.id.clone(),
                kind,
                target: incident.target(),
                namespace: incident.namespace.clone(),
                parameters: json!({}),
                dry_run: guard.limits().dry_run,
            };
            let outcome = match kind {
                ActionKind::CodeFix => self.code_fix(incident, state).await?,
                _ => {
                    let mut used = state.retries.get("ACTING").copied().unwrap_or(0);
                    let result = self
                        .settings
                        .retry
                        .run("ACTING", &mut used, &self.token, || guard.execute(&request))
                        .await;
                    state.retries.insert(OodaPhase::Acting.to_string(), used);
                    result?
                }
            };

            let action = RemediationAction {
                id: Uuid::new_v4().to_string(),
                incident_id: incident.id.clone(),
                kind,
                target: request.target.clone(),
                namespace: request.namespace.clone(),
                parameters: request.parameters.clone(),
                dry_run: outcome.dry_run,
                success: outcome.success,
                detail: json!({ "message": outcome.message, "detail": outcome.detail }),
                executed_at: Utc::now(),
            };
            self.deps.incidents.record_action(&action).await?;
            let verdict = if outcome.success { "ok" } else { "failed" };
            let summary = format!(
                "{} {}: {}{}",
                kind,
                action.target,
                verdict,
                if outcome.dry_run { " (dry run)" } else { "" }
            );
            self.deps
                .incidents
                .append_timeline(&TimelineEntry::new(&incident.id, OodaPhase::Acting, summary.clone()))
                .await?;
            self.listeners.emit(RunEvent::ActionExecuted {
                incident_id: incident.id.clone(),
                action: kind,
                target: action.target.clone(),
                dry_run: outcome.dry_run,
                success: outcome.success,
            });
            state.tried.push(kind);
            state.last_action = Some(summary);

            if outcome.success {
                return Ok(());
            }
            warn!(incident_id = %incident.id, action = %kind, "action failed, escalating");
        }
    }

    async fn code_fix(&self, incident: &Incident, state: &RunState) -> OpsResult<ActionOutcome> {
        let guard = &self.deps.guard;
        let dry_run = guard.limits().dry_run;
        let Some(fixer) = &self.deps.code_fixer else {
            guard.admit(&incident.id).await?;
            return Ok(ActionOutcome::failed("no code fixer configured", dry_run));
        };
        let hypothesis = match state.chosen.as_ref().or_else(|| Self::top_hypothesis(state)) {
            Some(h) => h.clone(),
            None => return Err(terminal(OodaPhase::Acting, "code fix requested without a hypothesis")),
        };
        guard.admit(&incident.id).await?;
        if dry_run {
            return Ok(ActionOutcome::ok(
                format!("dry run: would request a code evolution for '{}'", hypothesis.title),
                true,
            ));
        }
        match fixer.fix(incident, &hypothesis, &self.token).await {
            Ok(outcome) => Ok(outcome),
            Err(OpsError::Cancelled) => Err(OpsError::Cancelled),
            Err(e) => Ok(ActionOutcome::failed(e.to_string(), false)),
        }
    }

    /// True once a health check passes within the attempt budget.
    async fn verify(&self, incident: &Incident, state: &mut RunState) -> OpsResult<bool> {
        let target = incident.target();
        let guard = &self.deps.guard;
        let attempts = self.settings.max_verification_attempts;

        for attempt in 1..=attempts {
            self.token.sleep(self.settings.verification_delay).await?;
            let mut used = state.retries.get("VERIFYING").copied().unwrap_or(0);
            let result = self
                .settings
                .retry
                .run("VERIFYING", &mut used, &self.token, || guard.check_health(&target, &incident.namespace))
                .await;
            state.retries.insert(OodaPhase::Verifying.to_string(), used);
            let report = result?;

            let summary = format!(
                "attempt {}/{}: {} {}",
                attempt,
                attempts,
                if report.healthy { "healthy" } else { "unhealthy" },
                report.detail
            );
            self.deps
                .incidents
                .append_timeline(&TimelineEntry::new(
                    &incident.id,
                    OodaPhase::Verifying,
                    format!("{}{}", HEALTH_CHECK_NOTE, summary),
                ))
                .await?;
            state.last_verification = Some(summary);
            self.listeners.emit(RunEvent::VerificationCompleted {
                incident_id: incident.id.clone(),
                attempt,
                healthy: report.healthy,
            });
            if report.healthy {
                return Ok(true);
            }
        }

        self.deps
            .incidents
            .append_timeline(&TimelineEntry::new(
                &incident.id,
                OodaPhase::Verifying,
                format!("still unhealthy after {} checks, escalating", attempts),
            ))
            .await?;
        Ok(false)
    }

    async fn resolve(&self, incident: &mut Incident, state: &RunState) -> OpsResult<()> {
        if let (Some(hypothesis), Some(action)) = (&state.chosen, state.tried.last()) {
            self.learn(incident, hypothesis, *action).await;
        }
        info!(incident_id = %incident.id, actions = state.tried.len(), "investigation resolved");
        self.listeners.emit(RunEvent::InvestigationCompleted {
            incident_id: incident.id.clone(),
        });
        self.write_postmortem(incident, state).await;
        Ok(())
    }

    async fn fail(&self, incident: &mut Incident, state: &RunState, ctx: FailureContext) -> OpsResult<()> {
        let from = incident.ooda_phase;
        warn!(incident_id = %incident.id, phase = %from, error = %ctx.error, "investigation failed");
        incident.ooda_phase = OodaPhase::Failed;
        incident.status = IncidentStatus::Active;
        incident.failure = Some(ctx.clone());
        incident.touch();
        self.deps.incidents.update_incident(incident).await?;
        self.deps
            .incidents
            .append_timeline(&TimelineEntry::new(
                &incident.id,
                OodaPhase::Failed,
                format!("failed in {}: {}", from, ctx.error),
            ))
            .await?;
        self.listeners.emit(RunEvent::PhaseChanged {
            incident_id: incident.id.clone(),
            from,
            to: OodaPhase::Failed,
        });
        self.listeners.emit(RunEvent::InvestigationFailed {
            incident_id: incident.id.clone(),
            failure: ctx,
        });
        self.write_postmortem(incident, state).await;
        Ok(())
    }

    async fn learn(&self, incident: &Incident, hypothesis: &Hypothesis, action: ActionKind) {
        let signature = pattern_signature(incident);
        let repo = &self.deps.incidents;
        let pattern = match repo.find_pattern(&signature).await {
            Ok(Some(mut p)) if p.action == action => {
                p.success_count += 1;
                p.hypothesis_title = hypothesis.title.clone();
                p.last_seen = Utc::now();
                p
            }
            Ok(_) => LearnedPattern {
                id: Uuid::new_v4().to_string(),
                signature: signature.clone(),
                hypothesis_title: hypothesis.title.clone(),
                action,
                success_count: 1,
                last_seen: Utc::now(),
            },
            Err(e) => {
                warn!(incident_id = %incident.id, error = %e, "could not read learned patterns");
                return;
            }
        };
        if let Err(e) = repo.upsert_pattern(&pattern).await {
            warn!(incident_id = %incident.id, error = %e, "could not store learned pattern");
        }
    }

    /// Best effort: never changes the outcome.
    async fn write_postmortem(&self, incident: &Incident, state: &RunState) {
        let repo = &self.deps.incidents;
        let (timeline, actions) = match (repo.list_timeline(&incident.id).await, repo.list_actions(&incident.id).await) {
            (Ok(t), Ok(a)) => (t, a),
            (Err(e), _) | (_, Err(e)) => {
                warn!(incident_id = %incident.id, error = %e, "postmortem skipped");
                return;
            }
        };
        let draft = match self
            .deps
            .reasoning
            .generate_postmortem(incident, &timeline, &actions, state.signature.as_ref())
            .await
        {
            Ok(reply) => reply.data,
            Err(e) => {
                warn!(incident_id = %incident.id, error = %e, "postmortem generation failed");
                return;
            }
        };
        let postmortem = Postmortem {
            id: Uuid::new_v4().to_string(),
            incident_id: incident.id.clone(),
            summary: draft.summary,
            root_cause: draft.root_cause,
            actions_taken: actions
                .iter()
                .map(|a| format!("{} {} ({})", a.kind, a.target, if a.success { "ok" } else { "failed" }))
                .collect(),
            lessons: draft.lessons,
            created_at: Utc::now(),
        };
        if let Err(e) = repo.save_postmortem(&postmortem).await {
            warn!(incident_id = %incident.id, error = %e, "could not store postmortem");
        }
    }
}
