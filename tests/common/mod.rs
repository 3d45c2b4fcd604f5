//! Scripted collaborators shared by the integration tests. Each mock pops the
//! next reply from a queue and falls back to a healthy default when the script
//! runs out.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use autonomic::error::{OpsError, OpsResult};
use autonomic::model::{
    ActionKind, DeploymentInfo, Evidence, Evolution, EvolutionAnalysis, ImpactLevel, Incident, ProposedChange,
    RemediationAction, SourceFile, TimelineEntry,
};
use autonomic::orchestrator::{Collaborators, ControlPlaneConfig};
use autonomic::services::{
    ActionOutcome, ActionRequest, AppCatalog, BuildExecutor, BuildOutcome, BuildRequest, CodeFix, DeployRequest,
    HealthReport, HypothesisDraft, MetricsQuery, MonitoredApp, PlatformExecutor, PostmortemDraft, Reasoned,
    ReasoningService, RemediationTarget, RequirementBrief, Sample, Series, ThoughtSignature, VisionFinding,
    VisionFrame,
};
use autonomic::services::build::BuildError;
use autonomic::store::MemoryStore;

#[derive(Default)]
pub struct ScriptedReasoning {
    pub calls: Mutex<Vec<&'static str>>,
    pub code: Mutex<VecDeque<Vec<SourceFile>>>,
    pub fixes: Mutex<VecDeque<OpsResult<CodeFix>>>,
    pub hypotheses: Mutex<VecDeque<OpsResult<Vec<HypothesisDraft>>>>,
    pub analyses: Mutex<VecDeque<EvolutionAnalysis>>,
    pub changes: Mutex<VecDeque<Vec<ProposedChange>>>,
}

impl ScriptedReasoning {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn count(&self, call: &str) -> usize {
        self.calls.lock().await.iter().filter(|c| **c == call).count()
    }

    async fn record(&self, call: &'static str) {
        self.calls.lock().await.push(call);
    }

    pub async fn script_hypothesis(&self, title: &str, confidence: f64, action: Option<ActionKind>) {
        self.hypotheses.lock().await.push_back(Ok(vec![HypothesisDraft {
            title: title.to_string(),
            description: format!("{} explains the symptoms", title),
            confidence,
            supporting_evidence: Vec::new(),
            contradicting_evidence: Vec::new(),
            suggested_action: action,
        }]));
    }
}

fn signed<T>(data: T, step: &str) -> OpsResult<Reasoned<T>> {
    Ok(Reasoned::new(data).with_signature(Some(ThoughtSignature::new(step))))
}

#[async_trait]
impl ReasoningService for ScriptedReasoning {
    async fn analyze_requirement(
        &self,
        brief: &RequirementBrief,
        _signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Value>> {
        self.record("analyze_requirement").await;
        signed(json!({ "features": [brief.requirement] }), "analyzed")
    }

    async fn design_architecture(
        &self,
        _analyzed: &Value,
        _signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Value>> {
        self.record("design_architecture").await;
        signed(json!({ "language": "typescript", "framework": "express" }), "designed")
    }

    async fn generate_code(
        &self,
        _architecture: &Value,
        _signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Vec<SourceFile>>> {
        self.record("generate_code").await;
        let files = self.code.lock().await.pop_front().unwrap_or_else(|| {
            vec![
                SourceFile::new("src/index.ts", "import { app } from './app';\napp.listen(3000);\n"),
                SourceFile::new("src/app.ts", "export const app = express();\n"),
            ]
        });
        signed(files, "coded")
    }

    async fn fix_code(
        &self,
        file: &SourceFile,
        _errors: &[BuildError],
        _signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<CodeFix>> {
        self.record("fix_code").await;
        let fix = self.fixes.lock().await.pop_front().unwrap_or_else(|| {
            Ok(CodeFix {
                changed: true,
                content: format!("{}// fixed\n", file.content),
                explanation: None,
            })
        })?;
        signed(fix, "fixed")
    }

    async fn generate_tests(
        &self,
        _files: &[SourceFile],
        _signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Vec<SourceFile>>> {
        self.record("generate_tests").await;
        signed(vec![SourceFile::new("test/app.test.ts", "test('boots', () => {});\n")], "tested")
    }

    async fn analyze_frame(&self, _frame: &VisionFrame) -> OpsResult<Reasoned<Vec<VisionFinding>>> {
        self.record("analyze_frame").await;
        Ok(Reasoned::new(Vec::new()))
    }

    async fn generate_hypotheses(
        &self,
        incident: &Incident,
        _evidence: &[Evidence],
        _signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Vec<HypothesisDraft>>> {
        self.record("generate_hypotheses").await;
        let drafts = self.hypotheses.lock().await.pop_front().unwrap_or_else(|| {
            Ok(vec![HypothesisDraft {
                title: format!("{} is wedged", incident.target()),
                description: "process stopped serving requests".into(),
                confidence: 0.9,
                supporting_evidence: Vec::new(),
                contradicting_evidence: Vec::new(),
                suggested_action: Some(ActionKind::Restart),
            }])
        })?;
        signed(drafts, "oriented")
    }

    async fn generate_postmortem(
        &self,
        incident: &Incident,
        _timeline: &[TimelineEntry],
        _actions: &[RemediationAction],
        _signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<PostmortemDraft>> {
        self.record("generate_postmortem").await;
        signed(
            PostmortemDraft {
                summary: format!("{} handled", incident.title),
                root_cause: "stuck worker".into(),
                lessons: Vec::new(),
            },
            "postmortem",
        )
    }

    async fn analyze_evolution(
        &self,
        evolution: &Evolution,
        files: &[SourceFile],
    ) -> OpsResult<Reasoned<EvolutionAnalysis>> {
        self.record("analyze_evolution").await;
        let analysis = self.analyses.lock().await.pop_front().unwrap_or_else(|| EvolutionAnalysis {
            affected_files: files.iter().take(1).map(|f| f.path.clone()).collect(),
            impact: ImpactLevel::Low,
            summary: evolution.prompt.clone(),
        });
        Ok(Reasoned::new(analysis))
    }

    async fn generate_evolution_changes(
        &self,
        _evolution: &Evolution,
        _files: &[SourceFile],
    ) -> OpsResult<Reasoned<Vec<ProposedChange>>> {
        self.record("generate_evolution_changes").await;
        let changes = self
            .changes
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| OpsError::Validation("no changes scripted".into()))?;
        Ok(Reasoned::new(changes))
    }
}

#[derive(Default)]
pub struct ScriptedBuilder {
    pub builds: Mutex<VecDeque<BuildOutcome>>,
    pub health: Mutex<VecDeque<bool>>,
    pub deploy_error: Mutex<Option<String>>,
    pub requests: Mutex<Vec<BuildRequest>>,
    pub deployed: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
}

impl ScriptedBuilder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn fail_next_build(&self, logs: &str) {
        self.builds.lock().await.push_back(BuildOutcome {
            success: false,
            image_tag: None,
            logs: logs.to_string(),
            test_results: None,
            error: Some("build failed".into()),
        });
    }

    pub async fn build_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl BuildExecutor for ScriptedBuilder {
    async fn build(&self, request: &BuildRequest) -> OpsResult<BuildOutcome> {
        self.requests.lock().await.push(request.clone());
        let outcome = self.builds.lock().await.pop_front().unwrap_or_else(|| BuildOutcome {
            success: true,
            image_tag: Some(format!("registry.local/{}:{}", request.app_name, request.tag)),
            logs: "Successfully built".into(),
            test_results: None,
            error: None,
        });
        Ok(outcome)
    }

    async fn deploy(&self, request: &DeployRequest) -> OpsResult<DeploymentInfo> {
        if let Some(message) = self.deploy_error.lock().await.clone() {
            return Err(OpsError::Validation(message));
        }
        self.deployed.lock().await.push(request.image_tag.clone());
        Ok(DeploymentInfo {
            name: request.app_name.clone(),
            namespace: request.namespace.clone(),
            image_tag: request.image_tag.clone(),
            url: Some(format!("http://{}.{}.svc", request.app_name, request.namespace)),
            deployed_at: Utc::now(),
        })
    }

    async fn check_health(&self, _deployment: &DeploymentInfo) -> OpsResult<HealthReport> {
        let healthy = self.health.lock().await.pop_front().unwrap_or(true);
        Ok(HealthReport {
            healthy,
            detail: json!({ "status": if healthy { 200 } else { 503 } }),
        })
    }

    async fn delete_image(&self, image_tag: &str) -> OpsResult<()> {
        self.deleted.lock().await.push(image_tag.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct ScriptedPlatform {
    pub executed: Mutex<Vec<ActionRequest>>,
    pub outcomes: Mutex<VecDeque<bool>>,
    pub health: Mutex<VecDeque<bool>>,
}

impl ScriptedPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn executed_kinds(&self) -> Vec<ActionKind> {
        self.executed.lock().await.iter().map(|r| r.kind).collect()
    }
}

#[async_trait]
impl PlatformExecutor for ScriptedPlatform {
    async fn list_targets(&self, namespace: &str) -> OpsResult<Vec<RemediationTarget>> {
        Ok(vec![RemediationTarget {
            name: "checkout-svc".into(),
            namespace: namespace.to_string(),
            kind: "Deployment".into(),
            replicas: Some(2),
            ready_replicas: Some(1),
        }])
    }

    async fn execute(&self, request: &ActionRequest) -> OpsResult<ActionOutcome> {
        self.executed.lock().await.push(request.clone());
        let success = self.outcomes.lock().await.pop_front().unwrap_or(true);
        let message = format!("{} {}", request.kind, request.target);
        Ok(if success {
            ActionOutcome::ok(message, request.dry_run)
        } else {
            ActionOutcome::failed(message, request.dry_run)
        })
    }

    async fn check_health(&self, target: &str, _namespace: &str) -> OpsResult<HealthReport> {
        let healthy = self.health.lock().await.pop_front().unwrap_or(true);
        Ok(HealthReport {
            healthy,
            detail: json!({ "target": target }),
        })
    }
}

/// A metrics backend with nothing to report.
pub struct QuietMetrics;

#[async_trait]
impl MetricsQuery for QuietMetrics {
    async fn instant(&self, _query: &str) -> OpsResult<Vec<Sample>> {
        Ok(Vec::new())
    }

    async fn range(
        &self,
        _query: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _step: Duration,
    ) -> OpsResult<Vec<Series>> {
        Ok(Vec::new())
    }
}

pub struct FixedCatalog(pub Vec<MonitoredApp>);

#[async_trait]
impl AppCatalog for FixedCatalog {
    async fn monitored_apps(&self) -> OpsResult<Vec<MonitoredApp>> {
        Ok(self.0.clone())
    }
}

pub fn sample(app: &str, value: f64) -> Sample {
    Sample {
        labels: BTreeMap::from([("app".to_string(), app.to_string())]),
        value,
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub reasoning: Arc<ScriptedReasoning>,
    pub builder: Arc<ScriptedBuilder>,
    pub platform: Arc<ScriptedPlatform>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            reasoning: ScriptedReasoning::new(),
            builder: ScriptedBuilder::new(),
            platform: ScriptedPlatform::new(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            incidents: self.store.clone(),
            cycles: self.store.clone(),
            evolutions: self.store.clone(),
            reasoning: self.reasoning.clone(),
            platform: self.platform.clone(),
            builder: self.builder.clone(),
            metrics: Arc::new(QuietMetrics),
            catalog: Arc::new(FixedCatalog(Vec::new())),
            collectors: Vec::new(),
            frames: None,
            source_control: None,
        }
    }
}

/// Short delays so paused-clock tests do not have to advance far.
pub fn fast_config() -> ControlPlaneConfig {
    let mut config = ControlPlaneConfig::default();
    config.investigation.verification_delay_secs = 1;
    config.investigation.action_cooldown_secs = 1;
    config.investigation.retry_backoff_ms = 10;
    config.development.retry_backoff_ms = 10;
    config.development.deploy_verify_delay_secs = 1;
    config
}
