mod common;

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use autonomic::error::{OpsError, OpsResult};
use autonomic::model::{CyclePhase, DeploymentInfo, DevelopmentCycle, FileKind, GeneratedFile, SourceFile, VersionReason};
use autonomic::orchestrator::{
    CycleOutcome, DevelopmentDeps, DevelopmentOrchestrator, DevelopmentRequest, DevelopmentSettings, EventRecorder,
    Listeners, Supervisor,
};
use autonomic::services::{BuildExecutor, BuildOutcome, BuildRequest, CycleRepository, DeployRequest, HealthReport};
use autonomic::utils::CancellationToken;

use common::{fast_config, Harness};

fn orchestrator(harness: &Harness, recorder: Arc<EventRecorder>) -> (DevelopmentOrchestrator, DevelopmentSettings) {
    let settings = DevelopmentSettings::from_config(&fast_config().development);
    let deps = DevelopmentDeps {
        cycles: harness.store.clone(),
        reasoning: harness.reasoning.clone(),
        builder: harness.builder.clone(),
    };
    let run = DevelopmentOrchestrator::new(deps, settings.clone(), CancellationToken::new())
        .with_listeners(Listeners::new().with(recorder));
    (run, settings)
}

#[tokio::test(start_paused = true)]
async fn test_cycle_walks_every_phase_to_completion() {
    let harness = Harness::new();
    let recorder = EventRecorder::new();
    let (run, settings) = orchestrator(&harness, recorder.clone());
    let cycle = DevelopmentRequest::new("todo API with CRUD endpoints", "todo-api")
        .with_namespace("apps")
        .into_cycle(&settings);
    let id = cycle.id.clone();

    let outcome = run.develop(cycle).await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            url: Some("http://todo-api.apps.svc".into())
        }
    );
    assert_eq!(
        recorder.cycle_phases(),
        vec![
            CyclePhase::Analyzing,
            CyclePhase::Designing,
            CyclePhase::Coding,
            CyclePhase::Testing,
            CyclePhase::Building,
            CyclePhase::Deploying,
            CyclePhase::Verifying,
            CyclePhase::Completed,
        ]
    );

    let stored = harness.store.get_cycle(&id).await.unwrap().unwrap();
    assert_eq!(stored.phase, CyclePhase::Completed);
    assert!(stored.thought_signature.is_some());
    assert!(stored.verification.as_ref().is_some_and(|v| v.healthy));
    assert_eq!(stored.test_results.as_ref().map(|t| t.generated), Some(1));

    let files = harness.store.list_files(&id).await.unwrap();
    assert_eq!(files.iter().filter(|f| f.kind == FileKind::Source).count(), 2);
    assert_eq!(files.iter().filter(|f| f.kind == FileKind::Test).count(), 1);
    assert!(harness.builder.deleted.lock().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_compile_error_is_repaired() {
    let harness = Harness::new();
    let supervisor = Supervisor::new(fast_config(), harness.collaborators());
    harness
        .builder
        .fail_next_build("#9 3.114 src/app.ts(1,21): error TS2304: Cannot find name 'express'.")
        .await;

    let request = DevelopmentRequest::new("todo API", "todo-api");
    let cycle = supervisor.new_cycle(request);
    let id = cycle.id.clone();
    harness.store.create_cycle(&cycle).await.unwrap();
    let outcome = supervisor.resume_cycle(&id).await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    assert_eq!(harness.reasoning.count("fix_code").await, 1);
    assert_eq!(harness.builder.build_count().await, 2);

    let stored = harness.store.get_cycle(&id).await.unwrap().unwrap();
    assert_eq!(stored.iterations, 1);
    let app = harness.store.get_file(&id, "src/app.ts").await.unwrap().unwrap();
    assert!(app.content.ends_with("// fixed\n"));
    let versions = harness.store.list_file_versions(&id, "src/app.ts").await.unwrap();
    assert_eq!(versions.last().map(|v| &v.reason), Some(&VersionReason::Repair { attempt: 1 }));
}

#[tokio::test(start_paused = true)]
async fn test_unparseable_build_failure_skips_repair() {
    let harness = Harness::new();
    let supervisor = Supervisor::new(fast_config(), harness.collaborators());
    harness
        .builder
        .fail_next_build("npm ERR! code ELIFECYCLE\nnpm ERR! errno 137")
        .await;

    let outcome = supervisor
        .develop(DevelopmentRequest::new("todo API", "todo-api"))
        .await
        .unwrap();

    let ctx = match outcome {
        CycleOutcome::Failed(ctx) => {
            assert_eq!(ctx.phase, CyclePhase::Building.to_string());
            ctx
        }
        other => panic!("expected failure, got {:?}", other),
    };
    assert!(ctx.error.contains("no parseable errors"));
    assert_eq!(harness.reasoning.count("fix_code").await, 0);
    assert!(harness.builder.deployed.lock().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_resume_from_building_keeps_generated_code() {
    let harness = Harness::new();
    let recorder = EventRecorder::new();
    let (run, settings) = orchestrator(&harness, recorder.clone());

    let mut cycle = DevelopmentRequest::new("todo API", "todo-api").into_cycle(&settings);
    cycle.phase = CyclePhase::Building;
    harness.store.create_cycle(&cycle).await.unwrap();
    for (path, kind) in [("src/index.ts", FileKind::Source), ("test/index.test.ts", FileKind::Test)] {
        harness
            .store
            .save_file(&GeneratedFile::new(&cycle.id, SourceFile::new(path, "export {};\n"), kind))
            .await
            .unwrap();
    }

    let outcome = run.resume(cycle).await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    assert_eq!(harness.reasoning.count("generate_code").await, 0);
    assert_eq!(harness.reasoning.count("analyze_requirement").await, 0);
    assert_eq!(recorder.cycle_phases().first(), Some(&CyclePhase::Deploying));
    let built = harness.builder.requests.lock().await;
    assert_eq!(built.len(), 1);
    assert_eq!(built[0].files.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_deploy_removes_built_image() {
    let harness = Harness::new();
    let supervisor = Supervisor::new(fast_config(), harness.collaborators());
    *harness.builder.deploy_error.lock().await = Some("namespace quota exceeded".into());

    let outcome = supervisor
        .develop(DevelopmentRequest::new("todo API", "todo-api"))
        .await
        .unwrap();

    let CycleOutcome::Failed(ctx) = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert_eq!(ctx.phase, CyclePhase::Deploying.to_string());
    let deleted = harness.builder.deleted.lock().await;
    assert_eq!(deleted.len(), 1);
    assert!(deleted[0].starts_with("registry.local/todo-api:"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_fix_on_one_file_still_repairs_the_rest() {
    let harness = Harness::new();
    let supervisor = Supervisor::new(fast_config(), harness.collaborators());
    harness
        .builder
        .fail_next_build(
            "src/app.ts(1,21): error TS2304: Cannot find name 'express'.\n\
             src/index.ts(2,1): error TS2554: Expected 1 arguments, but got 0.",
        )
        .await;
    harness
        .reasoning
        .fixes
        .lock()
        .await
        .push_back(Err(OpsError::Validation("reply was not JSON".into())));

    let cycle = supervisor.new_cycle(DevelopmentRequest::new("todo API", "todo-api"));
    let id = cycle.id.clone();
    harness.store.create_cycle(&cycle).await.unwrap();
    let outcome = supervisor.resume_cycle(&id).await.unwrap();

    assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    assert_eq!(harness.reasoning.count("fix_code").await, 2);
    assert_eq!(harness.builder.build_count().await, 2);
    let app = harness.store.get_file(&id, "src/app.ts").await.unwrap().unwrap();
    assert!(!app.content.contains("// fixed"));
    let index = harness.store.get_file(&id, "src/index.ts").await.unwrap().unwrap();
    assert!(index.content.ends_with("// fixed\n"));
}

/// Fails the first `transient` builds with a registry timeout, then hangs.
struct StallingBuilder {
    calls: AtomicUsize,
    transient: usize,
    stalled: Notify,
}

impl StallingBuilder {
    fn new(transient: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            transient,
            stalled: Notify::new(),
        })
    }
}

#[async_trait]
impl BuildExecutor for StallingBuilder {
    async fn build(&self, _request: &BuildRequest) -> OpsResult<BuildOutcome> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.transient {
            return Err(OpsError::transient("builder", "registry timeout"));
        }
        self.stalled.notify_one();
        std::future::pending().await
    }

    async fn deploy(&self, _request: &DeployRequest) -> OpsResult<DeploymentInfo> {
        Err(OpsError::Validation("not deployable".into()))
    }

    async fn check_health(&self, _deployment: &DeploymentInfo) -> OpsResult<HealthReport> {
        Err(OpsError::Validation("not deployed".into()))
    }

    async fn delete_image(&self, _image_tag: &str) -> OpsResult<()> {
        Ok(())
    }
}

fn run_with(harness: &Harness, builder: Arc<dyn BuildExecutor>) -> DevelopmentOrchestrator {
    let deps = DevelopmentDeps {
        cycles: harness.store.clone(),
        reasoning: harness.reasoning.clone(),
        builder,
    };
    DevelopmentOrchestrator::new(
        deps,
        DevelopmentSettings::from_config(&fast_config().development),
        CancellationToken::new(),
    )
}

async fn building_cycle(harness: &Harness) -> DevelopmentCycle {
    let settings = DevelopmentSettings::from_config(&fast_config().development);
    let mut cycle = DevelopmentRequest::new("todo API", "todo-api").into_cycle(&settings);
    cycle.phase = CyclePhase::Building;
    harness.store.create_cycle(&cycle).await.unwrap();
    harness
        .store
        .save_file(&GeneratedFile::new(&cycle.id, SourceFile::new("src/index.ts", "export {};\n"), FileKind::Source))
        .await
        .unwrap();
    cycle
}

#[tokio::test(start_paused = true)]
async fn test_retries_spent_before_a_crash_stay_spent() {
    let harness = Harness::new();
    let cycle = building_cycle(&harness).await;
    let id = cycle.id.clone();

    // the process dies while the third build hangs
    let stalling = StallingBuilder::new(2);
    let run = run_with(&harness, stalling.clone());
    let task = tokio::spawn(async move { run.resume(cycle).await });
    stalling.stalled.notified().await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let stored = harness.store.get_cycle(&id).await.unwrap().unwrap();
    assert_eq!(stored.phase, CyclePhase::Building);
    assert_eq!(stored.retries_for(CyclePhase::Building), 2);

    // one retry is left of the three, so the restarted run builds twice
    let flaky = StallingBuilder::new(usize::MAX);
    let outcome = run_with(&harness, flaky.clone()).resume(stored).await.unwrap();
    match outcome {
        CycleOutcome::Failed(ctx) => assert_eq!(ctx.phase, CyclePhase::Building.to_string()),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);
    let stored = harness.store.get_cycle(&id).await.unwrap().unwrap();
    assert_eq!(stored.retries_for(CyclePhase::Building), 3);
}
