mod common;

use serde_json::json;
use std::time::Duration;

use autonomic::model::{CyclePhase, DevelopmentCycle, Incident, IncidentStatus, OodaPhase, Severity};
use autonomic::orchestrator::{CycleOutcome, DevelopmentRequest, InvestigationOutcome, Supervisor};
use autonomic::services::{CycleRepository, IncidentRepository};

use common::{fast_config, Harness};

async fn settle<F, Fut>(mut done: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if done().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("recovered runs did not finish");
}

#[tokio::test(start_paused = true)]
async fn test_recover_resumes_interrupted_runs() {
    let harness = Harness::new();
    let store = harness.store.clone();

    let mut interrupted = DevelopmentCycle::new("todo API", "todo-api", "apps");
    interrupted.phase = CyclePhase::Coding;
    interrupted.analyzed_requirement = Some(json!({ "features": ["crud"] }));
    interrupted.architecture = Some(json!({ "language": "typescript" }));
    store.create_cycle(&interrupted).await.unwrap();

    let mut finished = DevelopmentCycle::new("old API", "old-api", "apps");
    finished.phase = CyclePhase::Completed;
    store.create_cycle(&finished).await.unwrap();

    let mut incident = Incident::new("[checkout-svc] p95 latency 3s exceeds 2s", Severity::Medium, "shop")
        .with_app("checkout-svc")
        .with_anomaly_type("high_latency");
    incident.status = IncidentStatus::Investigating;
    incident.ooda_phase = OodaPhase::Orienting;
    store.create_incident(&incident).await.unwrap();
    // the crashed process still holds a fresh claim
    assert!(store
        .claim_investigation(&incident.id, "crashed-instance", Duration::from_secs(3600))
        .await
        .unwrap());

    let mut closed = Incident::new("[cart] resolved earlier", Severity::Low, "shop");
    closed.status = IncidentStatus::Resolved;
    closed.ooda_phase = OodaPhase::Done;
    store.create_incident(&closed).await.unwrap();

    let supervisor = Supervisor::new(fast_config(), harness.collaborators());
    let report = supervisor.recover().await.unwrap();
    assert_eq!(report.cycles, vec![interrupted.id.clone()]);
    assert_eq!(report.incidents, vec![incident.id.clone()]);
    assert!(report.skipped.is_empty());

    let (cycle_id, incident_id) = (interrupted.id.clone(), incident.id.clone());
    settle(|| {
        let store = store.clone();
        let (cycle_id, incident_id) = (cycle_id.clone(), incident_id.clone());
        async move {
            let cycle = store.get_cycle(&cycle_id).await.unwrap().unwrap();
            let incident = store.get_incident(&incident_id).await.unwrap().unwrap();
            cycle.phase.is_terminal() && incident.ooda_phase.is_terminal()
        }
    })
    .await;

    let cycle = store.get_cycle(&interrupted.id).await.unwrap().unwrap();
    assert_eq!(cycle.phase, CyclePhase::Completed);
    assert_eq!(harness.reasoning.count("analyze_requirement").await, 0);
    assert_eq!(harness.reasoning.count("generate_code").await, 1);

    let incident = store.get_incident(&incident.id).await.unwrap().unwrap();
    assert_eq!(incident.ooda_phase, OodaPhase::Done);
    assert_eq!(incident.status, IncidentStatus::Resolved);
    assert_eq!(harness.reasoning.count("generate_hypotheses").await, 1);
    settle(|| {
        let supervisor = supervisor.clone();
        async move { supervisor.stats().await.active_investigations == 0 }
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_runs_are_not_recovered() {
    let harness = Harness::new();
    let store = harness.store.clone();
    let supervisor = Supervisor::new(fast_config(), harness.collaborators());

    let cycle = supervisor.new_cycle(DevelopmentRequest::new("todo API", "todo-api"));
    let cycle_id = cycle.id.clone();
    store.create_cycle(&cycle).await.unwrap();
    let incident = Incident::new("[checkout-svc] Error rate 42% exceeds 5% threshold", Severity::High, "shop")
        .with_app("checkout-svc")
        .with_anomaly_type("high_error_rate");
    let incident_id = incident.id.clone();
    store.create_incident(&incident).await.unwrap();

    let cycle_run = {
        let (supervisor, id) = (supervisor.clone(), cycle_id.clone());
        tokio::spawn(async move { supervisor.resume_cycle(&id).await })
    };
    let incident_run = {
        let (supervisor, id) = (supervisor.clone(), incident_id.clone());
        tokio::spawn(async move { supervisor.investigate(&id).await })
    };

    // both runs wait out their first health check delay
    settle(|| {
        let store = store.clone();
        let (cycle_id, incident_id) = (cycle_id.clone(), incident_id.clone());
        async move {
            let cycle = store.get_cycle(&cycle_id).await.unwrap().unwrap();
            let incident = store.get_incident(&incident_id).await.unwrap().unwrap();
            cycle.phase == CyclePhase::Verifying && incident.ooda_phase == OodaPhase::Verifying
        }
    })
    .await;
    assert!(supervisor.cancel_cycle(&cycle_id));
    assert!(supervisor.cancel_investigation(&incident_id));
    assert_eq!(cycle_run.await.unwrap().unwrap(), CycleOutcome::Cancelled);
    assert_eq!(incident_run.await.unwrap().unwrap(), InvestigationOutcome::Cancelled);

    let cycle = store.get_cycle(&cycle_id).await.unwrap().unwrap();
    assert_eq!(cycle.phase, CyclePhase::Verifying);
    assert!(cycle.cancelled_at.is_some());
    let incident = store.get_incident(&incident_id).await.unwrap().unwrap();
    assert!(incident.cancelled_at.is_some());
    assert_eq!(supervisor.stats().await.active_investigations, 0);

    let report = supervisor.recover().await.unwrap();
    assert!(report.is_empty(), "{:?}", report);

    // an explicit resume still picks the cycle up
    let outcome = supervisor.resume_cycle(&cycle_id).await.unwrap();
    assert!(matches!(outcome, CycleOutcome::Completed { .. }));
    assert!(store.get_cycle(&cycle_id).await.unwrap().unwrap().cancelled_at.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_runs_stopped_by_shutdown_are_recovered() {
    let harness = Harness::new();
    let store = harness.store.clone();
    let supervisor = Supervisor::new(fast_config(), harness.collaborators());

    let cycle = supervisor.new_cycle(DevelopmentRequest::new("todo API", "todo-api"));
    let cycle_id = cycle.id.clone();
    store.create_cycle(&cycle).await.unwrap();
    let run = {
        let (supervisor, id) = (supervisor.clone(), cycle_id.clone());
        tokio::spawn(async move { supervisor.resume_cycle(&id).await })
    };
    settle(|| {
        let store = store.clone();
        let id = cycle_id.clone();
        async move { store.get_cycle(&id).await.unwrap().unwrap().phase == CyclePhase::Verifying }
    })
    .await;
    supervisor.shutdown();
    assert_eq!(run.await.unwrap().unwrap(), CycleOutcome::Cancelled);
    assert!(store.get_cycle(&cycle_id).await.unwrap().unwrap().cancelled_at.is_none());

    let restarted = Supervisor::new(fast_config(), harness.collaborators());
    let report = restarted.recover().await.unwrap();
    assert_eq!(report.cycles, vec![cycle_id]);
}
