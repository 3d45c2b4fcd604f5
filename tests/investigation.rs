mod common;

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use autonomic::model::{ActionKind, Hypothesis, Incident, IncidentStatus, OodaPhase, RemediationAction, Severity, TimelineEntry};
use autonomic::orchestrator::{
    EventRecorder, InvestigationDeps, InvestigationOrchestrator, InvestigationOutcome, InvestigationSettings,
    Listeners,
};
use autonomic::safety::{ActionGuard, GuardLimits};
use autonomic::services::IncidentRepository;
use autonomic::utils::CancellationToken;

use common::{fast_config, Harness};

fn orchestrator(harness: &Harness, recorder: Arc<EventRecorder>) -> InvestigationOrchestrator {
    let config = fast_config();
    let guard = Arc::new(ActionGuard::new(
        harness.platform.clone(),
        GuardLimits {
            dry_run: true,
            max_actions: config.investigation.max_actions,
            cooldown: Duration::from_secs(1),
        },
    ));
    let deps = InvestigationDeps {
        incidents: harness.store.clone(),
        reasoning: harness.reasoning.clone(),
        guard,
        collectors: Vec::new(),
        code_fixer: None,
    };
    InvestigationOrchestrator::new(
        deps,
        InvestigationSettings::from_config(&config.investigation),
        "instance-a",
        CancellationToken::new(),
    )
    .with_listeners(Listeners::new().with(recorder))
}

async fn stored_incident(harness: &Harness) -> Incident {
    let incident = Incident::new("[checkout-svc] Error rate 42% exceeds 5% threshold", Severity::High, "shop")
        .with_app("checkout-svc")
        .with_anomaly_type("high_error_rate");
    harness.store.create_incident(&incident).await.unwrap();
    incident
}

#[tokio::test(start_paused = true)]
async fn test_phases_run_in_order_to_done() {
    let harness = Harness::new();
    let recorder = EventRecorder::new();
    let incident = stored_incident(&harness).await;

    let outcome = orchestrator(&harness, recorder.clone())
        .investigate(incident.clone())
        .await
        .unwrap();

    assert_eq!(outcome, InvestigationOutcome::Resolved);
    assert_eq!(
        recorder.ooda_phases(),
        vec![
            OodaPhase::Observing,
            OodaPhase::Orienting,
            OodaPhase::Deciding,
            OodaPhase::Acting,
            OodaPhase::Verifying,
            OodaPhase::Done,
        ]
    );
    assert_eq!(harness.platform.executed_kinds().await, vec![ActionKind::Restart]);

    let stored = harness.store.get_incident(&incident.id).await.unwrap().unwrap();
    assert_eq!(stored.status, IncidentStatus::Resolved);
    assert!(stored.resolved_at.is_some());
    assert!(stored.claim.is_none());

    let actions = harness.store.list_actions(&incident.id).await.unwrap();
    assert_eq!(actions.len(), 1);
    assert!(actions[0].dry_run);
    assert!(harness.store.get_postmortem(&incident.id).await.unwrap().is_some());
    let pattern = harness
        .store
        .find_pattern("high_error_rate:checkout-svc")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pattern.action, ActionKind::Restart);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_after_restart_escalates_to_scale() {
    let harness = Harness::new();
    let recorder = EventRecorder::new();
    let incident = stored_incident(&harness).await;
    harness
        .platform
        .health
        .lock()
        .await
        .extend([false, false, false]);

    let outcome = orchestrator(&harness, recorder.clone())
        .investigate(incident)
        .await
        .unwrap();

    assert_eq!(outcome, InvestigationOutcome::Resolved);
    assert_eq!(
        harness.platform.executed_kinds().await,
        vec![ActionKind::Restart, ActionKind::Scale]
    );
    let phases = recorder.ooda_phases();
    assert_eq!(&phases[3..], &[
        OodaPhase::Acting,
        OodaPhase::Verifying,
        OodaPhase::Acting,
        OodaPhase::Verifying,
        OodaPhase::Done,
    ]);
}

#[tokio::test(start_paused = true)]
async fn test_low_confidence_fails_in_deciding() {
    let harness = Harness::new();
    let recorder = EventRecorder::new();
    let incident = stored_incident(&harness).await;
    harness
        .reasoning
        .script_hypothesis("cosmic rays", 0.2, Some(ActionKind::Restart))
        .await;

    let outcome = orchestrator(&harness, recorder.clone())
        .investigate(incident.clone())
        .await
        .unwrap();

    let InvestigationOutcome::Failed(ctx) = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert_eq!(ctx.phase, OodaPhase::Deciding.to_string());
    assert!(ctx.error.contains("cosmic rays"));
    assert!(harness.platform.executed_kinds().await.is_empty());

    let stored = harness.store.get_incident(&incident.id).await.unwrap().unwrap();
    assert_eq!(stored.ooda_phase, OodaPhase::Failed);
    assert_eq!(stored.failure.as_ref(), Some(&ctx));
    assert_eq!(recorder.ooda_phases().last(), Some(&OodaPhase::Failed));
}

#[tokio::test(start_paused = true)]
async fn test_resume_reuses_stored_hypotheses() {
    let harness = Harness::new();
    let recorder = EventRecorder::new();
    let mut incident = stored_incident(&harness).await;
    incident.status = IncidentStatus::Investigating;
    incident.ooda_phase = OodaPhase::Deciding;
    harness.store.update_incident(&incident).await.unwrap();
    harness
        .store
        .add_hypothesis(&Hypothesis {
            id: "hyp-1".into(),
            incident_id: incident.id.clone(),
            title: "bad rollout".into(),
            description: "the last image regressed".into(),
            confidence: 0.85,
            supporting_evidence: Vec::new(),
            contradicting_evidence: Vec::new(),
            suggested_action: Some(ActionKind::Rollback),
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let outcome = orchestrator(&harness, recorder.clone())
        .resume(incident, Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(outcome, InvestigationOutcome::Resolved);
    assert_eq!(harness.reasoning.count("generate_hypotheses").await, 0);
    assert_eq!(recorder.ooda_phases().first(), Some(&OodaPhase::Deciding));
    assert_eq!(harness.platform.executed_kinds().await, vec![ActionKind::Rollback]);
}

#[tokio::test(start_paused = true)]
async fn test_live_claim_blocks_second_owner() {
    let harness = Harness::new();
    let incident = stored_incident(&harness).await;
    assert!(harness
        .store
        .claim_investigation(&incident.id, "instance-b", Duration::from_secs(60))
        .await
        .unwrap());

    let err = orchestrator(&harness, EventRecorder::new())
        .investigate(incident)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("owned by a live investigation"));
    assert!(harness.platform.executed_kinds().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_acting_still_learns() {
    let harness = Harness::new();
    let recorder = EventRecorder::new();
    let mut incident = stored_incident(&harness).await;
    incident.status = IncidentStatus::Mitigating;
    incident.ooda_phase = OodaPhase::Acting;
    harness.store.update_incident(&incident).await.unwrap();
    for (id, title, confidence) in [("hyp-1", "connection pool exhausted", 0.9), ("hyp-2", "noisy neighbour", 0.4)] {
        harness
            .store
            .add_hypothesis(&Hypothesis {
                id: id.into(),
                incident_id: incident.id.clone(),
                title: title.into(),
                description: format!("{} explains the errors", title),
                confidence,
                supporting_evidence: Vec::new(),
                contradicting_evidence: Vec::new(),
                suggested_action: Some(ActionKind::Restart),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }
    // the restart went out before the previous owner died
    harness
        .store
        .record_action(&RemediationAction {
            id: "act-1".into(),
            incident_id: incident.id.clone(),
            kind: ActionKind::Restart,
            target: "checkout-svc".into(),
            namespace: "shop".into(),
            parameters: json!({}),
            dry_run: true,
            success: true,
            detail: json!({ "message": "restarted" }),
            executed_at: Utc::now(),
        })
        .await
        .unwrap();

    let outcome = orchestrator(&harness, recorder.clone())
        .resume(incident.clone(), Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(outcome, InvestigationOutcome::Resolved);
    assert_eq!(recorder.ooda_phases(), vec![OodaPhase::Verifying, OodaPhase::Done]);
    assert!(harness.platform.executed_kinds().await.is_empty());
    let pattern = harness
        .store
        .find_pattern("high_error_rate:checkout-svc")
        .await
        .unwrap()
        .expect("resumed run records what fixed the incident");
    assert_eq!(pattern.action, ActionKind::Restart);
    assert_eq!(pattern.hypothesis_title, "connection pool exhausted");
    assert_eq!(pattern.success_count, 1);

    let timeline = harness.store.list_timeline(&incident.id).await.unwrap();
    assert!(timeline
        .iter()
        .any(|e: &TimelineEntry| e.phase == OodaPhase::Verifying && e.message.starts_with("health check attempt 1/")));
}
