//! Run Events
//!
//! Every orchestrator run owns a [`Listeners`] set and reports progress
//! through it. Observers are called synchronously in registration order, so
//! events of one run arrive in the order they happened. The [`EventBus`] is
//! the broadcast sink transport code subscribes to.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::model::{ActionKind, AnomalySource, CyclePhase, EvolutionStatus, FailureContext, OodaPhase};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RunEvent {
    PhaseChanged {
        incident_id: String,
        from: OodaPhase,
        to: OodaPhase,
    },
    EvidenceCollected {
        incident_id: String,
        count: usize,
        sources: Vec<String>,
    },
    HypothesisGenerated {
        incident_id: String,
        hypothesis_id: String,
        title: String,
        confidence: f64,
    },
    ActionExecuted {
        incident_id: String,
        action: ActionKind,
        target: String,
        dry_run: bool,
        success: bool,
    },
    VerificationCompleted {
        incident_id: String,
        attempt: u32,
        healthy: bool,
    },
    InvestigationCompleted {
        incident_id: String,
    },
    InvestigationFailed {
        incident_id: String,
        failure: FailureContext,
    },
    InvestigationCancelled {
        incident_id: String,
    },

    CyclePhaseChanged {
        cycle_id: String,
        from: CyclePhase,
        to: CyclePhase,
    },
    RepairAttempted {
        cycle_id: String,
        attempt: u32,
        files_changed: usize,
    },
    CycleCompleted {
        cycle_id: String,
        url: Option<String>,
    },
    CycleFailed {
        cycle_id: String,
        failure: FailureContext,
    },
    CycleCancelled {
        cycle_id: String,
    },

    EvolutionStatusChanged {
        evolution_id: String,
        cycle_id: String,
        status: EvolutionStatus,
    },

    IncidentCreated {
        incident_id: String,
        title: String,
        app_name: Option<String>,
    },
    AnomalySuppressed {
        anomaly_type: String,
        app_name: Option<String>,
        reason: String,
    },
    DetectorError {
        source: AnomalySource,
        consecutive_failures: u32,
        disabled: bool,
        message: String,
    },
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::PhaseChanged { .. } => "phase_changed",
            RunEvent::EvidenceCollected { .. } => "evidence_collected",
            RunEvent::HypothesisGenerated { .. } => "hypothesis_generated",
            RunEvent::ActionExecuted { .. } => "action_executed",
            RunEvent::VerificationCompleted { .. } => "verification_completed",
            RunEvent::InvestigationCompleted { .. } => "investigation_completed",
            RunEvent::InvestigationFailed { .. } => "investigation_failed",
            RunEvent::InvestigationCancelled { .. } => "investigation_cancelled",
            RunEvent::CyclePhaseChanged { .. } => "cycle_phase_changed",
            RunEvent::RepairAttempted { .. } => "repair_attempted",
            RunEvent::CycleCompleted { .. } => "cycle_completed",
            RunEvent::CycleFailed { .. } => "cycle_failed",
            RunEvent::CycleCancelled { .. } => "cycle_cancelled",
            RunEvent::EvolutionStatusChanged { .. } => "evolution_status_changed",
            RunEvent::IncidentCreated { .. } => "incident_created",
            RunEvent::AnomalySuppressed { .. } => "anomaly_suppressed",
            RunEvent::DetectorError { .. } => "detector_error",
        }
    }

    fn is_failure(&self) -> bool {
        matches!(
            self,
            RunEvent::InvestigationFailed { .. } | RunEvent::CycleFailed { .. } | RunEvent::DetectorError { .. }
        )
    }
}

/// Receives run events. Must not block.
pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// The observer set of one run; dropped with it.
#[derive(Clone, Default)]
pub struct Listeners {
    observers: Vec<Arc<dyn RunObserver>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn add(&mut self, observer: Arc<dyn RunObserver>) {
        self.observers.push(observer);
    }

    pub fn emit(&self, event: RunEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
    }
}

pub struct EventBus {
    tx: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: RunEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl RunObserver for EventBus {
    fn on_event(&self, event: &RunEvent) {
        self.publish(event.clone());
    }
}

/// Logs every event as structured JSON.
pub struct TracingObserver;

impl RunObserver for TracingObserver {
    fn on_event(&self, event: &RunEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        if event.is_failure() {
            warn!(event = event.name(), %payload, "run event");
        } else {
            info!(event = event.name(), %payload, "run event");
        }
    }
}

/// Keeps every event in memory. For tests and ad-hoc inspection.
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<RunEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Investigation phases entered, in order.
    pub fn ooda_phases(&self) -> Vec<OodaPhase> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::PhaseChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    pub fn cycle_phases(&self) -> Vec<CyclePhase> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::CyclePhaseChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }
}

impl RunObserver for EventRecorder {
    fn on_event(&self, event: &RunEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listeners_fan_out_in_order() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let recorder = EventRecorder::new();
        let listeners = Listeners::new().with(recorder.clone()).with(bus.clone());

        listeners.emit(RunEvent::PhaseChanged {
            incident_id: "i".into(),
            from: OodaPhase::Idle,
            to: OodaPhase::Observing,
        });
        listeners.emit(RunEvent::InvestigationCompleted { incident_id: "i".into() });

        assert_eq!(recorder.ooda_phases(), vec![OodaPhase::Observing]);
        assert_eq!(rx.recv().await.unwrap().name(), "phase_changed");
        assert_eq!(rx.recv().await.unwrap().name(), "investigation_completed");
    }

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(RunEvent::CycleCancelled { cycle_id: "c".into() }).unwrap();
        assert_eq!(json["type"], "CycleCancelled");
        assert_eq!(json["payload"]["cycle_id"], "c");
    }
}
