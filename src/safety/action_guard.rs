//! Action Guard
//!
//! Wraps a platform executor with the per-incident limits every remediation
//! must respect: forced dry-run, a maximum number of actions and a cooldown
//! between consecutive actions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{OpsError, OpsResult};
use crate::services::platform::{ActionOutcome, ActionRequest, HealthReport, PlatformExecutor, RemediationTarget};

#[derive(Debug, Clone, Copy)]
pub struct GuardLimits {
    pub dry_run: bool,
    pub max_actions: u32,
    pub cooldown: Duration,
}

#[derive(Clone, Copy)]
struct Ledger {
    count: u32,
    last: Instant,
}

pub struct ActionGuard {
    inner: Arc<dyn PlatformExecutor>,
    limits: GuardLimits,
    ledgers: Mutex<HashMap<String, Ledger>>,
}

impl ActionGuard {
    pub fn new(inner: Arc<dyn PlatformExecutor>, limits: GuardLimits) -> Self {
        Self {
            inner,
            limits,
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> GuardLimits {
        self.limits
    }

    /// Actions still allowed for the incident.
    pub async fn remaining(&self, incident_id: &str) -> u32 {
        let ledgers = self.ledgers.lock().await;
        let used = ledgers.get(incident_id).map(|l| l.count).unwrap_or(0);
        self.limits.max_actions.saturating_sub(used)
    }

    /// How long until the cooldown lets the next action through.
    pub async fn ready_in(&self, incident_id: &str) -> Duration {
        let ledgers = self.ledgers.lock().await;
        match ledgers.get(incident_id) {
            Some(l) => self.limits.cooldown.saturating_sub(l.last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Count one action against the incident's budget, or refuse it.
    pub async fn admit(&self, incident_id: &str) -> OpsResult<()> {
        self.reserve(incident_id).await.map(|_| ())
    }

    /// Like `admit`, returning the ledger as it was so a call that never
    /// reached the platform can be refunded.
    async fn reserve(&self, incident_id: &str) -> OpsResult<Option<Ledger>> {
        let mut ledgers = self.ledgers.lock().await;
        let previous = ledgers.get(incident_id).copied();
        if let Some(ledger) = previous {
            if ledger.count >= self.limits.max_actions {
                return Err(OpsError::ResourceLimit(format!(
                    "incident {} already used {} of {} actions",
                    incident_id, ledger.count, self.limits.max_actions
                )));
            }
            let wait = self.limits.cooldown.saturating_sub(ledger.last.elapsed());
            if !wait.is_zero() {
                return Err(OpsError::ResourceLimit(format!(
                    "incident {} is in action cooldown for another {}s",
                    incident_id,
                    wait.as_secs()
                )));
            }
        }
        ledgers.insert(
            incident_id.to_string(),
            Ledger {
                count: previous.map(|l| l.count).unwrap_or(0) + 1,
                last: Instant::now(),
            },
        );
        Ok(previous)
    }

    async fn refund(&self, incident_id: &str, previous: Option<Ledger>) {
        let mut ledgers = self.ledgers.lock().await;
        match previous {
            Some(ledger) => {
                ledgers.insert(incident_id.to_string(), ledger);
            }
            None => {
                ledgers.remove(incident_id);
            }
        }
    }

    /// Drop the ledger once the incident's run is over.
    pub async fn forget(&self, incident_id: &str) {
        self.ledgers.lock().await.remove(incident_id);
    }
}

#[async_trait]
impl PlatformExecutor for ActionGuard {
    async fn list_targets(&self, namespace: &str) -> OpsResult<Vec<RemediationTarget>> {
        self.inner.list_targets(namespace).await
    }

    async fn execute(&self, request: &ActionRequest) -> OpsResult<ActionOutcome> {
        let previous = self.reserve(&request.incident_id).await?;

        let mut guarded = request.clone();
        if self.limits.dry_run && !guarded.dry_run {
            info!(incident_id = %request.incident_id, action = %request.kind, "dry-run mode, not mutating the platform");
            guarded.dry_run = true;
        }
        let outcome = match self.inner.execute(&guarded).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_transient() {
                    self.refund(&request.incident_id, previous).await;
                }
                return Err(e);
            }
        };
        if !outcome.success {
            warn!(incident_id = %request.incident_id, action = %request.kind, "action reported failure: {}", outcome.message);
        }
        Ok(outcome)
    }

    async fn check_health(&self, target: &str, namespace: &str) -> OpsResult<HealthReport> {
        self.inner.check_health(target, namespace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ActionKind;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingExecutor {
        calls: AtomicU32,
        saw_dry_run: std::sync::Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl PlatformExecutor for CountingExecutor {
        async fn list_targets(&self, _ns: &str) -> OpsResult<Vec<RemediationTarget>> {
            Ok(vec![])
        }
        async fn execute(&self, request: &ActionRequest) -> OpsResult<ActionOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.saw_dry_run.lock().unwrap().push(request.dry_run);
            Ok(ActionOutcome::ok("done", request.dry_run))
        }
        async fn check_health(&self, _t: &str, _ns: &str) -> OpsResult<HealthReport> {
            Ok(HealthReport::healthy(Value::Null))
        }
    }

    fn request(incident: &str) -> ActionRequest {
        ActionRequest {
            incident_id: incident.into(),
            kind: ActionKind::Restart,
            target: "checkout-svc".into(),
            namespace: "shop".into(),
            parameters: json!({}),
            dry_run: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_and_action_bound() {
        let inner = Arc::new(CountingExecutor::default());
        let guard = ActionGuard::new(
            inner.clone(),
            GuardLimits {
                dry_run: true,
                max_actions: 2,
                cooldown: Duration::from_secs(60),
            },
        );

        guard.execute(&request("i1")).await.unwrap();
        assert!(matches!(guard.execute(&request("i1")).await, Err(OpsError::ResourceLimit(_))));
        // other incidents are independent
        guard.execute(&request("i2")).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(guard.ready_in("i1").await, Duration::ZERO);
        guard.execute(&request("i1")).await.unwrap();
        assert_eq!(guard.remaining("i1").await, 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(guard.execute(&request("i1")).await, Err(OpsError::ResourceLimit(_))));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert!(inner.saw_dry_run.lock().unwrap().iter().all(|d| *d));
    }

    struct FlakyExecutor;

    #[async_trait]
    impl PlatformExecutor for FlakyExecutor {
        async fn list_targets(&self, _ns: &str) -> OpsResult<Vec<RemediationTarget>> {
            Ok(vec![])
        }
        async fn execute(&self, _request: &ActionRequest) -> OpsResult<ActionOutcome> {
            Err(OpsError::transient("kubectl", "connection reset"))
        }
        async fn check_health(&self, _t: &str, _ns: &str) -> OpsResult<HealthReport> {
            Ok(HealthReport::unhealthy(Value::Null))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_refunded() {
        let guard = ActionGuard::new(
            Arc::new(FlakyExecutor),
            GuardLimits {
                dry_run: true,
                max_actions: 1,
                cooldown: Duration::from_secs(60),
            },
        );
        assert!(guard.execute(&request("i1")).await.unwrap_err().is_transient());
        assert_eq!(guard.remaining("i1").await, 1);
        assert_eq!(guard.ready_in("i1").await, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_forget_resets_ledger() {
        let guard = ActionGuard::new(
            Arc::new(CountingExecutor::default()),
            GuardLimits {
                dry_run: false,
                max_actions: 1,
                cooldown: Duration::ZERO,
            },
        );
        guard.execute(&request("i1")).await.unwrap();
        assert_eq!(guard.remaining("i1").await, 0);
        guard.forget("i1").await;
        assert_eq!(guard.remaining("i1").await, 1);
    }
}
