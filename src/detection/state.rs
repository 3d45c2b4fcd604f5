//! Detection & Cooldown State
//!
//! Process-wide, in-memory admission control for anomaly signals. Decides
//! whether a signal becomes a new incident and bounds incident storms.
//!
//! Every entry carries its own expiry and is treated as absent once expired,
//! whether or not the sweeper has run yet. The sweeper only bounds memory.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{OpsError, OpsResult};
use crate::model::Severity;
use crate::utils::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct DetectionLimits {
    pub max_concurrent_investigations: usize,
    pub fingerprint_cooldown: Duration,
    pub app_cooldown: Duration,
    pub pending_evolution_ttl: Duration,
    pub description_chars: usize,
}

impl Default for DetectionLimits {
    fn default() -> Self {
        Self {
            max_concurrent_investigations: 3,
            fingerprint_cooldown: Duration::from_secs(5 * 60),
            app_cooldown: Duration::from_secs(10 * 60),
            pending_evolution_ttl: Duration::from_secs(30 * 60),
            description_chars: 100,
        }
    }
}

/// Why a signal did not become an incident. Checked in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionReason {
    ConcurrencyCap,
    AppCooldown,
    PendingEvolution,
    DuplicateFingerprint,
}

impl fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SuppressionReason::ConcurrencyCap => "concurrent investigation limit reached",
            SuppressionReason::AppCooldown => "app is in post-investigation cooldown",
            SuppressionReason::PendingEvolution => "app has a code fix in flight",
            SuppressionReason::DuplicateFingerprint => "duplicate of a recent anomaly",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerDecision {
    Trigger { fingerprint: String },
    Suppressed(SuppressionReason),
}

impl TriggerDecision {
    pub fn is_trigger(&self) -> bool {
        matches!(self, TriggerDecision::Trigger { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectionStats {
    pub recent_anomalies: usize,
    pub active_investigations: usize,
    pub app_cooldowns: usize,
    pub pending_evolutions: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub fingerprints: usize,
    pub app_cooldowns: usize,
    pub pending_evolutions: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.fingerprints + self.app_cooldowns + self.pending_evolutions
    }
}

struct SeenAnomaly {
    expires_at: Instant,
    incident_id: String,
}

struct PendingEvolution {
    evolution_id: String,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    recent: HashMap<String, SeenAnomaly>,
    active: HashSet<String>,
    app_cooldowns: HashMap<String, Instant>,
    pending_evolutions: HashMap<String, PendingEvolution>,
}

/// Normalized key for (app, type, description): case-folded, whitespace
/// collapsed, digit runs replaced so "42%" and "43%" collide, then truncated.
/// Rule descriptions are shared across apps, so the app is part of the key.
pub fn fingerprint(app_name: Option<&str>, anomaly_type: &str, description: &str, max_chars: usize) -> String {
    let mut normalized = String::with_capacity(description.len());
    let mut last_space = false;
    let mut last_digit = false;
    for c in description.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_digit() {
            if !last_digit {
                normalized.push('#');
            }
            last_digit = true;
            last_space = false;
            continue;
        }
        last_digit = false;
        if c.is_whitespace() {
            if !last_space {
                normalized.push(' ');
            }
            last_space = true;
        } else {
            normalized.push(c);
            last_space = false;
        }
    }
    let truncated: String = normalized.chars().take(max_chars).collect();

    let mut hasher = Sha256::new();
    hasher.update(app_name.unwrap_or("").trim().to_lowercase().as_bytes());
    hasher.update(b":");
    hasher.update(anomaly_type.trim().to_lowercase().as_bytes());
    hasher.update(b":");
    hasher.update(truncated.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct DetectionState {
    limits: DetectionLimits,
    inner: Mutex<Inner>,
}

impl DetectionState {
    pub fn new(limits: DetectionLimits) -> Self {
        Self {
            limits,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn limits(&self) -> DetectionLimits {
        self.limits
    }

    pub async fn should_trigger_incident(
        &self,
        anomaly_type: &str,
        severity: Severity,
        description: &str,
        app_name: Option<&str>,
    ) -> TriggerDecision {
        let now = Instant::now();
        let inner = self.inner.lock().await;

        let decision = if inner.active.len() >= self.limits.max_concurrent_investigations {
            TriggerDecision::Suppressed(SuppressionReason::ConcurrencyCap)
        } else if app_name.is_some_and(|app| inner.app_cooldowns.get(app).is_some_and(|until| *until > now)) {
            TriggerDecision::Suppressed(SuppressionReason::AppCooldown)
        } else if app_name.is_some_and(|app| inner.pending_evolutions.get(app).is_some_and(|p| p.expires_at > now)) {
            TriggerDecision::Suppressed(SuppressionReason::PendingEvolution)
        } else {
            let fp = fingerprint(app_name, anomaly_type, description, self.limits.description_chars);
            match inner.recent.get(&fp) {
                Some(seen) if seen.expires_at > now => TriggerDecision::Suppressed(SuppressionReason::DuplicateFingerprint),
                _ => TriggerDecision::Trigger { fingerprint: fp },
            }
        };

        if let TriggerDecision::Suppressed(reason) = &decision {
            debug!(anomaly_type, %severity, app = app_name.unwrap_or("-"), %reason, "anomaly suppressed");
        }
        decision
    }

    /// Start the fingerprint cooldown for a signal that produced `incident_id`.
    pub async fn record_anomaly(&self, anomaly_type: &str, description: &str, app_name: Option<&str>, incident_id: &str) {
        let fp = fingerprint(app_name, anomaly_type, description, self.limits.description_chars);
        self.inner.lock().await.recent.insert(
            fp,
            SeenAnomaly {
                expires_at: Instant::now() + self.limits.fingerprint_cooldown,
                incident_id: incident_id.to_string(),
            },
        );
    }

    /// Incident behind a live fingerprint, if any.
    pub async fn incident_for(&self, anomaly_type: &str, description: &str, app_name: Option<&str>) -> Option<String> {
        let fp = fingerprint(app_name, anomaly_type, description, self.limits.description_chars);
        let inner = self.inner.lock().await;
        inner
            .recent
            .get(&fp)
            .filter(|s| s.expires_at > Instant::now())
            .map(|s| s.incident_id.clone())
    }

    /// False when the incident was already counted.
    pub async fn start_investigation(&self, incident_id: &str) -> bool {
        self.inner.lock().await.active.insert(incident_id.to_string())
    }

    /// Take a slot for a run started outside detection, refusing when the cap
    /// is reached or the incident is already being investigated.
    pub async fn admit_investigation(&self, incident_id: &str) -> OpsResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.active.contains(incident_id) {
            return Err(OpsError::ResourceLimit(format!("incident {} is already being investigated", incident_id)));
        }
        let cap = self.limits.max_concurrent_investigations;
        if inner.active.len() >= cap {
            return Err(OpsError::ResourceLimit(format!("{} investigations already running", cap)));
        }
        inner.active.insert(incident_id.to_string());
        Ok(())
    }

    /// Free the concurrency slot and start the app cooldown (the configured
    /// default when `cooldown` is `None`).
    pub async fn complete_investigation(&self, incident_id: &str, app_name: Option<&str>, cooldown: Option<Duration>) {
        let mut inner = self.inner.lock().await;
        inner.active.remove(incident_id);
        if let Some(app) = app_name {
            let until = Instant::now() + cooldown.unwrap_or(self.limits.app_cooldown);
            inner.app_cooldowns.insert(app.to_string(), until);
            debug!(incident_id, app, "app cooldown started");
        }
    }

    pub async fn register_pending_evolution(&self, app_name: &str, evolution_id: &str) {
        self.inner.lock().await.pending_evolutions.insert(
            app_name.to_string(),
            PendingEvolution {
                evolution_id: evolution_id.to_string(),
                expires_at: Instant::now() + self.limits.pending_evolution_ttl,
            },
        );
        info!(app = app_name, evolution_id, "detection paused for app while fix is in flight");
    }

    pub async fn clear_pending_evolution(&self, app_name: &str) {
        if self.inner.lock().await.pending_evolutions.remove(app_name).is_some() {
            info!(app = app_name, "pending evolution cleared");
        }
    }

    pub async fn has_pending_evolution(&self, app_name: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .pending_evolutions
            .get(app_name)
            .is_some_and(|p| p.expires_at > Instant::now())
    }

    pub async fn pending_evolution_id(&self, app_name: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .pending_evolutions
            .get(app_name)
            .filter(|p| p.expires_at > Instant::now())
            .map(|p| p.evolution_id.clone())
    }

    /// Drop every expired entry.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;

        let before = (inner.recent.len(), inner.app_cooldowns.len(), inner.pending_evolutions.len());
        inner.recent.retain(|_, s| s.expires_at > now);
        inner.app_cooldowns.retain(|_, until| *until > now);
        inner.pending_evolutions.retain(|_, p| p.expires_at > now);

        SweepReport {
            fingerprints: before.0 - inner.recent.len(),
            app_cooldowns: before.1 - inner.app_cooldowns.len(),
            pending_evolutions: before.2 - inner.pending_evolutions.len(),
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, token: CancellationToken) -> JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = state.sweep().await;
                        if report.total() > 0 {
                            debug!(?report, "detection state swept");
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
        })
    }

    /// Raw map sizes, expired entries included until the next sweep.
    pub async fn stats(&self) -> DetectionStats {
        let inner = self.inner.lock().await;
        DetectionStats {
            recent_anomalies: inner.recent.len(),
            active_investigations: inner.active.len(),
            app_cooldowns: inner.app_cooldowns.len(),
            pending_evolutions: inner.pending_evolutions.len(),
        }
    }
}

impl Default for DetectionState {
    fn default() -> Self {
        Self::new(DetectionLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE: &str = "high_error_rate";
    const DESC: &str = "Error rate 42% exceeds 5% threshold";

    #[test]
    fn test_fingerprint_normalization() {
        let app = Some("checkout-svc");
        let a = fingerprint(app, TYPE, DESC, 100);
        assert_eq!(a, fingerprint(Some("Checkout-Svc"), "HIGH_ERROR_RATE", "error  rate 43%  exceeds 5% threshold ", 100));
        assert_ne!(a, fingerprint(app, "high_latency", DESC, 100));
        assert_ne!(a, fingerprint(Some("cart"), TYPE, DESC, 100));
        assert_ne!(a, fingerprint(None, TYPE, DESC, 100));
        // differences past the truncation point are ignored
        assert_eq!(fingerprint(app, TYPE, "abcdef-1", 6), fingerprint(app, TYPE, "abcdef-2", 6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fingerprint_cooldown_expires() {
        let state = DetectionState::default();
        assert!(state.should_trigger_incident(TYPE, Severity::High, DESC, Some("checkout-svc")).await.is_trigger());
        state.record_anomaly(TYPE, DESC, Some("checkout-svc"), "inc-1").await;
        assert_eq!(
            state.should_trigger_incident(TYPE, Severity::High, DESC, Some("checkout-svc")).await,
            TriggerDecision::Suppressed(SuppressionReason::DuplicateFingerprint)
        );
        assert_eq!(
            state.incident_for(TYPE, DESC, Some("checkout-svc")).await.as_deref(),
            Some("inc-1")
        );
        // the same breach on another app is a separate incident
        assert!(state.should_trigger_incident(TYPE, Severity::High, DESC, Some("cart")).await.is_trigger());

        tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
        assert!(state.should_trigger_incident(TYPE, Severity::High, DESC, Some("checkout-svc")).await.is_trigger());
    }

    #[tokio::test(start_paused = true)]
    async fn test_suppression_order() {
        let state = DetectionState::new(DetectionLimits {
            max_concurrent_investigations: 1,
            ..DetectionLimits::default()
        });
        state.record_anomaly(TYPE, DESC, Some("checkout-svc"), "inc-1").await;
        state.register_pending_evolution("checkout-svc", "evo-1").await;
        state.complete_investigation("inc-0", Some("checkout-svc"), None).await;
        state.start_investigation("inc-1").await;

        let check = || state.should_trigger_incident(TYPE, Severity::Critical, DESC, Some("checkout-svc"));
        assert_eq!(check().await, TriggerDecision::Suppressed(SuppressionReason::ConcurrencyCap));

        state.complete_investigation("inc-1", None, None).await;
        assert_eq!(check().await, TriggerDecision::Suppressed(SuppressionReason::AppCooldown));

        tokio::time::advance(Duration::from_secs(10 * 60 + 1)).await;
        assert_eq!(check().await, TriggerDecision::Suppressed(SuppressionReason::PendingEvolution));

        state.clear_pending_evolution("checkout-svc").await;
        state.record_anomaly(TYPE, DESC, Some("checkout-svc"), "inc-1").await;
        assert_eq!(check().await, TriggerDecision::Suppressed(SuppressionReason::DuplicateFingerprint));
    }

    #[tokio::test]
    async fn test_admitted_runs_count_against_the_cap() {
        let state = DetectionState::new(DetectionLimits {
            max_concurrent_investigations: 2,
            ..DetectionLimits::default()
        });
        state.start_investigation("inc-1").await;
        assert!(matches!(state.admit_investigation("inc-1").await, Err(OpsError::ResourceLimit(_))));
        state.admit_investigation("inc-2").await.unwrap();
        assert!(matches!(state.admit_investigation("inc-3").await, Err(OpsError::ResourceLimit(_))));
        assert_eq!(
            state.should_trigger_incident(TYPE, Severity::High, DESC, None).await,
            TriggerDecision::Suppressed(SuppressionReason::ConcurrencyCap)
        );

        state.complete_investigation("inc-2", None, None).await;
        state.admit_investigation("inc-3").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_evolution_self_expires() {
        let state = DetectionState::default();
        state.register_pending_evolution("checkout-svc", "evo-1").await;
        assert!(state.has_pending_evolution("checkout-svc").await);

        tokio::time::advance(Duration::from_secs(29 * 60)).await;
        assert!(state.has_pending_evolution("checkout-svc").await);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!state.has_pending_evolution("checkout-svc").await);
        assert!(state
            .should_trigger_incident(TYPE, Severity::High, DESC, Some("checkout-svc"))
            .await
            .is_trigger());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_bounds_memory() {
        let state = DetectionState::default();
        for i in 0..50 {
            state.record_anomaly(TYPE, &format!("disk {} full on node-{}", i, "x".repeat(i)), None, "inc").await;
        }
        state.complete_investigation("inc", Some("a"), Some(Duration::from_secs(1))).await;
        state.register_pending_evolution("b", "evo").await;
        assert!(state.stats().await.recent_anomalies > 1);

        tokio::time::advance(Duration::from_secs(31 * 60)).await;
        let report = state.sweep().await;
        assert_eq!(report.app_cooldowns, 1);
        assert_eq!(report.pending_evolutions, 1);
        assert_eq!(state.stats().await, DetectionStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_cancel() {
        let state = Arc::new(DetectionState::default());
        let token = CancellationToken::new();
        let handle = state.spawn_sweeper(Duration::from_secs(60), token.clone());
        state.record_anomaly(TYPE, DESC, None, "inc").await;

        tokio::time::sleep(Duration::from_secs(6 * 60 + 30)).await;
        assert_eq!(state.stats().await.recent_anomalies, 0);

        token.cancel();
        handle.await.unwrap();
    }
}
