//! Hybrid Anomaly Detector
//!
//! Two independent polling loops over the monitored-application set: a fast
//! structured-metrics loop and a slower vision loop. Both normalize their
//! output into [`AnomalySignal`] and hand admitted signals to an
//! [`AnomalyHandler`]. Each loop disables itself after too many consecutive
//! failures without affecting its sibling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{OpsError, OpsResult};
use crate::model::{AnomalySignal, AnomalySource, Severity};
use crate::orchestrator::event_bus::{Listeners, RunEvent};
use crate::services::metrics::MetricsQuery;
use crate::services::reasoning::ReasoningService;
use crate::services::sources::{AppCatalog, FrameSource, MonitoredApp};
use crate::utils::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Above,
    Below,
}

/// A threshold check run against every monitored app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRule {
    pub anomaly_type: String,
    /// PromQL with `{app}` and `{namespace}` placeholders.
    pub query: String,
    pub comparison: Comparison,
    pub threshold: f64,
    pub severity: Severity,
    /// `{value}` and `{threshold}` are filled in.
    pub description: String,
    /// Render values as percentages of 1.0.
    #[serde(default)]
    pub percent: bool,
}

impl MetricRule {
    pub fn breached(&self, value: f64) -> bool {
        match self.comparison {
            Comparison::Above => value > self.threshold,
            Comparison::Below => value < self.threshold,
        }
    }

    fn render(&self, value: f64) -> String {
        let fmt = |v: f64| {
            if self.percent {
                format!("{:.0}%", v * 100.0)
            } else if v.fract() == 0.0 {
                format!("{:.0}", v)
            } else {
                format!("{:.2}", v)
            }
        };
        self.description
            .replace("{value}", &fmt(value))
            .replace("{threshold}", &fmt(self.threshold))
    }

    pub fn default_rules() -> Vec<MetricRule> {
        vec![
            MetricRule {
                anomaly_type: "high_error_rate".into(),
                query: r#"sum(rate(http_requests_total{app="{app}",namespace="{namespace}",status=~"5.."}[5m])) / sum(rate(http_requests_total{app="{app}",namespace="{namespace}"}[5m]))"#.into(),
                comparison: Comparison::Above,
                threshold: 0.05,
                severity: Severity::High,
                description: "Error rate {value} exceeds {threshold} threshold".into(),
                percent: true,
            },
            MetricRule {
                anomaly_type: "high_latency".into(),
                query: r#"histogram_quantile(0.95, sum(rate(http_request_duration_seconds_bucket{app="{app}",namespace="{namespace}"}[5m])) by (le))"#.into(),
                comparison: Comparison::Above,
                threshold: 2.0,
                severity: Severity::Medium,
                description: "p95 latency {value}s exceeds {threshold}s".into(),
                percent: false,
            },
            MetricRule {
                anomaly_type: "pod_restarts".into(),
                query: r#"sum(increase(kube_pod_container_status_restarts_total{namespace="{namespace}",pod=~"{app}.*"}[15m]))"#.into(),
                comparison: Comparison::Above,
                threshold: 3.0,
                severity: Severity::High,
                description: "Containers restarted {value} times in 15m".into(),
                percent: false,
            },
            MetricRule {
                anomaly_type: "service_down".into(),
                query: r#"min(up{app="{app}",namespace="{namespace}"})"#.into(),
                comparison: Comparison::Below,
                threshold: 1.0,
                severity: Severity::Critical,
                description: "Service is not answering scrapes".into(),
                percent: false,
            },
        ]
    }
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub metrics_interval: Duration,
    pub vision_interval: Duration,
    pub max_consecutive_failures: u32,
    pub min_severity: Severity,
    pub min_vision_confidence: f64,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            metrics_interval: Duration::from_secs(15),
            vision_interval: Duration::from_secs(30),
            max_consecutive_failures: 5,
            min_severity: Severity::Medium,
            min_vision_confidence: 0.7,
        }
    }
}

/// Receives every admitted signal.
#[async_trait]
pub trait AnomalyHandler: Send + Sync {
    async fn handle(&self, signal: AnomalySignal) -> OpsResult<()>;
}

#[derive(Default)]
struct LoopHealth {
    consecutive_failures: AtomicU32,
    disabled: AtomicBool,
}

impl LoopHealth {
    fn succeed(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    fn fail(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub struct HybridAnomalyDetector {
    settings: DetectorSettings,
    rules: Vec<MetricRule>,
    catalog: Arc<dyn AppCatalog>,
    metrics: Arc<dyn MetricsQuery>,
    frames: Option<Arc<dyn FrameSource>>,
    reasoning: Arc<dyn ReasoningService>,
    listeners: Listeners,
    metrics_health: LoopHealth,
    vision_health: LoopHealth,
}

impl HybridAnomalyDetector {
    pub fn new(
        settings: DetectorSettings,
        catalog: Arc<dyn AppCatalog>,
        metrics: Arc<dyn MetricsQuery>,
        reasoning: Arc<dyn ReasoningService>,
    ) -> Self {
        Self {
            settings,
            rules: MetricRule::default_rules(),
            catalog,
            metrics,
            frames: None,
            reasoning,
            listeners: Listeners::new(),
            metrics_health: LoopHealth::default(),
            vision_health: LoopHealth::default(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<MetricRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Without a frame source the vision loop finds nothing.
    pub fn with_frames(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = Some(frames);
        self
    }

    pub fn with_listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    fn health(&self, source: AnomalySource) -> &LoopHealth {
        match source {
            AnomalySource::Metrics => &self.metrics_health,
            AnomalySource::Vision => &self.vision_health,
        }
    }

    pub fn is_disabled(&self, source: AnomalySource) -> bool {
        self.health(source).disabled.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self, source: AnomalySource) -> u32 {
        self.health(source).consecutive_failures.load(Ordering::SeqCst)
    }

    /// One pass of the metrics modality. Individual query failures are "no
    /// data"; the pass fails only when the catalog is unavailable or every
    /// query failed.
    pub async fn poll_metrics(&self) -> OpsResult<Vec<AnomalySignal>> {
        let apps = self.catalog.monitored_apps().await?;
        let mut signals = Vec::new();
        let mut attempted = 0usize;
        let mut failed = 0usize;
        let mut last_error = None;

        for app in &apps {
            for rule in &self.rules {
                let query = rule.query.replace("{app}", &app.name).replace("{namespace}", &app.namespace);
                attempted += 1;
                let samples = match self.metrics.instant(&query).await {
                    Ok(s) => s,
                    Err(e) => {
                        failed += 1;
                        last_error = Some(e);
                        continue;
                    }
                };
                for sample in samples {
                    if !sample.value.is_finite() || !rule.breached(sample.value) {
                        continue;
                    }
                    signals.push(
                        AnomalySignal::new(&rule.anomaly_type, rule.severity, rule.render(sample.value), AnomalySource::Metrics)
                            .for_app(&app.name, &app.namespace)
                            .with_data(json!({
                                "query": query,
                                "value": sample.value,
                                "threshold": rule.threshold,
                                "labels": sample.labels,
                            })),
                    );
                }
            }
        }

        if attempted > 0 && failed == attempted {
            return Err(last_error.unwrap_or_else(|| OpsError::transient("metrics", "all queries failed")));
        }
        Ok(signals)
    }

    /// One pass of the vision modality.
    pub async fn poll_vision(&self) -> OpsResult<Vec<AnomalySignal>> {
        let Some(frames) = &self.frames else {
            return Ok(Vec::new());
        };
        let apps = self.catalog.monitored_apps().await?;
        let mut signals = Vec::new();
        let mut attempted = 0usize;
        let mut failed = 0usize;
        let mut last_error = None;

        for app in &apps {
            attempted += 1;
            match self.inspect(frames.as_ref(), app).await {
                Ok(found) => signals.extend(found),
                Err(e) => {
                    debug!(app = %app.name, error = %e, "vision inspection failed");
                    failed += 1;
                    last_error = Some(e);
                }
            }
        }

        if attempted > 0 && failed == attempted {
            return Err(last_error.unwrap_or_else(|| OpsError::transient("vision", "all inspections failed")));
        }
        Ok(signals)
    }

    async fn inspect(&self, frames: &dyn FrameSource, app: &MonitoredApp) -> OpsResult<Vec<AnomalySignal>> {
        let Some(frame) = frames.capture(app).await? else {
            return Ok(Vec::new());
        };
        let findings = self.reasoning.analyze_frame(&frame).await?.data;
        Ok(findings
            .into_iter()
            .map(|f| {
                AnomalySignal::new(f.anomaly_type, f.severity, f.description, AnomalySource::Vision)
                    .for_app(&app.name, &app.namespace)
                    .with_confidence(f.confidence)
                    .with_data(json!({ "url": frame.url }))
            })
            .collect())
    }

    /// Minimum severity for both modalities, minimum confidence for vision.
    pub fn admits(&self, signal: &AnomalySignal) -> bool {
        if signal.severity < self.settings.min_severity {
            return false;
        }
        match signal.source {
            AnomalySource::Metrics => true,
            AnomalySource::Vision => signal.confidence >= self.settings.min_vision_confidence,
        }
    }

    /// One tick of a loop. Returns false once the loop has disabled itself.
    pub async fn tick(&self, source: AnomalySource, handler: &dyn AnomalyHandler) -> bool {
        if self.is_disabled(source) {
            return false;
        }
        let polled = match source {
            AnomalySource::Metrics => self.poll_metrics().await,
            AnomalySource::Vision => self.poll_vision().await,
        };
        let health = self.health(source);

        match polled {
            Ok(signals) => {
                health.succeed();
                for signal in signals.into_iter().filter(|s| self.admits(s)) {
                    let anomaly_type = signal.anomaly_type.clone();
                    if let Err(e) = handler.handle(signal).await {
                        warn!(%source, anomaly_type = %anomaly_type, error = %e, "anomaly handler failed");
                    }
                }
                true
            }
            Err(e) => {
                let failures = health.fail();
                let disabled = failures >= self.settings.max_consecutive_failures;
                if disabled {
                    health.disabled.store(true, Ordering::SeqCst);
                    error!(%source, failures, error = %e, "detector loop disabled after consecutive failures");
                } else {
                    warn!(%source, failures, error = %e, "detector poll failed");
                }
                self.listeners.emit(RunEvent::DetectorError {
                    source,
                    consecutive_failures: failures,
                    disabled,
                    message: e.to_string(),
                });
                !disabled
            }
        }
    }

    /// Spawn both loops. They stop on cancellation or self-disable.
    pub fn start(self: &Arc<Self>, handler: Arc<dyn AnomalyHandler>, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.spawn_loop(AnomalySource::Metrics, self.settings.metrics_interval, handler.clone(), token.clone())];
        if self.frames.is_some() {
            handles.push(self.spawn_loop(AnomalySource::Vision, self.settings.vision_interval, handler, token));
        }
        handles
    }

    fn spawn_loop(
        self: &Arc<Self>,
        source: AnomalySource,
        every: Duration,
        handler: Arc<dyn AnomalyHandler>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            info!(%source, interval_secs = every.as_secs(), "detector loop started");
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !detector.tick(source, handler.as_ref()).await {
                            break;
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
            info!(%source, "detector loop stopped");
        })
    }
}
