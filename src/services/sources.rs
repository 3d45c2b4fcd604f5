//! Inputs the detector and the investigation OBSERVING phase read from:
//! the monitored-application set, evidence collectors and vision frames.

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::{OpsError, OpsResult};
use crate::model::{CyclePhase, Evidence, EvidenceKind, Incident};
use crate::services::metrics::MetricsQuery;
use crate::services::platform::PlatformExecutor;
use crate::services::reasoning::VisionFrame;
use crate::services::repository::CycleRepository;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredApp {
    pub name: String,
    pub namespace: String,
    pub url: Option<String>,
}

#[async_trait]
pub trait AppCatalog: Send + Sync {
    async fn monitored_apps(&self) -> OpsResult<Vec<MonitoredApp>>;
}

/// Fixed list from configuration.
pub struct StaticCatalog {
    apps: Vec<MonitoredApp>,
}

impl StaticCatalog {
    pub fn new(apps: Vec<MonitoredApp>) -> Self {
        Self { apps }
    }
}

#[async_trait]
impl AppCatalog for StaticCatalog {
    async fn monitored_apps(&self) -> OpsResult<Vec<MonitoredApp>> {
        Ok(self.apps.clone())
    }
}

/// Every application a completed development cycle deployed.
pub struct CycleCatalog {
    cycles: Arc<dyn CycleRepository>,
}

impl CycleCatalog {
    pub fn new(cycles: Arc<dyn CycleRepository>) -> Self {
        Self { cycles }
    }
}

#[async_trait]
impl AppCatalog for CycleCatalog {
    async fn monitored_apps(&self) -> OpsResult<Vec<MonitoredApp>> {
        let mut apps: Vec<MonitoredApp> = Vec::new();
        for cycle in self.cycles.list_cycles().await? {
            if cycle.phase != CyclePhase::Completed {
                continue;
            }
            let Some(dep) = cycle.deployment else { continue };
            if apps.iter().any(|a| a.name == dep.name && a.namespace == dep.namespace) {
                continue;
            }
            apps.push(MonitoredApp {
                name: dep.name,
                namespace: dep.namespace,
                url: dep.url,
            });
        }
        Ok(apps)
    }
}

#[async_trait]
pub trait EvidenceCollector: Send + Sync {
    fn name(&self) -> &str;

    /// At most `budget` items.
    async fn collect(&self, incident: &Incident, budget: usize) -> OpsResult<Vec<Evidence>>;
}

/// Range queries over the last window for the incident's app. Templates may
/// use `{app}` and `{namespace}`.
pub struct MetricsEvidenceCollector {
    metrics: Arc<dyn MetricsQuery>,
    queries: Vec<(String, String)>,
    window: Duration,
}

impl MetricsEvidenceCollector {
    pub fn new(metrics: Arc<dyn MetricsQuery>, queries: Vec<(String, String)>) -> Self {
        Self {
            metrics,
            queries,
            window: Duration::from_secs(15 * 60),
        }
    }

    pub fn default_queries() -> Vec<(String, String)> {
        vec![
            (
                "error_rate".to_string(),
                r#"sum(rate(http_requests_total{app="{app}",namespace="{namespace}",status=~"5.."}[5m])) / sum(rate(http_requests_total{app="{app}",namespace="{namespace}"}[5m]))"#.to_string(),
            ),
            (
                "p95_latency_seconds".to_string(),
                r#"histogram_quantile(0.95, sum(rate(http_request_duration_seconds_bucket{app="{app}",namespace="{namespace}"}[5m])) by (le))"#.to_string(),
            ),
            (
                "restarts".to_string(),
                r#"sum(increase(kube_pod_container_status_restarts_total{namespace="{namespace}",pod=~"{app}.*"}[15m]))"#.to_string(),
            ),
        ]
    }
}

#[async_trait]
impl EvidenceCollector for MetricsEvidenceCollector {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn collect(&self, incident: &Incident, budget: usize) -> OpsResult<Vec<Evidence>> {
        let app = incident.target();
        let end = Utc::now();
        let start = end - chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::minutes(15));
        let mut out = Vec::new();

        for (label, template) in self.queries.iter().take(budget) {
            let query = template.replace("{app}", &app).replace("{namespace}", &incident.namespace);
            let series = match self.metrics.range(&query, start, end, Duration::from_secs(60)).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(incident_id = %incident.id, metric = %label, error = %e, "metric unavailable, skipping");
                    continue;
                }
            };
            let values: Vec<f64> = series.iter().flat_map(|s| s.points.iter().map(|p| p.1)).collect();
            let Some(last) = values.last().copied() else { continue };
            let max = values.iter().copied().fold(f64::MIN, f64::max);
            out.push(Evidence::new(
                &incident.id,
                EvidenceKind::Metrics,
                self.name(),
                format!("{}: last={:.4} max={:.4} over {}m", label, last, max, self.window.as_secs() / 60),
                json!({ "metric": label, "query": query, "last": last, "max": max, "points": values.len() }),
            ));
        }
        Ok(out)
    }
}

/// Current replica state of the incident's target on the platform.
pub struct PlatformEvidenceCollector {
    executor: Arc<dyn PlatformExecutor>,
}

impl PlatformEvidenceCollector {
    pub fn new(executor: Arc<dyn PlatformExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl EvidenceCollector for PlatformEvidenceCollector {
    fn name(&self) -> &str {
        "platform"
    }

    async fn collect(&self, incident: &Incident, budget: usize) -> OpsResult<Vec<Evidence>> {
        let app = incident.target();
        let targets = self.executor.list_targets(&incident.namespace).await?;
        Ok(targets
            .into_iter()
            .filter(|t| t.name == app)
            .take(budget)
            .map(|t| {
                Evidence::new(
                    &incident.id,
                    EvidenceKind::Platform,
                    self.name(),
                    format!(
                        "{} {}: {}/{} replicas ready",
                        t.kind,
                        t.name,
                        t.ready_replicas.unwrap_or(0),
                        t.replicas.unwrap_or(0)
                    ),
                    json!(t),
                )
            })
            .collect())
    }
}

#[async_trait]
pub trait FrameSource: Send + Sync {
    /// `None` when the app has nothing to look at.
    async fn capture(&self, app: &MonitoredApp) -> OpsResult<Option<VisionFrame>>;
}

/// Fetches a PNG of the app's URL from an HTTP screenshot service
/// (`GET {endpoint}?url=...`).
pub struct ScreenshotServiceSource {
    client: Client,
    endpoint: String,
}

impl ScreenshotServiceSource {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> OpsResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OpsError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl FrameSource for ScreenshotServiceSource {
    async fn capture(&self, app: &MonitoredApp) -> OpsResult<Option<VisionFrame>> {
        let Some(url) = &app.url else { return Ok(None) };
        let res = self
            .client
            .get(&self.endpoint)
            .query(&[("url", url.as_str())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| OpsError::transient("screenshots", e))?;
        let bytes = res.bytes().await.map_err(|e| OpsError::transient("screenshots", e))?;
        Ok(Some(VisionFrame {
            app_name: app.name.clone(),
            namespace: app.namespace.clone(),
            url: url.clone(),
            image_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
        }))
    }
}
