//! Normalized anomaly signals produced by either detection modality.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySource {
    Metrics,
    Vision,
}

impl fmt::Display for AnomalySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnomalySource::Metrics => write!(f, "metrics"),
            AnomalySource::Vision => write!(f, "vision"),
        }
    }
}

/// Common severity/confidence shape both detectors normalize into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalySignal {
    pub anomaly_type: String,
    pub severity: Severity,
    /// 0.0..=1.0. Metric threshold breaches are certain (1.0).
    pub confidence: f64,
    pub description: String,
    pub app_name: Option<String>,
    pub namespace: String,
    pub source: AnomalySource,
    pub data: Value,
    pub observed_at: DateTime<Utc>,
}

impl AnomalySignal {
    pub fn new(
        anomaly_type: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
        source: AnomalySource,
    ) -> Self {
        Self {
            anomaly_type: anomaly_type.into(),
            severity,
            confidence: 1.0,
            description: description.into(),
            app_name: None,
            namespace: "default".to_string(),
            source,
            data: Value::Null,
            observed_at: Utc::now(),
        }
    }

    pub fn for_app(mut self, app_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self.namespace = namespace.into();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Incident title; app-scoped anomalies are prefixed with `[app]`.
    pub fn incident_title(&self) -> String {
        match &self.app_name {
            Some(app) => format!("[{}] {}", app, self.description),
            None => self.description.clone(),
        }
    }
}
