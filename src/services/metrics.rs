//! Metrics query contract and a Prometheus HTTP API client.
//!
//! An unreachable metrics backend is "no data" to every caller, never fatal.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

use crate::error::{OpsError, OpsResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub points: Vec<(DateTime<Utc>, f64)>,
}

#[async_trait]
pub trait MetricsQuery: Send + Sync {
    async fn instant(&self, query: &str) -> OpsResult<Vec<Sample>>;

    async fn range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> OpsResult<Vec<Series>>;
}

/// Instant query where any failure degrades to an empty result.
pub async fn instant_or_empty(metrics: &dyn MetricsQuery, query: &str) -> Vec<Sample> {
    match metrics.instant(query).await {
        Ok(samples) => samples,
        Err(e) => {
            warn!(query = query, error = %e, "metrics unavailable, treating as no data");
            Vec::new()
        }
    }
}

pub struct PrometheusClient {
    client: Client,
    base_url: String,
}

impl PrometheusClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> OpsResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OpsError::Config(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str, params: &[(&str, String)]) -> OpsResult<Value> {
        let res = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(params)
            .send()
            .await
            .map_err(|e| OpsError::transient("prometheus", e))?;
        let body: Value = res.json().await.map_err(|e| OpsError::transient("prometheus", e))?;
        if body["status"] != "success" {
            let msg = body["error"].as_str().unwrap_or("query failed").to_string();
            return Err(OpsError::transient("prometheus", msg));
        }
        Ok(body["data"].clone())
    }

    fn labels(metric: &Value) -> BTreeMap<String, String> {
        metric
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Prometheus encodes a point as `[unix_seconds, "value"]`.
    fn point(raw: &Value) -> Option<(DateTime<Utc>, f64)> {
        let ts = raw.get(0)?.as_f64()?;
        let value = raw.get(1)?.as_str()?.parse::<f64>().ok()?;
        let at = Utc.timestamp_millis_opt((ts * 1000.0) as i64).single()?;
        Some((at, value))
    }

    fn parse_vector(data: &Value) -> Vec<Sample> {
        match data["resultType"].as_str() {
            Some("vector") => data["result"]
                .as_array()
                .map(|rows| {
                    rows.iter()
                        .filter_map(|r| {
                            let (_, value) = Self::point(&r["value"])?;
                            Some(Sample {
                                labels: Self::labels(&r["metric"]),
                                value,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
            Some("scalar") => Self::point(&data["result"])
                .map(|(_, value)| vec![Sample { labels: BTreeMap::new(), value }])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    fn parse_matrix(data: &Value) -> Vec<Series> {
        data["result"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .map(|r| Series {
                        labels: Self::labels(&r["metric"]),
                        points: r["values"]
                            .as_array()
                            .map(|vals| vals.iter().filter_map(Self::point).collect())
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl MetricsQuery for PrometheusClient {
    async fn instant(&self, query: &str) -> OpsResult<Vec<Sample>> {
        let data = self.get("/api/v1/query", &[("query", query.to_string())]).await?;
        Ok(Self::parse_vector(&data))
    }

    async fn range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> OpsResult<Vec<Series>> {
        let params = [
            ("query", query.to_string()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
            ("step", format!("{}s", step.as_secs().max(1))),
        ];
        let data = self.get("/api/v1/query_range", &params).await?;
        Ok(Self::parse_matrix(&data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_vector_result() {
        let data = json!({
            "resultType": "vector",
            "result": [
                { "metric": { "app": "checkout-svc" }, "value": [1700000000.5, "0.42"] },
                { "metric": { "app": "broken" }, "value": [1700000000.5, "NaN-ish"] }
            ]
        });
        let samples = PrometheusClient::parse_vector(&data);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].labels["app"], "checkout-svc");
        assert!((samples[0].value - 0.42).abs() < 1e-9);
    }

    #[test]
    fn test_parse_matrix_result() {
        let data = json!({
            "resultType": "matrix",
            "result": [{ "metric": {}, "values": [[1700000000, "1"], [1700000015, "2"]] }]
        });
        let series = PrometheusClient::parse_matrix(&data);
        assert_eq!(series[0].points.len(), 2);
        assert_eq!(series[0].points[1].1, 2.0);
    }

    struct Down;

    #[async_trait]
    impl MetricsQuery for Down {
        async fn instant(&self, _q: &str) -> OpsResult<Vec<Sample>> {
            Err(OpsError::transient("prometheus", "connection refused"))
        }
        async fn range(&self, _q: &str, _s: DateTime<Utc>, _e: DateTime<Utc>, _st: Duration) -> OpsResult<Vec<Series>> {
            Err(OpsError::transient("prometheus", "connection refused"))
        }
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_no_data() {
        assert!(instant_or_empty(&Down, "up").await.is_empty());
    }
}
