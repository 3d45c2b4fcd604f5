//! Platform executor contract and a kubectl-backed implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{OpsError, OpsResult};
use crate::model::ActionKind;
use crate::services::process::run_command;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationTarget {
    pub name: String,
    pub namespace: String,
    pub kind: String,
    pub replicas: Option<u32>,
    pub ready_replicas: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub incident_id: String,
    pub kind: ActionKind,
    pub target: String,
    pub namespace: String,
    pub parameters: Value,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub dry_run: bool,
    pub message: String,
    pub detail: Value,
}

impl ActionOutcome {
    pub fn ok(message: impl Into<String>, dry_run: bool) -> Self {
        Self {
            success: true,
            dry_run,
            message: message.into(),
            detail: Value::Null,
        }
    }

    pub fn failed(message: impl Into<String>, dry_run: bool) -> Self {
        Self {
            success: false,
            dry_run,
            message: message.into(),
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub detail: Value,
}

impl HealthReport {
    pub fn healthy(detail: Value) -> Self {
        Self { healthy: true, detail }
    }

    pub fn unhealthy(detail: Value) -> Self {
        Self { healthy: false, detail }
    }
}

#[async_trait]
pub trait PlatformExecutor: Send + Sync {
    async fn list_targets(&self, namespace: &str) -> OpsResult<Vec<RemediationTarget>>;

    /// Must honor `request.dry_run`.
    async fn execute(&self, request: &ActionRequest) -> OpsResult<ActionOutcome>;

    async fn check_health(&self, target: &str, namespace: &str) -> OpsResult<HealthReport>;
}

/// Drives Kubernetes deployments through the `kubectl` binary.
pub struct KubectlExecutor {
    kubectl: String,
    context: Option<String>,
}

impl KubectlExecutor {
    pub fn new(kubectl: impl Into<String>) -> Self {
        Self {
            kubectl: kubectl.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    async fn kubectl(&self, args: Vec<String>) -> OpsResult<(String, i32)> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(ctx) = &self.context {
            full.push("--context".to_string());
            full.push(ctx.clone());
        }
        full.extend(args);
        let refs: Vec<&str> = full.iter().map(String::as_str).collect();
        run_command(&self.kubectl, &refs, None, &[])
            .await
            .map_err(|e| OpsError::transient("kubectl", e))
    }

    async fn deployment_json(&self, name: &str, namespace: &str) -> OpsResult<Value> {
        let (out, code) = self
            .kubectl(vec![
                "get".into(),
                format!("deployment/{}", name),
                "-n".into(),
                namespace.into(),
                "-o".into(),
                "json".into(),
            ])
            .await?;
        if code != 0 {
            return Err(OpsError::transient("kubectl", out.trim().to_string()));
        }
        Ok(serde_json::from_str(out.trim())?)
    }

    fn target_from_json(item: &Value, namespace: &str) -> Option<RemediationTarget> {
        Some(RemediationTarget {
            name: item["metadata"]["name"].as_str()?.to_string(),
            namespace: namespace.to_string(),
            kind: "deployment".to_string(),
            replicas: item["spec"]["replicas"].as_u64().map(|v| v as u32),
            ready_replicas: item["status"]["readyReplicas"].as_u64().map(|v| v as u32),
        })
    }
}

#[async_trait]
impl PlatformExecutor for KubectlExecutor {
    async fn list_targets(&self, namespace: &str) -> OpsResult<Vec<RemediationTarget>> {
        let (out, code) = self
            .kubectl(vec![
                "get".into(),
                "deployments".into(),
                "-n".into(),
                namespace.into(),
                "-o".into(),
                "json".into(),
            ])
            .await?;
        if code != 0 {
            return Err(OpsError::transient("kubectl", out.trim().to_string()));
        }
        let list: Value = serde_json::from_str(out.trim())?;
        Ok(list["items"]
            .as_array()
            .map(|items| items.iter().filter_map(|i| Self::target_from_json(i, namespace)).collect())
            .unwrap_or_default())
    }

    async fn execute(&self, request: &ActionRequest) -> OpsResult<ActionOutcome> {
        let deployment = format!("deployment/{}", request.target);
        let mut args: Vec<String> = match request.kind {
            ActionKind::Restart => vec!["rollout".into(), "restart".into(), deployment],
            ActionKind::Rollback => vec!["rollout".into(), "undo".into(), deployment],
            ActionKind::Scale => {
                let replicas = match request.parameters["replicas"].as_u64() {
                    Some(r) => r as u32,
                    None => {
                        let current = self.deployment_json(&request.target, &request.namespace).await?;
                        current["spec"]["replicas"].as_u64().unwrap_or(1) as u32 + 1
                    }
                };
                vec!["scale".into(), deployment, format!("--replicas={}", replicas)]
            }
            ActionKind::CodeFix | ActionKind::Manual => {
                return Ok(ActionOutcome::failed(
                    format!("{} is not a platform action", request.kind),
                    request.dry_run,
                ));
            }
        };
        args.push("-n".into());
        args.push(request.namespace.clone());
        if request.dry_run {
            args.push("--dry-run=server".into());
        }

        info!(incident_id = %request.incident_id, action = %request.kind, target = %request.target, dry_run = request.dry_run, "executing platform action");
        let (out, code) = self.kubectl(args).await?;
        if code == 0 {
            Ok(ActionOutcome::ok(out.trim().to_string(), request.dry_run)
                .with_detail(json!({ "exit_code": code })))
        } else {
            warn!(incident_id = %request.incident_id, action = %request.kind, "platform action failed: {}", out.trim());
            Ok(ActionOutcome::failed(out.trim().to_string(), request.dry_run)
                .with_detail(json!({ "exit_code": code })))
        }
    }

    async fn check_health(&self, target: &str, namespace: &str) -> OpsResult<HealthReport> {
        let dep = self.deployment_json(target, namespace).await?;
        let desired = dep["spec"]["replicas"].as_u64().unwrap_or(1);
        let ready = dep["status"]["readyReplicas"].as_u64().unwrap_or(0);
        let available = dep["status"]["availableReplicas"].as_u64().unwrap_or(0);
        let detail = json!({ "desired": desired, "ready": ready, "available": available });
        if ready >= desired && available >= desired {
            Ok(HealthReport::healthy(detail))
        } else {
            Ok(HealthReport::unhealthy(detail))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_deployment_json() {
        let item = json!({
            "metadata": { "name": "checkout-svc" },
            "spec": { "replicas": 3 },
            "status": { "readyReplicas": 2 }
        });
        let t = KubectlExecutor::target_from_json(&item, "shop").unwrap();
        assert_eq!(t.name, "checkout-svc");
        assert_eq!(t.replicas, Some(3));
        assert_eq!(t.ready_replicas, Some(2));
        assert!(KubectlExecutor::target_from_json(&json!({}), "shop").is_none());
    }
}
