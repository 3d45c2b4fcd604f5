//! Build/deploy executor contract and a shell-command implementation.

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

use crate::error::{OpsError, OpsResult};
use crate::model::{DeploymentInfo, ServiceType, SourceFile, StorageMode, TestResults};
use crate::services::platform::HealthReport;
use crate::services::process::run_shell;

/// One structured compiler or test error, as handed to the reasoning service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildError {
    pub file: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub cycle_id: String,
    pub app_name: String,
    pub tag: String,
    pub files: Vec<SourceFile>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOutcome {
    pub success: bool,
    pub image_tag: Option<String>,
    pub logs: String,
    pub test_results: Option<TestResults>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub cycle_id: String,
    pub app_name: String,
    pub namespace: String,
    pub image_tag: String,
    pub service_type: ServiceType,
    pub storage_mode: StorageMode,
}

#[async_trait]
pub trait BuildExecutor: Send + Sync {
    /// A failed build is `Ok` with `success == false`; `Err` means the executor
    /// itself could not run.
    async fn build(&self, request: &BuildRequest) -> OpsResult<BuildOutcome>;

    async fn deploy(&self, request: &DeployRequest) -> OpsResult<DeploymentInfo>;

    async fn check_health(&self, deployment: &DeploymentInfo) -> OpsResult<HealthReport>;

    async fn delete_image(&self, image_tag: &str) -> OpsResult<()>;
}

/// Extract executed-test counts from jest or cargo style summaries.
pub fn parse_test_summary(logs: &str) -> Option<TestResults> {
    let jest = Regex::new(r"Tests:\s+(?:(\d+) failed,\s+)?(\d+) passed").ok()?;
    if let Some(c) = jest.captures(logs) {
        let failed = c.get(1).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        let passed = c.get(2).and_then(|m| m.as_str().parse().ok()).unwrap_or(0);
        return Some(TestResults {
            generated: 0,
            passed,
            failed,
            output: None,
        });
    }
    let cargo = Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed").ok()?;
    cargo.captures(logs).map(|c| TestResults {
        generated: 0,
        passed: c[1].parse().unwrap_or(0),
        failed: c[2].parse().unwrap_or(0),
        output: None,
    })
}

/// Writes the file set into a scratch workspace and runs operator-configured
/// command lines. Commands receive `IMAGE_TAG`, `APP_NAME`, `NAMESPACE`.
pub struct ShellBuildExecutor {
    build_command: String,
    deploy_command: String,
    delete_command: Option<String>,
    registry: String,
    health_path: String,
    client: Client,
}

impl ShellBuildExecutor {
    pub fn new(build_command: impl Into<String>, deploy_command: impl Into<String>, registry: impl Into<String>) -> Self {
        Self {
            build_command: build_command.into(),
            deploy_command: deploy_command.into(),
            delete_command: None,
            registry: registry.into(),
            health_path: "/health".to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn with_delete_command(mut self, command: impl Into<String>) -> Self {
        self.delete_command = Some(command.into());
        self
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = path.into();
        self
    }

    fn image_tag(&self, app: &str, tag: &str) -> String {
        format!("{}/{}:{}", self.registry.trim_end_matches('/'), app, tag)
    }
}

#[async_trait]
impl BuildExecutor for ShellBuildExecutor {
    async fn build(&self, request: &BuildRequest) -> OpsResult<BuildOutcome> {
        let workspace = tempfile::tempdir()?;
        for file in &request.files {
            let rel = file.path.trim_start_matches('/');
            if rel.split('/').any(|part| part == "..") {
                return Err(OpsError::Validation(format!("refusing path outside workspace: {}", file.path)));
            }
            let path = workspace.path().join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, &file.content).await?;
        }

        let image = self.image_tag(&request.app_name, &request.tag);
        info!(cycle_id = %request.cycle_id, image = %image, files = request.files.len(), "building image");
        let (logs, code) = run_shell(
            &self.build_command,
            Some(workspace.path()),
            &[("IMAGE_TAG", &image), ("APP_NAME", &request.app_name)],
        )
        .await
        .map_err(|e| OpsError::transient("builder", e))?;

        let test_results = parse_test_summary(&logs);
        if code == 0 {
            Ok(BuildOutcome {
                success: true,
                image_tag: Some(image),
                logs,
                test_results,
                error: None,
            })
        } else {
            Ok(BuildOutcome {
                success: false,
                image_tag: None,
                logs,
                test_results,
                error: Some(format!("build exited with code {}", code)),
            })
        }
    }

    async fn deploy(&self, request: &DeployRequest) -> OpsResult<DeploymentInfo> {
        let (out, code) = run_shell(
            &self.deploy_command,
            None,
            &[
                ("IMAGE_TAG", &request.image_tag),
                ("APP_NAME", &request.app_name),
                ("NAMESPACE", &request.namespace),
            ],
        )
        .await
        .map_err(|e| OpsError::transient("deployer", e))?;
        if code != 0 {
            return Err(OpsError::transient("deployer", out.trim().to_string()));
        }
        let url = out
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.starts_with("http://") || l.starts_with("https://"))
            .map(str::to_string)
            .unwrap_or_else(|| format!("http://{}.{}.svc.cluster.local", request.app_name, request.namespace));
        Ok(DeploymentInfo {
            name: request.app_name.clone(),
            namespace: request.namespace.clone(),
            image_tag: request.image_tag.clone(),
            url: Some(url),
            deployed_at: Utc::now(),
        })
    }

    async fn check_health(&self, deployment: &DeploymentInfo) -> OpsResult<HealthReport> {
        let Some(base) = &deployment.url else {
            return Ok(HealthReport::unhealthy(json!({ "reason": "deployment has no url" })));
        };
        let url = format!("{}{}", base.trim_end_matches('/'), self.health_path);
        match self.client.get(&url).send().await {
            Ok(res) if res.status().is_success() => Ok(HealthReport::healthy(json!({ "status": res.status().as_u16() }))),
            Ok(res) => Ok(HealthReport::unhealthy(json!({ "status": res.status().as_u16() }))),
            Err(e) => {
                warn!(url = %url, error = %e, "health check request failed");
                Ok(HealthReport::unhealthy(json!({ "error": e.to_string() })))
            }
        }
    }

    async fn delete_image(&self, image_tag: &str) -> OpsResult<()> {
        let Some(command) = &self.delete_command else {
            return Ok(());
        };
        let (out, code) = run_shell(command, None, &[("IMAGE_TAG", image_tag)])
            .await
            .map_err(|e| OpsError::transient("registry", e))?;
        if code != 0 {
            return Err(OpsError::transient("registry", out.trim().to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_jest_summary() {
        let logs = "PASS src/a.test.ts\nTests:       2 failed, 14 passed, 16 total";
        let r = parse_test_summary(logs).unwrap();
        assert_eq!((r.passed, r.failed), (14, 2));
        let r = parse_test_summary("Tests:  9 passed, 9 total").unwrap();
        assert_eq!((r.passed, r.failed), (9, 0));
    }

    #[test]
    fn test_parse_cargo_summary() {
        let logs = "test result: FAILED. 7 passed; 1 failed; 0 ignored";
        let r = parse_test_summary(logs).unwrap();
        assert_eq!((r.passed, r.failed), (7, 1));
        assert!(parse_test_summary("compiling...").is_none());
    }

    #[tokio::test]
    async fn test_build_rejects_parent_paths() {
        let exec = ShellBuildExecutor::new("true", "true", "registry.local");
        let req = BuildRequest {
            cycle_id: "c".into(),
            app_name: "app".into(),
            tag: "v1".into(),
            files: vec![SourceFile::new("../escape.sh", "rm -rf /")],
        };
        assert!(matches!(exec.build(&req).await, Err(OpsError::Validation(_))));
    }
}
