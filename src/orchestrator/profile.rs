use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::detection::{DetectionLimits, DetectorSettings, MetricRule};
use crate::error::{OpsError, OpsResult};
use crate::model::{ActionKind, CyclePhase, Severity};
use crate::services::sources::MonitoredApp;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionConfig {
    pub metrics_interval_secs: u64,
    pub vision_interval_secs: u64,
    pub vision_enabled: bool,
    pub max_consecutive_failures: u32,
    pub min_severity: Severity,
    pub min_vision_confidence: f64,
    pub max_concurrent_investigations: usize,
    pub fingerprint_cooldown_secs: u64,
    pub app_cooldown_secs: u64,
    pub pending_evolution_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub description_chars: usize,
    /// Empty means "every app a completed cycle deployed".
    pub apps: Vec<MonitoredApp>,
    pub metric_rules: Vec<MetricRule>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 15,
            vision_interval_secs: 30,
            vision_enabled: true,
            max_consecutive_failures: 5,
            min_severity: Severity::Medium,
            min_vision_confidence: 0.7,
            max_concurrent_investigations: 3,
            fingerprint_cooldown_secs: 300,
            app_cooldown_secs: 600,
            pending_evolution_ttl_secs: 1800,
            sweep_interval_secs: 60,
            description_chars: 100,
            apps: Vec::new(),
            metric_rules: MetricRule::default_rules(),
        }
    }
}

impl DetectionConfig {
    pub fn limits(&self) -> DetectionLimits {
        DetectionLimits {
            max_concurrent_investigations: self.max_concurrent_investigations,
            fingerprint_cooldown: Duration::from_secs(self.fingerprint_cooldown_secs),
            app_cooldown: Duration::from_secs(self.app_cooldown_secs),
            pending_evolution_ttl: Duration::from_secs(self.pending_evolution_ttl_secs),
            description_chars: self.description_chars,
        }
    }

    pub fn detector_settings(&self) -> DetectorSettings {
        DetectorSettings {
            metrics_interval: Duration::from_secs(self.metrics_interval_secs),
            vision_interval: Duration::from_secs(self.vision_interval_secs),
            max_consecutive_failures: self.max_consecutive_failures,
            min_severity: self.min_severity,
            min_vision_confidence: self.min_vision_confidence,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InvestigationConfig {
    pub evidence_budget: usize,
    pub confidence_threshold: f64,
    pub max_actions: u32,
    pub action_cooldown_secs: u64,
    pub verification_delay_secs: u64,
    pub max_verification_attempts: u32,
    pub phase_retries: u32,
    pub retry_backoff_ms: u64,
    pub heartbeat_secs: u64,
    pub stale_claim_secs: u64,
    pub dry_run: bool,
    /// Least disruptive first.
    pub ladder: Vec<ActionKind>,
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            evidence_budget: 20,
            confidence_threshold: 0.6,
            max_actions: 4,
            action_cooldown_secs: 60,
            verification_delay_secs: 30,
            max_verification_attempts: 3,
            phase_retries: 3,
            retry_backoff_ms: 2000,
            heartbeat_secs: 30,
            stale_claim_secs: 60,
            dry_run: true,
            ladder: vec![ActionKind::Restart, ActionKind::Scale, ActionKind::Rollback, ActionKind::CodeFix],
        }
    }
}

impl InvestigationConfig {
    pub fn action_cooldown(&self) -> Duration {
        Duration::from_secs(self.action_cooldown_secs)
    }

    pub fn verification_delay(&self) -> Duration {
        Duration::from_secs(self.verification_delay_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn stale_claim(&self) -> Duration {
        Duration::from_secs(self.stale_claim_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DevelopmentConfig {
    pub namespace: String,
    pub phase_retries: u32,
    pub phase_retry_overrides: BTreeMap<CyclePhase, u32>,
    pub repair_attempts: u32,
    pub retry_backoff_ms: u64,
    pub generate_tests: bool,
    pub deploy_verify_delay_secs: u64,
    pub deploy_verify_attempts: u32,
}

impl Default for DevelopmentConfig {
    fn default() -> Self {
        Self {
            namespace: "apps".to_string(),
            phase_retries: 3,
            phase_retry_overrides: BTreeMap::new(),
            repair_attempts: 3,
            retry_backoff_ms: 2000,
            generate_tests: true,
            deploy_verify_delay_secs: 10,
            deploy_verify_attempts: 3,
        }
    }
}

impl DevelopmentConfig {
    /// Retry ceiling for one phase.
    pub fn retries_for(&self, phase: CyclePhase) -> u32 {
        self.phase_retry_overrides.get(&phase).copied().unwrap_or(self.phase_retries)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn deploy_verify_delay(&self) -> Duration {
        Duration::from_secs(self.deploy_verify_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvolutionConfig {
    pub max_pending: usize,
    pub max_files: usize,
    pub analysis_timeout_secs: u64,
    /// Apply without a human approval when the change set is within limits.
    pub autonomous: bool,
    /// Git checkout reverts are committed to, if any.
    pub repo_dir: Option<PathBuf>,
    pub git_author: Option<String>,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            max_pending: 3,
            max_files: 10,
            analysis_timeout_secs: 120,
            autonomous: false,
            repo_dir: None,
            git_author: None,
        }
    }
}

impl EvolutionConfig {
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub default_directive: String,
    pub with_line_numbers: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_directive: "autonomic=info".to_string(),
            with_line_numbers: false,
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointsConfig {
    pub prometheus_url: String,
    pub llm_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub vision_model: Option<String>,
    /// Renders a page and returns a PNG; vision detection is off without it.
    pub screenshot_url: Option<String>,
    pub kubectl: String,
    pub kube_context: Option<String>,
    pub build_command: String,
    pub deploy_command: String,
    pub delete_image_command: Option<String>,
    pub registry: String,
    pub db_path: PathBuf,
    pub request_timeout_secs: u64,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            prometheus_url: "http://localhost:9090".to_string(),
            llm_url: "http://localhost:11434/v1".to_string(),
            llm_api_key: None,
            llm_model: "llama3.1".to_string(),
            vision_model: None,
            screenshot_url: None,
            kubectl: "kubectl".to_string(),
            kube_context: None,
            build_command: "docker build -t \"$IMAGE_TAG\" . && docker push \"$IMAGE_TAG\"".to_string(),
            deploy_command: "kubectl set image \"deployment/$APP_NAME\" \"$APP_NAME=$IMAGE_TAG\" -n \"$NAMESPACE\"".to_string(),
            delete_image_command: Some("docker rmi \"$IMAGE_TAG\"".to_string()),
            registry: "localhost:5000".to_string(),
            db_path: PathBuf::from("autonomic.db"),
            request_timeout_secs: 60,
        }
    }
}

impl EndpointsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub detection: DetectionConfig,
    pub investigation: InvestigationConfig,
    pub development: DevelopmentConfig,
    pub evolution: EvolutionConfig,
    pub logging: LoggingConfig,
    pub endpoints: EndpointsConfig,
}

impl ControlPlaneConfig {
    /// Every violation, not just the first.
    pub fn validate(&self) -> OpsResult<()> {
        let mut problems = Vec::new();
        let mut nonzero = |name: &str, value: u64| {
            if value == 0 {
                problems.push(format!("{} must be greater than zero", name));
            }
        };

        let d = &self.detection;
        nonzero("detection.metrics_interval_secs", d.metrics_interval_secs);
        nonzero("detection.vision_interval_secs", d.vision_interval_secs);
        nonzero("detection.max_consecutive_failures", d.max_consecutive_failures as u64);
        nonzero("detection.max_concurrent_investigations", d.max_concurrent_investigations as u64);
        nonzero("detection.sweep_interval_secs", d.sweep_interval_secs);
        nonzero("detection.description_chars", d.description_chars as u64);

        let i = &self.investigation;
        nonzero("investigation.evidence_budget", i.evidence_budget as u64);
        nonzero("investigation.max_actions", i.max_actions as u64);
        nonzero("investigation.max_verification_attempts", i.max_verification_attempts as u64);
        nonzero("investigation.heartbeat_secs", i.heartbeat_secs);
        nonzero("investigation.stale_claim_secs", i.stale_claim_secs);

        let dev = &self.development;
        nonzero("development.repair_attempts", dev.repair_attempts as u64);
        nonzero("development.deploy_verify_attempts", dev.deploy_verify_attempts as u64);

        let e = &self.evolution;
        nonzero("evolution.max_pending", e.max_pending as u64);
        nonzero("evolution.max_files", e.max_files as u64);
        nonzero("evolution.analysis_timeout_secs", e.analysis_timeout_secs);

        if !(0.0..=1.0).contains(&d.min_vision_confidence) {
            problems.push("detection.min_vision_confidence must be within [0, 1]".to_string());
        }
        if !(0.0..=1.0).contains(&i.confidence_threshold) {
            problems.push("investigation.confidence_threshold must be within [0, 1]".to_string());
        }
        if i.ladder.is_empty() {
            problems.push("investigation.ladder must name at least one action".to_string());
        }
        if i.stale_claim_secs <= i.heartbeat_secs {
            problems.push("investigation.stale_claim_secs must exceed heartbeat_secs".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(OpsError::Config(problems.join("; ")))
        }
    }

    /// Apply `AUTONOMIC_*` overrides through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> OpsResult<()> {
        if let Some(v) = lookup("AUTONOMIC_DRY_RUN") {
            self.investigation.dry_run = parse_flag("AUTONOMIC_DRY_RUN", &v)?;
        }
        if let Some(v) = lookup("AUTONOMIC_AUTONOMOUS") {
            self.evolution.autonomous = parse_flag("AUTONOMIC_AUTONOMOUS", &v)?;
        }
        if let Some(v) = lookup("AUTONOMIC_PROMETHEUS_URL") {
            self.endpoints.prometheus_url = v;
        }
        if let Some(v) = lookup("AUTONOMIC_LLM_URL") {
            self.endpoints.llm_url = v;
        }
        if let Some(v) = lookup("AUTONOMIC_LLM_API_KEY") {
            self.endpoints.llm_api_key = Some(v).filter(|k| !k.is_empty());
        }
        if let Some(v) = lookup("AUTONOMIC_LLM_MODEL") {
            self.endpoints.llm_model = v;
        }
        if let Some(v) = lookup("AUTONOMIC_DB_PATH") {
            self.endpoints.db_path = PathBuf::from(v);
        }
        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> OpsResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(OpsError::Config(format!("{}: expected a boolean, got '{}'", name, other))),
    }
}

pub struct ConfigManager {
    path: PathBuf,
}

impl ConfigManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_yaml(&self) -> bool {
        matches!(
            self.path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        )
    }

    /// File contents only; a missing file is created with defaults.
    pub async fn read(&self) -> OpsResult<ControlPlaneConfig> {
        if !self.path.exists() {
            let default = ControlPlaneConfig::default();
            self.save(&default).await?;
            return Ok(default);
        }
        let content = fs::read_to_string(&self.path).await?;
        let config = if self.is_yaml() {
            serde_yaml::from_str(&content)
                .map_err(|e| OpsError::Config(format!("{}: {}", self.path.display(), e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| OpsError::Config(format!("{}: {}", self.path.display(), e)))?
        };
        Ok(config)
    }

    /// File, then process environment, then validation.
    pub async fn load(&self) -> OpsResult<ControlPlaneConfig> {
        let mut config = self.read().await?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub async fn save(&self, config: &ControlPlaneConfig) -> OpsResult<()> {
        let content = if self.is_yaml() {
            serde_yaml::to_string(config).map_err(|e| OpsError::Config(e.to_string()))?
        } else {
            serde_json::to_string_pretty(config)?
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn test_missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autonomic.json");
        let manager = ConfigManager::new(path.clone());

        let loaded = manager.read().await.unwrap();
        assert_eq!(loaded, ControlPlaneConfig::default());
        assert!(path.exists());
        assert_eq!(loaded.detection.app_cooldown_secs, 600);
        assert_eq!(loaded.evolution.max_files, 10);
        assert!(loaded.investigation.dry_run);
    }

    #[tokio::test]
    async fn test_partial_yaml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autonomic.yaml");
        fs::write(
            &path,
            "evolution:\n  autonomous: true\ndevelopment:\n  phase_retry_overrides:\n    BUILDING: 5\n",
        )
        .await
        .unwrap();

        let config = ConfigManager::new(path).read().await.unwrap();
        assert!(config.evolution.autonomous);
        assert_eq!(config.evolution.max_pending, 3);
        assert_eq!(config.development.retries_for(CyclePhase::Building), 5);
        assert_eq!(config.development.retries_for(CyclePhase::Coding), 3);
        assert_eq!(config.detection.metric_rules.len(), 4);
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let temp_file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        let manager = ConfigManager::new(temp_file.path());
        let mut config = ControlPlaneConfig::default();
        config.detection.apps.push(MonitoredApp {
            name: "checkout-svc".into(),
            namespace: "shop".into(),
            url: Some("http://checkout.shop".into()),
        });
        manager.save(&config).await.unwrap();
        assert_eq!(manager.read().await.unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("AUTONOMIC_DRY_RUN", "false"),
            ("AUTONOMIC_AUTONOMOUS", "yes"),
            ("AUTONOMIC_LLM_MODEL", "qwen2.5-coder"),
        ]
        .into_iter()
        .collect();
        let mut config = ControlPlaneConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert!(!config.investigation.dry_run);
        assert!(config.evolution.autonomous);
        assert_eq!(config.endpoints.llm_model, "qwen2.5-coder");

        let err = config
            .apply_overrides(|k| (k == "AUTONOMIC_DRY_RUN").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, OpsError::Config(_)));
    }

    #[test]
    fn test_validate_collects_every_violation() {
        let mut config = ControlPlaneConfig::default();
        assert!(config.validate().is_ok());

        config.detection.metrics_interval_secs = 0;
        config.investigation.confidence_threshold = 1.5;
        config.evolution.max_files = 0;
        let Err(OpsError::Config(msg)) = config.validate() else {
            panic!("expected a config error");
        };
        assert!(msg.contains("metrics_interval_secs"));
        assert!(msg.contains("confidence_threshold"));
        assert!(msg.contains("max_files"));
    }
}
