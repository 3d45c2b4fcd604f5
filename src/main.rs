//! autonomicd
//!
//! Runs the control plane as a daemon: loads configuration, opens the store,
//! resumes whatever a previous process left running, then watches the
//! monitored applications until ctrl-c.
//!
//! Usage: `autonomicd [--config <path>] [--memory]`

use anyhow::{Context, Result};
use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use autonomic::agent::{LlmReasoner, OpenAICompatibleProvider};
use autonomic::orchestrator::{Collaborators, ConfigManager, ControlPlaneConfig, Supervisor};
use autonomic::services::{
    AppCatalog, CycleCatalog, CycleRepository, EvidenceCollector, EvolutionRepository, FrameSource,
    GitSourceControl, IncidentRepository, KubectlExecutor, MetricsEvidenceCollector, PlatformEvidenceCollector,
    PrometheusClient, ScreenshotServiceSource, ShellBuildExecutor, SourceControl, StaticCatalog,
};
use autonomic::store::{MemoryStore, SqliteStore};
use autonomic::utils::telemetry::init_logging;

// ──────────────────────────────────────────────────────────────────────────────
// ARGUMENTS
// ──────────────────────────────────────────────────────────────────────────────

struct Args {
    config: PathBuf,
    memory: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = Args {
            config: PathBuf::from(std::env::var("AUTONOMIC_CONFIG").unwrap_or_else(|_| "autonomic.yaml".to_string())),
            memory: false,
        };
        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--config" | "-c" => {
                    args.config = it.next().map(PathBuf::from).context("--config needs a path")?;
                }
                "--memory" => args.memory = true,
                other => anyhow::bail!("unknown argument '{}'", other),
            }
        }
        Ok(args)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// WIRING
// ──────────────────────────────────────────────────────────────────────────────

struct Stores {
    incidents: Arc<dyn IncidentRepository>,
    cycles: Arc<dyn CycleRepository>,
    evolutions: Arc<dyn EvolutionRepository>,
}

async fn open_stores(config: &ControlPlaneConfig, memory: bool) -> Result<Stores> {
    if memory {
        let store = Arc::new(MemoryStore::new());
        return Ok(Stores {
            incidents: store.clone(),
            cycles: store.clone(),
            evolutions: store,
        });
    }
    let path = &config.endpoints.db_path;
    let store = Arc::new(
        SqliteStore::new(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?,
    );
    Ok(Stores {
        incidents: store.clone(),
        cycles: store.clone(),
        evolutions: store,
    })
}

fn collaborators(config: &ControlPlaneConfig, stores: Stores) -> Result<Collaborators> {
    let endpoints = &config.endpoints;
    let timeout = endpoints.request_timeout();

    let provider = Arc::new(
        OpenAICompatibleProvider::new(endpoints.llm_url.clone(), endpoints.llm_api_key.clone(), timeout)
            .context("building LLM provider")?,
    );
    let mut reasoner = LlmReasoner::new(provider, endpoints.llm_model.clone());
    if let Some(model) = &endpoints.vision_model {
        reasoner = reasoner.with_vision_model(model.clone());
    }

    let metrics = Arc::new(PrometheusClient::new(endpoints.prometheus_url.clone(), timeout)?);

    let mut kubectl = KubectlExecutor::new(endpoints.kubectl.clone());
    if let Some(context) = &endpoints.kube_context {
        kubectl = kubectl.with_context(context.clone());
    }
    let platform = Arc::new(kubectl);

    let mut builder = ShellBuildExecutor::new(
        endpoints.build_command.clone(),
        endpoints.deploy_command.clone(),
        endpoints.registry.clone(),
    );
    if let Some(delete) = &endpoints.delete_image_command {
        builder = builder.with_delete_command(delete.clone());
    }

    let catalog: Arc<dyn AppCatalog> = if config.detection.apps.is_empty() {
        Arc::new(CycleCatalog::new(stores.cycles.clone()))
    } else {
        Arc::new(StaticCatalog::new(config.detection.apps.clone()))
    };

    let frames: Option<Arc<dyn FrameSource>> = match &endpoints.screenshot_url {
        Some(url) => Some(Arc::new(ScreenshotServiceSource::new(url.clone(), timeout)?)),
        None => None,
    };

    let source_control: Option<Arc<dyn SourceControl>> = config.evolution.repo_dir.as_ref().map(|dir| {
        let mut git = GitSourceControl::new(dir.clone());
        if let Some(author) = &config.evolution.git_author {
            git = git.with_author(author.clone());
        }
        Arc::new(git) as Arc<dyn SourceControl>
    });

    let collectors: Vec<Arc<dyn EvidenceCollector>> = vec![
        Arc::new(MetricsEvidenceCollector::new(
            metrics.clone(),
            MetricsEvidenceCollector::default_queries(),
        )),
        Arc::new(PlatformEvidenceCollector::new(platform.clone())),
    ];

    Ok(Collaborators {
        incidents: stores.incidents,
        cycles: stores.cycles,
        evolutions: stores.evolutions,
        reasoning: Arc::new(reasoner),
        platform,
        builder: Arc::new(builder),
        metrics,
        catalog,
        collectors,
        frames,
        source_control,
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// MAIN ENTRY POINT
// ──────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse()?;

    let config = ConfigManager::new(&args.config)
        .load()
        .await
        .with_context(|| format!("loading {}", args.config.display()))?;
    let _log_guard = init_logging(&config.logging)?;

    info!(
        config = %args.config.display(),
        dry_run = config.investigation.dry_run,
        autonomous = config.evolution.autonomous,
        store = if args.memory { "memory" } else { "sqlite" },
        "autonomic control plane starting"
    );

    let stores = open_stores(&config, args.memory).await?;
    let supervisor = Supervisor::new(config.clone(), collaborators(&config, stores)?);

    match supervisor.recover().await {
        Ok(report) => info!(
            cycles = report.cycles.len(),
            incidents = report.incidents.len(),
            skipped = report.skipped.len(),
            "recovery finished"
        ),
        Err(e) => error!(error = %e, "recovery scan failed"),
    }

    let handles = supervisor.start_background();

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    supervisor.shutdown();
    for joined in join_all(handles).await {
        if let Err(e) = joined {
            error!(error = %e, "background loop ended abnormally");
        }
    }
    info!("autonomic control plane stopped");
    Ok(())
}
