//! Collaborator Contracts
//!
//! The orchestration core talks to the outside world only through the traits
//! in this module. Each file pairs a contract with one concrete adapter.

pub mod build;
pub mod metrics;
pub mod platform;
pub(crate) mod process;
pub mod reasoning;
pub mod repository;
pub mod source_control;
pub mod sources;

pub use build::{BuildError, BuildExecutor, BuildOutcome, BuildRequest, DeployRequest, ShellBuildExecutor};
pub use metrics::{instant_or_empty, MetricsQuery, PrometheusClient, Sample, Series};
pub use platform::{ActionOutcome, ActionRequest, HealthReport, KubectlExecutor, PlatformExecutor, RemediationTarget};
pub use reasoning::{
    CodeFix, HypothesisDraft, PostmortemDraft, Reasoned, ReasoningService, RequirementBrief, ThoughtSignature,
    VisionFinding, VisionFrame,
};
pub use repository::{CycleRepository, EvolutionRepository, IncidentRepository};
pub use source_control::{GitSourceControl, SourceControl};
pub use sources::{
    AppCatalog, CycleCatalog, EvidenceCollector, FrameSource, MetricsEvidenceCollector, MonitoredApp,
    PlatformEvidenceCollector, ScreenshotServiceSource, StaticCatalog,
};
