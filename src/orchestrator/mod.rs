//! Orchestrator Module
//!
//! The run engines (investigation, development, evolution), the pieces they
//! share, and the supervisor that owns them for the life of the process.

pub mod event_bus;
pub mod development;
pub mod evolution;
pub mod investigation;
pub mod ladder;
pub mod profile;
pub mod recovery;
pub mod registry;
pub mod repair;
pub mod supervisor;

pub use development::{
    CycleOutcome, CycleRedeployer, DevelopmentDeps, DevelopmentOrchestrator, DevelopmentRequest, DevelopmentSettings,
    Redeploy,
};
pub use event_bus::{EventBus, EventRecorder, Listeners, RunEvent, RunObserver, TracingObserver};
pub use evolution::{ApplyResult, EvolutionEngine, EvolutionSettings, EvolutionStep, FullCycleResult};
pub use investigation::{
    pattern_signature, CodeFixer, InvestigationDeps, InvestigationOrchestrator, InvestigationOutcome,
    InvestigationSettings,
};
pub use ladder::EscalationLadder;
pub use profile::{ConfigManager, ControlPlaneConfig};
pub use recovery::{Recovery, RecoveryHandler, RecoveryReport};
pub use registry::{RunGuard, RunKind, RunRegistry};
pub use repair::{parse_build_errors, RepairReport, SelfRepair};
pub use supervisor::{Collaborators, Supervisor};
