//! `ReasoningService` over any chat-completion provider.
//!
//! Every task asks for exactly one JSON document. A reply that does not parse
//! into the expected shape is a validation failure, never a best guess.
//!
//! Continuity: each reply yields a fresh [`ThoughtSignature`]. The reasoner
//! keeps a short note of the exchange under that signature, and a later call
//! presenting it gets the note prepended to its prompt.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::provider::LLMProvider;
use crate::error::{OpsError, OpsResult};
use crate::model::{
    Evidence, Evolution, EvolutionAnalysis, ImpactLevel, Incident, ProposedChange, RemediationAction, SourceFile,
    TimelineEntry,
};
use crate::services::build::BuildError;
use crate::services::reasoning::{
    CodeFix, HypothesisDraft, PostmortemDraft, Reasoned, ReasoningService, RequirementBrief, ThoughtSignature,
    VisionFinding, VisionFrame,
};
use crate::utils::truncate_middle;

const MAX_THREADS: usize = 256;
const NOTE_BYTES: usize = 4_000;
const FILE_BYTES: usize = 12_000;

const SYSTEM: &str = "You are the reasoning engine of an autonomous operations control plane. \
Reply with a single JSON document and nothing else. Do not wrap it in prose.";

#[derive(Default)]
struct ThreadNotes {
    order: VecDeque<String>,
    notes: HashMap<String, String>,
}

impl ThreadNotes {
    fn insert(&mut self, key: String, note: String) {
        if self.notes.insert(key.clone(), note).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > MAX_THREADS {
            if let Some(old) = self.order.pop_front() {
                self.notes.remove(&old);
            }
        }
    }
}

pub struct LlmReasoner {
    provider: Arc<dyn LLMProvider>,
    model: String,
    vision_model: String,
    threads: RwLock<ThreadNotes>,
}

impl LlmReasoner {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            provider,
            vision_model: model.clone(),
            model,
            threads: RwLock::new(ThreadNotes::default()),
        }
    }

    pub fn with_vision_model(mut self, model: impl Into<String>) -> Self {
        self.vision_model = model.into();
        self
    }

    async fn recall(&self, signature: Option<&ThoughtSignature>) -> Option<String> {
        let sig = signature?;
        self.threads.read().await.notes.get(sig.as_str()).cloned()
    }

    async fn remember(&self, previous: Option<&ThoughtSignature>, task: &str, reply: &str) -> ThoughtSignature {
        let mut hasher = Sha256::new();
        hasher.update(previous.map(|s| s.as_str()).unwrap_or("").as_bytes());
        hasher.update(task.as_bytes());
        hasher.update(reply.as_bytes());
        let key = format!("{:x}", hasher.finalize());
        let note = truncate_middle(&format!("[{}]\n{}", task, reply), NOTE_BYTES);
        self.threads.write().await.insert(key.clone(), note);
        ThoughtSignature::new(key)
    }

    async fn ask<T: DeserializeOwned>(
        &self,
        task: &str,
        prompt: String,
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<T>> {
        let mut full = String::new();
        if let Some(note) = self.recall(signature).await {
            full.push_str("Context from the previous step of this run:\n");
            full.push_str(&note);
            full.push_str("\n\n");
        }
        full.push_str(&prompt);

        debug!(task = task, prompt_bytes = full.len(), "reasoning request");
        let raw = self
            .provider
            .generate(&self.model, full, Some(SYSTEM.to_string()))
            .await
            .map_err(|e| OpsError::transient("reasoning", format!("{:#}", e)))?;
        let data = parse_reply::<T>(task, &raw)?;
        let next = self.remember(signature, task, &raw).await;
        Ok(Reasoned::new(data).with_signature(Some(next)))
    }
}

/// First balanced JSON object or array in `text`, skipping code fences and prose.
pub fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let body = &text[start..];
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in body.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&body[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_reply<T: DeserializeOwned>(task: &str, raw: &str) -> OpsResult<T> {
    let json = extract_json(raw).ok_or_else(|| OpsError::Validation(format!("{} reply contains no JSON", task)))?;
    serde_json::from_str(json).map_err(|e| OpsError::Validation(format!("{} reply has the wrong shape: {}", task, e)))
}

fn files_block(files: &[SourceFile]) -> String {
    files
        .iter()
        .map(|f| format!("--- {} ---\n{}", f.path, truncate_middle(&f.content, FILE_BYTES)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FilesReply {
    Wrapped { files: Vec<SourceFile> },
    Bare(Vec<SourceFile>),
}

impl FilesReply {
    fn into_files(self) -> Vec<SourceFile> {
        match self {
            FilesReply::Wrapped { files } | FilesReply::Bare(files) => files,
        }
    }
}

#[derive(Deserialize)]
struct FixReply {
    #[serde(default)]
    changed: Option<bool>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    explanation: Option<String>,
}

#[derive(Deserialize)]
struct FindingsReply {
    #[serde(default)]
    findings: Vec<VisionFinding>,
}

#[derive(Deserialize)]
struct HypothesesReply {
    hypotheses: Vec<HypothesisDraft>,
}

#[derive(Deserialize)]
struct AnalysisReply {
    #[serde(default)]
    affected_files: Vec<String>,
    #[serde(default)]
    impact: ImpactLevel,
    #[serde(default)]
    summary: String,
}

#[derive(Deserialize)]
struct ChangesReply {
    changes: Vec<ProposedChange>,
}

#[async_trait]
impl ReasoningService for LlmReasoner {
    async fn analyze_requirement(
        &self,
        brief: &RequirementBrief,
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Value>> {
        let prompt = format!(
            "Analyze this application requirement. Return an object with keys \
             \"features\", \"endpoints\", \"data_entities\", \"non_functional\".\n\n{}",
            serde_json::to_string_pretty(brief)?
        );
        self.ask("analyze_requirement", prompt, signature).await
    }

    async fn design_architecture(
        &self,
        analyzed: &Value,
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Value>> {
        let prompt = format!(
            "Design the architecture for this analyzed requirement. Return an object with keys \
             \"language\", \"framework\", \"files\" (planned paths with purpose) and \"dependencies\".\n\n{}",
            serde_json::to_string_pretty(analyzed)?
        );
        self.ask("design_architecture", prompt, signature).await
    }

    async fn generate_code(
        &self,
        architecture: &Value,
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Vec<SourceFile>>> {
        let prompt = format!(
            "Generate the complete source tree for this architecture, including a Dockerfile. \
             Return {{\"files\": [{{\"path\": ..., \"content\": ...}}]}}.\n\n{}",
            serde_json::to_string_pretty(architecture)?
        );
        let reply: Reasoned<FilesReply> = self.ask("generate_code", prompt, signature).await?;
        let files = reply.data.into_files();
        if files.is_empty() {
            return Err(OpsError::Validation("generate_code returned no files".into()));
        }
        Ok(Reasoned::new(files).with_signature(reply.signature))
    }

    async fn fix_code(
        &self,
        file: &SourceFile,
        errors: &[BuildError],
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<CodeFix>> {
        let prompt = format!(
            "Fix the build errors in this file. Return {{\"changed\": bool, \"content\": <full new file>, \
             \"explanation\": ...}}.\n\nErrors:\n{}\n\n{}",
            serde_json::to_string_pretty(errors)?,
            files_block(std::slice::from_ref(file))
        );
        let reply: Reasoned<FixReply> = self.ask("fix_code", prompt, signature).await?;
        let FixReply {
            changed,
            content,
            explanation,
        } = reply.data;
        let changed = changed.unwrap_or(true) && !content.trim().is_empty() && content != file.content;
        let content = if changed { content } else { file.content.clone() };
        Ok(Reasoned::new(CodeFix {
            changed,
            content,
            explanation,
        })
        .with_signature(reply.signature))
    }

    async fn generate_tests(
        &self,
        files: &[SourceFile],
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Vec<SourceFile>>> {
        let prompt = format!(
            "Write unit tests for these files using the project's own test framework. \
             Return {{\"files\": [{{\"path\": ..., \"content\": ...}}]}}.\n\n{}",
            files_block(files)
        );
        let reply: Reasoned<FilesReply> = self.ask("generate_tests", prompt, signature).await?;
        Ok(Reasoned::new(reply.data.into_files()).with_signature(reply.signature))
    }

    async fn analyze_frame(&self, frame: &VisionFrame) -> OpsResult<Reasoned<Vec<VisionFinding>>> {
        let prompt = format!(
            "This is a screenshot of {} ({}). Report visible failures: error pages, blank screens, \
             broken layouts, stuck spinners. Return {{\"findings\": [{{\"anomaly_type\": ..., \"severity\": \
             \"low|medium|high|critical\", \"confidence\": 0..1, \"description\": ...}}]}}; an empty list when \
             the page looks healthy.",
            frame.app_name, frame.url
        );
        let raw = self
            .provider
            .generate_with_image(&self.vision_model, prompt, Some(SYSTEM.to_string()), &frame.image_base64)
            .await
            .map_err(|e| OpsError::transient("reasoning", format!("{:#}", e)))?;
        let reply: FindingsReply = parse_reply("analyze_frame", &raw)?;
        Ok(Reasoned::new(reply.findings))
    }

    async fn generate_hypotheses(
        &self,
        incident: &Incident,
        evidence: &[Evidence],
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<Vec<HypothesisDraft>>> {
        let evidence: Vec<Value> = evidence
            .iter()
            .map(|e| json!({ "id": e.id, "kind": e.kind, "source": e.source, "summary": e.summary }))
            .collect();
        let prompt = format!(
            "Incident: {} (severity {}, target {}).\n{}\n\nEvidence:\n{}\n\n\
             Return {{\"hypotheses\": [{{\"title\", \"description\", \"confidence\": 0..1, \
             \"supporting_evidence\": [evidence ids], \"contradicting_evidence\": [evidence ids], \
             \"suggested_action\": \"restart|scale|rollback|code_fix|manual\"|null}}]}}, most likely first.",
            incident.title,
            incident.severity,
            incident.target(),
            incident.description,
            serde_json::to_string_pretty(&evidence)?
        );
        let reply: Reasoned<HypothesesReply> = self.ask("generate_hypotheses", prompt, signature).await?;
        Ok(Reasoned::new(reply.data.hypotheses).with_signature(reply.signature))
    }

    async fn generate_postmortem(
        &self,
        incident: &Incident,
        timeline: &[TimelineEntry],
        actions: &[RemediationAction],
        signature: Option<&ThoughtSignature>,
    ) -> OpsResult<Reasoned<PostmortemDraft>> {
        let timeline: Vec<String> = timeline
            .iter()
            .map(|t| format!("{} [{}] {}", t.at.to_rfc3339(), t.phase, t.message))
            .collect();
        let actions: Vec<Value> = actions
            .iter()
            .map(|a| json!({ "kind": a.kind, "target": a.target, "dry_run": a.dry_run, "success": a.success }))
            .collect();
        let prompt = format!(
            "Write a blameless postmortem for incident \"{}\" (status {:?}).\n\nTimeline:\n{}\n\nActions:\n{}\n\n\
             Return {{\"summary\", \"root_cause\", \"lessons\": [...]}}.",
            incident.title,
            incident.status,
            timeline.join("\n"),
            serde_json::to_string_pretty(&actions)?
        );
        self.ask("generate_postmortem", prompt, signature).await
    }

    async fn analyze_evolution(
        &self,
        evolution: &Evolution,
        files: &[SourceFile],
    ) -> OpsResult<Reasoned<EvolutionAnalysis>> {
        let prompt = format!(
            "Change request ({:?}): {}\n\nEstimate which files must change. Return {{\"affected_files\": [paths], \
             \"impact\": \"low|medium|high\", \"summary\": ...}}.\n\nCurrent files:\n{}",
            evolution.scope,
            evolution.prompt,
            files_block(files)
        );
        let reply: Reasoned<AnalysisReply> = self.ask("analyze_evolution", prompt, None).await?;
        let AnalysisReply {
            affected_files,
            impact,
            summary,
        } = reply.data;
        Ok(Reasoned::new(EvolutionAnalysis {
            affected_files,
            impact,
            summary,
        })
        .with_signature(reply.signature))
    }

    async fn generate_evolution_changes(
        &self,
        evolution: &Evolution,
        files: &[SourceFile],
    ) -> OpsResult<Reasoned<Vec<ProposedChange>>> {
        let scope = evolution
            .analysis
            .as_ref()
            .map(|a| a.affected_files.join(", "))
            .unwrap_or_default();
        let prompt = format!(
            "Change request: {}\nFiles expected to change: {}\n\nReturn {{\"changes\": [{{\"path\", \
             \"kind\": \"create|modify|delete\", \"new_content\": <full file, omitted for delete>}}]}}.\n\n\
             Current files:\n{}",
            evolution.prompt,
            scope,
            files_block(files)
        );
        let reply: Reasoned<ChangesReply> = self.ask("generate_evolution_changes", prompt, None).await?;
        Ok(Reasoned::new(reply.data.changes).with_signature(reply.signature))
    }
}
