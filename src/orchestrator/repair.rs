//! Self-Repair Loop
//!
//! Build, and on failure parse structured errors out of the raw tool output,
//! ask the reasoning service to fix each affected file, then rebuild. Shared by
//! the BUILDING phase and the standalone rebuild path.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

use crate::error::{OpsError, OpsResult};
use crate::model::{CyclePhase, DevelopmentCycle, FailureContext, FileVersion, GeneratedFile, VersionReason};
use crate::orchestrator::development::retry_recorder;
use crate::orchestrator::event_bus::{Listeners, RunEvent};
use crate::services::build::{BuildError, BuildExecutor, BuildOutcome, BuildRequest};
use crate::services::reasoning::ReasoningService;
use crate::services::repository::CycleRepository;
use crate::utils::{truncate_middle, CancellationToken, PhaseRetry};

struct Patterns {
    docker_prefix: Regex,
    tsc: Regex,
    tsc_pretty: Regex,
    rustc_header: Regex,
    rustc_location: Regex,
    python_frame: Regex,
    python_error: Regex,
    generic: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            docker_prefix: Regex::new(r"^#\d+ \d+(?:\.\d+)? ")?,
            tsc: Regex::new(r"^(?P<file>[^\s(]+)\((?P<line>\d+),(?P<col>\d+)\): error (?P<code>TS\d+): (?P<msg>.+)$")?,
            tsc_pretty: Regex::new(r"^(?P<file>[^\s:]+):(?P<line>\d+):(?P<col>\d+) - error (?P<code>TS\d+): (?P<msg>.+)$")?,
            rustc_header: Regex::new(r"^error(?:\[(?P<code>E\d+)\])?: (?P<msg>.+)$")?,
            rustc_location: Regex::new(r"^\s*--> (?P<file>[^:\s]+):(?P<line>\d+):(?P<col>\d+)")?,
            python_frame: Regex::new(r#"^\s*File "(?P<file>[^"]+)", line (?P<line>\d+)"#)?,
            python_error: Regex::new(r"^(?P<code>[A-Za-z_]+(?:Error|Exception)): (?P<msg>.+)$")?,
            generic: Regex::new(
                r"^(?:\./)?(?P<file>[\w./-]+\.(?:ts|tsx|js|jsx|mjs|cjs|go|py|rs|c|cc|cpp|h|hpp|java|kt|rb|php|cs)):(?P<line>\d+):(?:(?P<col>\d+):)?\s*(?:(?:fatal )?error:?\s*)?(?P<msg>.+)$",
            )?,
        })
    }
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| match Patterns::compile() {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(error = %e, "build error patterns failed to compile");
                None
            }
        })
        .as_ref()
}

fn push(e: BuildError, errors: &mut Vec<BuildError>) {
    if !errors.contains(&e) {
        errors.push(e);
    }
}

fn num(m: Option<regex::Match<'_>>) -> Option<u32> {
    m.and_then(|m| m.as_str().parse().ok())
}

/// Structured errors from compiler and test-runner output. Unrecognized lines
/// are ignored; identical errors are reported once.
pub fn parse_build_errors(logs: &str) -> Vec<BuildError> {
    let Some(p) = patterns() else {
        return Vec::new();
    };
    let mut errors: Vec<BuildError> = Vec::new();
    let mut rustc_pending: Option<(Option<String>, String)> = None;
    let mut python_frame: Option<(String, Option<u32>)> = None;

    for raw in logs.lines() {
        let line = p.docker_prefix.replace(raw.trim_end(), "");
        let line = line.as_ref();

        if let Some(c) = p.tsc.captures(line).or_else(|| p.tsc_pretty.captures(line)) {
            push(
                BuildError {
                    file: c["file"].to_string(),
                    line: num(c.name("line")),
                    column: num(c.name("col")),
                    code: Some(c["code"].to_string()),
                    message: c["msg"].trim().to_string(),
                },
                &mut errors,
            );
            continue;
        }
        if let Some(c) = p.rustc_header.captures(line) {
            rustc_pending = Some((c.name("code").map(|m| m.as_str().to_string()), c["msg"].trim().to_string()));
            continue;
        }
        if let Some(c) = p.rustc_location.captures(line) {
            if let Some((code, message)) = rustc_pending.take() {
                push(
                    BuildError {
                        file: c["file"].to_string(),
                        line: num(c.name("line")),
                        column: num(c.name("col")),
                        code,
                        message,
                    },
                    &mut errors,
                );
            }
            continue;
        }
        if let Some(c) = p.python_frame.captures(line) {
            python_frame = Some((c["file"].to_string(), num(c.name("line"))));
            continue;
        }
        if let Some(c) = p.python_error.captures(line) {
            if let Some((file, line_no)) = python_frame.take() {
                push(
                    BuildError {
                        file,
                        line: line_no,
                        column: None,
                        code: Some(c["code"].to_string()),
                        message: c["msg"].trim().to_string(),
                    },
                    &mut errors,
                );
            }
            continue;
        }
        if let Some(c) = p.generic.captures(line) {
            push(
                BuildError {
                    file: c["file"].to_string(),
                    line: num(c.name("line")),
                    column: num(c.name("col")),
                    code: None,
                    message: c["msg"].trim().to_string(),
                },
                &mut errors,
            );
        }
    }
    errors
}

/// Errors keyed by the file they point at.
pub fn group_by_file(errors: &[BuildError]) -> BTreeMap<String, Vec<BuildError>> {
    let mut grouped: BTreeMap<String, Vec<BuildError>> = BTreeMap::new();
    for e in errors {
        grouped.entry(e.file.clone()).or_default().push(e.clone());
    }
    grouped
}

/// Compiler paths may be absolute (the build workspace) or `./`-prefixed.
fn matches_path(reported: &str, stored: &str) -> bool {
    let reported = reported.trim_start_matches("./");
    let stored = stored.trim_start_matches("./");
    reported == stored || reported.ends_with(&format!("/{}", stored))
}

#[derive(Debug, Clone)]
pub struct RepairReport {
    pub build: BuildOutcome,
    /// Fix rounds performed, not builds.
    pub attempts: u32,
}

pub struct SelfRepair {
    pub cycles: Arc<dyn CycleRepository>,
    pub reasoning: Arc<dyn ReasoningService>,
    pub builder: Arc<dyn BuildExecutor>,
    pub max_attempts: u32,
    pub retry: PhaseRetry,
}

impl SelfRepair {
    fn terminal(cycle: &DevelopmentCycle, message: impl ToString) -> OpsError {
        OpsError::Terminal(FailureContext::new(CyclePhase::Building, message).with_retries(
            cycle.phase_retries.iter().map(|(phase, n)| (phase.to_string(), *n)),
        ))
    }

    /// Build the cycle's stored files, repairing until the build passes or the
    /// loop stops making progress. Transient executor and reasoning failures
    /// draw on the cycle's cumulative BUILDING retry budget.
    pub async fn build(
        &self,
        cycle: &mut DevelopmentCycle,
        tag: &str,
        listeners: &Listeners,
        token: &CancellationToken,
    ) -> OpsResult<RepairReport> {
        let mut files = self.cycles.list_files(&cycle.id).await?;
        let mut attempts = 0u32;

        loop {
            token.check()?;
            let request = BuildRequest {
                cycle_id: cycle.id.clone(),
                app_name: cycle.app_name.clone(),
                tag: tag.to_string(),
                files: files.iter().map(GeneratedFile::as_source).collect(),
            };
            let mut used = cycle.retries_for(CyclePhase::Building);
            let record = retry_recorder(self.cycles.clone(), cycle, CyclePhase::Building);
            let result = self
                .retry
                .run_recorded("BUILDING", &mut used, token, || self.builder.build(&request), record)
                .await;
            cycle.phase_retries.insert(CyclePhase::Building, used);
            let outcome = result?;

            if outcome.success {
                info!(cycle_id = %cycle.id, repairs = attempts, "build succeeded");
                return Ok(RepairReport { build: outcome, attempts });
            }

            let summary = outcome
                .error
                .clone()
                .unwrap_or_else(|| truncate_middle(&outcome.logs, 400));
            if attempts >= self.max_attempts {
                return Err(Self::terminal(
                    cycle,
                    format!("build still failing after {} repair attempts: {}", attempts, summary),
                ));
            }
            let errors = parse_build_errors(&outcome.logs);
            if errors.is_empty() {
                return Err(Self::terminal(cycle, format!("build failed with no parseable errors: {}", summary)));
            }

            attempts += 1;
            let grouped = group_by_file(&errors);
            info!(cycle_id = %cycle.id, attempt = attempts, errors = errors.len(), files = grouped.len(), "attempting self-repair");

            let mut changed = 0usize;
            for (reported, file_errors) in &grouped {
                token.check()?;
                let Some(idx) = files.iter().position(|f| matches_path(reported, &f.path)) else {
                    warn!(cycle_id = %cycle.id, file = %reported, "error points at a file the cycle does not own");
                    continue;
                };
                let source = files[idx].as_source();
                let signature = cycle.thought_signature.clone();
                let mut used = cycle.retries_for(CyclePhase::Building);
                let record = retry_recorder(self.cycles.clone(), cycle, CyclePhase::Building);
                let result = self
                    .retry
                    .run_recorded(
                        "BUILDING",
                        &mut used,
                        token,
                        || self.reasoning.fix_code(&source, file_errors, signature.as_ref()),
                        record,
                    )
                    .await;
                cycle.phase_retries.insert(CyclePhase::Building, used);
                // one file's failed fix leaves the others to be tried
                let fix = match result {
                    Ok(reasoned) => reasoned.thread(&mut cycle.thought_signature),
                    Err(OpsError::Cancelled) => return Err(OpsError::Cancelled),
                    Err(e) => {
                        warn!(cycle_id = %cycle.id, file = %source.path, error = %e, "fix attempt failed");
                        continue;
                    }
                };

                if !fix.changed || fix.content == source.content || fix.content.trim().is_empty() {
                    continue;
                }
                let file = &mut files[idx];
                file.content = fix.content;
                file.updated_at = chrono::Utc::now();
                self.cycles.save_file(file).await?;
                self.cycles
                    .save_file_version(FileVersion::new(
                        &cycle.id,
                        &file.path,
                        Some(file.content.clone()),
                        VersionReason::Repair { attempt: attempts },
                    ))
                    .await?;
                changed += 1;
            }

            listeners.emit(RunEvent::RepairAttempted {
                cycle_id: cycle.id.clone(),
                attempt: attempts,
                files_changed: changed,
            });
            if changed == 0 {
                return Err(Self::terminal(
                    cycle,
                    format!("repair attempt {} changed no files: {}", attempts, summary),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tsc_and_rustc_output() {
        let logs = "\
#12 4.210 src/server.ts(14,7): error TS2322: Type 'string' is not assignable to type 'number'.
#12 4.211 src/routes/todo.ts:3:10 - error TS2305: Module './db' has no exported member 'pool'.
error[E0308]: mismatched types
  --> src/main.rs:4:18
warning: unused variable
Found 2 errors.";
        let errors = parse_build_errors(logs);
        assert_eq!(errors.len(), 3);
        assert_eq!(errors[0].file, "src/server.ts");
        assert_eq!(errors[0].line, Some(14));
        assert_eq!(errors[0].code.as_deref(), Some("TS2322"));
        assert_eq!(errors[1].file, "src/routes/todo.ts");
        assert_eq!(errors[2].file, "src/main.rs");
        assert_eq!(errors[2].code.as_deref(), Some("E0308"));
        assert_eq!(errors[2].message, "mismatched types");
    }

    #[test]
    fn test_parse_go_and_python_output() {
        let logs = r#"./main.go:12:5: undefined: handler
./main.go:12:5: undefined: handler
Traceback (most recent call last):
  File "/app/app/main.py", line 7, in <module>
    from app.db import engine
ImportError: cannot import name 'engine'"#;
        let errors = parse_build_errors(logs);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].file, "main.go");
        assert_eq!(errors[0].message, "undefined: handler");
        assert_eq!(errors[1].file, "/app/app/main.py");
        assert_eq!(errors[1].code.as_deref(), Some("ImportError"));

        let grouped = group_by_file(&errors);
        assert_eq!(grouped.len(), 2);
        assert!(matches_path("/app/app/main.py", "app/main.py"));
        assert!(!matches_path("/app/app/main.py", "main.py.bak"));
    }

    #[test]
    fn test_unparseable_output_yields_nothing() {
        assert!(parse_build_errors("npm ERR! code ELIFECYCLE\nnpm ERR! errno 1").is_empty());
    }
}
