//! Run Registry
//!
//! The live investigations and development cycles of this process, each with
//! the cancellation token its run checks. Passed by reference into every
//! entry point, so separate instances stay isolated.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::{OpsError, OpsResult};
use crate::utils::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunKind {
    Investigation,
    Cycle,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Investigation => write!(f, "investigation"),
            RunKind::Cycle => write!(f, "development cycle"),
        }
    }
}

pub struct RunRegistry {
    instance_id: String,
    runs: Mutex<HashMap<(RunKind, String), CancellationToken>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::with_instance_id(format!("autonomic-{}", Uuid::new_v4()))
    }

    pub fn with_instance_id(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Owner id used for investigation claims.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register a run. A second run for the same id is refused while the
    /// first is live; dropping the guard deregisters it.
    pub fn begin(&self, kind: RunKind, id: &str) -> OpsResult<RunGuard<'_>> {
        let mut runs = self.lock()?;
        let key = (kind, id.to_string());
        if runs.contains_key(&key) {
            return Err(OpsError::ResourceLimit(format!("{} {} is already running", kind, id)));
        }
        let token = CancellationToken::new();
        runs.insert(key.clone(), token.clone());
        Ok(RunGuard {
            registry: self,
            key,
            token,
        })
    }

    fn finish(&self, key: &(RunKind, String)) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(key);
        }
    }

    /// False when no such run is live.
    pub fn cancel(&self, kind: RunKind, id: &str) -> bool {
        match self.runs.lock() {
            Ok(runs) => match runs.get(&(kind, id.to_string())) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// Stop every live run for process shutdown; the runs stay resumable.
    pub fn cancel_all(&self) {
        if let Ok(runs) = self.runs.lock() {
            for token in runs.values() {
                token.interrupt();
            }
        }
    }

    pub fn is_running(&self, kind: RunKind, id: &str) -> bool {
        self.runs
            .lock()
            .map(|runs| runs.contains_key(&(kind, id.to_string())))
            .unwrap_or(false)
    }

    pub fn active(&self, kind: RunKind) -> Vec<String> {
        let mut ids: Vec<String> = self
            .runs
            .lock()
            .map(|runs| runs.keys().filter(|(k, _)| *k == kind).map(|(_, id)| id.clone()).collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    fn lock(&self) -> OpsResult<std::sync::MutexGuard<'_, HashMap<(RunKind, String), CancellationToken>>> {
        self.runs
            .lock()
            .map_err(|_| OpsError::Repository("run registry lock poisoned".into()))
    }
}

/// A live registration. The run stays registered until this is dropped,
/// including when its future is dropped mid-flight.
pub struct RunGuard<'a> {
    registry: &'a RunRegistry,
    key: (RunKind, String),
    token: CancellationToken,
}

impl RunGuard<'_> {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.registry.finish(&self.key);
    }
}

impl Default for RunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_runs_are_refused() {
        let registry = RunRegistry::with_instance_id("node-a");
        let run = registry.begin(RunKind::Investigation, "inc-1").unwrap();
        assert!(matches!(
            registry.begin(RunKind::Investigation, "inc-1"),
            Err(OpsError::ResourceLimit(_))
        ));
        // same id, different kind
        let _cycle = registry.begin(RunKind::Cycle, "inc-1").unwrap();

        assert!(registry.cancel(RunKind::Investigation, "inc-1"));
        let token = run.token();
        assert!(token.is_cancelled() && !token.is_interrupted());

        drop(run);
        assert!(!registry.is_running(RunKind::Investigation, "inc-1"));
        assert!(!registry.cancel(RunKind::Investigation, "inc-1"));
        assert!(registry.is_running(RunKind::Cycle, "inc-1"));
        let _again = registry.begin(RunKind::Investigation, "inc-1").unwrap();
    }

    #[test]
    fn test_cancel_all_reaches_every_run() {
        let registry = RunRegistry::new();
        let a = registry.begin(RunKind::Investigation, "a").unwrap();
        let b = registry.begin(RunKind::Cycle, "b").unwrap();
        assert_eq!(registry.active(RunKind::Cycle), vec!["b".to_string()]);
        registry.cancel_all();
        assert!(a.token().is_interrupted() && b.token().is_interrupted());
        assert!(registry.instance_id().starts_with("autonomic-"));
    }

    #[tokio::test]
    async fn test_aborted_run_is_deregistered() {
        let registry = std::sync::Arc::new(RunRegistry::new());
        let held = registry.clone();
        let task = tokio::spawn(async move {
            let _run = held.begin(RunKind::Cycle, "c-1")?;
            std::future::pending::<OpsResult<()>>().await
        });
        while !registry.is_running(RunKind::Cycle, "c-1") {
            tokio::task::yield_now().await;
        }
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!registry.is_running(RunKind::Cycle, "c-1"));
        assert!(registry.active(RunKind::Cycle).is_empty());
    }
}
