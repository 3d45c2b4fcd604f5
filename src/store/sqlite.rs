//! SQLite persistence.
//!
//! Entities are stored as JSON documents keyed by `(kind, id)` with an
//! optional parent id for per-incident and per-cycle listings. File versions
//! get their own table so numbering can be assigned inside one transaction.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;

use crate::error::{OpsError, OpsResult};
use crate::model::{
    DevelopmentCycle, Evidence, Evolution, FileVersion, GeneratedFile, Hypothesis, Incident, InvestigationClaim,
    LearnedPattern, Postmortem, RemediationAction, TimelineEntry,
};
use crate::services::repository::{CycleRepository, EvolutionRepository, IncidentRepository};

const INCIDENT: &str = "incident";
const EVIDENCE: &str = "evidence";
const HYPOTHESIS: &str = "hypothesis";
const ACTION: &str = "action";
const TIMELINE: &str = "timeline";
const POSTMORTEM: &str = "postmortem";
const PATTERN: &str = "pattern";
const CYCLE: &str = "cycle";
const FILE: &str = "file";
const EVOLUTION: &str = "evolution";

#[derive(Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub async fn new(db_path: impl AsRef<Path>) -> OpsResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let path_clone = path.clone();

        task::spawn_blocking(move || {
            let conn = Connection::open(&path_clone)?;
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS documents (
                    kind TEXT NOT NULL,
                    id TEXT NOT NULL,
                    parent_id TEXT,
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (kind, id)
                );
                CREATE INDEX IF NOT EXISTS idx_documents_parent ON documents(kind, parent_id);
                CREATE TABLE IF NOT EXISTS file_versions (
                    cycle_id TEXT NOT NULL,
                    path TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    body TEXT NOT NULL,
                    PRIMARY KEY (cycle_id, path, version)
                );
                "#,
            )?;
            Ok::<_, OpsError>(())
        })
        .await??;

        Ok(Self { db_path: path })
    }

    async fn with_conn<T, F>(&self, f: F) -> OpsResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> OpsResult<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)?;
            conn.busy_timeout(Duration::from_secs(5))?;
            f(&mut conn)
        })
        .await?
    }

    /// Insert or replace the body, keeping the original row position.
    async fn put<T: Serialize>(&self, kind: &'static str, id: &str, parent: Option<&str>, value: &T) -> OpsResult<()> {
        let body = serde_json::to_string(value)?;
        let id = id.to_string();
        let parent = parent.map(str::to_string);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO documents (kind, id, parent_id, body, created_at) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(kind, id) DO UPDATE SET parent_id = excluded.parent_id, body = excluded.body",
                params![kind, &id, &parent, &body, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }

    async fn replace<T: Serialize>(&self, kind: &'static str, id: &str, value: &T) -> OpsResult<()> {
        let body = serde_json::to_string(value)?;
        let id = id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE documents SET body = ?1 WHERE kind = ?2 AND id = ?3",
                params![&body, kind, &id],
            )?;
            if changed == 0 {
                return Err(OpsError::not_found(kind, id));
            }
            Ok(())
        })
        .await
    }

    async fn get<T: DeserializeOwned + Send + 'static>(&self, kind: &'static str, id: &str) -> OpsResult<Option<T>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM documents WHERE kind = ?1 AND id = ?2",
                    params![kind, &id],
                    |row| row.get(0),
                )
                .optional()?;
            body.map(|b| serde_json::from_str(&b).map_err(OpsError::from)).transpose()
        })
        .await
    }

    /// Insertion order.
    async fn list<T: DeserializeOwned + Send + 'static>(
        &self,
        kind: &'static str,
        parent: Option<&str>,
    ) -> OpsResult<Vec<T>> {
        let parent = parent.map(str::to_string);
        self.with_conn(move |conn| {
            let bodies: Vec<String> = match &parent {
                Some(p) => {
                    let mut stmt = conn
                        .prepare("SELECT body FROM documents WHERE kind = ?1 AND parent_id = ?2 ORDER BY rowid ASC")?;
                    let rows = stmt.query_map(params![kind, p], |row| row.get(0))?;
                    rows.collect::<Result<Vec<String>, rusqlite::Error>>()?
                }
                None => {
                    let mut stmt = conn.prepare("SELECT body FROM documents WHERE kind = ?1 ORDER BY rowid ASC")?;
                    let rows = stmt.query_map(params![kind], |row| row.get(0))?;
                    rows.collect::<Result<Vec<String>, rusqlite::Error>>()?
                }
            };
            bodies
                .iter()
                .map(|b| serde_json::from_str(b).map_err(OpsError::from))
                .collect()
        })
        .await
    }

    /// Read-modify-write of an incident's claim inside one transaction.
    async fn modify_claim<F>(&self, incident_id: &str, f: F) -> OpsResult<bool>
    where
        F: FnOnce(&mut Incident) -> bool + Send + 'static,
    {
        let id = incident_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let body: Option<String> = tx
                .query_row(
                    "SELECT body FROM documents WHERE kind = ?1 AND id = ?2",
                    params![INCIDENT, &id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(body) = body else {
                return Err(OpsError::not_found("incident", id));
            };
            let mut incident: Incident = serde_json::from_str(&body)?;
            let changed = f(&mut incident);
            if changed {
                tx.execute(
                    "UPDATE documents SET body = ?1 WHERE kind = ?2 AND id = ?3",
                    params![serde_json::to_string(&incident)?, INCIDENT, &id],
                )?;
            }
            tx.commit()?;
            Ok(changed)
        })
        .await
    }
}

fn file_key(cycle_id: &str, path: &str) -> String {
    format!("{}:{}", cycle_id, path)
}

#[async_trait]
impl IncidentRepository for SqliteStore {
    async fn create_incident(&self, incident: &Incident) -> OpsResult<()> {
        self.put(INCIDENT, &incident.id, None, incident).await
    }

    async fn update_incident(&self, incident: &Incident) -> OpsResult<()> {
        let updated = incident.clone();
        self.modify_claim(&incident.id, move |stored| {
            let claim = stored.claim.take();
            *stored = updated;
            stored.claim = claim;
            true
        })
        .await
        .map(|_| ())
    }

    async fn get_incident(&self, id: &str) -> OpsResult<Option<Incident>> {
        self.get(INCIDENT, id).await
    }

    async fn list_incidents(&self) -> OpsResult<Vec<Incident>> {
        self.list(INCIDENT, None).await
    }

    async fn claim_investigation(&self, incident_id: &str, owner_id: &str, stale_after: Duration) -> OpsResult<bool> {
        let owner = owner_id.to_string();
        self.modify_claim(incident_id, move |incident| {
            let now = Utc::now();
            let started_at = match &incident.claim {
                None => None,
                Some(c) if c.owner_id == owner => Some(c.started_at),
                Some(c) if c.is_stale(now, stale_after) => None,
                Some(_) => return false,
            };
            let mut claim = InvestigationClaim::new(owner);
            if let Some(started) = started_at {
                claim.started_at = started;
            }
            incident.claim = Some(claim);
            true
        })
        .await
    }

    async fn renew_heartbeat(&self, incident_id: &str, owner_id: &str) -> OpsResult<bool> {
        let owner = owner_id.to_string();
        self.modify_claim(incident_id, move |incident| match incident.claim.as_mut() {
            Some(c) if c.owner_id == owner => {
                c.heartbeat_at = Utc::now();
                true
            }
            _ => false,
        })
        .await
    }

    async fn release_claim(&self, incident_id: &str, owner_id: &str) -> OpsResult<()> {
        let owner = owner_id.to_string();
        match self
            .modify_claim(incident_id, move |incident| {
                if incident.claim.as_ref().is_some_and(|c| c.owner_id == owner) {
                    incident.claim = None;
                    true
                } else {
                    false
                }
            })
            .await
        {
            Ok(_) | Err(OpsError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn add_evidence(&self, evidence: &Evidence) -> OpsResult<()> {
        self.put(EVIDENCE, &evidence.id, Some(&evidence.incident_id), evidence).await
    }

    async fn list_evidence(&self, incident_id: &str) -> OpsResult<Vec<Evidence>> {
        self.list(EVIDENCE, Some(incident_id)).await
    }

    async fn add_hypothesis(&self, hypothesis: &Hypothesis) -> OpsResult<()> {
        self.put(HYPOTHESIS, &hypothesis.id, Some(&hypothesis.incident_id), hypothesis)
            .await
    }

    async fn list_hypotheses(&self, incident_id: &str) -> OpsResult<Vec<Hypothesis>> {
        self.list(HYPOTHESIS, Some(incident_id)).await
    }

    async fn record_action(&self, action: &RemediationAction) -> OpsResult<()> {
        self.put(ACTION, &action.id, Some(&action.incident_id), action).await
    }

    async fn list_actions(&self, incident_id: &str) -> OpsResult<Vec<RemediationAction>> {
        self.list(ACTION, Some(incident_id)).await
    }

    async fn append_timeline(&self, entry: &TimelineEntry) -> OpsResult<()> {
        self.put(TIMELINE, &entry.id, Some(&entry.incident_id), entry).await
    }

    async fn list_timeline(&self, incident_id: &str) -> OpsResult<Vec<TimelineEntry>> {
        self.list(TIMELINE, Some(incident_id)).await
    }

    async fn save_postmortem(&self, postmortem: &Postmortem) -> OpsResult<()> {
        self.put(POSTMORTEM, &postmortem.incident_id, None, postmortem).await
    }

    async fn get_postmortem(&self, incident_id: &str) -> OpsResult<Option<Postmortem>> {
        self.get(POSTMORTEM, incident_id).await
    }

    async fn upsert_pattern(&self, pattern: &LearnedPattern) -> OpsResult<()> {
        self.put(PATTERN, &pattern.signature, None, pattern).await
    }

    async fn find_pattern(&self, signature: &str) -> OpsResult<Option<LearnedPattern>> {
        self.get(PATTERN, signature).await
    }
}

#[async_trait]
impl CycleRepository for SqliteStore {
    async fn create_cycle(&self, cycle: &DevelopmentCycle) -> OpsResult<()> {
        self.put(CYCLE, &cycle.id, None, cycle).await
    }

    async fn update_cycle(&self, cycle: &DevelopmentCycle) -> OpsResult<()> {
        self.replace(CYCLE, &cycle.id, cycle).await
    }

    async fn get_cycle(&self, id: &str) -> OpsResult<Option<DevelopmentCycle>> {
        self.get(CYCLE, id).await
    }

    async fn list_cycles(&self) -> OpsResult<Vec<DevelopmentCycle>> {
        self.list(CYCLE, None).await
    }

    async fn save_file(&self, file: &GeneratedFile) -> OpsResult<()> {
        self.put(FILE, &file_key(&file.cycle_id, &file.path), Some(&file.cycle_id), file)
            .await
    }

    async fn get_file(&self, cycle_id: &str, path: &str) -> OpsResult<Option<GeneratedFile>> {
        self.get(FILE, &file_key(cycle_id, path)).await
    }

    async fn list_files(&self, cycle_id: &str) -> OpsResult<Vec<GeneratedFile>> {
        let mut files: Vec<GeneratedFile> = self.list(FILE, Some(cycle_id)).await?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn delete_file(&self, cycle_id: &str, path: &str) -> OpsResult<()> {
        let key = file_key(cycle_id, path);
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM documents WHERE kind = ?1 AND id = ?2", params![FILE, &key])?;
            Ok(())
        })
        .await
    }

    async fn save_file_version(&self, mut version: FileVersion) -> OpsResult<FileVersion> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let latest: u32 = tx.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM file_versions WHERE cycle_id = ?1 AND path = ?2",
                params![&version.cycle_id, &version.path],
                |row| row.get(0),
            )?;
            version.version = latest + 1;
            tx.execute(
                "INSERT INTO file_versions (cycle_id, path, version, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    &version.cycle_id,
                    &version.path,
                    version.version,
                    serde_json::to_string(&version)?
                ],
            )?;
            tx.commit()?;
            Ok(version)
        })
        .await
    }

    async fn list_file_versions(&self, cycle_id: &str, path: &str) -> OpsResult<Vec<FileVersion>> {
        let cycle_id = cycle_id.to_string();
        let path = path.to_string();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT body FROM file_versions WHERE cycle_id = ?1 AND path = ?2 ORDER BY version ASC")?;
            let rows = stmt.query_map(params![&cycle_id, &path], |row| row.get::<_, String>(0))?;
            let mut out = Vec::new();
            for body in rows {
                out.push(serde_json::from_str(&body?)?);
            }
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl EvolutionRepository for SqliteStore {
    async fn create_evolution(&self, evolution: &Evolution) -> OpsResult<()> {
        self.put(EVOLUTION, &evolution.id, Some(&evolution.cycle_id), evolution)
            .await
    }

    async fn update_evolution(&self, evolution: &Evolution) -> OpsResult<()> {
        self.replace(EVOLUTION, &evolution.id, evolution).await
    }

    async fn get_evolution(&self, id: &str) -> OpsResult<Option<Evolution>> {
        self.get(EVOLUTION, id).await
    }

    async fn list_evolutions(&self, cycle_id: &str) -> OpsResult<Vec<Evolution>> {
        self.list(EVOLUTION, Some(cycle_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CyclePhase, EvolutionScope, Severity, SourceFile, FileKind, VersionReason};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_incident_roundtrip_and_claims() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("ops.db")).await.unwrap();
        let incident = Incident::new("[checkout-svc] Error rate high", Severity::High, "shop").with_app("checkout-svc");
        store.create_incident(&incident).await.unwrap();

        assert!(store.claim_investigation(&incident.id, "a", Duration::from_secs(60)).await.unwrap());
        assert!(!store.claim_investigation(&incident.id, "b", Duration::from_secs(60)).await.unwrap());

        let mut changed = incident.clone();
        changed.status = crate::model::IncidentStatus::Investigating;
        store.update_incident(&changed).await.unwrap();

        let stored = store.get_incident(&incident.id).await.unwrap().unwrap();
        assert_eq!(stored.status, crate::model::IncidentStatus::Investigating);
        assert_eq!(stored.claim.unwrap().owner_id, "a");
        assert!(store.get_incident("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_of_missing_cycle_is_not_found() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("ops.db")).await.unwrap();
        let cycle = DevelopmentCycle::new("todo api", "todo", "default");
        let err = store.update_cycle(&cycle).await.unwrap_err();
        assert!(matches!(err, OpsError::NotFound { .. }));

        store.create_cycle(&cycle).await.unwrap();
        let mut cycle = cycle;
        cycle.phase = CyclePhase::Building;
        store.update_cycle(&cycle).await.unwrap();
        assert_eq!(store.get_cycle(&cycle.id).await.unwrap().unwrap().phase, CyclePhase::Building);
    }

    #[tokio::test]
    async fn test_files_versions_and_evolutions() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("ops.db")).await.unwrap();

        let file = GeneratedFile::new("c1", SourceFile::new("src/b.ts", "b"), FileKind::Source);
        store.save_file(&file).await.unwrap();
        store
            .save_file(&GeneratedFile::new("c1", SourceFile::new("src/a.ts", "a"), FileKind::Source))
            .await
            .unwrap();
        let paths: Vec<String> = store.list_files("c1").await.unwrap().into_iter().map(|f| f.path).collect();
        assert_eq!(paths, vec!["src/a.ts", "src/b.ts"]);
        store.delete_file("c1", "src/a.ts").await.unwrap();
        assert!(store.get_file("c1", "src/a.ts").await.unwrap().is_none());

        let v1 = store
            .save_file_version(FileVersion::new("c1", "src/b.ts", Some("b".into()), VersionReason::Generated))
            .await
            .unwrap();
        let v2 = store
            .save_file_version(FileVersion::new("c1", "src/b.ts", None, VersionReason::Generated))
            .await
            .unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));

        let evo = Evolution::new("c1", "add pagination", EvolutionScope::Feature);
        store.create_evolution(&evo).await.unwrap();
        assert_eq!(store.list_evolutions("c1").await.unwrap().len(), 1);
        assert!(store.list_evolutions("c2").await.unwrap().is_empty());
    }
}
