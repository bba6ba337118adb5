//! File-backed tracker: the whole session state in one JSON document.
//!
//! Every state change rewrites the document through
//! [`write_atomic`](legisflow_shared::write_atomic), so a crash leaves either
//! the previous or the next version on disk, never a torn one. A document
//! that cannot be parsed or fails consistency checks is reported as
//! [`LegisflowError::StateCorruption`] and is never silently reset.
//!
//! Each change rewrites the full document, so this backend suits sessions of
//! a few hundred bills; larger sessions belong on the SQL tracker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use legisflow_shared::{
    ArtifactRef, BillId, BillMetadata, CURRENT_SCHEMA_VERSION, Fingerprint, LegisflowError, Result,
    SessionId, Stage, StageError, StageRecord, write_atomic,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::{StateTracker, TrackedBill, record};

/// On-disk layout of `pipeline_state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateDocument {
    schema_version: u32,
    session: SessionId,
    updated_at: DateTime<Utc>,
    /// Keyed by bill number.
    bills: BTreeMap<String, TrackedBill>,
}

impl StateDocument {
    fn empty(session: SessionId) -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            session,
            updated_at: Utc::now(),
            bills: BTreeMap::new(),
        }
    }

    fn validate(&self, expected: &SessionId) -> std::result::Result<(), String> {
        if self.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(format!(
                "schema_version {} is not supported (expected {CURRENT_SCHEMA_VERSION})",
                self.schema_version
            ));
        }
        if &self.session != expected {
            return Err(format!(
                "state belongs to session {} but {expected} was requested",
                self.session
            ));
        }
        for (key, bill) in &self.bills {
            if key != &bill.id.number || bill.id.session != self.session {
                return Err(format!("bill entry {key} is keyed inconsistently ({})", bill.id));
            }
            for (stage, rec) in &bill.stages {
                if &rec.stage != stage || rec.bill != bill.id {
                    return Err(format!("{} {stage} record belongs to another key", bill.id));
                }
                record::check_consistent(rec)?;
            }
        }
        Ok(())
    }
}

/// Tracker persisted as a single JSON file per session.
#[derive(Debug)]
pub struct JsonFileTracker {
    path: PathBuf,
    session: SessionId,
    state: Mutex<StateDocument>,
}

impl JsonFileTracker {
    /// Open the state file at `path`, starting empty when it does not exist.
    #[instrument(skip_all, fields(path = %path.as_ref().display(), session = %session))]
    pub async fn open(path: impl AsRef<Path>, session: SessionId) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let doc: StateDocument = serde_json::from_str(&content).map_err(|e| {
                    LegisflowError::StateCorruption(format!(
                        "{} is not a valid state document: {e}",
                        path.display()
                    ))
                })?;
                doc.validate(&session).map_err(|msg| {
                    LegisflowError::StateCorruption(format!("{}: {msg}", path.display()))
                })?;
                info!(bills = doc.bills.len(), "loaded pipeline state");
                doc
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no pipeline state yet, starting empty");
                StateDocument::empty(session.clone())
            }
            Err(e) => return Err(LegisflowError::io(&path, e)),
        };

        Ok(Self {
            path,
            session,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_session(&self, bill: &BillId) -> Result<()> {
        if bill.session != self.session {
            return Err(LegisflowError::validation(format!(
                "{bill} does not belong to session {}",
                self.session
            )));
        }
        Ok(())
    }

    /// Apply a change to one bill entry and persist the document. The
    /// in-memory copy only changes if the write succeeds.
    async fn mutate<T>(
        &self,
        bill: &BillId,
        apply: impl FnOnce(&mut TrackedBill) -> T + Send,
    ) -> Result<T> {
        self.check_session(bill)?;
        let mut state = self.state.lock().await;

        let mut entry = state.bills.get(bill.key()).cloned().unwrap_or_else(|| TrackedBill {
            id: bill.clone(),
            metadata: None,
            stages: BTreeMap::new(),
        });
        let out = apply(&mut entry);

        let previous_at = state.updated_at;
        let previous = state.bills.insert(bill.key().to_string(), entry);
        state.updated_at = Utc::now();

        if let Err(e) = self.persist(&state).await {
            match previous {
                Some(prev) => state.bills.insert(bill.key().to_string(), prev),
                None => state.bills.remove(bill.key()),
            };
            state.updated_at = previous_at;
            return Err(e);
        }
        Ok(out)
    }

    /// Encode under the caller's lock, then write on the blocking pool so the
    /// fsync does not stall a runtime worker. The lock stays held until the
    /// write lands, which keeps writes ordered.
    async fn persist(&self, doc: &StateDocument) -> Result<()> {
        let json = serde_json::to_vec_pretty(doc)
            .map_err(|e| LegisflowError::Storage(format!("failed to encode state: {e}")))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|e| LegisflowError::Storage(format!("state write task failed: {e}")))?
    }

    async fn update_stage(
        &self,
        bill: &BillId,
        stage: Stage,
        apply: impl FnOnce(Option<StageRecord>) -> StageRecord + Send,
    ) -> Result<StageRecord> {
        self.mutate(bill, |entry| {
            let next = apply(entry.stages.get(&stage).cloned());
            entry.stages.insert(stage, next.clone());
            next
        })
        .await
    }
}

#[async_trait]
impl StateTracker for JsonFileTracker {
    fn backend(&self) -> &'static str {
        "json"
    }

    async fn get(&self, bill: &BillId, stage: Stage) -> Result<Option<StageRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .bills
            .get(bill.key())
            .filter(|b| b.id == *bill)
            .and_then(|b| b.stages.get(&stage))
            .cloned())
    }

    async fn record_success(
        &self,
        bill: &BillId,
        stage: Stage,
        fingerprint: &Fingerprint,
        artifact: &ArtifactRef,
    ) -> Result<StageRecord> {
        self.update_stage(bill, stage, |prev| {
            record::succeeded(prev, bill, stage, fingerprint, artifact, Utc::now())
        })
        .await
    }

    async fn record_failure(
        &self,
        bill: &BillId,
        stage: Stage,
        fingerprint: &Fingerprint,
        error: &StageError,
    ) -> Result<StageRecord> {
        self.update_stage(bill, stage, |prev| {
            record::failed(prev, bill, stage, fingerprint, error, Utc::now())
        })
        .await
    }

    async fn record_not_applicable(
        &self,
        bill: &BillId,
        stage: Stage,
        fingerprint: &Fingerprint,
    ) -> Result<StageRecord> {
        self.update_stage(bill, stage, |prev| {
            record::not_applicable(prev, bill, stage, fingerprint, Utc::now())
        })
        .await
    }

    async fn upsert_bill(&self, bill: &BillId, metadata: &BillMetadata) -> Result<()> {
        {
            let state = self.state.lock().await;
            let unchanged = state
                .bills
                .get(bill.key())
                .and_then(|b| b.metadata.as_ref())
                .is_some_and(|m| m == metadata);
            if unchanged {
                return Ok(());
            }
        }
        self.mutate(bill, |entry| entry.metadata = Some(metadata.clone()))
            .await
    }

    async fn bills(&self, session: &SessionId) -> Result<Vec<TrackedBill>> {
        if session != &self.session {
            return Ok(Vec::new());
        }
        let state = self.state.lock().await;
        Ok(state.bills.values().cloned().collect())
    }
}
