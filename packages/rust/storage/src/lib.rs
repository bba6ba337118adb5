//! Pipeline state tracking.
//!
//! [`StateTracker`] is the authority for skip/run decisions: it records, per
//! bill per stage, the fingerprint of the last attempt, its status and its
//! output artifact. Three interchangeable backends implement it:
//!
//! - [`MemoryTracker`]: in-process only, for tests and dry runs
//! - [`JsonFileTracker`]: one JSON document per session, replaced atomically
//! - [`SqlTracker`]: a libSQL database, one row per (bill, stage)
//!
//! Every backend serializes its writes through a single lock, so concurrent
//! workers never lose updates to the same key.

mod json;
mod memory;
mod migrations;
pub mod record;
mod sql;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use legisflow_shared::{
    ArtifactRef, BillId, BillMetadata, Fingerprint, Result, SessionId, Stage, StageError,
    StageRecord, StateBackend,
};
use serde::{Deserialize, Serialize};

pub use json::JsonFileTracker;
pub use memory::MemoryTracker;
pub use record::needs_run;
pub use sql::SqlTracker;

/// File name of the JSON state document inside a session directory.
pub const JSON_STATE_FILE: &str = "pipeline_state.json";

/// File name of the libSQL state database inside a session directory.
pub const SQL_STATE_FILE: &str = "pipeline_state.db";

/// Everything tracked for one bill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedBill {
    pub id: BillId,
    #[serde(default)]
    pub metadata: Option<BillMetadata>,
    #[serde(default)]
    pub stages: BTreeMap<Stage, StageRecord>,
}

/// Read/write contract for per-bill per-stage pipeline state.
///
/// Every `record_*` call is durable when it returns.
#[async_trait]
pub trait StateTracker: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    async fn get(&self, bill: &BillId, stage: Stage) -> Result<Option<StageRecord>>;

    async fn record_success(
        &self,
        bill: &BillId,
        stage: Stage,
        fingerprint: &Fingerprint,
        artifact: &ArtifactRef,
    ) -> Result<StageRecord>;

    async fn record_failure(
        &self,
        bill: &BillId,
        stage: Stage,
        fingerprint: &Fingerprint,
        error: &StageError,
    ) -> Result<StageRecord>;

    /// Record a structural skip so the stage is not retried until its
    /// inputs change.
    async fn record_not_applicable(
        &self,
        bill: &BillId,
        stage: Stage,
        fingerprint: &Fingerprint,
    ) -> Result<StageRecord>;

    /// Store or refresh a bill's metadata.
    async fn upsert_bill(&self, bill: &BillId, metadata: &BillMetadata) -> Result<()>;

    /// All bills tracked for `session`, ordered by bill number.
    async fn bills(&self, session: &SessionId) -> Result<Vec<TrackedBill>>;

    /// Whether `stage` of `bill` must run for inputs with `current` fingerprint.
    async fn needs_run(&self, bill: &BillId, stage: Stage, current: &Fingerprint) -> Result<bool> {
        let record = self.get(bill, stage).await?;
        Ok(record::needs_run(record.as_ref(), current))
    }
}

/// Open the tracker for one session directory with the configured backend.
pub async fn open_tracker(
    backend: StateBackend,
    session_dir: &Path,
    session: &SessionId,
) -> Result<Arc<dyn StateTracker>> {
    Ok(match backend {
        StateBackend::Json => Arc::new(
            JsonFileTracker::open(session_dir.join(JSON_STATE_FILE), session.clone()).await?,
        ),
        StateBackend::Libsql => Arc::new(SqlTracker::open(&session_dir.join(SQL_STATE_FILE)).await?),
    })
}
