//! libSQL-backed tracker: one row per (bill, stage).
//!
//! Each state change is a single upsert statement, so SQLite's journal makes
//! it atomic. Read-modify-write sequences run under one writer lock.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use legisflow_shared::{
    ArtifactRef, BillId, BillMetadata, Fingerprint, LegisflowError, Result, SessionId, Stage,
    StageError, StageRecord, StageStatus, SuccessEntry,
};
use libsql::{Connection, Database, Row, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::instrument;

use crate::{StateTracker, TrackedBill, migrations, record};

const RECORD_COLUMNS: &str = "session, number, stage, status, fingerprint, artifact_json, \
     error_json, attempts, last_attempt_at, last_success_json";

fn storage_err(e: libsql::Error) -> LegisflowError {
    LegisflowError::Storage(e.to_string())
}

fn corrupt(msg: impl std::fmt::Display) -> LegisflowError {
    LegisflowError::StateCorruption(msg.to_string())
}

/// Tracker stored in a libSQL database file.
pub struct SqlTracker {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl SqlTracker {
    /// Open or create the database at `path` and apply pending migrations.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LegisflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let tracker = Self {
            db,
            conn,
            write_lock: Mutex::new(()),
        };
        tracker.run_migrations().await?;
        Ok(tracker)
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LegisflowError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    async fn fetch_record(&self, bill: &BillId, stage: Stage) -> Result<Option<StageRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM stage_records
             WHERE session = ?1 AND number = ?2 AND stage = ?3"
        );
        let mut rows = self
            .conn
            .query(
                &sql,
                params![bill.session.as_str(), bill.number.as_str(), stage.as_str()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn store_record(&self, rec: &StageRecord) -> Result<()> {
        let artifact = encode(&rec.artifact)?;
        let error = encode(&rec.error)?;
        let last_success = encode(&rec.last_success)?;
        let last_attempt = rec.last_attempt_at.map(|t| t.to_rfc3339());

        self.conn
            .execute(
                "INSERT INTO stage_records
                   (session, number, stage, status, fingerprint, artifact_json,
                    error_json, attempts, last_attempt_at, last_success_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(session, number, stage) DO UPDATE SET
                   status = excluded.status,
                   fingerprint = excluded.fingerprint,
                   artifact_json = excluded.artifact_json,
                   error_json = excluded.error_json,
                   attempts = excluded.attempts,
                   last_attempt_at = excluded.last_attempt_at,
                   last_success_json = excluded.last_success_json",
                params![
                    rec.bill.session.as_str(),
                    rec.bill.number.as_str(),
                    rec.stage.as_str(),
                    rec.status.as_str(),
                    rec.fingerprint.as_ref().map(|f| f.as_str()),
                    artifact.as_deref(),
                    error.as_deref(),
                    i64::from(rec.attempts),
                    last_attempt.as_deref(),
                    last_success.as_deref(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn update(
        &self,
        bill: &BillId,
        stage: Stage,
        apply: impl FnOnce(Option<StageRecord>) -> StageRecord + Send,
    ) -> Result<StageRecord> {
        let _guard = self.write_lock.lock().await;
        let prev = self.fetch_record(bill, stage).await?;
        let next = apply(prev);
        self.store_record(&next).await?;
        Ok(next)
    }
}

fn encode<T: Serialize>(value: &Option<T>) -> Result<Option<String>> {
    value
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| LegisflowError::Storage(format!("failed to encode record: {e}")))
}

fn decode<T: DeserializeOwned>(column: &str, raw: Option<String>) -> Result<Option<T>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| corrupt(format!("unreadable {column}: {e}")))
}

fn parse_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| corrupt(format!("bad timestamp {s:?}: {e}")))
    })
    .transpose()
}

fn row_to_record(row: &Row) -> Result<StageRecord> {
    let session: SessionId = row
        .get::<String>(0)
        .map_err(storage_err)?
        .parse()
        .map_err(corrupt)?;
    let number = row.get::<String>(1).map_err(storage_err)?;
    let bill = BillId::new(session, number).map_err(corrupt)?;
    let stage: Stage = row
        .get::<String>(2)
        .map_err(storage_err)?
        .parse()
        .map_err(corrupt)?;
    let status: StageStatus = row
        .get::<String>(3)
        .map_err(storage_err)?
        .parse()
        .map_err(corrupt)?;
    let attempts = u32::try_from(row.get::<i64>(7).map_err(storage_err)?)
        .map_err(|_| corrupt("negative attempt count"))?;

    let rec = StageRecord {
        bill,
        stage,
        status,
        fingerprint: row.get::<String>(4).ok().map(Fingerprint::new),
        artifact: decode::<ArtifactRef>("artifact_json", row.get::<String>(5).ok())?,
        error: decode::<StageError>("error_json", row.get::<String>(6).ok())?,
        attempts,
        last_attempt_at: parse_time(row.get::<String>(8).ok())?,
        last_success: decode::<SuccessEntry>("last_success_json", row.get::<String>(9).ok())?,
    };
    record::check_consistent(&rec).map_err(corrupt)?;
    Ok(rec)
}

#[async_trait]
impl StateTracker for SqlTracker {
    fn backend(&self) -> &'static str {
        "libsql"
    }

    async fn get(&self, bill: &BillId, stage: Stage) -> Result<Option<StageRecord>> {
        self.fetch_record(bill, stage).await
    }

    async fn record_success(
        &self,
        bill: &BillId,
        stage: Stage,
        fingerprint: &Fingerprint,
        artifact: &ArtifactRef,
    ) -> Result<StageRecord> {
        self.update(bill, stage, |prev| {
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
        self.update(bill, stage, |prev| {
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
        self.update(bill, stage, |prev| {
            record::not_applicable(prev, bill, stage, fingerprint, Utc::now())
        })
        .await
    }

    async fn upsert_bill(&self, bill: &BillId, metadata: &BillMetadata) -> Result<()> {
        let json = serde_json::to_string(metadata)
            .map_err(|e| LegisflowError::Storage(format!("failed to encode metadata: {e}")))?;
        let now = Utc::now().to_rfc3339();
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO bills (session, number, metadata_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session, number) DO UPDATE SET
                   metadata_json = excluded.metadata_json,
                   updated_at = excluded.updated_at
                 WHERE bills.metadata_json IS NOT excluded.metadata_json",
                params![
                    bill.session.as_str(),
                    bill.number.as_str(),
                    json.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    async fn bills(&self, session: &SessionId) -> Result<Vec<TrackedBill>> {
        let mut bills: BTreeMap<String, TrackedBill> = BTreeMap::new();

        let mut rows = self
            .conn
            .query(
                "SELECT number, metadata_json FROM bills WHERE session = ?1",
                params![session.as_str()],
            )
            .await
            .map_err(storage_err)?;
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let number = row.get::<String>(0).map_err(storage_err)?;
            let id = BillId::new(session.clone(), number.clone()).map_err(corrupt)?;
            let metadata = decode::<BillMetadata>("metadata_json", row.get::<String>(1).ok())?;
            bills.insert(
                number,
                TrackedBill {
                    id,
                    metadata,
                    stages: BTreeMap::new(),
                },
            );
        }

        let sql = format!("SELECT {RECORD_COLUMNS} FROM stage_records WHERE session = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![session.as_str()])
            .await
            .map_err(storage_err)?;
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let rec = row_to_record(&row)?;
            bills
                .entry(rec.bill.number.clone())
                .or_insert_with(|| TrackedBill {
                    id: rec.bill.clone(),
                    metadata: None,
                    stages: BTreeMap::new(),
                })
                .stages
                .insert(rec.stage, rec);
        }

        Ok(bills.into_values().collect())
    }
}
