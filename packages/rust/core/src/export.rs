//! Consolidated export: one JSON document per session, keyed by bill number,
//! with metadata, the most current text, QA answers and per-stage status.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use legisflow_artifacts::ArtifactStore;
use legisflow_shared::{
    ArtifactRef, BillMetadata, CURRENT_SCHEMA_VERSION, LegisflowError, Result, SessionId, Stage,
    StageError, StageRecord, StageStatus, write_atomic,
};
use legisflow_storage::StateTracker;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::fingerprint::TextSource;

/// File name of the export inside a session directory.
pub const EXPORT_FILE: &str = "export.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionExport {
    pub schema_version: u32,
    pub session: SessionId,
    pub generated_at: DateTime<Utc>,
    pub bills: BTreeMap<String, BillExport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillExport {
    pub metadata: Option<BillMetadata>,
    pub stages: BTreeMap<Stage, StageExport>,
    /// Amended text when amend produced one, else the converted text.
    pub text: Option<String>,
    pub text_source: Option<TextSource>,
    /// Parsed `qa_answers` artifact.
    pub qa: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExport {
    pub status: StageStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error: Option<StageError>,
    /// Artifact whose content is surfaced for this stage.
    pub artifact: Option<String>,
    /// The surfaced artifact comes from an earlier success, not the latest
    /// attempt.
    pub stale: bool,
}

/// Artifact to surface for a stage: the current output, or the last
/// success when the latest attempt failed.
fn surfaced(record: &StageRecord) -> Option<(&ArtifactRef, bool)> {
    match record.status {
        StageStatus::Succeeded => record.artifact.as_ref().map(|a| (a, false)),
        StageStatus::Failed => record.last_success.as_ref().map(|s| (&s.artifact, true)),
        StageStatus::Pending | StageStatus::NotApplicable => None,
    }
}

fn read_surfaced(store: &ArtifactStore, record: Option<&StageRecord>) -> Option<String> {
    let (artifact, _) = surfaced(record?)?;
    match store.read_text(artifact) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!(path = %artifact.path, error = %e, "skipping unreadable artifact in export");
            None
        }
    }
}

/// Aggregate every tracked bill of `session`, including partially processed
/// ones.
#[instrument(skip_all, fields(session = %session))]
pub async fn build_export(
    session: &SessionId,
    tracker: &dyn StateTracker,
    store: &ArtifactStore,
) -> Result<SessionExport> {
    let tracked = tracker.bills(session).await?;
    let mut bills = BTreeMap::new();

    for bill in tracked {
        let stages = bill
            .stages
            .iter()
            .map(|(stage, record)| {
                let surfaced = surfaced(record);
                let export = StageExport {
                    status: record.status,
                    attempts: record.attempts,
                    last_attempt_at: record.last_attempt_at,
                    error: record.error.clone(),
                    artifact: surfaced.map(|(a, _)| a.path.clone()),
                    stale: surfaced.is_some_and(|(_, stale)| stale),
                };
                (*stage, export)
            })
            .collect();

        let (text, text_source) = match read_surfaced(store, bill.stages.get(&Stage::Amend)) {
            Some(text) => (Some(text), Some(TextSource::Amended)),
            None => match read_surfaced(store, bill.stages.get(&Stage::Convert)) {
                Some(text) => (Some(text), Some(TextSource::Original)),
                None => (None, None),
            },
        };

        let qa = match read_surfaced(store, bill.stages.get(&Stage::Qa)) {
            Some(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!(bill = %bill.id, error = %e, "qa artifact is not JSON");
                    None
                }
            },
            None => None,
        };

        bills.insert(
            bill.id.key().to_string(),
            BillExport {
                metadata: bill.metadata,
                stages,
                text,
                text_source,
                qa,
            },
        );
    }

    info!(bills = bills.len(), "export built");
    Ok(SessionExport {
        schema_version: CURRENT_SCHEMA_VERSION,
        session: session.clone(),
        generated_at: Utc::now(),
        bills,
    })
}

/// Write `export` to `path` atomically.
pub fn write_export(export: &SessionExport, path: &Path) -> Result<()> {
    let json = serde_json::to_vec_pretty(export)
        .map_err(|e| LegisflowError::Serialization(e.to_string()))?;
    write_atomic(path, &json)?;
    info!(path = %path.display(), "export written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use legisflow_shared::{
        ArtifactKind, BillId, ErrorCategory, Fingerprint, StageError, sha256_hex,
    };
    use legisflow_storage::MemoryTracker;

    use super::*;

    fn session() -> SessionId {
        "2026rs".parse().unwrap()
    }

    fn fp(seed: &str) -> Fingerprint {
        Fingerprint::new(sha256_hex(seed.as_bytes()))
    }

    fn metadata(number: &str) -> BillMetadata {
        BillMetadata {
            number: number.into(),
            title: format!("Bill {number}"),
            sponsors: vec![],
            status: "Passed".into(),
            synopsis: None,
            crossfile: None,
        }
    }

    #[tokio::test]
    async fn partial_bills_are_exported_with_status() {
        let root = std::env::temp_dir().join(format!("legisflow-export-{}", uuid::Uuid::now_v7()));
        let store = ArtifactStore::open(&root).unwrap();
        let tracker = MemoryTracker::new();

        // HB0001: converted, amend not applicable, qa failed after an earlier success.
        let one = BillId::new(session(), "HB0001").unwrap();
        tracker.upsert_bill(&one, &metadata("HB0001")).await.unwrap();
        let text = store
            .put(&one, Stage::Convert, ArtifactKind::Markdown, &fp("c1"), b"# One\n")
            .unwrap();
        tracker
            .record_success(&one, Stage::Convert, &fp("c1"), &text)
            .await
            .unwrap();
        tracker
            .record_not_applicable(&one, Stage::Amend, &fp("na"))
            .await
            .unwrap();
        let answers = store
            .put(
                &one,
                Stage::Qa,
                ArtifactKind::QaAnswers,
                &fp("q1"),
                br#"{"bill_summary": "One"}"#,
            )
            .unwrap();
        tracker
            .record_success(&one, Stage::Qa, &fp("q1"), &answers)
            .await
            .unwrap();
        let error = StageError {
            category: ErrorCategory::ModelCall,
            message: "quota".into(),
        };
        tracker
            .record_failure(&one, Stage::Qa, &fp("q2"), &error)
            .await
            .unwrap();

        // HB0002: conversion failed.
        let two = BillId::new(session(), "HB0002").unwrap();
        tracker.upsert_bill(&two, &metadata("HB0002")).await.unwrap();
        let conversion = StageError {
            category: ErrorCategory::Conversion,
            message: "no text".into(),
        };
        tracker
            .record_failure(&two, Stage::Convert, &fp("c2"), &conversion)
            .await
            .unwrap();

        let export = build_export(&session(), &tracker, &store).await.unwrap();
        assert_eq!(export.schema_version, CURRENT_SCHEMA_VERSION);
        assert_eq!(export.bills.len(), 2);

        let bill = &export.bills["HB0001"];
        assert_eq!(bill.text.as_deref(), Some("# One\n"));
        assert_eq!(bill.text_source, Some(TextSource::Original));
        assert_eq!(bill.qa.as_ref().unwrap()["bill_summary"], "One");
        assert_eq!(bill.stages[&Stage::Amend].status, StageStatus::NotApplicable);
        let qa = &bill.stages[&Stage::Qa];
        assert_eq!(qa.status, StageStatus::Failed);
        assert!(qa.stale);
        assert_eq!(qa.error.as_ref().unwrap().message, "quota");

        let bill = &export.bills["HB0002"];
        assert_eq!(bill.metadata.as_ref().unwrap().title, "Bill HB0002");
        assert!(bill.text.is_none());
        assert!(bill.qa.is_none());
        assert_eq!(bill.stages[&Stage::Convert].status, StageStatus::Failed);
        assert!(!bill.stages.contains_key(&Stage::Qa));

        let path = root.join(EXPORT_FILE);
        write_export(&export, &path).unwrap();
        let read: SessionExport =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(read, export);

        let _ = std::fs::remove_dir_all(&root);
    }
}
