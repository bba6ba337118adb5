//! Stage record transitions shared by every tracker backend.
//!
//! Backends only decide where records live; what a success, failure or
//! structural skip does to a record is defined once here.

use chrono::{DateTime, Utc};
use legisflow_shared::{
    ArtifactRef, BillId, Fingerprint, Stage, StageError, StageRecord, StageStatus, SuccessEntry,
};

/// The skip/run decision. Every caller goes through this function.
///
/// Runs when there is no record, when the last attempt failed or never
/// finished, and when the recorded fingerprint differs from `current`.
pub fn needs_run(record: Option<&StageRecord>, current: &Fingerprint) -> bool {
    let Some(record) = record else {
        return true;
    };
    match record.status {
        StageStatus::Pending | StageStatus::Failed => true,
        StageStatus::Succeeded | StageStatus::NotApplicable => {
            record.fingerprint.as_ref() != Some(current)
        }
    }
}

fn base(prev: Option<StageRecord>, bill: &BillId, stage: Stage) -> StageRecord {
    prev.unwrap_or_else(|| StageRecord::pending(bill.clone(), stage))
}

/// Transition to `succeeded`, replacing the prior outcome.
pub fn succeeded(
    prev: Option<StageRecord>,
    bill: &BillId,
    stage: Stage,
    fingerprint: &Fingerprint,
    artifact: &ArtifactRef,
    now: DateTime<Utc>,
) -> StageRecord {
    let mut record = base(prev, bill, stage);
    record.status = StageStatus::Succeeded;
    record.fingerprint = Some(fingerprint.clone());
    record.artifact = Some(artifact.clone());
    record.error = None;
    record.attempts = record.attempts.saturating_add(1);
    record.last_attempt_at = Some(now);
    record.last_success = Some(SuccessEntry {
        fingerprint: fingerprint.clone(),
        artifact: artifact.clone(),
        completed_at: now,
    });
    record
}

/// Transition to `failed`. The last success (for whatever fingerprint) is
/// kept as history but no longer counts as the current output.
pub fn failed(
    prev: Option<StageRecord>,
    bill: &BillId,
    stage: Stage,
    fingerprint: &Fingerprint,
    error: &StageError,
    now: DateTime<Utc>,
) -> StageRecord {
    let mut record = base(prev, bill, stage);
    record.status = StageStatus::Failed;
    record.fingerprint = Some(fingerprint.clone());
    record.artifact = None;
    record.error = Some(error.clone());
    record.attempts = record.attempts.saturating_add(1);
    record.last_attempt_at = Some(now);
    record
}

/// Transition to `not_applicable` (structural skip). Not an attempt.
pub fn not_applicable(
    prev: Option<StageRecord>,
    bill: &BillId,
    stage: Stage,
    fingerprint: &Fingerprint,
    now: DateTime<Utc>,
) -> StageRecord {
    let mut record = base(prev, bill, stage);
    record.status = StageStatus::NotApplicable;
    record.fingerprint = Some(fingerprint.clone());
    record.artifact = None;
    record.error = None;
    record.last_attempt_at = Some(now);
    record
}

/// Structural checks applied to records loaded from persistent state.
pub(crate) fn check_consistent(record: &StageRecord) -> Result<(), String> {
    match record.status {
        StageStatus::Succeeded if record.artifact.is_none() || record.fingerprint.is_none() => {
            Err(format!(
                "{} {} is succeeded without artifact or fingerprint",
                record.bill, record.stage
            ))
        }
        StageStatus::Failed if record.error.is_none() => Err(format!(
            "{} {} is failed without error detail",
            record.bill, record.stage
        )),
        StageStatus::NotApplicable if record.fingerprint.is_none() => Err(format!(
            "{} {} is not_applicable without fingerprint",
            record.bill, record.stage
        )),
        _ => Ok(()),
    }
}
