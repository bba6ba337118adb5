//! In-memory tracker. State lives only as long as the process.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use legisflow_shared::{
    ArtifactRef, BillId, BillMetadata, Fingerprint, Result, SessionId, Stage, StageError,
    StageRecord,
};
use tokio::sync::Mutex;

use crate::{StateTracker, TrackedBill, record};

#[derive(Debug, Default)]
pub struct MemoryTracker {
    bills: Mutex<BTreeMap<BillId, TrackedBill>>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update(
        &self,
        bill: &BillId,
        stage: Stage,
        apply: impl FnOnce(Option<StageRecord>) -> StageRecord + Send,
    ) -> StageRecord {
        let mut bills = self.bills.lock().await;
        let entry = bills.entry(bill.clone()).or_insert_with(|| TrackedBill {
            id: bill.clone(),
            metadata: None,
            stages: BTreeMap::new(),
        });
        let next = apply(entry.stages.get(&stage).cloned());
        entry.stages.insert(stage, next.clone());
        next
    }
}

#[async_trait]
impl StateTracker for MemoryTracker {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, bill: &BillId, stage: Stage) -> Result<Option<StageRecord>> {
        let bills = self.bills.lock().await;
        Ok(bills.get(bill).and_then(|b| b.stages.get(&stage)).cloned())
    }

    async fn record_success(
        &self,
        bill: &BillId,
        stage: Stage,
        fingerprint: &Fingerprint,
        artifact: &ArtifactRef,
    ) -> Result<StageRecord> {
        Ok(self
            .update(bill, stage, |prev| {
                record::succeeded(prev, bill, stage, fingerprint, artifact, Utc::now())
            })
            .await)
    }

    async fn record_failure(
        &self,
        bill: &BillId,
        stage: Stage,
        fingerprint: &Fingerprint,
        error: &StageError,
    ) -> Result<StageRecord> {
        Ok(self
            .update(bill, stage, |prev| {
                record::failed(prev, bill, stage, fingerprint, error, Utc::now())
            })
            .await)
    }

    async fn record_not_applicable(
        &self,
        bill: &BillId,
        stage: Stage,
        fingerprint: &Fingerprint,
    ) -> Result<StageRecord> {
        Ok(self
            .update(bill, stage, |prev| {
                record::not_applicable(prev, bill, stage, fingerprint, Utc::now())
            })
            .await)
    }

    async fn upsert_bill(&self, bill: &BillId, metadata: &BillMetadata) -> Result<()> {
        let mut bills = self.bills.lock().await;
        bills
            .entry(bill.clone())
            .or_insert_with(|| TrackedBill {
                id: bill.clone(),
                metadata: None,
                stages: BTreeMap::new(),
            })
            .metadata = Some(metadata.clone());
        Ok(())
    }

    async fn bills(&self, session: &SessionId) -> Result<Vec<TrackedBill>> {
        let bills = self.bills.lock().await;
        Ok(bills
            .values()
            .filter(|b| &b.id.session == session)
            .cloned()
            .collect())
    }
}
