//! In-process fakes for the source, converter and model capabilities.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use legisflow_convert::{Converter, DocumentConverter};
use legisflow_shared::{
    AmendmentMeta, BillMetadata, LegisflowError, MediaType, ModelCallKind, ModelFamily, Result,
    SessionId,
};
use legisflow_source::{
    AmendmentDocument, AmendmentListing, BillDocuments, BillListing, Document, DocumentSource,
};
use serde_json::json;

use crate::model::{InferenceRequest, InferenceResponse, ModelClient, ModelSpec, finish_response};

pub fn spec(model: &str) -> ModelSpec {
    ModelSpec {
        family: ModelFamily::Gemini,
        model: model.into(),
        temperature: 0.2,
    }
}

fn markdown(origin: &str, text: &str) -> Document {
    Document {
        media_type: MediaType::Markdown,
        bytes: text.as_bytes().to_vec(),
        origin: origin.into(),
    }
}

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct FakeBill {
    metadata: BillMetadata,
    text: String,
    fiscal_note: Option<String>,
    amendments: Vec<(AmendmentMeta, String)>,
}

/// Mutable in-memory session whose bills can change between runs.
#[derive(Default)]
pub struct FakeSource {
    bills: Mutex<BTreeMap<String, FakeBill>>,
    unavailable: Mutex<BTreeSet<String>>,
    fetches: AtomicU32,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bill(&self, number: &str, text: &str) {
        let bill = FakeBill {
            metadata: BillMetadata {
                number: number.into(),
                title: format!("Bill {number}"),
                sponsors: vec!["Delegate Smith".into()],
                status: "Passed".into(),
                synopsis: None,
                crossfile: None,
            },
            text: text.into(),
            fiscal_note: None,
            amendments: vec![],
        };
        self.bills.lock().unwrap().insert(number.into(), bill);
    }

    pub fn set_text(&self, number: &str, text: &str) {
        self.bills.lock().unwrap().get_mut(number).unwrap().text = text.into();
    }

    pub fn set_fiscal_note(&self, number: &str, text: &str) {
        self.bills.lock().unwrap().get_mut(number).unwrap().fiscal_note = Some(text.into());
    }

    pub fn add_amendment(&self, number: &str, id: &str, sequence: u32, adopted: bool, text: &str) {
        let meta = AmendmentMeta {
            id: id.into(),
            sequence,
            date: None,
            adopted,
        };
        self.bills
            .lock()
            .unwrap()
            .get_mut(number)
            .unwrap()
            .amendments
            .push((meta, text.into()));
    }

    pub fn set_unavailable(&self, number: &str, unavailable: bool) {
        let mut set = self.unavailable.lock().unwrap();
        if unavailable {
            set.insert(number.into());
        } else {
            set.remove(number);
        }
    }

    pub fn fetches(&self) -> u32 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentSource for FakeSource {
    fn name(&self) -> &str {
        "fake"
    }

    async fn list_bills(&self, _session: &SessionId) -> Result<Vec<BillListing>> {
        let bills = self.bills.lock().unwrap();
        Ok(bills
            .values()
            .map(|bill| BillListing {
                metadata: bill.metadata.clone(),
                document: format!("{}.md", bill.metadata.number),
                fiscal_note: bill
                    .fiscal_note
                    .as_ref()
                    .map(|_| format!("{}_fn.md", bill.metadata.number)),
                amendments: bill
                    .amendments
                    .iter()
                    .map(|(meta, _)| AmendmentListing {
                        meta: meta.clone(),
                        document: format!("{}.md", meta.id),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn fetch_documents(
        &self,
        _session: &SessionId,
        listing: &BillListing,
    ) -> Result<BillDocuments> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let number = &listing.metadata.number;
        if self.unavailable.lock().unwrap().contains(number) {
            return Err(LegisflowError::Fetch(format!("{number}: upstream unavailable")));
        }
        let bill = self
            .bills
            .lock()
            .unwrap()
            .get(number)
            .cloned()
            .ok_or_else(|| LegisflowError::Fetch(format!("{number}: not listed")))?;

        Ok(BillDocuments {
            bill: markdown(&listing.document, &bill.text),
            fiscal_note: bill.fiscal_note.as_deref().map(|t| markdown("fiscal note", t)),
            amendments: bill
                .amendments
                .iter()
                .map(|(meta, text)| AmendmentDocument {
                    meta: meta.clone(),
                    document: markdown(&meta.id, text),
                })
                .collect(),
        })
    }
}

// ---------------------------------------------------------------------------
// Converter
// ---------------------------------------------------------------------------

/// [`DocumentConverter`] that counts calls and rejects any document
/// containing `CORRUPT`.
#[derive(Default)]
pub struct CountingConverter {
    inner: DocumentConverter,
    calls: AtomicU32,
}

impl CountingConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Converter for CountingConverter {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn convert(&self, bytes: &[u8], media_type: MediaType) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if bytes.windows(7).any(|w| w == b"CORRUPT") {
            return Err(LegisflowError::Conversion("corrupt document".into()));
        }
        self.inner.convert(bytes, media_type)
    }
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// Deterministic model: amend requests echo the bill plus the amendment,
/// structured requests get a fixed answer. Any prompt containing a failure
/// marker fails with a validation error.
pub struct FakeModel {
    spec: ModelSpec,
    calls: AtomicU32,
    fail_marker: Mutex<Option<String>>,
    latency: Duration,
    in_flight: AtomicU32,
    peak_in_flight: AtomicU32,
}

impl FakeModel {
    pub fn new(model: &str) -> Self {
        Self {
            spec: spec(model),
            calls: AtomicU32::new(0),
            fail_marker: Mutex::new(None),
            latency: Duration::ZERO,
            in_flight: AtomicU32::new(0),
            peak_in_flight: AtomicU32::new(0),
        }
    }

    /// Hold every call open for `latency` so overlapping calls can be observed.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_when_prompt_contains(&self, marker: Option<&str>) {
        *self.fail_marker.lock().unwrap() = marker.map(String::from);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most calls that were ever in progress at the same time.
    pub fn peak_in_flight(&self) -> u32 {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for FakeModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = self.answer(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl FakeModel {
    fn answer(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        if let Some(marker) = self.fail_marker.lock().unwrap().as_deref() {
            if request.user.contains(marker) {
                return Err(LegisflowError::model(
                    ModelCallKind::Validation,
                    "response does not match schema",
                ));
            }
        }

        let text = match &request.schema {
            None => {
                let bill = between(&request.user, "<bill>\n", "\n</bill>");
                let amendment = between(&request.user, "<amendment>\n", "\n</amendment>");
                format!("{}\n{}", bill.trim_end(), amendment.trim_end())
            }
            Some(schema) if schema.name == "agency_analysis" => json!({
                "relevant_agencies": [{
                    "agency_name": "Comptroller of Maryland",
                    "is_relevant": true,
                    "relevance_explanation": "Collects the revenue",
                    "relevance_rating": 3
                }]
            })
            .to_string(),
            Some(_) => json!({
                "bill_summary": format!("Summary by {}", self.spec.model),
                "start_year": 2026,
                "responsible_party": "Comptroller of Maryland",
                "stakeholders": "Taxpayers"
            })
            .to_string(),
        };
        finish_response(request, text)
    }
}

fn between<'a>(text: &'a str, start: &str, end: &str) -> &'a str {
    text.split_once(start)
        .and_then(|(_, rest)| rest.split_once(end))
        .map(|(inner, _)| inner)
        .unwrap_or("")
}

/// Model that replays a fixed script of replies and records what it was asked.
pub struct ScriptedModel {
    spec: ModelSpec,
    replies: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<InferenceRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String>>) -> Self {
        Self {
            spec: spec("scripted"),
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// User content of every request, in order.
    pub fn prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.user.clone())
            .collect()
    }

    /// System prompt of every request, in order.
    pub fn systems(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.system.clone())
            .collect()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LegisflowError::model(ModelCallKind::Config, "script exhausted")));
        finish_response(request, reply?)
    }
}
