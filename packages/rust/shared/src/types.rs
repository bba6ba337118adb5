//! Core domain types: sessions, bills, stages, artifacts and stage records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCategory, LegisflowError};

/// Current schema version of persisted pipeline state and exports.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// SessionId / BillId
// ---------------------------------------------------------------------------

/// A year-scoped legislative session, e.g. `2026rs`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = LegisflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if !is_path_safe(s) {
            return Err(LegisflowError::validation(format!(
                "invalid session identifier {s:?}"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

/// A bill, identified by its session and bill number (e.g. `2026rs/HB0100`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BillId {
    pub session: SessionId,
    pub number: String,
}

impl BillId {
    /// Build a bill id, rejecting numbers that are unsafe as path segments.
    pub fn new(session: SessionId, number: impl Into<String>) -> crate::Result<Self> {
        let number = number.into();
        if !is_path_safe(&number) {
            return Err(LegisflowError::validation(format!(
                "invalid bill number {number:?}"
            )));
        }
        Ok(Self { session, number })
    }

    /// Key used for per-bill maps inside one session.
    pub fn key(&self) -> &str {
        &self.number
    }
}

impl fmt::Display for BillId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session, self.number)
    }
}

/// Identifiers double as directory names in the document store.
fn is_path_safe(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

// ---------------------------------------------------------------------------
// Bill metadata
// ---------------------------------------------------------------------------

/// Descriptive metadata for a bill, as listed by the upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillMetadata {
    /// Bill number, unique within the session.
    pub number: String,
    pub title: String,
    #[serde(default)]
    pub sponsors: Vec<String>,
    /// Legislative status as reported upstream (e.g. "Passed Enrolled").
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synopsis: Option<String>,
    /// Number of the companion bill in the other chamber, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crossfile: Option<String>,
}

/// Metadata for one amendment document attached to a bill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmendmentMeta {
    pub id: String,
    /// Order in which the amendment was adopted.
    pub sequence: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    pub adopted: bool,
}

// ---------------------------------------------------------------------------
// Stages and artifacts
// ---------------------------------------------------------------------------

/// A pipeline stage. Declaration order is execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Convert,
    Amend,
    Qa,
}

impl Stage {
    /// All stages in dependency order.
    pub const ALL: [Stage; 3] = [Stage::Convert, Stage::Amend, Stage::Qa];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Convert => "convert",
            Self::Amend => "amend",
            Self::Qa => "qa",
        }
    }

    /// Stages that depend on this one, in order.
    pub fn downstream(&self) -> &'static [Stage] {
        match self {
            Self::Convert => &[Stage::Amend, Stage::Qa],
            Self::Amend => &[Stage::Qa],
            Self::Qa => &[],
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = LegisflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "convert" => Ok(Self::Convert),
            "amend" => Ok(Self::Amend),
            "qa" => Ok(Self::Qa),
            other => Err(LegisflowError::validation(format!("unknown stage {other:?}"))),
        }
    }
}

/// Kind of artifact held in the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    RawPdf,
    Text,
    Markdown,
    AmendedMarkdown,
    QaAnswers,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RawPdf => "raw_pdf",
            Self::Text => "text",
            Self::Markdown => "markdown",
            Self::AmendedMarkdown => "amended_markdown",
            Self::QaAnswers => "qa_answers",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::RawPdf => "pdf",
            Self::Text => "txt",
            Self::Markdown | Self::AmendedMarkdown => "md",
            Self::QaAnswers => "json",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media type of a raw upstream document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Pdf,
    Text,
    Markdown,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Text => "text",
            Self::Markdown => "markdown",
        }
    }

    /// Guess from a file name or URL path.
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = path.rsplit('.').next()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(Self::Pdf),
            "txt" => Some(Self::Text),
            "md" | "markdown" => Some(Self::Markdown),
            _ => None,
        }
    }

    /// Artifact kind under which the raw document is stored.
    pub fn raw_kind(&self) -> ArtifactKind {
        match self {
            Self::Pdf => ArtifactKind::RawPdf,
            Self::Text => ArtifactKind::Text,
            Self::Markdown => ArtifactKind::Markdown,
        }
    }
}

/// Content-derived identifier of a stage's inputs (lowercase sha256 hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters, used in artifact file names and log lines.
    pub fn short(&self) -> &str {
        self.0.get(..16).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pointer to an immutable artifact in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    /// Path relative to the store root, `/`-separated.
    pub path: String,
    /// sha256 hex of the artifact bytes.
    pub content_hash: String,
    /// Fingerprint of the inputs that generated the artifact.
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// StageRecord
// ---------------------------------------------------------------------------

/// Status of one stage of one bill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Succeeded,
    Failed,
    /// Structural skip: the stage does not apply to this bill's inputs.
    NotApplicable,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::NotApplicable => "not_applicable",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = LegisflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "not_applicable" => Ok(Self::NotApplicable),
            other => Err(LegisflowError::validation(format!(
                "unknown stage status {other:?}"
            ))),
        }
    }
}

/// Error detail stored with a failed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub category: ErrorCategory,
    pub message: String,
}

impl From<&LegisflowError> for StageError {
    fn from(err: &LegisflowError) -> Self {
        Self {
            category: err.category(),
            message: err.to_string(),
        }
    }
}

/// The last successful attempt of a stage, kept across later failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessEntry {
    pub fingerprint: Fingerprint,
    pub artifact: ArtifactRef,
    pub completed_at: DateTime<Utc>,
}

/// Persisted state of one (bill, stage) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub bill: BillId,
    pub stage: Stage,
    pub status: StageStatus,
    /// Fingerprint of the inputs used by the latest attempt.
    pub fingerprint: Option<Fingerprint>,
    /// Output of the latest attempt; only set when `status` is succeeded.
    pub artifact: Option<ArtifactRef>,
    pub error: Option<StageError>,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// History: survives later failures for a different fingerprint.
    pub last_success: Option<SuccessEntry>,
}

impl StageRecord {
    /// A fresh record with no attempts.
    pub fn pending(bill: BillId, stage: Stage) -> Self {
        Self {
            bill,
            stage,
            status: StageStatus::Pending,
            fingerprint: None,
            artifact: None,
            error: None,
            attempts: 0,
            last_attempt_at: None,
            last_success: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Model family
// ---------------------------------------------------------------------------

/// Which provider adapter serves model calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    #[default]
    Gemini,
    Gpt,
    Ollama,
}

impl ModelFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Gpt => "gpt",
            Self::Ollama => "ollama",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gemini" => Ok(Self::Gemini),
            "gpt" | "openai" => Ok(Self::Gpt),
            "ollama" => Ok(Self::Ollama),
            other => Err(format!(
                "unknown model family '{other}' (expected gemini, gpt or ollama)"
            )),
        }
    }
}
