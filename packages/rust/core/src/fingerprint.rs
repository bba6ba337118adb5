//! Change detection: content fingerprints of each stage's declared inputs.
//!
//! A fingerprint is the SHA-256 of a canonical JSON encoding of
//! [`StageInputs`]. It depends only on the values passed in (upstream
//! content hashes, converter id, model spec, prompt version), never on file
//! timestamps or process state, so equal inputs always give equal
//! fingerprints across runs and machines.

use legisflow_shared::{Fingerprint, MediaType, Stage, sha256_hex};
use serde::Serialize;

use crate::model::ModelSpec;

/// Bumped when the encoding below changes meaning; invalidates every stage.
pub const FINGERPRINT_VERSION: u32 = 1;

/// Which text a QA run read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextSource {
    Original,
    Amended,
}

/// One adopted amendment as seen by the amend stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmendmentInput {
    pub id: String,
    pub sequence: u32,
    /// sha256 of the raw amendment document.
    pub document_hash: String,
}

/// Everything that can change a stage's output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "inputs", rename_all = "snake_case")]
pub enum StageInputs {
    Convert {
        converter: String,
        media_type: MediaType,
        /// sha256 of the raw bill document.
        document_hash: String,
    },
    Amend {
        /// sha256 of the converted bill text.
        base_text_hash: String,
        /// Adopted amendments in application order.
        amendments: Vec<AmendmentInput>,
        converter: String,
        model: ModelSpec,
        prompt_version: u32,
    },
    Qa {
        /// sha256 of the most current text (amended, else original).
        text_hash: String,
        text_source: TextSource,
        fiscal_note_hash: Option<String>,
        converter: String,
        model: ModelSpec,
        prompt_version: u32,
        agencies_hash: Option<String>,
    },
    /// Structural skip: the stage does not apply to these upstream inputs.
    NotApplicable {
        stage: Stage,
        upstream_hash: String,
    },
    /// The stage's inputs could not be fetched; `reference` names what was
    /// requested.
    Unavailable { stage: Stage, reference: String },
}

impl StageInputs {
    /// The stage these inputs belong to.
    pub fn stage(&self) -> Stage {
        match self {
            Self::Convert { .. } => Stage::Convert,
            Self::Amend { .. } => Stage::Amend,
            Self::Qa { .. } => Stage::Qa,
            Self::NotApplicable { stage, .. } | Self::Unavailable { stage, .. } => *stage,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        fingerprint(self)
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    version: u32,
    #[serde(flatten)]
    inputs: &'a StageInputs,
}

/// Compute the fingerprint of a stage's inputs.
pub fn fingerprint(inputs: &StageInputs) -> Fingerprint {
    let envelope = Envelope {
        version: FINGERPRINT_VERSION,
        inputs,
    };
    // Plain structs with string keys: encoding cannot fail.
    let canonical = serde_json::to_vec(&envelope).expect("stage inputs serialize to JSON");
    Fingerprint::new(sha256_hex(&canonical))
}
