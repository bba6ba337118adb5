//! Stage functions: convert, amend, qa.
//!
//! Each function takes its already-fetched inputs and returns the bytes of
//! the artifact it produced. Persistence and skip decisions belong to the
//! runner.

use std::collections::BTreeSet;
use std::path::Path;

use legisflow_convert::Converter;
use legisflow_shared::{
    ArtifactKind, BillMetadata, LegisflowError, ModelCallKind, Result, sha256_hex,
};
use legisflow_source::{AmendmentDocument, Document};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::model::{InferenceRequest, ModelClient, ResponseSchema, strip_code_fence};

/// Bumped whenever the amend prompt changes meaning.
pub const AMEND_PROMPT_VERSION: u32 = 1;
/// Bumped whenever the qa prompts or schema change meaning.
pub const QA_PROMPT_VERSION: u32 = 1;

/// Bytes produced by one stage function.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub kind: ArtifactKind,
    pub content: Vec<u8>,
    /// Number of successful model calls made to produce the output.
    pub model_calls: u32,
}

// ---------------------------------------------------------------------------
// convert
// ---------------------------------------------------------------------------

/// Convert the bill document to Markdown.
#[instrument(skip_all, fields(origin = %document.origin))]
pub fn convert_bill(converter: &dyn Converter, document: &Document) -> Result<StageOutput> {
    let text = converter.convert(&document.bytes, document.media_type)?;
    Ok(StageOutput {
        kind: ArtifactKind::Markdown,
        content: text.into_bytes(),
        model_calls: 0,
    })
}

// ---------------------------------------------------------------------------
// amend
// ---------------------------------------------------------------------------

const AMEND_SYSTEM_PROMPT: &str = "Below you will find bill markdown wrapped in <bill> tags, \
followed by amendment markdown wrapped in <amendment> tags. Apply the instructions in the \
amendment to the bill. Respond ONLY with the resulting markdown.";

/// Apply `amendments` to `base_text` one at a time, in the given order.
#[instrument(skip_all, fields(amendments = amendments.len(), model = %model.spec()))]
pub async fn apply_amendments(
    converter: &dyn Converter,
    model: &dyn ModelClient,
    base_text: &str,
    amendments: &[&AmendmentDocument],
) -> Result<StageOutput> {
    if amendments.is_empty() {
        return Err(LegisflowError::validation(
            "amend stage called without adopted amendments",
        ));
    }

    let mut text = base_text.to_string();
    let mut calls = 0;
    for amendment in amendments {
        let amendment_text = converter
            .convert(&amendment.document.bytes, amendment.document.media_type)
            .map_err(|e| match e {
                LegisflowError::Conversion(msg) => {
                    LegisflowError::Conversion(format!("amendment {}: {msg}", amendment.meta.id))
                }
                other => other,
            })?;

        let request = InferenceRequest {
            system: AMEND_SYSTEM_PROMPT.to_string(),
            user: format!("<bill>\n{text}\n</bill>\n\n<amendment>\n{amendment_text}\n</amendment>"),
            schema: None,
        };
        let response = model.infer(&request).await?;
        calls += 1;

        let mut merged = strip_code_fence(&response.text).to_string();
        if !merged.ends_with('\n') {
            merged.push('\n');
        }
        debug!(amendment = %amendment.meta.id, chars = merged.len(), "amendment applied");
        text = merged;
    }

    Ok(StageOutput {
        kind: ArtifactKind::AmendedMarkdown,
        content: text.into_bytes(),
        model_calls: calls,
    })
}

// ---------------------------------------------------------------------------
// qa
// ---------------------------------------------------------------------------

const QUESTIONS: [(&str, &str); 7] = [
    (
        "bill_summary",
        "Write a brief, plain-English summary of the bill.",
    ),
    ("start_year", "What year does the bill take effect?"),
    ("end_year", "What year does the bill expire or sunset?"),
    (
        "funding",
        "How much funding is allocated or mandated by the bill? (if millions, write out full number. E.g. \"1 million\" should be 1000000)",
    ),
    (
        "responsible_party",
        "What Maryland State agency, department, office, or role is responsible for implementing the bill?",
    ),
    ("stakeholders", "What population will be impacted by the bill?"),
    (
        "fiscal_impact_summary",
        "Summarize the state and local fiscal impact as described in the Fiscal Note. Include estimates for revenues and expenditures if available.",
    ),
];

/// Answers to the fixed policy questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaAnswers {
    pub bill_summary: String,
    #[serde(default)]
    pub start_year: Option<i32>,
    #[serde(default)]
    pub end_year: Option<i32>,
    #[serde(default)]
    pub funding: Option<f64>,
    pub responsible_party: String,
    pub stakeholders: String,
    #[serde(default)]
    pub fiscal_impact_summary: Option<String>,
}

/// One agency the bill is relevant to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgencyRelevance {
    pub agency_name: String,
    pub is_relevant: bool,
    pub relevance_explanation: String,
    pub relevance_rating: u8,
}

#[derive(Debug, Deserialize)]
struct AgencyAnalysis {
    #[serde(default)]
    relevant_agencies: Vec<AgencyRelevance>,
}

/// Content of a `qa_answers` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaResult {
    #[serde(flatten)]
    pub answers: QaAnswers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency_relevance: Option<Vec<AgencyRelevance>>,
}

/// A state agency the bill can be rated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agency {
    pub name: String,
    pub summary: String,
}

/// Load the agencies list: a JSON array of `{ "name", "summary" }` objects.
pub fn load_agencies(path: &Path) -> Result<Vec<Agency>> {
    let raw = std::fs::read_to_string(path).map_err(|e| LegisflowError::io(path, e))?;
    let agencies: Vec<Agency> = serde_json::from_str(&raw).map_err(|e| {
        LegisflowError::config(format!("invalid agencies file {}: {e}", path.display()))
    })?;
    if agencies.iter().any(|a| a.name.trim().is_empty()) {
        return Err(LegisflowError::config(format!(
            "agencies file {} has an entry without a name",
            path.display()
        )));
    }
    Ok(agencies)
}

/// Hash of the agencies list as it appears in the prompt; `None` when empty.
pub fn agencies_hash(agencies: &[Agency]) -> Option<String> {
    if agencies.is_empty() {
        None
    } else {
        Some(sha256_hex(agencies_text(agencies).as_bytes()))
    }
}

/// Everything the qa stage reads.
#[derive(Debug, Clone, Copy)]
pub struct QaInput<'a> {
    pub metadata: &'a BillMetadata,
    /// Most current bill text: amended if available, else original.
    pub text: &'a str,
    pub fiscal_note: Option<&'a str>,
    pub agencies: &'a [Agency],
}

impl QaInput<'_> {
    fn document(&self) -> String {
        match self.fiscal_note {
            Some(note) => format!("{}\n\nFISCAL NOTE:\n{note}", self.text),
            None => self.text.to_string(),
        }
    }
}

/// Ask the policy questions, then rate agency relevance when agencies are
/// configured.
#[instrument(skip_all, fields(bill = %input.metadata.number, model = %model.spec()))]
pub async fn answer_questions(model: &dyn ModelClient, input: &QaInput<'_>) -> Result<StageOutput> {
    let document = input.document();

    let response = model
        .infer(&InferenceRequest {
            system: qa_system_prompt(),
            user: document.clone(),
            schema: Some(ResponseSchema {
                name: "answers_to_questions".into(),
                schema: answers_schema(),
            }),
        })
        .await?;
    let answers: QaAnswers = parse_structured(response.json, "answers_to_questions")?;
    let mut calls = 1;

    let agency_relevance = if input.agencies.is_empty() {
        None
    } else {
        let response = model
            .infer(&InferenceRequest {
                system: agency_prompt(input.agencies),
                user: document,
                schema: Some(ResponseSchema {
                    name: "agency_analysis".into(),
                    schema: agency_schema(input.agencies),
                }),
            })
            .await?;
        calls += 1;
        let analysis: AgencyAnalysis = parse_structured(response.json, "agency_analysis")?;
        Some(filter_relevance(analysis.relevant_agencies, input.agencies))
    };

    let result = QaResult {
        answers,
        agency_relevance,
    };
    let content = serde_json::to_vec_pretty(&result)
        .map_err(|e| LegisflowError::Serialization(e.to_string()))?;
    Ok(StageOutput {
        kind: ArtifactKind::QaAnswers,
        content,
        model_calls: calls,
    })
}

fn parse_structured<T: serde::de::DeserializeOwned>(json: Option<Value>, name: &str) -> Result<T> {
    let value = json.ok_or_else(|| {
        LegisflowError::model(
            ModelCallKind::Validation,
            format!("{name}: structured response missing"),
        )
    })?;
    serde_json::from_value(value).map_err(|e| {
        LegisflowError::model(
            ModelCallKind::Validation,
            format!("{name}: response does not match schema: {e}"),
        )
    })
}

/// Keep only known agencies with a rating in 1..=5, one entry per agency.
fn filter_relevance(rated: Vec<AgencyRelevance>, agencies: &[Agency]) -> Vec<AgencyRelevance> {
    let known: BTreeSet<&str> = agencies.iter().map(|a| a.name.as_str()).collect();
    let mut seen = BTreeSet::new();
    rated
        .into_iter()
        .filter(|entry| {
            if !known.contains(entry.agency_name.as_str()) {
                warn!(agency = %entry.agency_name, "dropping rating for unknown agency");
                return false;
            }
            if !(1..=5).contains(&entry.relevance_rating) {
                warn!(
                    agency = %entry.agency_name,
                    rating = entry.relevance_rating,
                    "dropping out-of-range relevance rating"
                );
                return false;
            }
            seen.insert(entry.agency_name.clone())
        })
        .collect()
}

fn qa_system_prompt() -> String {
    let questions: Vec<String> = QUESTIONS
        .iter()
        .map(|(key, question)| format!("- {key}: {question}"))
        .collect();
    format!(
        "You are reading markdown generated from the text of a bill passed by the Maryland General Assembly, \
and its associated Fiscal and Policy Note (appended at the end). \
Note that ~ syntax means text has been stricken. \
Answer the following questions:\n{}\n\
Please respond with only valid JSON in the specified format.",
        questions.join("\n")
    )
}

fn agencies_text(agencies: &[Agency]) -> String {
    agencies
        .iter()
        .map(|a| format!("Agency: {}\nSummary: {}", a.name, a.summary))
        .collect::<Vec<_>>()
        .join("\n---\n")
}

fn agency_prompt(agencies: &[Agency]) -> String {
    format!(
        "You are an expert policy analyst. Review the provided bill text and fiscal note. \
We have a list of Maryland State Agencies and their summaries. \
For EACH agency in the list, determine if the bill is relevant to their work or has a notable fiscal impact on them, \
based on the provided Agency Summary.\n\n\
Return a list of ONLY the agencies that are relevant or impacted.\n\n\
For each relevant agency, provide a relevance_rating from 1 to 5, where 5 is the most relevant \
(e.g., they are the primary implementing agency) and 1 is low relevance (e.g., they are minimally impacted or mentioned).\n\n\
AGENCIES LIST:\n{}\n\n\
Analyze the bill's content against each agency's summary to make your determination.",
        agencies_text(agencies)
    )
}

fn answers_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "bill_summary": {"type": "string"},
            "start_year": {"type": ["integer", "null"]},
            "end_year": {"type": ["integer", "null"]},
            "funding": {"type": ["number", "null"]},
            "responsible_party": {"type": "string"},
            "stakeholders": {"type": "string"},
            "fiscal_impact_summary": {"type": ["string", "null"]}
        },
        "required": ["bill_summary", "responsible_party", "stakeholders"]
    })
}

fn agency_schema(agencies: &[Agency]) -> Value {
    let names: Vec<&str> = agencies.iter().map(|a| a.name.as_str()).collect();
    json!({
        "type": "object",
        "properties": {
            "relevant_agencies": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "agency_name": {"type": "string", "enum": names},
                        "is_relevant": {"type": "boolean"},
                        "relevance_explanation": {"type": "string"},
                        "relevance_rating": {
                            "type": "integer",
                            "minimum": 1,
                            "maximum": 5,
                            "description": "Relevance rating from 1 to 5, with 5 being the most relevant"
                        }
                    },
                    "required": ["agency_name", "is_relevant", "relevance_explanation", "relevance_rating"]
                }
            }
        },
        "required": ["relevant_agencies"]
    })
}

#[cfg(test)]
mod tests {
    use legisflow_convert::DocumentConverter;
    use legisflow_shared::{AmendmentMeta, MediaType};

    use super::*;
    use crate::testkit::ScriptedModel;

    fn markdown(text: &str) -> Document {
        Document {
            media_type: MediaType::Markdown,
            bytes: text.as_bytes().to_vec(),
            origin: "test".into(),
        }
    }

    fn amendment(id: &str, text: &str) -> AmendmentDocument {
        AmendmentDocument {
            meta: AmendmentMeta {
                id: id.into(),
                sequence: 1,
                date: None,
                adopted: true,
            },
            document: markdown(text),
        }
    }

    fn metadata() -> BillMetadata {
        BillMetadata {
            number: "HB0100".into(),
            title: "Education - Funding".into(),
            sponsors: vec![],
            status: "Passed".into(),
            synopsis: None,
            crossfile: None,
        }
    }

    fn answers_json() -> Value {
        json!({
            "bill_summary": "Funds schools.",
            "start_year": 2026,
            "end_year": null,
            "funding": 1000000.0,
            "responsible_party": "State Department of Education",
            "stakeholders": "Students"
        })
    }

    #[test]
    fn convert_produces_markdown_artifact() {
        let out = convert_bill(&DocumentConverter::new(), &markdown("# Bill\r\n\r\n\r\nText  \n")).unwrap();
        assert_eq!(out.kind, ArtifactKind::Markdown);
        assert_eq!(String::from_utf8(out.content).unwrap(), "# Bill\n\nText\n");
        assert_eq!(out.model_calls, 0);
    }

    #[tokio::test]
    async fn amendments_are_applied_in_order() {
        let model = ScriptedModel::new(vec![
            Ok("```markdown\n# Bill v2\n```".into()),
            Ok("# Bill v3".into()),
        ]);
        let first = amendment("A1", "Strike line 1");
        let second = amendment("A2", "Insert line 2");
        let out = apply_amendments(
            &DocumentConverter::new(),
            &model,
            "# Bill\n",
            &[&first, &second],
        )
        .await
        .unwrap();

        assert_eq!(out.kind, ArtifactKind::AmendedMarkdown);
        assert_eq!(out.model_calls, 2);
        assert_eq!(String::from_utf8(out.content).unwrap(), "# Bill v3\n");

        let prompts = model.prompts();
        assert!(prompts[0].contains("<bill>\n# Bill\n\n</bill>"));
        assert!(prompts[0].contains("<amendment>\nStrike line 1\n\n</amendment>"));
        // Second call sees the output of the first.
        assert!(prompts[1].contains("<bill>\n# Bill v2\n\n</bill>"));
    }

    #[tokio::test]
    async fn amend_without_amendments_is_rejected() {
        let model = ScriptedModel::new(vec![]);
        let err = apply_amendments(&DocumentConverter::new(), &model, "# Bill\n", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, LegisflowError::Validation { .. }));
        assert!(model.prompts().is_empty());
    }

    #[tokio::test]
    async fn qa_appends_fiscal_note_and_parses_answers() {
        let model = ScriptedModel::new(vec![Ok(answers_json().to_string())]);
        let meta = metadata();
        let out = answer_questions(
            &model,
            &QaInput {
                metadata: &meta,
                text: "# Bill\n",
                fiscal_note: Some("Costs $1M."),
                agencies: &[],
            },
        )
        .await
        .unwrap();

        assert_eq!(out.kind, ArtifactKind::QaAnswers);
        assert_eq!(out.model_calls, 1);
        let result: QaResult = serde_json::from_slice(&out.content).unwrap();
        assert_eq!(result.answers.start_year, Some(2026));
        assert_eq!(result.answers.funding, Some(1_000_000.0));
        assert!(result.agency_relevance.is_none());

        let prompts = model.prompts();
        assert_eq!(prompts[0], "# Bill\n\n\nFISCAL NOTE:\nCosts $1M.");
        assert!(model.systems()[0].contains("- funding: How much funding"));
    }

    #[tokio::test]
    async fn qa_rejects_answers_missing_required_fields() {
        let model = ScriptedModel::new(vec![Ok(r#"{"bill_summary": "x"}"#.into())]);
        let meta = metadata();
        let err = answer_questions(
            &model,
            &QaInput {
                metadata: &meta,
                text: "# Bill\n",
                fiscal_note: None,
                agencies: &[],
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            LegisflowError::ModelCall {
                kind: ModelCallKind::Validation,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn agency_ratings_are_filtered() {
        let agencies = vec![
            Agency {
                name: "Maryland State Department of Education".into(),
                summary: "Schools".into(),
            },
            Agency {
                name: "Comptroller of Maryland".into(),
                summary: "Taxes".into(),
            },
        ];
        let ratings = json!({
            "relevant_agencies": [
                {"agency_name": "Maryland State Department of Education", "is_relevant": true,
                 "relevance_explanation": "Implements it", "relevance_rating": 5},
                {"agency_name": "Department of Nowhere", "is_relevant": true,
                 "relevance_explanation": "Invented", "relevance_rating": 3},
                {"agency_name": "Comptroller of Maryland", "is_relevant": true,
                 "relevance_explanation": "Out of range", "relevance_rating": 9},
                {"agency_name": "Maryland State Department of Education", "is_relevant": true,
                 "relevance_explanation": "Duplicate", "relevance_rating": 4}
            ]
        });
        let model = ScriptedModel::new(vec![
            Ok(answers_json().to_string()),
            Ok(ratings.to_string()),
        ]);
        let meta = metadata();
        let out = answer_questions(
            &model,
            &QaInput {
                metadata: &meta,
                text: "# Bill\n",
                fiscal_note: None,
                agencies: &agencies,
            },
        )
        .await
        .unwrap();

        assert_eq!(out.model_calls, 2);
        let result: QaResult = serde_json::from_slice(&out.content).unwrap();
        let relevance = result.agency_relevance.unwrap();
        assert_eq!(relevance.len(), 1);
        assert_eq!(relevance[0].relevance_rating, 5);
        assert!(model.systems()[1].contains(
            "Agency: Maryland State Department of Education\nSummary: Schools\n---\nAgency: Comptroller of Maryland"
        ));
    }

    #[test]
    fn agencies_load_and_hash() {
        let dir = std::env::temp_dir().join(format!("legisflow-agencies-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("agencies.json");
        std::fs::write(
            &path,
            r#"[{"name": "Comptroller of Maryland", "summary": "Taxes"}]"#,
        )
        .unwrap();

        let agencies = load_agencies(&path).unwrap();
        assert_eq!(agencies.len(), 1);
        assert!(agencies_hash(&agencies).is_some());
        assert!(agencies_hash(&[]).is_none());

        std::fs::write(&path, r#"[{"name": " ", "summary": "x"}]"#).unwrap();
        assert!(matches!(
            load_agencies(&path).unwrap_err(),
            LegisflowError::Config { .. }
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
