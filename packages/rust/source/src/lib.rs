//! Upstream document sources.
//!
//! A [`DocumentSource`] lists the bills of a session and fetches the raw
//! documents of one bill: the bill text, an optional fiscal note, and its
//! amendments. Two implementations:
//!
//! - [`LocalSource`]: a directory holding `{session}/bills.json` and the
//!   documents it references
//! - [`HttpManifestSource`]: the same layout served over HTTP

mod http;
mod local;

use std::collections::HashSet;

use async_trait::async_trait;
use legisflow_shared::{AmendmentMeta, BillMetadata, MediaType, Result, SessionId};
use serde::{Deserialize, Serialize};

pub use http::HttpManifestSource;
pub use local::LocalSource;

/// File name of the per-session bill listing.
pub const MANIFEST_FILE: &str = "bills.json";

// ---------------------------------------------------------------------------
// Listing (bills.json)
// ---------------------------------------------------------------------------

/// Top-level shape of `bills.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub bills: Vec<BillListing>,
}

/// One bill as listed upstream, with references to its documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillListing {
    #[serde(flatten)]
    pub metadata: BillMetadata,
    /// Bill text document, relative to the manifest (or absolute URL).
    pub document: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fiscal_note: Option<String>,
    #[serde(default)]
    pub amendments: Vec<AmendmentListing>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmendmentListing {
    #[serde(flatten)]
    pub meta: AmendmentMeta,
    pub document: String,
}

// ---------------------------------------------------------------------------
// Fetched documents
// ---------------------------------------------------------------------------

/// Raw bytes of one upstream document.
#[derive(Debug, Clone)]
pub struct Document {
    pub media_type: MediaType,
    pub bytes: Vec<u8>,
    /// Where the bytes came from (path or URL), for diagnostics.
    pub origin: String,
}

#[derive(Debug, Clone)]
pub struct AmendmentDocument {
    pub meta: AmendmentMeta,
    pub document: Document,
}

/// Everything fetched for one bill.
#[derive(Debug, Clone)]
pub struct BillDocuments {
    pub bill: Document,
    pub fiscal_note: Option<Document>,
    pub amendments: Vec<AmendmentDocument>,
}

impl BillDocuments {
    /// Adopted amendments in application order: ascending sequence, then id.
    pub fn adopted_amendments(&self) -> Vec<&AmendmentDocument> {
        let mut adopted: Vec<&AmendmentDocument> =
            self.amendments.iter().filter(|a| a.meta.adopted).collect();
        adopted.sort_by(|a, b| {
            a.meta
                .sequence
                .cmp(&b.meta.sequence)
                .then_with(|| a.meta.id.cmp(&b.meta.id))
        });
        adopted
    }
}

/// Media type of a referenced document, defaulting to PDF.
pub(crate) fn media_type_of(reference: &str) -> MediaType {
    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    MediaType::from_path(path).unwrap_or(MediaType::Pdf)
}

// ---------------------------------------------------------------------------
// DocumentSource
// ---------------------------------------------------------------------------

/// Capability to enumerate and download a session's bills.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// All bills listed for `session`, as published.
    async fn list_bills(&self, session: &SessionId) -> Result<Vec<BillListing>>;

    /// Download the documents referenced by one listing.
    async fn fetch_documents(
        &self,
        session: &SessionId,
        listing: &BillListing,
    ) -> Result<BillDocuments>;
}

/// Sort listings by bill number and drop repeats: a bill that is listed
/// twice, or whose number was already seen as another bill's crossfile.
pub fn dedup_crossfiles(mut listings: Vec<BillListing>) -> Vec<BillListing> {
    listings.sort_by(|a, b| a.metadata.number.cmp(&b.metadata.number));

    let mut seen: HashSet<String> = HashSet::new();
    let mut kept = Vec::with_capacity(listings.len());
    for listing in listings {
        if seen.contains(&listing.metadata.number) {
            tracing::debug!(bill = %listing.metadata.number, "skipping crossfiled or duplicate bill");
            continue;
        }
        seen.insert(listing.metadata.number.clone());
        if let Some(crossfile) = &listing.metadata.crossfile {
            seen.insert(crossfile.clone());
        }
        kept.push(listing);
    }
    kept
}
