//! Source backed by a local directory tree.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use legisflow_shared::{LegisflowError, Result, SessionId};
use tracing::{debug, instrument};

use crate::{
    AmendmentDocument, BillDocuments, BillListing, Document, DocumentSource, MANIFEST_FILE,
    Manifest, media_type_of,
};

/// Reads `{root}/{session}/bills.json` and the documents next to it.
#[derive(Debug, Clone)]
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.root.join(session.as_str())
    }

    async fn read_document(&self, session: &SessionId, reference: &str) -> Result<Document> {
        let relative = Path::new(reference);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(LegisflowError::Fetch(format!(
                "document reference {reference:?} leaves the session directory"
            )));
        }

        let path = self.session_dir(session).join(relative);
        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| LegisflowError::Fetch(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), size = bytes.len(), "read document");

        Ok(Document {
            media_type: media_type_of(reference),
            bytes,
            origin: path.display().to_string(),
        })
    }
}

#[async_trait]
impl DocumentSource for LocalSource {
    fn name(&self) -> &str {
        "local"
    }

    #[instrument(skip_all, fields(session = %session))]
    async fn list_bills(&self, session: &SessionId) -> Result<Vec<BillListing>> {
        let path = self.session_dir(session).join(MANIFEST_FILE);
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| LegisflowError::Fetch(format!("{}: {e}", path.display())))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .map_err(|e| LegisflowError::Fetch(format!("{} is malformed: {e}", path.display())))?;
        Ok(manifest.bills)
    }

    async fn fetch_documents(
        &self,
        session: &SessionId,
        listing: &BillListing,
    ) -> Result<BillDocuments> {
        let bill = self.read_document(session, &listing.document).await?;

        let fiscal_note = match &listing.fiscal_note {
            Some(reference) => Some(self.read_document(session, reference).await?),
            None => None,
        };

        let mut amendments = Vec::with_capacity(listing.amendments.len());
        for amendment in &listing.amendments {
            amendments.push(AmendmentDocument {
                meta: amendment.meta.clone(),
                document: self.read_document(session, &amendment.document).await?,
            });
        }

        Ok(BillDocuments {
            bill,
            fiscal_note,
            amendments,
        })
    }
}

#[cfg(test)]
mod tests {
    use legisflow_shared::MediaType;

    use super::*;
    use crate::fixtures::manifest_json;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fixture_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("lf-source-{}", uuid::Uuid::now_v7()));
        write(&root, "2026rs/bills.json", manifest_json());
        write(&root, "2026rs/HB0100.md", "# HB0100\n\nSection 1.");
        write(&root, "2026rs/SB0100.md", "# SB0100");
        write(&root, "2026rs/HB0100_fn.txt", "Fiscal impact: minimal.");
        for id in ["A1", "A2", "W1"] {
            write(&root, &format!("2026rs/amendments/HB0100-{id}.md"), &format!("Amendment {id}"));
        }
        root
    }

    #[tokio::test]
    async fn lists_and_fetches_bill_documents() {
        let root = fixture_root();
        let source = LocalSource::new(&root);
        let session: SessionId = "2026rs".parse().unwrap();

        let listings = source.list_bills(&session).await.unwrap();
        assert_eq!(listings.len(), 2);

        let hb = listings.iter().find(|l| l.metadata.number == "HB0100").unwrap();
        let docs = source.fetch_documents(&session, hb).await.unwrap();
        assert_eq!(docs.bill.media_type, MediaType::Markdown);
        assert_eq!(docs.bill.bytes, b"# HB0100\n\nSection 1.");
        assert_eq!(docs.fiscal_note.as_ref().unwrap().media_type, MediaType::Text);
        assert_eq!(docs.amendments.len(), 3);
        assert_eq!(docs.adopted_amendments().len(), 2);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn missing_session_is_fetch_error() {
        let source = LocalSource::new(std::env::temp_dir().join("lf-source-missing"));
        let err = source
            .list_bills(&"1999rs".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, LegisflowError::Fetch(_)));
    }

    #[tokio::test]
    async fn refuses_references_outside_session() {
        let root = fixture_root();
        let source = LocalSource::new(&root);
        let session: SessionId = "2026rs".parse().unwrap();

        let mut listing = source.list_bills(&session).await.unwrap().remove(0);
        listing.document = "../../etc/passwd".into();
        let err = source.fetch_documents(&session, &listing).await.unwrap_err();
        assert!(err.to_string().contains("leaves the session directory"));

        let _ = std::fs::remove_dir_all(&root);
    }
}
