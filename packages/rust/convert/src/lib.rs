//! Document conversion: raw bill, amendment and fiscal note bytes to
//! normalized Markdown text.
//!
//! Conversion is deterministic: identical bytes and media type always give
//! identical output. [`Converter::id`] names the converter and its version;
//! it feeds the convert-stage fingerprint, so bumping it re-converts every
//! bill on the next run.

mod cleanup;

use legisflow_shared::{LegisflowError, MediaType, Result};
use tracing::{debug, instrument};

/// Pure bytes-to-text conversion capability.
pub trait Converter: Send + Sync {
    /// Stable identifier including a version, e.g. `document-converter/1`.
    fn id(&self) -> &str;

    fn convert(&self, bytes: &[u8], media_type: MediaType) -> Result<String>;
}

/// Default converter: `pdf-extract` for PDFs, pass-through for text and
/// Markdown, followed by the cleanup pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentConverter;

impl DocumentConverter {
    pub const ID: &'static str = "document-converter/1";

    pub fn new() -> Self {
        Self
    }
}

impl Converter for DocumentConverter {
    fn id(&self) -> &str {
        Self::ID
    }

    #[instrument(skip_all, fields(media_type = media_type.as_str(), size = bytes.len()))]
    fn convert(&self, bytes: &[u8], media_type: MediaType) -> Result<String> {
        let raw = match media_type {
            MediaType::Pdf => extract_pdf_text(bytes)?,
            MediaType::Text | MediaType::Markdown => decode_utf8(bytes)?,
        };

        let text = cleanup::run_pipeline(&raw, media_type == MediaType::Pdf);
        if text.trim().is_empty() {
            return Err(LegisflowError::Conversion(
                "document has no extractable text".into(),
            ));
        }
        debug!(chars = text.len(), "document converted");
        Ok(text)
    }
}

/// Extract text from PDF bytes. `pdf-extract` panics on some malformed
/// inputs, so the call runs under `catch_unwind`.
fn extract_pdf_text(bytes: &[u8]) -> Result<String> {
    let extracted = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem(bytes)
    }));
    match extracted {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(LegisflowError::Conversion(format!("PDF extraction failed: {e}"))),
        Err(_) => Err(LegisflowError::Conversion(
            "PDF extraction panicked on malformed input".into(),
        )),
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String> {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| LegisflowError::Conversion(format!("document is not valid UTF-8: {e}")))
}
