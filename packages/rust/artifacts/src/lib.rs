//! Document store: append-only, content-addressed artifact files.
//!
//! Layout under the store root:
//!
//! ```text
//! {session}/{bill}/{stage}/{kind}/{fingerprint[..16]}-{sha256[..16]}.{ext}
//! ```
//!
//! A file is never rewritten once it exists. A changed input yields a new
//! fingerprint, hence a new file; the state tracker moves its pointer to it
//! and earlier versions stay on disk. The one exception is a file whose bytes
//! no longer match the hash in its own name: that file is damaged, and
//! storing the correct bytes again repairs it in place.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use legisflow_shared::{
    ArtifactKind, ArtifactRef, BillId, Fingerprint, LegisflowError, Result, Stage, sha256_hex,
    write_atomic,
};
use tracing::{debug, instrument, warn};

/// Handle to an artifact directory tree.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| LegisflowError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store `bytes` as an artifact of `bill`/`stage`/`kind` generated from
    /// inputs with `fingerprint`. Storing identical bytes for the same
    /// fingerprint again returns a reference to the existing file.
    #[instrument(skip_all, fields(bill = %bill, stage = %stage, kind = %kind))]
    pub fn put(
        &self,
        bill: &BillId,
        stage: Stage,
        kind: ArtifactKind,
        fingerprint: &Fingerprint,
        bytes: &[u8],
    ) -> Result<ArtifactRef> {
        let content_hash = sha256_hex(bytes);
        let relative = format!(
            "{}/{}-{}.{}",
            kind_dir(bill, stage, kind),
            fingerprint.short(),
            &content_hash[..16],
            kind.extension()
        );
        let path = self.resolve(&relative)?;

        let created_at = if path.exists() {
            let existing = std::fs::read(&path).map_err(|e| LegisflowError::io(&path, e))?;
            if sha256_hex(&existing) == content_hash {
                debug!(path = %relative, "artifact already stored");
                modified_at(&path)?
            } else {
                warn!(path = %relative, "stored artifact is damaged, rewriting it");
                write_atomic(&path, bytes)?;
                Utc::now()
            }
        } else {
            write_atomic(&path, bytes)?;
            debug!(path = %relative, size = bytes.len(), "artifact written");
            Utc::now()
        };

        Ok(ArtifactRef {
            kind,
            path: relative,
            content_hash,
            fingerprint: fingerprint.clone(),
            size: bytes.len() as u64,
            created_at,
        })
    }

    /// Read an artifact's bytes, verifying them against the recorded hash.
    pub fn read(&self, artifact: &ArtifactRef) -> Result<Vec<u8>> {
        let path = self.resolve(&artifact.path)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LegisflowError::Storage(format!(
                    "artifact {} is missing",
                    artifact.path
                )));
            }
            Err(e) => return Err(LegisflowError::io(&path, e)),
        };
        if sha256_hex(&bytes) != artifact.content_hash {
            return Err(LegisflowError::Storage(format!(
                "artifact {} does not match its recorded hash",
                artifact.path
            )));
        }
        Ok(bytes)
    }

    /// Read an artifact as UTF-8 text.
    pub fn read_text(&self, artifact: &ArtifactRef) -> Result<String> {
        let bytes = self.read(artifact)?;
        String::from_utf8(bytes).map_err(|_| {
            LegisflowError::Storage(format!("artifact {} is not valid UTF-8", artifact.path))
        })
    }

    /// Relative paths of every stored version of `bill`/`stage`/`kind`, sorted.
    pub fn versions(&self, bill: &BillId, stage: Stage, kind: ArtifactKind) -> Result<Vec<String>> {
        let dir_rel = kind_dir(bill, stage, kind);
        let dir = self.resolve(&dir_rel)?;
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LegisflowError::io(&dir, e)),
        };

        let mut versions: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .map(|name| format!("{dir_rel}/{name}"))
            .collect();
        versions.sort();
        Ok(versions)
    }

    /// Map a stored relative path onto the filesystem, refusing anything that
    /// could escape the root.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in relative.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return Err(LegisflowError::Storage(format!(
                    "invalid artifact path {relative:?}"
                )));
            }
            path.push(segment);
        }
        Ok(path)
    }
}

fn kind_dir(bill: &BillId, stage: Stage, kind: ArtifactKind) -> String {
    format!("{}/{}/{}/{}", bill.session, bill.number, stage, kind)
}

fn modified_at(path: &Path) -> Result<DateTime<Utc>> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| LegisflowError::io(path, e))?;
    Ok(DateTime::<Utc>::from(modified))
}
