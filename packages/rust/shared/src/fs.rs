//! Crash-safe file replacement.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{LegisflowError, Result};

/// Write `content` to `path` atomically: write and sync a temp file in the
/// same directory, rename it over the target, then sync the directory so the
/// rename itself survives a crash. Readers see either the old file or the new
/// one, never a partial write.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| LegisflowError::io(parent, e))?;

    let temp = parent.join(format!(".tmp_{}", uuid::Uuid::now_v7()));
    let written = fs::File::create(&temp).and_then(|mut file| {
        file.write_all(content)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(LegisflowError::io(&temp, e));
    }

    fs::rename(&temp, path).map_err(|e| {
        let _ = fs::remove_file(&temp);
        LegisflowError::io(path, e)
    })?;
    sync_dir(parent)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| LegisflowError::io(dir, e))
}

// Directory handles cannot be opened as files on this platform.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_existing_file_without_leftovers() {
        let dir = std::env::temp_dir().join(format!("lf-fs-{}", uuid::Uuid::now_v7()));
        let path = dir.join("nested").join("state.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp_"))
            .collect();
        assert!(leftovers.is_empty());

        let _ = fs::remove_dir_all(&dir);
    }

    #[cfg(unix)]
    #[test]
    fn directory_sync_reports_missing_directories() {
        let dir = std::env::temp_dir().join(format!("lf-fs-{}", uuid::Uuid::now_v7()));
        assert!(sync_dir(&dir).is_err());

        fs::create_dir_all(&dir).unwrap();
        sync_dir(&dir).unwrap();
        write_atomic(&dir.join("state.json"), b"synced").unwrap();
        assert_eq!(fs::read_to_string(dir.join("state.json")).unwrap(), "synced");

        let _ = fs::remove_dir_all(&dir);
    }
}
