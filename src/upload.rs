//! Storage of uploaded workbooks.
//!
//! Uploads land in the configured directory under their base file name.
//! A file is only kept if it can actually yield metadata afterward; anything
//! that fails the probe is removed again so later requests never trip over a
//! half-usable workbook.

use crate::error::{AnalysisError, Result};
use crate::metadata::{self, SheetMetadata};
use std::path::{Path, PathBuf};
use tracing::info;

pub fn save_upload(
    upload_dir: &Path,
    file_name: &str,
    bytes: &[u8],
) -> Result<(PathBuf, SheetMetadata)> {
    let base_name = Path::new(file_name)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AnalysisError::UnsupportedFormat("upload needs a file name".to_string()))?;

    let target = upload_dir.join(&base_name);
    if !metadata::is_supported_extension(&target) {
        return Err(AnalysisError::UnsupportedFormat(format!(
            "unsupported file type: {}",
            base_name
        )));
    }
    if bytes.is_empty() {
        return Err(AnalysisError::EmptyFile(base_name));
    }

    std::fs::create_dir_all(upload_dir)?;
    std::fs::write(&target, bytes)?;

    let probed = match metadata::extract(&target) {
        Ok(probed) => probed,
        Err(error) => {
            let _ = std::fs::remove_file(&target);
            return Err(error);
        }
    };

    info!(file = %target.display(), size = bytes.len(), "stored upload");
    Ok((target, probed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::Workbook;

    fn workbook_bytes() -> Vec<u8> {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "name").unwrap();
        sheet.write_string(1, 0, "a").unwrap();
        workbook.save_to_buffer().unwrap()
    }

    #[test]
    fn stores_a_valid_workbook() {
        let dir = tempfile::tempdir().unwrap();
        let (path, probed) = save_upload(dir.path(), "book.xlsx", &workbook_bytes()).unwrap();

        assert!(path.exists());
        assert_eq!(path, dir.path().join("book.xlsx"));
        assert_eq!(probed.total_rows, 1);
        assert_eq!(probed.columns, vec!["name".to_string()]);
    }

    #[test]
    fn rejects_unsupported_extensions_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let err = save_upload(dir.path(), "notes.txt", b"hello").unwrap_err();

        assert!(matches!(err, AnalysisError::UnsupportedFormat(_)));
        assert!(!dir.path().join("notes.txt").exists());
    }

    #[test]
    fn rejects_empty_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let err = save_upload(dir.path(), "book.xlsx", b"").unwrap_err();

        assert!(matches!(err, AnalysisError::EmptyFile(_)));
        assert!(!dir.path().join("book.xlsx").exists());
    }

    #[test]
    fn removes_files_that_fail_the_probe() {
        let dir = tempfile::tempdir().unwrap();
        let err = save_upload(dir.path(), "bad.xlsx", b"not a workbook").unwrap_err();

        assert!(matches!(err, AnalysisError::CorruptFile(_)));
        assert!(!dir.path().join("bad.xlsx").exists());
    }

    #[test]
    fn strips_directory_components_from_names() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = save_upload(dir.path(), "../escape.xlsx", &workbook_bytes()).unwrap();

        assert_eq!(path, dir.path().join("escape.xlsx"));
    }
}
