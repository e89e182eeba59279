use crate::error::{AnalysisError, Result};
use calamine::{open_workbook_auto, Data, Reader};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Spreadsheet extensions accepted for analysis and upload.
pub const SUPPORTED_EXTENSIONS: &[&str] = &["xlsx", "xlsm", "xls"];

/// Number of data rows sampled for column type inference.
const SAMPLE_ROWS: usize = 5;

/// Structural summary of a workbook, built once per request without
/// materializing the full dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetMetadata {
    pub sheet_names: Vec<String>,
    pub total_rows: usize,
    pub columns: Vec<String>,
    pub dtypes: Vec<(String, String)>,
}

impl SheetMetadata {
    /// Human-readable summary used by the inspection endpoint.
    pub fn summary(&self, path: &Path) -> String {
        let dtype_lines: Vec<String> = self
            .dtypes
            .iter()
            .map(|(name, dtype)| format!("  - {}: {}", name, dtype))
            .collect();

        format!(
            "File: {}\nSheets: {}\nTotal rows: {}\nColumns ({}):\n{}",
            path.display(),
            self.sheet_names.join(", "),
            self.total_rows,
            self.columns.len(),
            dtype_lines.join("\n")
        )
    }
}

pub fn is_supported_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Extract metadata from the first sheet of a workbook.
///
/// Reads the used cell range once: the header row provides column names, the
/// range height provides the row count, and the first few data rows feed type
/// inference. The workbook handle is dropped before this function returns.
pub fn extract(path: &Path) -> Result<SheetMetadata> {
    if !path.exists() {
        return Err(AnalysisError::NotFound(path.display().to_string()));
    }
    if !is_supported_extension(path) {
        return Err(AnalysisError::UnsupportedFormat(path.display().to_string()));
    }

    let mut workbook = open_workbook_auto(path)
        .map_err(|e| AnalysisError::CorruptFile(format!("{}: {}", path.display(), e)))?;

    let sheet_names = workbook.sheet_names().to_vec();
    let first_sheet = sheet_names
        .first()
        .cloned()
        .ok_or_else(|| AnalysisError::EmptyFile("workbook has no sheets".to_string()))?;

    let range = workbook
        .worksheet_range(&first_sheet)
        .map_err(|e| AnalysisError::CorruptFile(format!("{}: {}", first_sheet, e)))?;

    if range.height() == 0 {
        return Err(AnalysisError::EmptyFile(format!(
            "sheet '{}' has no rows",
            first_sheet
        )));
    }

    let mut rows = range.rows();
    let header = rows
        .next()
        .ok_or_else(|| AnalysisError::EmptyFile(format!("sheet '{}' has no rows", first_sheet)))?;

    let columns = dedup_headers(header);
    let total_rows = range.height().saturating_sub(1);

    let sample: Vec<&[Data]> = rows.take(SAMPLE_ROWS).collect();
    let dtypes = columns
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let cells: Vec<&Data> = sample.iter().filter_map(|row| row.get(idx)).collect();
            (name.clone(), infer_dtype(&cells).to_string())
        })
        .collect();

    Ok(SheetMetadata {
        sheet_names,
        total_rows,
        columns,
        dtypes,
    })
}

/// Turn a header row into unique, non-empty column names. Blank cells become
/// `column_N`; repeated names get a numeric suffix so the prompt and the
/// execution facade agree on what each column is called.
pub fn dedup_headers(header: &[Data]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut names = Vec::with_capacity(header.len());

    for (idx, cell) in header.iter().enumerate() {
        let base = match cell {
            Data::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            Data::Int(i) => i.to_string(),
            Data::Float(f) => f.to_string(),
            Data::Bool(b) => b.to_string(),
            _ => format!("column_{}", idx + 1),
        };

        let count = seen.entry(base.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            names.push(base);
        } else {
            names.push(format!("{}_{}", base, count));
        }
    }

    names
}

fn infer_dtype(cells: &[&Data]) -> &'static str {
    let mut saw_number = false;
    let mut saw_bool = false;
    let mut saw_datetime = false;
    let mut saw_duration = false;

    for cell in cells {
        match cell {
            Data::String(s) if !s.trim().is_empty() => return "text",
            Data::Int(_) | Data::Float(_) => saw_number = true,
            Data::Bool(_) => saw_bool = true,
            Data::DateTime(_) | Data::DateTimeIso(_) => saw_datetime = true,
            Data::DurationIso(_) => saw_duration = true,
            _ => {}
        }
    }

    if saw_datetime {
        "datetime"
    } else if saw_duration {
        "duration"
    } else if saw_number {
        "number"
    } else if saw_bool {
        "boolean"
    } else {
        "empty"
    }
}
