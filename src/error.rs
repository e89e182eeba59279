use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Empty spreadsheet: {0}")]
    EmptyFile(String),

    #[error("Failed to read spreadsheet: {0}")]
    CorruptFile(String),

    #[error("Code generation error: {0}")]
    Generation(String),

    #[error("Script rejected: {0}")]
    Compilation(String),

    #[error("Script execution error: {0}")]
    Execution(String),

    #[error("Frame operation error: {0}")]
    Frame(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
