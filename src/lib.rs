//! Natural-language analysis of spreadsheet files.
//!
//! A question and a workbook go in; a language model writes a small Lua
//! script against a restricted spreadsheet API; the script runs in a
//! capability-scoped VM and the captured output comes back as text.

pub mod analyzer;
pub mod config;
pub mod error;
pub mod llm;
pub mod marshal;
pub mod metadata;
pub mod prompts;
pub mod sandbox;
pub mod sanitizer;
pub mod server;
pub mod upload;
