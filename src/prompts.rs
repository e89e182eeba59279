//! Prompt construction for the code-generation call.
//!
//! Builders are pure string renderers: the same metadata and query always
//! produce the same prompt, so the surrounding pipeline can be tested without
//! the language model.

use crate::metadata::SheetMetadata;
use std::path::Path;

/// System prompt for the script-writing model.
pub const SYSTEM_PROMPT: &str = r#"You are a data analysis assistant that writes Lua scripts.

The script runs inside a restricted interpreter. Only the Lua table, string and
math libraries are available, plus a provided spreadsheet API named `pl`. There
is no os, io, require or any other way to reach the outside world. The path of
the spreadsheet under analysis is provided in the global FILE_PATH.

Respond with a single Lua script and nothing else. No prose, no explanations,
no markdown outside of one optional code fence."#;

/// Render the code-generation instruction for one analysis request.
pub fn build_codegen_prompt(path: &Path, metadata: &SheetMetadata, query: &str) -> String {
    let dtype_list: Vec<String> = metadata
        .dtypes
        .iter()
        .map(|(name, dtype)| format!("{}: {}", name, dtype))
        .collect();

    format!(
        r#"Generate a Lua script that analyzes a spreadsheet and answers the user's question.

File information:
- File path: {file_path}
- Sheets: {sheets}
- Total rows: {total_rows}
- Columns: {columns}
- Column types: {dtypes}

User question: {query}

Available API (nothing else exists in the environment):
- pl.read_file(FILE_PATH) -> frame
- frame:columns() -> list of column names
- frame:row_count() -> number of rows
- frame:dtypes() -> table of column -> type name
- frame:head(n) -> frame with the first n rows
- frame:select(cols) -> frame with only the named columns, e.g. frame:select({{"a", "b"}})
- frame:filter(column, op, value) -> frame; op is one of "==", "!=", ">", ">=", "<", "<=", "contains"
- frame:sort(column, descending) -> frame; descending is a boolean
- frame:group_by(cols, aggs) -> frame, e.g. frame:group_by({{"city"}}, {{amount = "sum"}}); aggs are "sum", "mean", "min", "max", "count"
- frame:sum(column), frame:mean(column), frame:min(column), frame:max(column) -> number
- frame:count() -> number of rows
- frame:unique(column) -> list of distinct values
- frame:column(column) -> list of values
- frame:to_json() -> row-oriented JSON string

Requirements:
1. Read the spreadsheet with pl.read_file(FILE_PATH) and use only the API listed above.
2. Use English identifiers for every variable.
3. Store the final answer in a global variable named result.
4. Wrap the logic in pcall; if it fails, store a readable error message in result.
5. If the answer is a table of rows, store frame:to_json() in result, never the frame itself.
6. Keep the script short and direct. Output only Lua code."#,
        file_path = path.display(),
        sheets = metadata.sheet_names.join(", "),
        total_rows = metadata.total_rows,
        columns = metadata.columns.join(", "),
        dtypes = dtype_list.join(", "),
        query = query,
    )
}

/// Extend the base instruction with the failure from the previous attempt.
pub fn build_retry_prompt(base_prompt: &str, error: &str, previous_code: Option<&str>) -> String {
    let mut prompt = String::from(base_prompt);
    prompt.push_str("\n\nYour previous attempt failed.\n");
    if let Some(code) = previous_code {
        prompt.push_str("Previous script:\n```lua\n");
        prompt.push_str(code);
        prompt.push_str("\n```\n");
    }
    prompt.push_str("Error: ");
    prompt.push_str(error);
    prompt.push_str("\nWrite a corrected script that avoids this error.");
    prompt
}
