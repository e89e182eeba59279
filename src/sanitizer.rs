//! Cleanup of raw model output into a candidate script.
//!
//! The model's answer arrives as free text: usually a fenced code block, often
//! decorated with prose, response-wrapper reprs serialized by intermediate
//! layers, or JSON escape noise. Sanitization is a fixed sequence of
//! normalization passes, each one documented and tested on its own. The whole
//! pipeline is infallible: for any input it returns a string, and running it
//! on its own output changes nothing.

use regex::Regex;

/// Apply every cleanup pass in order.
pub fn sanitize(raw: &str) -> String {
    let text = extract_fenced_block(raw);
    let text = strip_wrapper_reprs(&text);
    let text = strip_boilerplate_lines(&text);
    let text = unescape(&text);
    let text = strip_blank_lines(&text);
    reindent(&text)
}

/// Pass 1: if the text contains a fenced code block, keep only the body of
/// the first one. Accepts ```lua and bare ``` fences. Text without a complete
/// fence pair is returned unchanged.
pub fn extract_fenced_block(text: &str) -> String {
    if let Ok(re) = Regex::new(r"(?s)```(?:lua)?[ \t]*\r?\n?(.*?)```") {
        if let Some(caps) = re.captures(text) {
            if let Some(body) = caps.get(1) {
                return body.as_str().to_string();
            }
        }
    }
    text.to_string()
}

/// Pass 2: remove textual remnants of response-wrapper objects. A calling
/// layer that stringifies its result object leaks fragments like
/// `RunResult(output=..., usage=...)` into the code text.
pub fn strip_wrapper_reprs(text: &str) -> String {
    let mut cleaned = text.to_string();
    for pattern in [
        r"(?s)RunResult\s*\(.*?\)",
        r"(?s)ModelResponse\s*\(.*?\)",
        r"(?s)TextPart\s*\(.*?\)",
    ] {
        if let Ok(re) = Regex::new(pattern) {
            cleaned = re.replace_all(&cleaned, "").to_string();
        }
    }
    cleaned
}

/// Pass 3: drop whole lines echoing the "final result" boilerplate phrase
/// models like to add around the code.
pub fn strip_boilerplate_lines(text: &str) -> String {
    if let Ok(re) = Regex::new(r"(?mi)^[^\n]*\bfinal result\b[^\n]*$\n?") {
        return re.replace_all(text, "").to_string();
    }
    text.to_string()
}

/// Pass 4: undo escape noise introduced by intermediate JSON encoding. Runs
/// of two or more backslashes collapse to one, then escaped quotes become
/// plain quotes. Collapsing runs (instead of replacing pairs) keeps the pass
/// idempotent.
pub fn unescape(text: &str) -> String {
    let collapsed = match Regex::new(r"\\{2,}") {
        Ok(re) => re.replace_all(text, "\\").to_string(),
        Err(_) => text.to_string(),
    };
    collapsed.replace("\\'", "'").replace("\\\"", "\"")
}

/// Pass 5: drop blank lines and trailing whitespace. Leading indentation is
/// preserved.
pub fn strip_blank_lines(text: &str) -> String {
    text.lines()
        .map(|line| line.trim_end())
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pass 6: best-effort reindentation of the script, standing in for a real
/// formatter. Block keywords drive a depth counter; four spaces per level.
/// If the blocks do not balance the input is returned unchanged, so malformed
/// code flows through to compilation where it fails with a proper error.
pub fn reindent(text: &str) -> String {
    let mut depth: i32 = 0;
    let mut out: Vec<String> = Vec::new();

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            out.push(String::new());
            continue;
        }

        let render_depth = if starts_with_closer(line) {
            depth - 1
        } else {
            depth
        };
        if render_depth < 0 {
            return text.to_string();
        }

        out.push(format!("{}{}", "    ".repeat(render_depth as usize), line));

        depth += block_delta(line);
        if depth < 0 {
            return text.to_string();
        }
    }

    if depth != 0 {
        return text.to_string();
    }
    out.join("\n")
}

fn starts_with_closer(line: &str) -> bool {
    let first = line
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .next()
        .unwrap_or("");
    matches!(first, "end" | "else" | "elseif" | "until")
}

/// Net block-depth change contributed by one line. `then` and `do` open,
/// `end` and `until` close; `elseif` cancels the `then` it carries. Comment
/// tails are ignored so prose does not skew the count.
fn block_delta(line: &str) -> i32 {
    let code = line.split("--").next().unwrap_or("");
    let mut delta = 0i32;

    for token in code.split(|c: char| !c.is_alphanumeric() && c != '_') {
        match token {
            "then" | "do" | "function" | "repeat" => delta += 1,
            "end" | "until" => delta -= 1,
            "elseif" => delta -= 1,
            _ => {}
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_lua_fenced_block() {
        let raw = "Here is the script:\n```lua\nresult = 1\n```\nHope this helps!";
        assert_eq!(extract_fenced_block(raw), "result = 1\n");
    }

    #[test]
    fn extracts_bare_fenced_block() {
        let raw = "```\nresult = 2\n```";
        assert_eq!(extract_fenced_block(raw), "result = 2\n");
    }

    #[test]
    fn text_without_fences_is_unchanged() {
        let raw = "result = 3";
        assert_eq!(extract_fenced_block(raw), "result = 3");
    }

    #[test]
    fn removes_wrapper_reprs() {
        let raw = "RunResult(output=ModelResponse(parts=[TextPart(content='x')]))\nresult = 1";
        let cleaned = strip_wrapper_reprs(raw);
        assert!(!cleaned.contains("RunResult"));
        assert!(!cleaned.contains("ModelResponse"));
        assert!(!cleaned.contains("TextPart"));
        assert!(cleaned.contains("result = 1"));
    }

    #[test]
    fn removes_final_result_boilerplate() {
        let raw = "result = 1\n-- The final result is stored below:\nresult = 2";
        let cleaned = strip_boilerplate_lines(raw);
        assert_eq!(cleaned, "result = 1\nresult = 2");
    }

    #[test]
    fn unescapes_backslash_noise() {
        assert_eq!(unescape(r#"local s = \"ok\""#), r#"local s = "ok""#);
        assert_eq!(unescape(r"a \\ b"), r"a \ b");
        assert_eq!(unescape(r"a \\\\ b"), r"a \ b");
    }

    #[test]
    fn unescape_is_idempotent() {
        let raw = r#"x = \\'a\\' .. \"b\" \\\\ tail"#;
        let once = unescape(raw);
        assert_eq!(unescape(&once), once);
    }

    #[test]
    fn drops_blank_lines_and_trailing_whitespace() {
        let raw = "local x = 1   \n\n    result = x\t\n\n";
        assert_eq!(strip_blank_lines(raw), "local x = 1\n    result = x");
    }

    #[test]
    fn reindents_balanced_blocks() {
        let raw = "if ok then\nresult = total\nelse\nresult = 0\nend";
        let expected = "if ok then\n    result = total\nelse\n    result = 0\nend";
        assert_eq!(reindent(raw), expected);
    }

    #[test]
    fn reindent_keeps_unbalanced_input_untouched() {
        let raw = "if ok then\nresult = 1";
        assert_eq!(reindent(raw), raw);
    }

    #[test]
    fn reindent_handles_one_line_blocks() {
        let raw = "if ok then result = 1 end\nresult = result + 1";
        assert_eq!(reindent(raw), raw);
    }

    #[test]
    fn sanitize_cleans_a_messy_response() {
        let raw = concat!(
            "Sure! Here is the code:\n",
            "```lua\n",
            "local frame = pl.read_file(FILE_PATH)\n",
            "\n",
            "result = frame:sum(\\\"amount\\\")   \n",
            "```\n",
            "The final result is stored in `result`.\n",
        );
        let cleaned = sanitize(raw);
        assert_eq!(
            cleaned,
            "local frame = pl.read_file(FILE_PATH)\nresult = frame:sum(\"amount\")"
        );
    }

    #[test]
    fn sanitize_is_idempotent() {
        let samples = [
            "```lua\nif x then\nresult = 1\nend\n```",
            "RunResult(output='x')\nresult = 2\n\n",
            r#"result = \"a\" .. \\ "b""#,
            "",
            "already clean",
        ];
        for raw in samples {
            let once = sanitize(raw);
            assert_eq!(sanitize(&once), once, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn sanitize_never_fails_on_odd_input() {
        for raw in ["", "```", "``````", "\\", "\u{fffd}nonsense\u{0}", "```lua"] {
            let _ = sanitize(raw);
        }
    }
}
