//! Turning captured script output into user-facing text.
//!
//! Tabular output becomes a JSON array of row objects, scalars and tables
//! render as JSON, and strings pass through untouched. Floats that carry no
//! fractional part serialize as integers so aggregate answers read naturally.

use polars::prelude::{AnyValue, DataFrame};
use serde_json::Value as JsonValue;

/// VM-independent snapshot of whatever the script left in its output global.
#[derive(Debug)]
pub enum ScriptOutput {
    /// The script never assigned the output global.
    Absent,
    Text(String),
    Frame(DataFrame),
    Value(JsonValue),
}

/// Render an execution output as the text shown to the user.
///
/// `None` means the script produced nothing; callers decide how to phrase
/// that. This never fails: values that defy clean serialization fall back to
/// their debug rendering instead of erroring.
pub fn marshal(output: &ScriptOutput) -> Option<String> {
    match output {
        ScriptOutput::Absent => None,
        ScriptOutput::Text(text) => Some(text.clone()),
        ScriptOutput::Frame(df) => Some(frame_to_json_string(df)),
        ScriptOutput::Value(JsonValue::String(text)) => Some(text.clone()),
        ScriptOutput::Value(value) => Some(value.to_string()),
    }
}

/// Serialize a dataframe as a JSON array of row objects.
pub fn frame_to_json_string(df: &DataFrame) -> String {
    let columns: Vec<String> = df
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();

    let mut rows = Vec::with_capacity(df.height());
    for row_idx in 0..df.height() {
        let mut row = serde_json::Map::new();
        for name in &columns {
            let cell = df
                .column(name)
                .ok()
                .map(|series| series.get(row_idx).unwrap_or(AnyValue::Null))
                .map(anyvalue_to_json)
                .unwrap_or(JsonValue::Null);
            row.insert(name.clone(), cell);
        }
        rows.push(JsonValue::Object(row));
    }

    serde_json::to_string(&JsonValue::Array(rows)).unwrap_or_else(|_| "[]".to_string())
}

fn anyvalue_to_json(value: AnyValue) -> JsonValue {
    match value {
        AnyValue::Null => JsonValue::Null,
        AnyValue::Boolean(b) => JsonValue::Bool(b),
        AnyValue::String(s) => JsonValue::String(s.to_string()),
        AnyValue::StringOwned(s) => JsonValue::String(s.to_string()),
        AnyValue::Int8(v) => JsonValue::Number(v.into()),
        AnyValue::Int16(v) => JsonValue::Number(v.into()),
        AnyValue::Int32(v) => JsonValue::Number(v.into()),
        AnyValue::Int64(v) => JsonValue::Number(v.into()),
        AnyValue::UInt8(v) => JsonValue::Number(v.into()),
        AnyValue::UInt16(v) => JsonValue::Number(v.into()),
        AnyValue::UInt32(v) => JsonValue::Number(v.into()),
        AnyValue::UInt64(v) => JsonValue::Number(v.into()),
        AnyValue::Float32(v) => json_number(v as f64),
        AnyValue::Float64(v) => json_number(v),
        other => JsonValue::String(format!("{:?}", other)),
    }
}

/// JSON number for a float, collapsing integral values to integers.
pub fn json_number(value: f64) -> JsonValue {
    const EXACT_INT_BOUND: f64 = 9_007_199_254_740_992.0;
    if value.is_finite() && value.fract() == 0.0 && value.abs() < EXACT_INT_BOUND {
        JsonValue::Number((value as i64).into())
    } else {
        serde_json::Number::from_f64(value)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::df;

    #[test]
    fn absent_output_marshals_to_none() {
        assert!(marshal(&ScriptOutput::Absent).is_none());
    }

    #[test]
    fn text_passes_through_unchanged() {
        let output = ScriptOutput::Text("合計は 30 です".to_string());
        assert_eq!(marshal(&output).unwrap(), "合計は 30 です");
    }

    #[test]
    fn scalar_values_render_as_bare_json() {
        assert_eq!(
            marshal(&ScriptOutput::Value(serde_json::json!(30))).unwrap(),
            "30"
        );
        assert_eq!(
            marshal(&ScriptOutput::Value(serde_json::json!(true))).unwrap(),
            "true"
        );
        assert_eq!(
            marshal(&ScriptOutput::Value(serde_json::json!({"a": 1}))).unwrap(),
            "{\"a\":1}"
        );
    }

    #[test]
    fn frames_serialize_as_row_objects() {
        let df = df!(
            "name" => &["a", "b"],
            "amount" => &[10.0f64, 20.0],
        )
        .unwrap();

        let json = frame_to_json_string(&df);
        let rows: JsonValue = serde_json::from_str(&json).unwrap();
        let rows = rows.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], serde_json::json!("a"));
        assert_eq!(rows[0]["amount"], serde_json::json!(10));
        assert_eq!(rows[1]["amount"], serde_json::json!(20));
    }

    #[test]
    fn non_ascii_cells_survive_serialization() {
        let df = df!("city" => &["東京", "大阪"]).unwrap();
        let json = frame_to_json_string(&df);
        assert!(json.contains("東京"));
        assert!(json.contains("大阪"));
    }

    #[test]
    fn integral_floats_collapse_to_integers() {
        assert_eq!(json_number(30.0), serde_json::json!(30));
        assert_eq!(json_number(10.5), serde_json::json!(10.5));
        assert_eq!(json_number(-2.0), serde_json::json!(-2));
        assert_eq!(json_number(f64::NAN), JsonValue::Null);
        assert_eq!(json_number(f64::INFINITY), JsonValue::Null);
    }

    #[test]
    fn null_cells_render_as_json_null() {
        let df = df!(
            "name" => &[Some("a"), None],
        )
        .unwrap();
        let json = frame_to_json_string(&df);
        let rows: JsonValue = serde_json::from_str(&json).unwrap();
        assert_eq!(rows[1]["name"], JsonValue::Null);
    }
}
