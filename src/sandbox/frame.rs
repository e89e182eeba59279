//! Allow-listed data-processing surface exposed to generated scripts.
//!
//! `Frame` wraps a polars DataFrame as Lua userdata. Scripts can read,
//! transform, aggregate and serialize through the methods below and nothing
//! else; there is no route from a Frame back to arbitrary host code.

use crate::error::{AnalysisError, Result};
use crate::marshal;
use crate::metadata::dedup_headers;
use calamine::{open_workbook_auto, Data, Reader};
use mlua::{Lua, UserData, UserDataMethods, Value};
use polars::prelude::*;
use std::path::Path;

#[derive(Clone)]
pub struct Frame(pub DataFrame);

/// Load the first sheet of a workbook into a DataFrame.
///
/// The first row is the header. Column storage is decided per column from the
/// cells it contains: all-numeric becomes Float64, all-boolean Boolean,
/// all-datetime ISO-8601 strings, anything mixed or textual String. Error
/// cells and blanks are nulls.
pub fn load_dataframe(path: &Path) -> Result<DataFrame> {
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
    let data_rows: Vec<&[Data]> = rows.collect();

    let mut series = Vec::with_capacity(columns.len());
    for (idx, name) in columns.iter().enumerate() {
        series.push(build_series(name, idx, &data_rows));
    }

    DataFrame::new(series).map_err(|e| AnalysisError::Frame(e.to_string()))
}

enum ColumnKind {
    Number,
    Boolean,
    DateTime,
    Text,
    Empty,
}

fn classify_column(rows: &[&[Data]], idx: usize) -> ColumnKind {
    let mut number = false;
    let mut boolean = false;
    let mut datetime = false;
    let mut text = false;

    for row in rows {
        match row.get(idx) {
            Some(Data::Int(_)) | Some(Data::Float(_)) => number = true,
            Some(Data::Bool(_)) => boolean = true,
            Some(Data::DateTime(_)) | Some(Data::DateTimeIso(_)) => datetime = true,
            Some(Data::String(s)) if !s.trim().is_empty() => text = true,
            Some(Data::DurationIso(_)) => text = true,
            _ => {}
        }
    }

    match (number, boolean, datetime, text) {
        (_, _, _, true) => ColumnKind::Text,
        (true, false, false, false) => ColumnKind::Number,
        (false, true, false, false) => ColumnKind::Boolean,
        (false, false, true, false) => ColumnKind::DateTime,
        (false, false, false, false) => ColumnKind::Empty,
        _ => ColumnKind::Text,
    }
}

fn build_series(name: &str, idx: usize, rows: &[&[Data]]) -> Series {
    match classify_column(rows, idx) {
        ColumnKind::Number => {
            let values: Vec<Option<f64>> = rows
                .iter()
                .map(|row| match row.get(idx) {
                    Some(Data::Int(i)) => Some(*i as f64),
                    Some(Data::Float(f)) => Some(*f),
                    _ => None,
                })
                .collect();
            Series::new(name, values)
        }
        ColumnKind::Boolean => {
            let values: Vec<Option<bool>> = rows
                .iter()
                .map(|row| match row.get(idx) {
                    Some(Data::Bool(b)) => Some(*b),
                    _ => None,
                })
                .collect();
            Series::new(name, values)
        }
        ColumnKind::DateTime => {
            let values: Vec<Option<String>> = rows
                .iter()
                .map(|row| match row.get(idx) {
                    Some(Data::DateTime(dt)) => excel_serial_to_iso(dt.as_f64()),
                    Some(Data::DateTimeIso(s)) => Some(s.clone()),
                    _ => None,
                })
                .collect();
            Series::new(name, values)
        }
        ColumnKind::Text | ColumnKind::Empty => {
            let values: Vec<Option<String>> = rows
                .iter()
                .map(|row| row.get(idx).and_then(cell_to_text))
                .collect();
            Series::new(name, values)
        }
    }
}

fn cell_to_text(cell: &Data) -> Option<String> {
    match cell {
        Data::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Data::Int(i) => Some(i.to_string()),
        Data::Float(f) => Some(format_float(*f)),
        Data::Bool(b) => Some(b.to_string()),
        Data::DateTime(dt) => excel_serial_to_iso(dt.as_f64()),
        Data::DateTimeIso(s) => Some(s.clone()),
        Data::DurationIso(s) => Some(s.clone()),
        _ => None,
    }
}

fn format_float(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{:.0}", f)
    } else {
        f.to_string()
    }
}

/// Convert an Excel serial date (days since 1899-12-30) to an ISO-8601
/// timestamp string.
fn excel_serial_to_iso(serial: f64) -> Option<String> {
    let days = serial.floor() as i64;
    let seconds = ((serial - serial.floor()) * 86_400.0).round() as i64;
    let base = chrono::NaiveDate::from_ymd_opt(1899, 12, 30)?;
    let date = base.checked_add_signed(chrono::TimeDelta::try_days(days)?)?;
    let datetime = date
        .and_hms_opt(0, 0, 0)?
        .checked_add_signed(chrono::TimeDelta::try_seconds(seconds)?)?;
    Some(datetime.format("%Y-%m-%dT%H:%M:%S").to_string())
}

impl UserData for Frame {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("columns", |_, this, ()| {
            let names: Vec<String> = this
                .0
                .get_column_names()
                .iter()
                .map(|s| s.to_string())
                .collect();
            Ok(names)
        });

        methods.add_method("row_count", |_, this, ()| Ok(this.0.height()));

        methods.add_method("count", |_, this, ()| Ok(this.0.height()));

        methods.add_method("dtypes", |lua, this, ()| {
            let table = lua.create_table()?;
            for (name, dtype) in this.0.get_column_names().iter().zip(this.0.dtypes()) {
                table.set(name.to_string(), dtype.to_string())?;
            }
            Ok(table)
        });

        methods.add_method("head", |_, this, n: Option<usize>| {
            Ok(Frame(this.0.head(Some(n.unwrap_or(5)))))
        });

        methods.add_method("select", |_, this, cols: Vec<String>| {
            let exprs: Vec<Expr> = cols.iter().map(|c| col(c)).collect();
            let selected = this
                .0
                .clone()
                .lazy()
                .select(exprs)
                .collect()
                .map_err(mlua::Error::external)?;
            Ok(Frame(selected))
        });

        methods.add_method(
            "filter",
            |_, this, (column, op, value): (String, String, Value)| {
                let predicate = comparison_expr(&column, &op, &value)?;
                let filtered = this
                    .0
                    .clone()
                    .lazy()
                    .filter(predicate)
                    .collect()
                    .map_err(mlua::Error::external)?;
                Ok(Frame(filtered))
            },
        );

        methods.add_method(
            "sort",
            |_, this, (column, descending): (String, Option<bool>)| {
                let options =
                    SortMultipleOptions::default().with_order_descending(descending.unwrap_or(false));
                let sorted = this
                    .0
                    .clone()
                    .lazy()
                    .sort_by_exprs(vec![col(&column)], options)
                    .collect()
                    .map_err(mlua::Error::external)?;
                Ok(Frame(sorted))
            },
        );

        methods.add_method(
            "group_by",
            |_, this, (cols, aggs): (Vec<String>, mlua::Table)| {
                let group_exprs: Vec<Expr> = cols.iter().map(|c| col(c)).collect();
                let mut agg_exprs = Vec::new();
                for pair in aggs.pairs::<String, String>() {
                    let (column, agg) = pair?;
                    agg_exprs.push(agg_expr(&column, &agg)?);
                }
                if agg_exprs.is_empty() {
                    return Err(mlua::Error::external(
                        "group_by requires at least one aggregation".to_string(),
                    ));
                }
                let grouped = this
                    .0
                    .clone()
                    .lazy()
                    .group_by_stable(group_exprs)
                    .agg(agg_exprs)
                    .collect()
                    .map_err(mlua::Error::external)?;
                Ok(Frame(grouped))
            },
        );

        methods.add_method("sum", |lua, this, column: String| {
            scalar_agg(lua, &this.0, col(&column).sum())
        });

        methods.add_method("mean", |lua, this, column: String| {
            scalar_agg(lua, &this.0, col(&column).mean())
        });

        methods.add_method("min", |lua, this, column: String| {
            scalar_agg(lua, &this.0, col(&column).min())
        });

        methods.add_method("max", |lua, this, column: String| {
            scalar_agg(lua, &this.0, col(&column).max())
        });

        methods.add_method("unique", |lua, this, column: String| {
            let out = this
                .0
                .clone()
                .lazy()
                .select([col(&column).unique_stable()])
                .collect()
                .map_err(mlua::Error::external)?;
            series_values(lua, out.get_columns().first())
        });

        methods.add_method("column", |lua, this, column: String| {
            let series = this.0.column(&column).map_err(mlua::Error::external)?;
            series_values(lua, Some(series))
        });

        methods.add_method("to_json", |_, this, ()| {
            Ok(marshal::frame_to_json_string(&this.0))
        });
    }
}

fn comparison_expr(column: &str, op: &str, value: &Value) -> mlua::Result<Expr> {
    if op == "contains" {
        let pattern = match value {
            Value::String(s) => s.to_string_lossy().to_string(),
            other => {
                return Err(mlua::Error::external(format!(
                    "contains expects a string, got {}",
                    other.type_name()
                )))
            }
        };
        return Ok(col(column).str().contains_literal(lit(pattern)));
    }

    let literal = lua_value_to_lit(value)?;
    let lhs = col(column);
    let expr = match op {
        "==" => lhs.eq(literal),
        "!=" => lhs.neq(literal),
        ">" => lhs.gt(literal),
        ">=" => lhs.gt_eq(literal),
        "<" => lhs.lt(literal),
        "<=" => lhs.lt_eq(literal),
        other => {
            return Err(mlua::Error::external(format!(
                "unsupported filter operator '{}'",
                other
            )))
        }
    };
    Ok(expr)
}

fn lua_value_to_lit(value: &Value) -> mlua::Result<Expr> {
    match value {
        Value::Integer(i) => Ok(lit(*i)),
        Value::Number(f) => Ok(lit(*f)),
        Value::Boolean(b) => Ok(lit(*b)),
        Value::String(s) => Ok(lit(s.to_string_lossy().to_string())),
        other => Err(mlua::Error::external(format!(
            "unsupported filter value type: {}",
            other.type_name()
        ))),
    }
}

fn agg_expr(column: &str, agg: &str) -> mlua::Result<Expr> {
    let expr = match agg {
        "sum" => col(column).sum(),
        "mean" => col(column).mean(),
        "min" => col(column).min(),
        "max" => col(column).max(),
        "count" => len().alias(column),
        other => {
            return Err(mlua::Error::external(format!(
                "unsupported aggregation '{}'",
                other
            )))
        }
    };
    Ok(expr)
}

fn scalar_agg(lua: &Lua, df: &DataFrame, expr: Expr) -> mlua::Result<Value> {
    let out = df
        .clone()
        .lazy()
        .select([expr])
        .collect()
        .map_err(mlua::Error::external)?;
    let series = out
        .get_columns()
        .first()
        .ok_or_else(|| mlua::Error::external("aggregation produced no column".to_string()))?;
    let value = series.get(0).unwrap_or(AnyValue::Null);
    anyvalue_to_lua(lua, value)
}

fn series_values(lua: &Lua, series: Option<&Series>) -> mlua::Result<Vec<Value>> {
    let series =
        series.ok_or_else(|| mlua::Error::external("column produced no values".to_string()))?;
    let mut values = Vec::with_capacity(series.len());
    for item in series.iter() {
        values.push(anyvalue_to_lua(lua, item)?);
    }
    Ok(values)
}

fn anyvalue_to_lua(lua: &Lua, value: AnyValue) -> mlua::Result<Value> {
    match value {
        AnyValue::Null => Ok(Value::Nil),
        AnyValue::Boolean(b) => Ok(Value::Boolean(b)),
        AnyValue::String(s) => Ok(Value::String(lua.create_string(s)?)),
        AnyValue::StringOwned(s) => Ok(Value::String(lua.create_string(s.as_str())?)),
        AnyValue::Int8(i) => Ok(Value::Integer(i as i64)),
        AnyValue::Int16(i) => Ok(Value::Integer(i as i64)),
        AnyValue::Int32(i) => Ok(Value::Integer(i as i64)),
        AnyValue::Int64(i) => Ok(Value::Integer(i)),
        AnyValue::UInt8(u) => Ok(Value::Integer(u as i64)),
        AnyValue::UInt16(u) => Ok(Value::Integer(u as i64)),
        AnyValue::UInt32(u) => Ok(Value::Integer(u as i64)),
        AnyValue::UInt64(u) => Ok(Value::Integer(u as i64)),
        AnyValue::Float32(f) => Ok(Value::Number(f as f64)),
        AnyValue::Float64(f) => Ok(Value::Number(f)),
        other => Ok(Value::String(lua.create_string(other.to_string())?)),
    }
}
