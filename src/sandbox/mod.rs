//! Restricted execution environment for generated scripts.
//!
//! Scripts run inside a fresh Lua VM built with only the table, string and
//! math libraries. Base globals are scrubbed to an allow-list, `print` is a
//! no-op, and the only route to external data is `pl.read_file` on the one
//! injected file path. A static screen rejects module loading, system library
//! references and metatable tricks before anything is compiled, and each
//! execution carries an instruction budget and a memory ceiling.

pub mod frame;

use crate::config::AgentConfig;
use crate::error::{AnalysisError, Result};
use crate::marshal::{self, ScriptOutput};
use frame::{load_dataframe, Frame};
use mlua::{HookTriggers, Lua, LuaOptions, StdLib, Value, Variadic};
use regex::Regex;
use std::path::Path;

/// Name of the global the script must assign its answer to.
pub const OUTPUT_GLOBAL: &str = "result";

/// Base globals that survive scrubbing. Everything else the VM ships with is
/// removed before the script sees the environment.
const ALLOWED_GLOBALS: &[&str] = &[
    "pairs", "ipairs", "next", "select", "tonumber", "tostring", "type", "pcall", "xpcall",
    "error", "assert", "unpack", "string", "table", "math",
];

/// Source patterns rejected before compilation, with the reason reported.
const FORBIDDEN_PATTERNS: &[(&str, &str)] = &[
    (
        r"\b(require|dofile|loadfile|loadstring|load)\b",
        "module loading",
    ),
    (
        r"\b(os|io|debug|package|coroutine)\s*\.",
        "system library access",
    ),
    (r"\b_G\b", "global environment access"),
    (r"\b__\w+", "metamethod access"),
    (
        r"\b(getmetatable|setmetatable|rawget|rawset|rawequal|rawlen)\b",
        "metatable manipulation",
    ),
];

pub struct Sandbox {
    instruction_budget: u32,
    memory_limit_bytes: usize,
}

impl Sandbox {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            instruction_budget: config.instruction_budget,
            memory_limit_bytes: config.memory_limit_bytes,
        }
    }

    /// Compile and run one candidate script against one workbook.
    ///
    /// Builds a fresh VM per call; nothing survives between executions. The
    /// value left in the `result` global is captured into a VM-independent
    /// form before the VM is dropped.
    pub fn execute(&self, script: &str, file_path: &Path) -> Result<ScriptOutput> {
        static_screen(script)?;

        let canonical = file_path
            .canonicalize()
            .map_err(|_| AnalysisError::NotFound(file_path.display().to_string()))?;
        let lua = self.build_vm(file_path, &canonical)?;

        let function = lua
            .load(script)
            .set_name("analysis")
            .into_function()
            .map_err(|e| AnalysisError::Compilation(lua_error_text(&e)))?;

        if self.instruction_budget > 0 {
            lua.set_hook(
                HookTriggers::new().every_nth_instruction(self.instruction_budget),
                |_, _| {
                    Err(mlua::Error::RuntimeError(
                        "instruction budget exceeded".to_string(),
                    ))
                },
            );
        }

        function
            .call::<()>(())
            .map_err(|e| AnalysisError::Execution(lua_error_text(&e)))?;

        let value = lua
            .globals()
            .get::<Value>(OUTPUT_GLOBAL)
            .map_err(|e| AnalysisError::Execution(lua_error_text(&e)))?;
        Ok(capture_output(&value))
    }

    fn build_vm(&self, raw_path: &Path, canonical: &Path) -> Result<Lua> {
        let lua = Lua::new_with(
            StdLib::TABLE | StdLib::STRING | StdLib::MATH,
            LuaOptions::default(),
        )
        .map_err(vm_err)?;
        lua.set_memory_limit(self.memory_limit_bytes)
            .map_err(vm_err)?;

        scrub_globals(&lua).map_err(vm_err)?;
        register_api(&lua, raw_path, canonical).map_err(vm_err)?;
        Ok(lua)
    }
}

/// Reject scripts containing constructs the environment must never compile.
pub fn static_screen(script: &str) -> Result<()> {
    for (pattern, description) in FORBIDDEN_PATTERNS {
        if let Ok(re) = Regex::new(pattern) {
            if let Some(found) = re.find(script) {
                return Err(AnalysisError::Compilation(format!(
                    "forbidden construct '{}' ({})",
                    found.as_str().trim(),
                    description
                )));
            }
        }
    }
    Ok(())
}

fn scrub_globals(lua: &Lua) -> mlua::Result<()> {
    let globals = lua.globals();
    let mut remove = Vec::new();
    for pair in globals.clone().pairs::<Value, Value>() {
        let (key, _) = pair?;
        if let Value::String(name) = key {
            let name = name.to_string_lossy().to_string();
            if !ALLOWED_GLOBALS.contains(&name.as_str()) {
                remove.push(name);
            }
        }
    }
    for name in remove {
        globals.set(name, Value::Nil)?;
    }
    Ok(())
}

fn register_api(lua: &Lua, raw_path: &Path, canonical: &Path) -> mlua::Result<()> {
    let globals = lua.globals();

    // Output sink: script print calls go nowhere.
    globals.set("print", lua.create_function(|_, _: Variadic<Value>| Ok(()))?)?;

    let pl = lua.create_table()?;
    let allowed = canonical.to_path_buf();
    pl.set(
        "read_file",
        lua.create_function(move |_, path: String| {
            let requested = Path::new(&path).canonicalize().map_err(|_| {
                mlua::Error::external(format!("access denied: cannot read '{}'", path))
            })?;
            if requested != allowed {
                return Err(mlua::Error::external(format!(
                    "access denied: '{}' is outside the analysis scope",
                    path
                )));
            }
            let df = load_dataframe(&requested).map_err(mlua::Error::external)?;
            Ok(Frame(df))
        })?,
    )?;
    globals.set("pl", pl)?;

    globals.set("FILE_PATH", raw_path.display().to_string())?;
    Ok(())
}

/// Convert the script's output binding into a VM-independent value.
fn capture_output(value: &Value) -> ScriptOutput {
    match value {
        Value::Nil => ScriptOutput::Absent,
        Value::String(s) => ScriptOutput::Text(s.to_string_lossy().to_string()),
        Value::UserData(ud) => match ud.borrow::<Frame>() {
            Ok(frame) => ScriptOutput::Frame(frame.0.clone()),
            Err(_) => ScriptOutput::Text("<userdata>".to_string()),
        },
        other => ScriptOutput::Value(lua_to_json(other, 16)),
    }
}

fn lua_to_json(value: &Value, depth: u8) -> serde_json::Value {
    if depth == 0 {
        return serde_json::Value::Null;
    }
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => serde_json::Value::Number((*i).into()),
        Value::Number(f) => marshal::json_number(*f),
        Value::String(s) => serde_json::Value::String(s.to_string_lossy().to_string()),
        Value::Table(t) => {
            let len = t.raw_len();
            if len > 0 {
                let mut items = Vec::with_capacity(len);
                for i in 1..=len {
                    let item: Value = t.raw_get(i).unwrap_or(Value::Nil);
                    items.push(lua_to_json(&item, depth - 1));
                }
                serde_json::Value::Array(items)
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.clone().pairs::<Value, Value>() {
                    if let Ok((key, item)) = pair {
                        let key = match key {
                            Value::String(s) => s.to_string_lossy().to_string(),
                            Value::Integer(i) => i.to_string(),
                            Value::Number(f) => f.to_string(),
                            other => other.type_name().to_string(),
                        };
                        map.insert(key, lua_to_json(&item, depth - 1));
                    }
                }
                serde_json::Value::Object(map)
            }
        }
        Value::UserData(ud) => match ud.borrow::<Frame>() {
            Ok(frame) => serde_json::from_str(&marshal::frame_to_json_string(&frame.0))
                .unwrap_or(serde_json::Value::Null),
            Err(_) => serde_json::Value::Null,
        },
        other => serde_json::Value::String(format!("<{}>", other.type_name())),
    }
}

fn vm_err(error: mlua::Error) -> AnalysisError {
    AnalysisError::Execution(lua_error_text(&error))
}

/// Innermost human-readable message of a Lua error chain.
fn lua_error_text(error: &mlua::Error) -> String {
    match error {
        mlua::Error::CallbackError { cause, .. } => lua_error_text(cause),
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::MemoryError(message) => format!("memory limit exceeded: {}", message),
        mlua::Error::ExternalError(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::Workbook;
    use std::path::PathBuf;

    fn write_fixture(dir: &Path, file_name: &str) -> PathBuf {
        let path = dir.join(file_name);
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "name").unwrap();
        sheet.write_string(0, 1, "amount").unwrap();
        sheet.write_string(1, 0, "a").unwrap();
        sheet.write_number(1, 1, 10).unwrap();
        sheet.write_string(2, 0, "b").unwrap();
        sheet.write_number(2, 1, 20).unwrap();
        workbook.save(&path).unwrap();
        path
    }

    fn sandbox() -> Sandbox {
        Sandbox::new(&AgentConfig::default())
    }

    #[test]
    fn screen_rejects_forbidden_constructs() {
        let scripts = [
            "require('os')",
            "dofile('x.lua')",
            "loadstring('return 1')()",
            "local f = load('return 1')",
            "os.execute('ls')",
            "io.open('/etc/passwd')",
            "debug.getinfo(1)",
            "package.path = ''",
            "result = _G",
            "local m = getmetatable('')",
            "setmetatable({}, {})",
            "rawset(t, 'k', 1)",
            "result = ('x').__index",
        ];
        for script in scripts {
            let err = static_screen(script).unwrap_err();
            assert!(
                matches!(err, AnalysisError::Compilation(_)),
                "expected rejection for {:?}",
                script
            );
        }
    }

    #[test]
    fn screen_accepts_clean_scripts() {
        let script = "local f = pl.read_file(FILE_PATH)\nresult = f:sum(\"amount\")";
        assert!(static_screen(script).is_ok());
    }

    #[test]
    fn syntax_errors_fail_compilation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let err = sandbox().execute("result = (", &path).unwrap_err();
        assert!(matches!(err, AnalysisError::Compilation(_)));
    }

    #[test]
    fn executes_plain_arithmetic() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let output = sandbox().execute("result = 1 + 2", &path).unwrap();
        match output {
            ScriptOutput::Value(v) => assert_eq!(v, serde_json::json!(3)),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn missing_result_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let output = sandbox().execute("local x = 1", &path).unwrap();
        assert!(matches!(output, ScriptOutput::Absent));
    }

    #[test]
    fn system_libraries_do_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let output = sandbox().execute("result = type(os)", &path).unwrap();
        match output {
            ScriptOutput::Text(s) => assert_eq!(s, "nil"),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn print_is_a_silent_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let output = sandbox()
            .execute("print('hello')\nresult = 'done'", &path)
            .unwrap();
        match output {
            ScriptOutput::Text(s) => assert_eq!(s, "done"),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn reading_another_path_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");
        let other = write_fixture(dir.path(), "other.xlsx");

        let script = format!("result = pl.read_file('{}')", other.display());
        let err = sandbox().execute(&script, &path).unwrap_err();
        match err {
            AnalysisError::Execution(msg) => assert!(msg.contains("access denied")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn sums_a_column_through_the_facade() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let script = "local f = pl.read_file(FILE_PATH)\nresult = f:sum('amount')";
        let output = sandbox().execute(script, &path).unwrap();
        match output {
            ScriptOutput::Value(v) => assert_eq!(v, serde_json::json!(30)),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn unknown_column_is_an_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let script = "local f = pl.read_file(FILE_PATH)\nresult = f:sum('missing')";
        let err = sandbox().execute(script, &path).unwrap_err();
        match err {
            AnalysisError::Execution(msg) => assert!(msg.contains("missing")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn filter_and_count_work_in_scripts() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let script = "local f = pl.read_file(FILE_PATH)\nresult = f:filter('amount', '>', 15):count()";
        let output = sandbox().execute(script, &path).unwrap();
        match output {
            ScriptOutput::Value(v) => assert_eq!(v, serde_json::json!(1)),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn group_by_serializes_to_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let script = "local f = pl.read_file(FILE_PATH)\n\
                      result = f:group_by({'name'}, {amount = 'sum'}):to_json()";
        let output = sandbox().execute(script, &path).unwrap();
        match output {
            ScriptOutput::Text(json) => {
                let rows: serde_json::Value = serde_json::from_str(&json).unwrap();
                let rows = rows.as_array().unwrap();
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[0]["name"], serde_json::json!("a"));
                assert_eq!(rows[0]["amount"], serde_json::json!(10));
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn sort_select_and_head_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let script = "local f = pl.read_file(FILE_PATH)\n\
                      result = f:sort('amount', true):select({'name'}):head(1):to_json()";
        let output = sandbox().execute(script, &path).unwrap();
        match output {
            ScriptOutput::Text(json) => assert_eq!(json, "[{\"name\":\"b\"}]"),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn unique_returns_values_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let script = "local f = pl.read_file(FILE_PATH)\nresult = f:unique('name')";
        let output = sandbox().execute(script, &path).unwrap();
        match output {
            ScriptOutput::Value(v) => assert_eq!(v, serde_json::json!(["a", "b"])),
            other => panic!("unexpected output: {:?}", other),
        }
    }

    #[test]
    fn runaway_loops_hit_the_instruction_budget() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let config = AgentConfig {
            instruction_budget: 10_000,
            ..AgentConfig::default()
        };
        let err = Sandbox::new(&config)
            .execute("while true do end", &path)
            .unwrap_err();
        match err {
            AnalysisError::Execution(msg) => assert!(msg.contains("instruction budget")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn allocation_bombs_hit_the_memory_limit() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let config = AgentConfig {
            memory_limit_bytes: 1024 * 1024,
            ..AgentConfig::default()
        };
        let script = "local s = 'x'\nfor i = 1, 30 do s = s .. s end\nresult = #s";
        let err = Sandbox::new(&config).execute(script, &path).unwrap_err();
        match err {
            AnalysisError::Execution(msg) => {
                assert!(msg.contains("memory"), "got message: {}", msg)
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn nonexistent_file_is_not_found() {
        let err = sandbox()
            .execute("result = 1", Path::new("/no/such/book.xlsx"))
            .unwrap_err();
        assert!(matches!(err, AnalysisError::NotFound(_)));
    }

    #[test]
    fn table_results_become_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(dir.path(), "book.xlsx");

        let script = "result = {total = 30, rows = {1, 2}}";
        let output = sandbox().execute(script, &path).unwrap();
        match output {
            ScriptOutput::Value(v) => {
                assert_eq!(v["total"], serde_json::json!(30));
                assert_eq!(v["rows"], serde_json::json!([1, 2]));
            }
            other => panic!("unexpected output: {:?}", other),
        }
    }
}
