//! SQL template rendering and step execution.
//!
//! Tool implementations are ordered SQL templates with `{{param}}`
//! placeholders. Rendering is the most security-sensitive code in the
//! server, so the whole pipeline (key validation, value coercion,
//! context detection, escaping, substitution) is pure functions over
//! `(template, args)` with no storage in sight.
//!
//! Escaping rules per occurrence:
//! - a placeholder preceded (within 200 chars) by a JavaScript marker is
//!   escaped for a JSON string literal first, then for SQL;
//! - everywhere else only SQL single-quote escaping applies.

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::mcp::registry::ToolStep;
use crate::storage::{AttachDenied, Storage};

/// Hard cap on a substituted value, to bound template-inflation DoS.
const MAX_VALUE_LEN: usize = 65_536;

/// Lookback window for JavaScript-context detection.
const JS_LOOKBACK: usize = 200;

/// Markers that indicate a placeholder sits inside JavaScript carried in
/// SQL (e.g. a CDP `expression` payload built with `json_object`).
const JS_MARKERS: [&str; 10] = [
    "expression",
    "document.",
    "window.",
    "json.stringify",
    ".queryselector",
    ".click()",
    ".focus()",
    ".value",
    "innertext",
    "innerhtml",
];

// ---------------------------------------------------------------------------
// Pure rendering pipeline
// ---------------------------------------------------------------------------

/// Parameter keys must match `[A-Za-z_][A-Za-z0-9_]{0,63}`.
pub fn valid_param_key(key: &str) -> bool {
    if key.is_empty() || key.len() > 64 {
        return false;
    }
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Coerce an argument value to its textual SQL form: strings pass
/// through, booleans become `1`/`0`, null the empty string, everything
/// else its JSON serialization. The result is capped at 64 KiB.
pub fn coerce_value(value: &Value) -> String {
    let s = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    };
    truncate_bytes(s, MAX_VALUE_LEN)
}

fn truncate_bytes(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

/// SQL single-quote escaping. NUL bytes are dropped outright and control
/// characters other than tab/newline/CR are stripped; SQLite does not
/// treat backslash as an escape, so backslashes pass through untouched.
pub fn escape_sql_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '\0' => {}
            '\'' => out.push_str("''"),
            '\n' | '\t' | '\r' => out.push(c),
            c if (c as u32) < 32 => {}
            c => out.push(c),
        }
    }
    out
}

/// Escape a value for inclusion inside a JSON/JavaScript string literal.
pub fn escape_json_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => {}
            c if (c as u32) < 32 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Whether the placeholder at byte offset `at` sits in a JavaScript
/// context, judged by a lowercase lookback of up to 200 characters.
fn js_context_at(template: &str, at: usize) -> bool {
    let mut start = at.saturating_sub(JS_LOOKBACK);
    while start > 0 && !template.is_char_boundary(start) {
        start -= 1;
    }
    let context = template[start..at].to_lowercase();
    JS_MARKERS.iter().any(|m| context.contains(m))
}

/// Substitute every `{{key}}` occurrence, applying per-occurrence
/// context-aware escaping, then erase any placeholder that survives.
pub fn render(template: &str, args: &Map<String, Value>) -> String {
    let mut result = template.to_string();

    for (key, value) in args {
        // Unknown or malformed keys are silently dropped.
        if !valid_param_key(key) {
            debug!(key = %key, "dropping invalid parameter key");
            continue;
        }
        let placeholder = format!("{{{{{key}}}}}");
        let coerced = coerce_value(value);

        let mut rebuilt = String::with_capacity(result.len());
        let mut rest = result.as_str();
        let mut offset = 0usize;
        while let Some(pos) = rest.find(&placeholder) {
            let abs = offset + pos;
            rebuilt.push_str(&rest[..pos]);
            let escaped = if js_context_at(&result, abs) {
                escape_sql_literal(&escape_json_string(&coerced))
            } else {
                escape_sql_literal(&coerced)
            };
            rebuilt.push_str(&escaped);
            rest = &rest[pos + placeholder.len()..];
            offset = abs + placeholder.len();
        }
        rebuilt.push_str(rest);
        result = rebuilt;
    }

    erase_placeholders(&result)
}

/// Remove any `{{...}}` span that was not substituted.
fn erase_placeholders(input: &str) -> String {
    let mut result = input.to_string();
    loop {
        let Some(start) = result.find("{{") else { break };
        let Some(end) = result[start..].find("}}") else { break };
        result.replace_range(start..start + end + 2, "");
    }
    result
}

// ---------------------------------------------------------------------------
// Step execution
// ---------------------------------------------------------------------------

/// Classified failure of a tool execution.
#[derive(Debug)]
pub enum ToolError {
    /// A `validate` step's statement failed.
    Validation { step: String, message: String },
    /// A `sql` step failed to execute.
    Sql { step: String, message: String },
    /// An ATTACH statement targeted a path with no whitelist row.
    ForbiddenPath(AttachDenied),
    /// The tool exceeded its `timeout_seconds`.
    Timeout { seconds: i64 },
    /// A step row carried an unrecognized type.
    UnknownStepType { step: String, step_type: String },
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolError::Validation { step, message } => {
                write!(f, "validation failed at step {step}: {message}")
            }
            ToolError::Sql { step, message } => {
                write!(f, "SQL execution failed at step {step}: {message}")
            }
            ToolError::ForbiddenPath(denied) => write!(f, "{denied}"),
            ToolError::Timeout { seconds } => write!(f, "tool timed out after {seconds}s"),
            ToolError::UnknownStepType { step, step_type } => {
                write!(f, "unknown step type {step_type} at step {step}")
            }
        }
    }
}

impl std::error::Error for ToolError {}

impl ToolError {
    /// Whether this failure should be offered to the retry queue.
    pub fn retryable(&self) -> bool {
        !matches!(self, ToolError::ForbiddenPath(_))
    }
}

/// Run a tool's steps in order against the tool shard. Each step's
/// return value replaces the running result; the last one wins.
pub fn execute_steps(
    storage: &Storage,
    steps: &[ToolStep],
    args: &Map<String, Value>,
) -> Result<Value, ToolError> {
    let mut last = json!({"message": "Tool executed (no steps defined)"});

    for step in steps {
        let sql = render(&step.sql_template, args);

        last = match step.step_type.as_str() {
            "validate" => {
                storage
                    .tools
                    .with(|conn| conn.execute_batch(&sql))
                    .map_err(|e| ToolError::Validation {
                        step: step.name.clone(),
                        message: e.to_string(),
                    })?;
                json!({"validated": true})
            }
            "sql" => execute_sql(storage, &step.name, &sql)?,
            // Reserved step types: success markers only, never SQL.
            "attach" => json!({"attached": true}),
            "transform" => json!({"transformed": true}),
            other => {
                return Err(ToolError::UnknownStepType {
                    step: step.name.clone(),
                    step_type: other.to_string(),
                })
            }
        };
    }

    Ok(last)
}

/// Execute one rendered statement. SELECTs collect rows (with the
/// single-cell JSON auto-unwrap); ATTACH statements are gated by the
/// whitelist; everything else reports `{rows_affected, last_insert_id}`.
fn execute_sql(storage: &Storage, step_name: &str, sql: &str) -> Result<Value, ToolError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();

    if upper.starts_with("ATTACH") {
        let path = quoted_path(trimmed).unwrap_or_default();
        storage
            .validate_attach_path(&path)
            .map_err(ToolError::ForbiddenPath)?;
        storage
            .tools
            .with(|conn| conn.execute_batch(trimmed))
            .map_err(|e| ToolError::Sql {
                step: step_name.to_string(),
                message: e.to_string(),
            })?;
        return Ok(json!({"attached": true, "path": path}));
    }

    if upper.starts_with("SELECT") {
        return storage
            .tools
            .with(|conn| {
                let mut stmt = conn.prepare(trimmed)?;
                let columns: Vec<String> =
                    stmt.column_names().iter().map(|c| c.to_string()).collect();
                let mut rows = stmt.query([])?;
                let mut results: Vec<Value> = Vec::new();
                while let Some(row) = rows.next()? {
                    let mut obj = Map::new();
                    for (i, col) in columns.iter().enumerate() {
                        obj.insert(col.clone(), column_value(row, i)?);
                    }
                    results.push(Value::Object(obj));
                }
                Ok(unwrap_single_cell(results, &columns))
            })
            .map_err(|e| ToolError::Sql {
                step: step_name.to_string(),
                message: e.to_string(),
            });
    }

    storage
        .tools
        .with(|conn| {
            let affected = conn.execute(trimmed, [])?;
            Ok(json!({
                "rows_affected": affected as i64,
                "last_insert_id": conn.last_insert_rowid(),
            }))
        })
        .map_err(|e| ToolError::Sql {
            step: step_name.to_string(),
            message: e.to_string(),
        })
}

/// First single-quoted string in an ATTACH statement, i.e. its file path.
fn quoted_path(sql: &str) -> Option<String> {
    let start = sql.find('\'')? + 1;
    let end = sql[start..].find('\'')? + start;
    Some(sql[start..end].to_string())
}

fn column_value(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    use rusqlite::types::ValueRef;
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
    })
}

/// Single row, single column: a JSON-looking string cell is parsed and
/// returned as the value itself; otherwise the bare scalar is returned.
fn unwrap_single_cell(results: Vec<Value>, columns: &[String]) -> Value {
    if results.len() == 1 && columns.len() == 1 {
        let cell = results[0][&columns[0]].clone();
        if let Value::String(ref s) = cell {
            if s.starts_with('{') || s.starts_with('[') {
                if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                    return parsed;
                }
            }
        }
        return cell;
    }
    Value::Array(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_valid_param_key() {
        assert!(valid_param_key("name"));
        assert!(valid_param_key("_x"));
        assert!(valid_param_key("a1_b2"));
        assert!(valid_param_key(&"a".repeat(64)));
        assert!(!valid_param_key(""));
        assert!(!valid_param_key("1abc"));
        assert!(!valid_param_key("has-dash"));
        assert!(!valid_param_key("has space"));
        assert!(!valid_param_key(&"a".repeat(65)));
    }

    #[test]
    fn test_coerce_value_forms() {
        assert_eq!(coerce_value(&json!("s")), "s");
        assert_eq!(coerce_value(&json!(42)), "42");
        assert_eq!(coerce_value(&json!(true)), "1");
        assert_eq!(coerce_value(&json!(false)), "0");
        assert_eq!(coerce_value(&Value::Null), "");
        assert_eq!(coerce_value(&json!({"a": 1})), r#"{"a":1}"#);
        assert_eq!(coerce_value(&json!([1, 2])), "[1,2]");
    }

    #[test]
    fn test_coerce_value_caps_at_64k() {
        let big = "x".repeat(70_000);
        assert_eq!(coerce_value(&json!(big)).len(), 65_536);
    }

    #[test]
    fn test_sql_escaping_doubles_quotes_and_strips_controls() {
        assert_eq!(escape_sql_literal("O'Brien"), "O''Brien");
        assert_eq!(escape_sql_literal("a\x00b"), "ab");
        assert_eq!(escape_sql_literal("a\x07b"), "ab");
        assert_eq!(escape_sql_literal("line1\nline2\ttab"), "line1\nline2\ttab");
        // Backslash is not an escape character in SQLite.
        assert_eq!(escape_sql_literal(r"c:\path"), r"c:\path");
    }

    #[test]
    fn test_json_escaping() {
        assert_eq!(escape_json_string(r#"say "hi""#), r#"say \"hi\""#);
        assert_eq!(escape_json_string(r"a\b"), r"a\\b");
        assert_eq!(escape_json_string("a\nb"), r"a\nb");
        assert_eq!(escape_json_string("a\x01b"), r"a\u0001b");
    }

    #[test]
    fn test_render_substitutes_and_escapes() {
        let out = render(
            "SELECT * FROM t WHERE name = '{{name}}'",
            &args(&[("name", json!("O'Brien"))]),
        );
        assert_eq!(out, "SELECT * FROM t WHERE name = 'O''Brien'");
    }

    #[test]
    fn test_render_drops_invalid_keys_and_erases_leftovers() {
        let out = render(
            "SELECT '{{good}}', '{{bad-key}}', '{{missing}}'",
            &args(&[("good", json!("v")), ("bad-key", json!("x"))]),
        );
        assert_eq!(out, "SELECT 'v', '', ''");
    }

    #[test]
    fn test_render_js_context_double_escapes() {
        // Inside an `expression` payload the quote must be JSON-escaped
        // before SQL doubling.
        let template = r#"INSERT INTO cdp_commands (expression) VALUES ('document.querySelector("{{sel}}")')"#;
        let out = render(template, &args(&[("sel", json!(r#"a"quote"#))]));
        assert!(out.contains(r#"a\"quote"#), "got: {out}");

        // The same value in a plain SQL context keeps the raw quote.
        let plain = render("SELECT '{{v}}'", &args(&[("v", json!(r#"a"quote"#))]));
        assert_eq!(plain, r#"SELECT 'a"quote'"#);
    }

    #[test]
    fn test_render_js_context_single_quote_both_layers() {
        let template = "SELECT json_object('expression', 'el.value = \"{{v}}\"')";
        let out = render(template, &args(&[("v", json!("it's"))]));
        // SQL doubling still applies after JSON escaping.
        assert!(out.contains("it''s"), "got: {out}");
    }

    #[test]
    fn test_render_lookback_window_bounds() {
        // Marker farther than 200 chars back must not trigger JS escaping.
        let filler = "x".repeat(210);
        let template = format!("/* document. */ {filler} SELECT '{{{{v}}}}'");
        let out = render(&template, &args(&[("v", json!("a\"b"))]));
        assert!(out.ends_with("SELECT 'a\"b'"), "got: {out}");
    }

    #[test]
    fn test_render_numeric_and_bool() {
        let out = render(
            "UPDATE t SET n = {{n}}, flag = {{flag}}",
            &args(&[("n", json!(7)), ("flag", json!(true))]),
        );
        assert_eq!(out, "UPDATE t SET n = 7, flag = 1");
    }

    #[test]
    fn test_erase_unclosed_placeholder_kept() {
        // An opening brace pair with no closing pair stops the sweep.
        assert_eq!(erase_placeholders("a {{oops"), "a {{oops");
        assert_eq!(erase_placeholders("a {{x}} b {{y}} c"), "a  b  c");
    }

    #[test]
    fn test_quoted_path_extraction() {
        assert_eq!(
            quoted_path("ATTACH DATABASE '/tmp/x.db' AS x").as_deref(),
            Some("/tmp/x.db")
        );
        assert_eq!(quoted_path("ATTACH DATABASE ? AS x"), None);
    }

    // -- step execution against a real shard ------------------------------

    use crate::mcp::registry::ToolStep;
    use crate::storage::Storage;

    fn storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let s = Storage::open(dir.path()).unwrap();
        s.init_schemas(None).unwrap();
        (dir, s)
    }

    fn step(order: i64, step_type: &str, sql: &str) -> ToolStep {
        ToolStep {
            order,
            name: format!("step{order}"),
            step_type: step_type.to_string(),
            sql_template: sql.to_string(),
            error_handler: None,
            condition: None,
        }
    }

    #[test]
    fn test_execute_select_rows() {
        let (_dir, storage) = storage();
        let steps = [step(1, "sql", "SELECT 1 AS v")];
        let out = execute_steps(&storage, &steps, &Map::new()).unwrap();
        assert_eq!(out, json!(1));
    }

    #[test]
    fn test_execute_select_multi_column() {
        let (_dir, storage) = storage();
        let steps = [step(1, "sql", "SELECT 1 AS a, 'x' AS b")];
        let out = execute_steps(&storage, &steps, &Map::new()).unwrap();
        assert_eq!(out, json!([{"a": 1, "b": "x"}]));
    }

    #[test]
    fn test_execute_single_cell_json_unwrap() {
        let (_dir, storage) = storage();
        let steps = [step(1, "sql", r#"SELECT '{"k": [1,2]}' AS v"#)];
        let out = execute_steps(&storage, &steps, &Map::new()).unwrap();
        assert_eq!(out, json!({"k": [1, 2]}));
    }

    #[test]
    fn test_execute_insert_reports_counts() {
        let (_dir, storage) = storage();
        let steps = [step(
            1,
            "sql",
            "INSERT INTO workflow_state (workflow_id, tool_name) VALUES ('w1', 't')",
        )];
        let out = execute_steps(&storage, &steps, &Map::new()).unwrap();
        assert_eq!(out["rows_affected"], 1);
    }

    #[test]
    fn test_last_step_wins() {
        let (_dir, storage) = storage();
        let steps = [
            step(1, "sql", "SELECT 1 AS v"),
            step(2, "sql", "SELECT 2 AS v"),
        ];
        let out = execute_steps(&storage, &steps, &Map::new()).unwrap();
        assert_eq!(out, json!(2));
    }

    #[test]
    fn test_validate_step_failure_names_step() {
        let (_dir, storage) = storage();
        let steps = [step(1, "validate", "INSERT INTO no_such_table VALUES (1)")];
        let err = execute_steps(&storage, &steps, &Map::new()).unwrap_err();
        match err {
            ToolError::Validation { step, .. } => assert_eq!(step, "step1"),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_attach_and_transform_steps_are_markers() {
        let (_dir, storage) = storage();
        let steps = [step(1, "attach", "ignored"), step(2, "transform", "ignored")];
        let out = execute_steps(&storage, &steps, &Map::new()).unwrap();
        assert_eq!(out, json!({"transformed": true}));
    }

    #[test]
    fn test_attach_statement_denied_then_allowed() {
        let (dir, storage) = storage();
        let foreign = dir.path().join("foreign.db");
        rusqlite::Connection::open(&foreign).unwrap();
        let sql = format!("ATTACH DATABASE '{}' AS x", foreign.display());
        let steps = [step(1, "sql", &sql)];

        let err = execute_steps(&storage, &steps, &Map::new()).unwrap_err();
        assert!(matches!(err, ToolError::ForbiddenPath(_)));
        assert!(!err.retryable());

        storage
            .add_allowed_attach_path("test", foreign.to_str().unwrap(), "sqlite", "")
            .unwrap();
        let out = execute_steps(&storage, &steps, &Map::new()).unwrap();
        assert_eq!(out["attached"], true);
    }

    #[test]
    fn test_no_steps_returns_marker() {
        let (_dir, storage) = storage();
        let out = execute_steps(&storage, &[], &Map::new()).unwrap();
        assert!(out["message"].as_str().unwrap().contains("no steps"));
    }
}
