//! Analysis/meta master tool (`brainloop`).
//!
//! One MCP entry with an `action` discriminator, covering:
//! - system: create_tool, list_tools, get_tool, audit_system, get_metrics
//! - reading: read_sqlite, read_code, read_markdown, read_config
//! - codebase: list_files, search_code
//! - discovery: list_actions, get_schema, get_stats
//!
//! Reading actions are bounded (file-size caps, row caps, match caps)
//! and `read_sqlite` on a foreign path consults the ATTACH whitelist.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rusqlite::Connection;
use serde_json::{json, Map, Value};

use crate::execution::circuit::BreakerSet;
use crate::execution::retry::RetrySweeper;
use crate::mcp::registry::ToolRegistry;
use crate::observability::MetricsHub;
use crate::storage::Storage;

/// Files larger than this are refused by the reading actions.
const MAX_READ_BYTES: u64 = 1024 * 1024;

/// Caps for the codebase walkers.
const MAX_LISTED_FILES: usize = 500;
const MAX_SEARCH_MATCHES: usize = 200;

/// The `brainloop` master tool.
pub struct ToolboxTools {
    storage: Storage,
    registry: Arc<ToolRegistry>,
    breakers: Arc<BreakerSet>,
    retry: Arc<RetrySweeper>,
    metrics: Arc<MetricsHub>,
    call_counts: Mutex<HashMap<String, u64>>,
}

impl ToolboxTools {
    pub fn new(
        storage: Storage,
        registry: Arc<ToolRegistry>,
        breakers: Arc<BreakerSet>,
        retry: Arc<RetrySweeper>,
        metrics: Arc<MetricsHub>,
    ) -> Self {
        Self {
            storage,
            registry,
            breakers,
            retry,
            metrics,
            call_counts: Mutex::new(HashMap::new()),
        }
    }

    /// MCP descriptor for the master tool.
    pub fn descriptor(&self) -> Value {
        json!({
            "name": "brainloop",
            "description": "Smart analysis and system tool. Actions: create_tool, list_tools, \
                get_tool, audit_system, get_metrics (system); read_sqlite, read_code, \
                read_markdown, read_config (reading); list_files, search_code (codebase); \
                list_actions, get_schema, get_stats (discovery)",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "description": "Action to perform",
                        "enum": [
                            "create_tool", "list_tools", "get_tool", "audit_system", "get_metrics",
                            "read_sqlite", "read_code", "read_markdown", "read_config",
                            "list_files", "search_code",
                            "list_actions", "get_schema", "get_stats"
                        ]
                    },
                    "name": {"type": "string", "description": "Tool name (create_tool/get_tool)"},
                    "tool_description": {"type": "string", "description": "Description (create_tool)"},
                    "sql": {"type": "string", "description": "SQL template (create_tool)"},
                    "category": {"type": "string", "description": "Tool category filter"},
                    "parameters": {"type": "object", "description": "JSON input schema (create_tool)"},
                    "path": {"type": "string", "description": "File or database path"},
                    "db": {"type": "string", "description": "Shard name (read_sqlite)"},
                    "max_rows": {"type": "integer", "description": "Sample rows per table (read_sqlite)"},
                    "pattern": {"type": "string", "description": "File or search pattern"},
                    "file_pattern": {"type": "string", "description": "File name filter (search_code)"},
                    "action_name": {"type": "string", "description": "Action name (get_schema)"}
                },
                "required": ["action"]
            }
        })
    }

    /// Dispatch one action.
    pub async fn execute(&self, action: &str, args: &Value) -> Result<Value, String> {
        *self
            .call_counts
            .lock()
            .unwrap()
            .entry(action.to_string())
            .or_insert(0) += 1;

        match action {
            "create_tool" => self.create_tool(args),
            "list_tools" => self.list_tools(args),
            "get_tool" => self.get_tool(args),
            "audit_system" => self.audit_system(),
            "get_metrics" => self.get_metrics(),
            "read_sqlite" => self.read_sqlite(args),
            "read_code" => self.read_code(args),
            "read_markdown" => self.read_markdown(args),
            "read_config" => self.read_config(args),
            "list_files" => self.list_files(args),
            "search_code" => self.search_code(args),
            "list_actions" => Ok(list_actions()),
            "get_schema" => get_schema(args),
            "get_stats" => self.get_stats(),
            other => Err(format!("unknown action: {other}")),
        }
    }

    // -- system actions ----------------------------------------------------

    fn create_tool(&self, args: &Value) -> Result<Value, String> {
        let name = require_str(args, "name")?;
        let description = require_str(args, "tool_description")?;
        let sql = require_str(args, "sql")?;
        let category = args
            .get("category")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("custom");
        let input_schema = args.get("parameters").cloned().unwrap_or_else(|| json!({}));

        self.registry
            .create_tool(&name, &description, &input_schema, category, &sql, "brainloop")
            .map_err(|e| format!("failed to create tool: {e}"))?;
        // Make the new tool visible without waiting out a poll interval.
        self.registry
            .force_reload()
            .map_err(|e| format!("tool created but reload failed: {e}"))?;

        Ok(json!({
            "success": true,
            "action": "create_tool",
            "name": name,
            "message": format!("Tool '{name}' created successfully"),
        }))
    }

    fn list_tools(&self, args: &Value) -> Result<Value, String> {
        let filter = args.get("category").and_then(|v| v.as_str());
        let snapshot = self.registry.snapshot();
        let mut tools: Vec<&Arc<crate::mcp::registry::Tool>> = snapshot
            .values()
            .filter(|t| filter.map_or(true, |c| t.category == c))
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));

        let listed: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "category": t.category,
                    "steps": t.steps.len(),
                })
            })
            .collect();

        Ok(json!({
            "success": true,
            "action": "list_tools",
            "count": listed.len(),
            "tools": listed,
        }))
    }

    fn get_tool(&self, args: &Value) -> Result<Value, String> {
        let name = require_str(args, "name")?;
        let tool = self
            .registry
            .get(&name)
            .ok_or_else(|| format!("tool not found: {name}"))?;

        let steps: Vec<Value> = tool
            .steps
            .iter()
            .map(|s| {
                json!({
                    "order": s.order,
                    "name": s.name,
                    "type": s.step_type,
                    "sql_template": s.sql_template,
                })
            })
            .collect();

        Ok(json!({
            "success": true,
            "action": "get_tool",
            "name": tool.name,
            "description": tool.description,
            "category": tool.category,
            "version": tool.version,
            "timeout_seconds": tool.timeout_seconds,
            "retry_policy": tool.retry_policy.as_str(),
            "input_schema": tool.input_schema,
            "steps": steps,
        }))
    }

    fn audit_system(&self) -> Result<Value, String> {
        let (total, enabled): (i64, i64) = self
            .storage
            .tools
            .with(|c| {
                let total =
                    c.query_row("SELECT COUNT(*) FROM tool_definitions", [], |r| r.get(0))?;
                let enabled = c.query_row(
                    "SELECT COUNT(*) FROM tool_definitions WHERE enabled = 1",
                    [],
                    |r| r.get(0),
                )?;
                Ok((total, enabled))
            })
            .map_err(|e| e.to_string())?;

        let by_category: Map<String, Value> = self
            .storage
            .tools
            .with(|c| {
                let mut stmt = c.prepare(
                    "SELECT category, COUNT(*) FROM tool_definitions GROUP BY category",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                let mut map = Map::new();
                for row in rows {
                    let (cat, count) = row?;
                    map.insert(cat, json!(count));
                }
                Ok(map)
            })
            .map_err(|e| e.to_string())?;

        let mut shards = Map::new();
        for shard in self.storage.all() {
            let ok = shard
                .with(|c| c.query_row("PRAGMA quick_check(1)", [], |r| r.get::<_, String>(0)))
                .map(|s| s == "ok")
                .unwrap_or(false);
            shards.insert(shard.name().to_string(), json!(ok));
        }

        let heartbeat_status: String = self
            .storage
            .output
            .with(|c| {
                c.query_row("SELECT status FROM heartbeat WHERE id = 1", [], |r| r.get(0))
            })
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(json!({
            "success": true,
            "action": "audit_system",
            "total_tools": total,
            "enabled": enabled,
            "disabled": total - enabled,
            "by_category": by_category,
            "loaded_tools": self.registry.count(),
            "shards_healthy": shards,
            "circuit_breakers": self.breakers.all_stats(),
            "pending_retries": self.retry.pending_count().unwrap_or(-1),
            "heartbeat_status": heartbeat_status,
        }))
    }

    fn get_metrics(&self) -> Result<Value, String> {
        let latest: Option<Value> = self
            .storage
            .metadata
            .with(|c| {
                use rusqlite::OptionalExtension;
                c.query_row(
                    "SELECT memory_used_mb, tasks, p50_latency_ms, p95_latency_ms, p99_latency_ms, sampled_at
                     FROM system_metrics ORDER BY id DESC LIMIT 1",
                    [],
                    |r| {
                        Ok(json!({
                            "memory_used_mb": r.get::<_, f64>(0)?,
                            "tasks": r.get::<_, i64>(1)?,
                            "p50_latency_ms": r.get::<_, f64>(2)?,
                            "p95_latency_ms": r.get::<_, f64>(3)?,
                            "p99_latency_ms": r.get::<_, f64>(4)?,
                            "sampled_at": r.get::<_, i64>(5)?,
                        }))
                    },
                )
                .optional()
            })
            .map_err(|e| e.to_string())?;

        Ok(json!({
            "success": true,
            "action": "get_metrics",
            "active_tools": self.registry.count(),
            "requests_processed": self.metrics.processed_count(),
            "requests_failed": self.metrics.failed_count(),
            "latest_sample": latest,
        }))
    }

    // -- reading actions ---------------------------------------------------

    fn read_sqlite(&self, args: &Value) -> Result<Value, String> {
        let max_rows = args.get("max_rows").and_then(|v| v.as_i64()).unwrap_or(3);

        // A shard name reads the live handle; a filesystem path must be
        // whitelisted like any other cross-shard attach target.
        if let Some(db) = args.get("db").and_then(|v| v.as_str()) {
            let shard = self
                .storage
                .by_name(db)
                .ok_or_else(|| format!("unknown shard: {db}"))?;
            return shard
                .with(|conn| Ok(introspect_database(conn, db, max_rows)))
                .map_err(|e: rusqlite::Error| e.to_string());
        }

        let path = require_str(args, "path")?;
        self.storage
            .validate_attach_path(&path)
            .map_err(|e| e.to_string())?;
        let conn = Connection::open_with_flags(
            &path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )
        .map_err(|e| format!("failed to open database: {e}"))?;
        Ok(introspect_database(&conn, &path, max_rows))
    }

    fn read_code(&self, args: &Value) -> Result<Value, String> {
        let path = require_str(args, "path")?;
        let content = read_bounded(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        let ext = Path::new(&path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("");
        let language = detect_language(ext);

        Ok(json!({
            "success": true,
            "action": "read_code",
            "file_path": path,
            "language": language,
            "line_count": lines.len(),
            "byte_size": content.len(),
            "functions": extract_functions(&content, language),
        }))
    }

    fn read_markdown(&self, args: &Value) -> Result<Value, String> {
        let path = require_str(args, "path")?;
        let content = read_bounded(&path)?;

        let headings: Vec<Value> = content
            .lines()
            .enumerate()
            .filter(|(_, line)| line.starts_with('#'))
            .map(|(i, line)| {
                let level = line.chars().take_while(|c| *c == '#').count();
                json!({
                    "line": i + 1,
                    "level": level,
                    "text": line.trim_start_matches('#').trim(),
                })
            })
            .collect();

        Ok(json!({
            "success": true,
            "action": "read_markdown",
            "file_path": path,
            "line_count": content.lines().count(),
            "headings": headings,
        }))
    }

    fn read_config(&self, args: &Value) -> Result<Value, String> {
        let path = require_str(args, "path")?;
        let content = read_bounded(&path)?;

        match serde_json::from_str::<Value>(&content) {
            Ok(parsed) => {
                let keys: Vec<String> = parsed
                    .as_object()
                    .map(|o| o.keys().cloned().collect())
                    .unwrap_or_default();
                Ok(json!({
                    "success": true,
                    "action": "read_config",
                    "file_path": path,
                    "format": "json",
                    "keys": keys,
                    "content": parsed,
                }))
            }
            Err(_) => Ok(json!({
                "success": true,
                "action": "read_config",
                "file_path": path,
                "format": "raw",
                "content": content,
            })),
        }
    }

    // -- codebase actions --------------------------------------------------

    fn list_files(&self, args: &Value) -> Result<Value, String> {
        let pattern = require_str(args, "pattern")?;
        let base = args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".")
            .to_string();

        let mut files = Vec::new();
        walk_files(Path::new(&base), &mut |path, size| {
            if files.len() >= MAX_LISTED_FILES {
                return false;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if matches_pattern(&pattern, name) {
                files.push(json!({
                    "path": path.display().to_string(),
                    "size": size,
                }));
            }
            true
        });

        Ok(json!({
            "success": true,
            "action": "list_files",
            "pattern": pattern,
            "base_path": base,
            "file_count": files.len(),
            "truncated": files.len() >= MAX_LISTED_FILES,
            "files": files,
        }))
    }

    fn search_code(&self, args: &Value) -> Result<Value, String> {
        let pattern = require_str(args, "pattern")?;
        let regex = regex::Regex::new(&pattern).map_err(|e| format!("invalid regex pattern: {e}"))?;
        let file_pattern = args
            .get("file_pattern")
            .and_then(|v| v.as_str())
            .unwrap_or("*")
            .to_string();
        let base = args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".")
            .to_string();

        let mut matches = Vec::new();
        walk_files(Path::new(&base), &mut |path, size| {
            if matches.len() >= MAX_SEARCH_MATCHES {
                return false;
            }
            if size > MAX_READ_BYTES {
                return true;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !matches_pattern(&file_pattern, name) {
                return true;
            }
            let Ok(bytes) = std::fs::read(path) else {
                return true;
            };
            // NUL in the first 512 bytes marks a binary file.
            if bytes.iter().take(512).any(|b| *b == 0) {
                return true;
            }
            let content = String::from_utf8_lossy(&bytes);
            for (i, line) in content.lines().enumerate() {
                if matches.len() >= MAX_SEARCH_MATCHES {
                    break;
                }
                if regex.is_match(line) {
                    matches.push(json!({
                        "file": path.display().to_string(),
                        "line": i + 1,
                        "text": line.trim(),
                    }));
                }
            }
            true
        });

        Ok(json!({
            "success": true,
            "action": "search_code",
            "pattern": pattern,
            "match_count": matches.len(),
            "truncated": matches.len() >= MAX_SEARCH_MATCHES,
            "matches": matches,
        }))
    }

    // -- discovery ---------------------------------------------------------

    fn get_stats(&self) -> Result<Value, String> {
        let (total, success, failed): (i64, i64, i64) = self
            .storage
            .execution
            .with(|c| {
                let total = c.query_row("SELECT COUNT(*) FROM processed_log", [], |r| r.get(0))?;
                let success = c.query_row(
                    "SELECT COUNT(*) FROM processed_log WHERE status = 'success'",
                    [],
                    |r| r.get(0),
                )?;
                let failed = c.query_row(
                    "SELECT COUNT(*) FROM processed_log WHERE status = 'failed'",
                    [],
                    |r| r.get(0),
                )?;
                Ok((total, success, failed))
            })
            .map_err(|e| e.to_string())?;

        let by_action: Map<String, Value> = self
            .call_counts
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();

        Ok(json!({
            "success": true,
            "action": "get_stats",
            "total_calls": total,
            "success_count": success,
            "failed_count": failed,
            "by_action": by_action,
        }))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn require_str(args: &Value, key: &str) -> Result<String, String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| format!("{key} is required"))
}

fn read_bounded(path: &str) -> Result<String, String> {
    let meta = std::fs::metadata(path).map_err(|e| format!("failed to read file: {e}"))?;
    if meta.len() > MAX_READ_BYTES {
        return Err(format!("file too large ({} bytes, cap {MAX_READ_BYTES})", meta.len()));
    }
    std::fs::read_to_string(path).map_err(|e| format!("failed to read file: {e}"))
}

fn detect_language(ext: &str) -> &'static str {
    match ext {
        "rs" => "rust",
        "go" => "go",
        "py" => "python",
        "sql" => "sql",
        "js" | "mjs" => "javascript",
        "ts" => "typescript",
        "md" => "markdown",
        "json" => "json",
        _ => "text",
    }
}

/// Rough function/definition outline by line prefix.
fn extract_functions(content: &str, language: &str) -> Vec<Value> {
    let markers: &[&str] = match language {
        "rust" => &["fn ", "pub fn ", "pub(crate) fn ", "async fn ", "pub async fn "],
        "go" => &["func "],
        "python" => &["def ", "async def ", "class "],
        "sql" => &["CREATE TABLE", "CREATE INDEX", "CREATE TRIGGER", "CREATE VIEW"],
        "javascript" | "typescript" => &["function ", "export function ", "const "],
        _ => &[],
    };

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let trimmed = line.trim_start();
            markers.iter().any(|m| trimmed.starts_with(m))
        })
        .take(200)
        .map(|(i, line)| json!({"line": i + 1, "text": line.trim()}))
        .collect()
}

/// Walk a tree depth-first, skipping hidden and dependency directories.
/// The visitor returns `false` to stop the walk.
fn walk_files(base: &Path, visit: &mut dyn FnMut(&Path, u64) -> bool) -> bool {
    const SKIP_DIRS: [&str; 7] = [
        "node_modules",
        "vendor",
        "target",
        "dist",
        "build",
        "__pycache__",
        "bin",
    ];

    let Ok(entries) = std::fs::read_dir(base) else {
        return true;
    };
    let mut entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Ok(meta) = entry.metadata() else { continue };

        if meta.is_dir() {
            if name.starts_with('.') || SKIP_DIRS.contains(&name.as_ref()) {
                continue;
            }
            if !walk_files(&path, visit) {
                return false;
            }
        } else if !visit(&path, meta.len()) {
            return false;
        }
    }
    true
}

/// Glob-lite file-name matching: `*` and `?` only.
fn matches_pattern(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

/// Table-by-table introspection: columns, row counts, samples, indexes.
fn introspect_database(conn: &Connection, label: &str, max_rows: i64) -> Value {
    let mut tables = Vec::new();

    let names: Vec<String> = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .and_then(|mut stmt| {
            stmt.query_map([], |r| r.get(0))
                .and_then(|rows| rows.collect())
        })
        .unwrap_or_default();

    for table in &names {
        let mut info = Map::new();
        info.insert("name".into(), json!(table));

        if let Ok(mut stmt) = conn.prepare(&format!("PRAGMA table_info({table})")) {
            let columns: Vec<Value> = stmt
                .query_map([], |row| {
                    Ok(json!({
                        "name": row.get::<_, String>(1)?,
                        "type": row.get::<_, String>(2)?,
                        "notnull": row.get::<_, i64>(3)? == 1,
                        "pk": row.get::<_, i64>(5)? != 0,
                    }))
                })
                .and_then(|rows| rows.collect())
                .unwrap_or_default();
            info.insert("columns".into(), json!(columns));
        }

        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap_or(0);
        info.insert("row_count".into(), json!(count));

        if max_rows > 0 && count > 0 {
            if let Ok(mut stmt) = conn.prepare(&format!("SELECT * FROM {table} LIMIT {max_rows}")) {
                let cols: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
                let mut samples = Vec::new();
                if let Ok(mut rows) = stmt.query([]) {
                    while let Ok(Some(row)) = rows.next() {
                        let mut obj = Map::new();
                        for (i, col) in cols.iter().enumerate() {
                            let value = match row.get_ref(i) {
                                Ok(rusqlite::types::ValueRef::Null) => Value::Null,
                                Ok(rusqlite::types::ValueRef::Integer(v)) => json!(v),
                                Ok(rusqlite::types::ValueRef::Real(v)) => json!(v),
                                Ok(rusqlite::types::ValueRef::Text(t)) => {
                                    json!(String::from_utf8_lossy(t))
                                }
                                Ok(rusqlite::types::ValueRef::Blob(b)) => {
                                    json!(format!("<{} bytes>", b.len()))
                                }
                                Err(_) => Value::Null,
                            };
                            obj.insert(col.clone(), value);
                        }
                        samples.push(Value::Object(obj));
                    }
                }
                info.insert("samples".into(), json!(samples));
            }
        }

        tables.push(Value::Object(info));
    }

    json!({
        "success": true,
        "action": "read_sqlite",
        "db_path": label,
        "table_count": tables.len(),
        "tables": tables,
    })
}

fn list_actions() -> Value {
    json!({
        "actions": [
            {"name": "create_tool", "description": "Create a SQL-backed tool with one execute step", "requires": ["name", "tool_description", "sql"], "category": "system"},
            {"name": "list_tools", "description": "List loaded tools, optionally by category", "requires": [], "category": "system"},
            {"name": "get_tool", "description": "Full definition and steps of one tool", "requires": ["name"], "category": "system"},
            {"name": "audit_system", "description": "Shard health, breaker states, tool counts", "requires": [], "category": "system"},
            {"name": "get_metrics", "description": "Request counters and the latest sampled metrics", "requires": [], "category": "system"},
            {"name": "read_sqlite", "description": "Introspect a shard or whitelisted database file", "requires": [], "category": "reading"},
            {"name": "read_code", "description": "Outline a source file", "requires": ["path"], "category": "reading"},
            {"name": "read_markdown", "description": "Heading outline of a markdown file", "requires": ["path"], "category": "reading"},
            {"name": "read_config", "description": "Parse a JSON config file", "requires": ["path"], "category": "reading"},
            {"name": "list_files", "description": "List files matching a name pattern", "requires": ["pattern"], "category": "codebase"},
            {"name": "search_code", "description": "Regex search across code files", "requires": ["pattern"], "category": "codebase"},
            {"name": "list_actions", "description": "List all available actions", "requires": [], "category": "discovery"},
            {"name": "get_schema", "description": "Detailed schema for an action", "requires": ["action_name"], "category": "discovery"},
            {"name": "get_stats", "description": "Usage statistics from the processed log", "requires": [], "category": "discovery"}
        ]
    })
}

/// Per-action argument schemas served by `get_schema`.
static ACTION_SCHEMAS: Lazy<Value> = Lazy::new(|| {
    json!({
        "create_tool": {
            "required": {"name": "string", "tool_description": "string", "sql": "string"},
            "optional": {"category": "string", "parameters": "object"},
            "example": {"action": "create_tool", "name": "count_results", "tool_description": "Count tool results", "sql": "SELECT COUNT(*) AS n FROM tool_results"}
        },
        "list_tools": {
            "optional": {"category": "string"},
            "example": {"action": "list_tools", "category": "custom"}
        },
        "get_tool": {
            "required": {"name": "string"},
            "example": {"action": "get_tool", "name": "ping_db"}
        },
        "read_sqlite": {
            "optional": {"db": "string (shard name)", "path": "string (whitelisted file)", "max_rows": "integer"},
            "example": {"action": "read_sqlite", "db": "output", "max_rows": 3}
        },
        "read_code": {
            "required": {"path": "string"},
            "example": {"action": "read_code", "path": "src/main.rs"}
        },
        "list_files": {
            "required": {"pattern": "string"},
            "optional": {"path": "string"},
            "example": {"action": "list_files", "pattern": "*.rs", "path": "src"}
        },
        "search_code": {
            "required": {"pattern": "string (regex)"},
            "optional": {"path": "string", "file_pattern": "string"},
            "example": {"action": "search_code", "pattern": "fn main", "file_pattern": "*.rs"}
        },
    })
});

fn get_schema(args: &Value) -> Result<Value, String> {
    let action_name = require_str(args, "action_name")?;
    ACTION_SCHEMAS
        .get(&action_name)
        .cloned()
        .map(|schema| json!({"success": true, "action": "get_schema", "schema": schema}))
        .ok_or_else(|| format!("unknown action: {action_name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn toolbox() -> (tempfile::TempDir, Storage, Arc<ToolRegistry>, ToolboxTools) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.init_schemas(None).unwrap();
        let registry = Arc::new(ToolRegistry::new(storage.tools.clone()));
        registry.reload().unwrap();
        let breakers = Arc::new(BreakerSet::new(storage.execution.clone()));
        let retry = Arc::new(RetrySweeper::new(
            storage.execution.clone(),
            storage.output.clone(),
        ));
        let metrics = Arc::new(MetricsHub::new(
            storage.core.clone(),
            storage.metadata.clone(),
            storage.output.clone(),
        ));
        let toolbox = ToolboxTools::new(
            storage.clone(),
            Arc::clone(&registry),
            breakers,
            retry,
            metrics,
        );
        (dir, storage, registry, toolbox)
    }

    #[tokio::test]
    async fn test_create_tool_is_immediately_visible() {
        let (_dir, _storage, registry, toolbox) = toolbox();
        let out = toolbox
            .execute(
                "create_tool",
                &json!({
                    "action": "create_tool",
                    "name": "hello",
                    "tool_description": "greets",
                    "sql": "SELECT 'hi' AS v"
                }),
            )
            .await
            .unwrap();
        assert_eq!(out["success"], true);
        assert!(registry.get("hello").is_some());
    }

    #[tokio::test]
    async fn test_create_tool_requires_fields() {
        let (_dir, _storage, _registry, toolbox) = toolbox();
        let err = toolbox
            .execute("create_tool", &json!({"action": "create_tool", "name": "x"}))
            .await
            .unwrap_err();
        assert!(err.contains("tool_description is required"));
    }

    #[tokio::test]
    async fn test_list_and_get_tool() {
        let (_dir, _storage, _registry, toolbox) = toolbox();
        let out = toolbox
            .execute("list_tools", &json!({"action": "list_tools"}))
            .await
            .unwrap();
        assert!(out["count"].as_i64().unwrap() >= 1);

        let out = toolbox
            .execute("get_tool", &json!({"action": "get_tool", "name": "ping_db"}))
            .await
            .unwrap();
        assert_eq!(out["steps"][0]["type"], "sql");
    }

    #[tokio::test]
    async fn test_audit_system_reports_shards() {
        let (_dir, _storage, _registry, toolbox) = toolbox();
        let out = toolbox
            .execute("audit_system", &json!({"action": "audit_system"}))
            .await
            .unwrap();
        assert_eq!(out["shards_healthy"]["output"], true);
        assert!(out["total_tools"].as_i64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_read_sqlite_shard_by_name() {
        let (_dir, _storage, _registry, toolbox) = toolbox();
        let out = toolbox
            .execute(
                "read_sqlite",
                &json!({"action": "read_sqlite", "db": "lifecycle-tools", "max_rows": 1}),
            )
            .await
            .unwrap();
        let tables: Vec<&str> = out["tables"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert!(tables.contains(&"tool_definitions"));
    }

    #[tokio::test]
    async fn test_read_sqlite_foreign_path_needs_whitelist() {
        let (dir, storage, _registry, toolbox) = toolbox();
        let foreign = dir.path().join("side.db");
        rusqlite::Connection::open(&foreign).unwrap();
        let path = foreign.to_str().unwrap().to_string();

        let err = toolbox
            .execute("read_sqlite", &json!({"action": "read_sqlite", "path": path}))
            .await
            .unwrap_err();
        assert!(err.contains("ATTACH forbidden"), "got: {err}");

        storage
            .add_allowed_attach_path("toolbox", &path, "sqlite", "")
            .unwrap();
        let out = toolbox
            .execute("read_sqlite", &json!({"action": "read_sqlite", "path": path}))
            .await
            .unwrap();
        assert_eq!(out["success"], true);
    }

    #[tokio::test]
    async fn test_read_code_outline() {
        let (dir, _storage, _registry, toolbox) = toolbox();
        let file = dir.path().join("sample.rs");
        std::fs::write(&file, "pub fn alpha() {}\n\nfn beta() {}\n").unwrap();

        let out = toolbox
            .execute(
                "read_code",
                &json!({"action": "read_code", "path": file.to_str().unwrap()}),
            )
            .await
            .unwrap();
        assert_eq!(out["language"], "rust");
        assert_eq!(out["functions"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_files_and_search_code() {
        let (dir, _storage, _registry, toolbox) = toolbox();
        let sub = dir.path().join("code");
        std::fs::create_dir_all(&sub).unwrap();
        std::fs::write(sub.join("a.rs"), "fn needle_here() {}\n").unwrap();
        std::fs::write(sub.join("b.txt"), "nothing\n").unwrap();

        let out = toolbox
            .execute(
                "list_files",
                &json!({"action": "list_files", "pattern": "*.rs", "path": sub.to_str().unwrap()}),
            )
            .await
            .unwrap();
        assert_eq!(out["file_count"], 1);

        let out = toolbox
            .execute(
                "search_code",
                &json!({
                    "action": "search_code",
                    "pattern": "needle_\\w+",
                    "path": sub.to_str().unwrap(),
                    "file_pattern": "*.rs"
                }),
            )
            .await
            .unwrap();
        assert_eq!(out["match_count"], 1);
        assert_eq!(out["matches"][0]["line"], 1);
    }

    #[tokio::test]
    async fn test_get_stats_counts_actions() {
        let (_dir, _storage, _registry, toolbox) = toolbox();
        toolbox
            .execute("list_actions", &json!({"action": "list_actions"}))
            .await
            .unwrap();
        let out = toolbox
            .execute("get_stats", &json!({"action": "get_stats"}))
            .await
            .unwrap();
        assert_eq!(out["by_action"]["list_actions"], 1);
        assert_eq!(out["by_action"]["get_stats"], 1);
    }

    #[tokio::test]
    async fn test_get_schema_known_and_unknown() {
        let (_dir, _storage, _registry, toolbox) = toolbox();
        let out = toolbox
            .execute(
                "get_schema",
                &json!({"action": "get_schema", "action_name": "create_tool"}),
            )
            .await
            .unwrap();
        assert_eq!(out["schema"]["required"]["name"], "string");

        let err = toolbox
            .execute(
                "get_schema",
                &json!({"action": "get_schema", "action_name": "bogus"}),
            )
            .await
            .unwrap_err();
        assert!(err.contains("unknown action"));
    }

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern("*.rs", "main.rs"));
        assert!(matches_pattern("*", "anything"));
        assert!(matches_pattern("a?c", "abc"));
        assert!(!matches_pattern("*.rs", "main.go"));
        assert!(!matches_pattern("a?c", "ac"));
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language("rs"), "rust");
        assert_eq!(detect_language("sql"), "sql");
        assert_eq!(detect_language("xyz"), "text");
    }
}
