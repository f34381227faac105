//! One-shot SQL query mode (`--sql QUERY --db SHARD`).
//!
//! Ancillary operator tooling: runs a single statement against a named
//! shard and prints rows as JSON lines. The interactive REPL is a
//! separate external tool.

use std::path::Path;

use serde_json::{json, Map, Value};

use crate::storage::Storage;

/// Execute one query and print the result to stdout.
pub fn run_query(base: &Path, db_name: &str, query: &str) -> anyhow::Result<()> {
    let storage = Storage::open(base)?;
    let shard = storage
        .by_name(db_name)
        .ok_or_else(|| anyhow::anyhow!("unknown shard: {db_name}"))?;

    let trimmed = query.trim();
    if trimmed
        .split_whitespace()
        .next()
        .is_some_and(|kw| kw.eq_ignore_ascii_case("select") || kw.eq_ignore_ascii_case("pragma"))
    {
        let rows = shard.with(|conn| {
            let mut stmt = conn.prepare(trimmed)?;
            let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt.query([])?;
            let mut out: Vec<Value> = Vec::new();
            while let Some(row) = rows.next()? {
                let mut obj = Map::new();
                for (i, col) in columns.iter().enumerate() {
                    use rusqlite::types::ValueRef;
                    let value = match row.get_ref(i)? {
                        ValueRef::Null => Value::Null,
                        ValueRef::Integer(v) => json!(v),
                        ValueRef::Real(v) => json!(v),
                        ValueRef::Text(t) => json!(String::from_utf8_lossy(t)),
                        ValueRef::Blob(b) => json!(format!("<{} bytes>", b.len())),
                    };
                    obj.insert(col.clone(), value);
                }
                out.push(Value::Object(obj));
            }
            Ok(out)
        })?;

        for row in &rows {
            println!("{row}");
        }
        eprintln!("({} rows)", rows.len());
    } else {
        let affected = shard.with(|conn| conn.execute(trimmed, []))?;
        eprintln!("({affected} rows affected)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_query_select() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.init_schemas(None).unwrap();
        drop(storage);
        run_query(dir.path(), "lifecycle-tools", "SELECT name FROM tool_definitions").unwrap();
    }

    #[test]
    fn test_run_query_unknown_shard() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run_query(dir.path(), "nope", "SELECT 1").is_err());
    }

    #[test]
    fn test_run_query_exec() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.init_schemas(None).unwrap();
        drop(storage);
        run_query(
            dir.path(),
            "lifecycle-core",
            "UPDATE config SET value = '1000' WHERE key = 'polling.interval_ms'",
        )
        .unwrap();
    }
}
