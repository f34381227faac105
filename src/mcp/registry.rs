//! SQL-backed tool registry with trigger-driven hot reload.
//!
//! The catalog lives behind a single immutable snapshot
//! (`Arc<HashMap<..>>`): `reload` builds a replacement map and swaps it
//! in one store, so two `tools/list` calls straddling an edit see either
//! the old set or the new set, never a mix.
//!
//! Reload is driven by the `hot_reload_flag` singleton on the tool
//! shard, raised by INSERT/UPDATE/DELETE triggers on `tool_definitions`
//! and polled by the supervisor (default every 2 s).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::execution::retry::RetryPolicy;
use crate::storage::Shard;

/// One ordered element of a tool implementation.
#[derive(Debug, Clone)]
pub struct ToolStep {
    pub order: i64,
    pub name: String,
    pub step_type: String,
    pub sql_template: String,
    pub error_handler: Option<String>,
    pub condition: Option<String>,
}

/// A loaded SQL-backed tool definition.
#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub category: String,
    pub version: i64,
    pub timeout_seconds: i64,
    pub retry_policy: RetryPolicy,
    pub max_retries: i64,
    pub steps: Vec<ToolStep>,
}

impl Tool {
    /// MCP tool-descriptor shape.
    pub fn descriptor(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

type Catalog = HashMap<String, Arc<Tool>>;

/// The registry: a snapshot of enabled tools plus the reload machinery.
pub struct ToolRegistry {
    shard: Shard,
    catalog: RwLock<Arc<Catalog>>,
}

impl ToolRegistry {
    pub fn new(shard: Shard) -> Self {
        Self {
            shard,
            catalog: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Build a fresh snapshot from `tool_definitions` + ordered steps and
    /// swap it in atomically.
    pub fn reload(&self) -> rusqlite::Result<usize> {
        let new_catalog: Catalog = self.shard.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name, description, input_schema, category, version,
                        timeout_seconds, retry_policy, max_retries
                 FROM tool_definitions
                 WHERE enabled = 1",
            )?;
            let defs = stmt
                .query_map([], |row| {
                    let schema_text: String = row.get(2)?;
                    let policy: String = row.get(6)?;
                    Ok(Tool {
                        name: row.get(0)?,
                        description: row.get(1)?,
                        input_schema: serde_json::from_str(&schema_text)
                            .unwrap_or_else(|_| json!({})),
                        category: row.get(3)?,
                        version: row.get(4)?,
                        timeout_seconds: row.get(5)?,
                        retry_policy: RetryPolicy::parse(&policy),
                        max_retries: row.get(7)?,
                        steps: Vec::new(),
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut step_stmt = conn.prepare(
                "SELECT step_order, step_name, step_type, sql_template,
                        error_handler, condition
                 FROM tool_implementations
                 WHERE tool_name = ?1
                 ORDER BY step_order",
            )?;

            let mut catalog = Catalog::with_capacity(defs.len());
            for mut tool in defs {
                tool.steps = step_stmt
                    .query_map([&tool.name], |row| {
                        Ok(ToolStep {
                            order: row.get(0)?,
                            name: row.get(1)?,
                            step_type: row.get(2)?,
                            sql_template: row.get(3)?,
                            error_handler: row.get(4)?,
                            condition: row.get(5)?,
                        })
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                catalog.insert(tool.name.clone(), Arc::new(tool));
            }
            Ok(catalog)
        })?;

        let count = new_catalog.len();
        *self.catalog.write().unwrap() = Arc::new(new_catalog);
        Ok(count)
    }

    /// Check the dirty flag; when raised, reload and clear it while
    /// stamping `last_reload_at`. Returns whether a reload happened.
    pub fn poll_dirty_and_reload(&self) -> bool {
        let dirty: i64 = match self.shard.with(|conn| {
            conn.query_row(
                "SELECT tools_dirty FROM hot_reload_flag WHERE id = 1",
                [],
                |r| r.get(0),
            )
        }) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "dirty-flag poll failed");
                return false;
            }
        };
        if dirty != 1 {
            return false;
        }

        match self.reload() {
            Ok(count) => {
                self.shard.exec_or_log(
                    "UPDATE hot_reload_flag
                     SET tools_dirty = 0, last_reload_at = strftime('%s', 'now')
                     WHERE id = 1",
                    &[],
                );
                info!(tools = count, "catalog reloaded (dirty flag)");
                true
            }
            Err(e) => {
                warn!(error = %e, "catalog reload failed, flag left raised");
                false
            }
        }
    }

    /// Immediate reload, bypassing the flag. Used by the toolbox
    /// `create_tool` action and by tests.
    pub fn force_reload(&self) -> rusqlite::Result<usize> {
        let count = self.reload()?;
        self.shard.exec_or_log(
            "UPDATE hot_reload_flag
             SET tools_dirty = 0, last_reload_at = strftime('%s', 'now')
             WHERE id = 1",
            &[],
        );
        Ok(count)
    }

    /// Current snapshot handle. Holders see a consistent catalog for as
    /// long as they keep the `Arc`.
    pub fn snapshot(&self) -> Arc<Catalog> {
        Arc::clone(&self.catalog.read().unwrap())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tool>> {
        self.snapshot().get(name).cloned()
    }

    pub fn count(&self) -> usize {
        self.snapshot().len()
    }

    /// MCP descriptors for every loaded tool, sorted by name.
    pub fn descriptors(&self) -> Vec<Value> {
        let snapshot = self.snapshot();
        let mut tools: Vec<_> = snapshot.values().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools.iter().map(|t| t.descriptor()).collect()
    }

    /// Insert a definition plus its first `sql` step. The definition
    /// trigger raises the dirty flag; callers wanting same-call
    /// visibility follow up with [`force_reload`](Self::force_reload).
    pub fn create_tool(
        &self,
        name: &str,
        description: &str,
        input_schema: &Value,
        category: &str,
        sql_template: &str,
        created_by: &str,
    ) -> rusqlite::Result<()> {
        self.shard.with(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO tool_definitions
                     (name, description, input_schema, category, version, enabled,
                      timeout_seconds, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, 1, 30, ?5,
                         strftime('%s', 'now'), strftime('%s', 'now'))",
                rusqlite::params![
                    name,
                    description,
                    input_schema.to_string(),
                    category,
                    created_by
                ],
            )?;
            tx.execute(
                "INSERT INTO tool_implementations
                     (tool_name, step_order, step_name, step_type, sql_template)
                 VALUES (?1, 1, 'execute', 'sql', ?2)",
                rusqlite::params![name, sql_template],
            )?;
            tx.commit()
        })
    }

    /// Append a step. Ordering gaps are fine; a tie on
    /// `(tool_name, step_order)` is rejected by the unique constraint.
    pub fn add_step(
        &self,
        tool_name: &str,
        step_order: i64,
        step_name: &str,
        step_type: &str,
        sql_template: &str,
    ) -> rusqlite::Result<()> {
        self.shard.with(|conn| {
            conn.execute(
                "INSERT INTO tool_implementations
                     (tool_name, step_order, step_name, step_type, sql_template)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![tool_name, step_order, step_name, step_type, sql_template],
            )?;
            Ok(())
        })
    }
}
