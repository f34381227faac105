//! Retry queue and dead-letter promotion.
//!
//! Failed tool calls with a retry policy land in `retry_queue`
//! (execution shard) with an initial 2 s backoff. A sweeper re-executes
//! due rows in small batches; exponential rows double their backoff on
//! each failure, and exhausted rows move to `dead_letter_queue` (output
//! shard) carrying the full error context.

use serde_json::Value;
use tracing::{debug, warn};

use crate::storage::Shard;

/// Sweep batch size.
const SWEEP_LIMIT: i64 = 10;

/// Initial backoff for a freshly enqueued retry.
const INITIAL_BACKOFF_SECS: i64 = 2;

/// Tool retry policy, from `tool_definitions.retry_policy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    None,
    Fixed,
    Exponential,
}

impl RetryPolicy {
    pub fn parse(s: &str) -> RetryPolicy {
        match s {
            "fixed" => RetryPolicy::Fixed,
            "exponential" => RetryPolicy::Exponential,
            _ => RetryPolicy::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetryPolicy::None => "none",
            RetryPolicy::Fixed => "fixed",
            RetryPolicy::Exponential => "exponential",
        }
    }

    pub fn retryable(&self) -> bool {
        !matches!(self, RetryPolicy::None)
    }
}

/// Outcome counters from one sweep pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub succeeded: usize,
    pub rearmed: usize,
    pub dead_lettered: usize,
}

struct DueRow {
    id: i64,
    request_id: String,
    tool_name: String,
    params_json: String,
    attempt: i64,
    max_attempts: i64,
    policy: String,
    backoff: i64,
    created_at: i64,
}

/// Retry queue operations over the execution and output shards.
pub struct RetrySweeper {
    execution: Shard,
    output: Shard,
}

impl RetrySweeper {
    pub fn new(execution: Shard, output: Shard) -> Self {
        Self { execution, output }
    }

    /// Enqueue a retry with attempt counter 1 and the initial backoff.
    pub fn enqueue(
        &self,
        request_id: &str,
        tool_name: &str,
        params: &Value,
        policy: RetryPolicy,
        max_attempts: i64,
    ) -> rusqlite::Result<()> {
        let params_json = params.to_string();
        self.execution.with(|conn| {
            conn.execute(
                "INSERT INTO retry_queue
                     (request_id, tool_name, params_json, attempt_number, max_attempts,
                      retry_policy, backoff_seconds, next_retry_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, strftime('%s', 'now') + ?6)",
                rusqlite::params![
                    request_id,
                    tool_name,
                    params_json,
                    max_attempts,
                    policy.as_str(),
                    INITIAL_BACKOFF_SECS
                ],
            )?;
            Ok(())
        })
    }

    /// Number of pending rows (audit surface).
    pub fn pending_count(&self) -> rusqlite::Result<i64> {
        self.execution.with(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM retry_queue WHERE status = 'pending'",
                [],
                |r| r.get(0),
            )
        })
    }

    /// Process due rows. `execute` re-runs the named tool with the
    /// stored arguments and reports success or a failure message.
    pub fn sweep_due<F>(&self, execute: F) -> rusqlite::Result<SweepStats>
    where
        F: Fn(&str, &Value) -> Result<Value, String>,
    {
        let due: Vec<DueRow> = self.execution.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, request_id, tool_name, params_json, attempt_number,
                        max_attempts, retry_policy, backoff_seconds, created_at
                 FROM retry_queue
                 WHERE status = 'pending' AND next_retry_at <= strftime('%s', 'now')
                 ORDER BY next_retry_at
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map([SWEEP_LIMIT], |row| {
                Ok(DueRow {
                    id: row.get(0)?,
                    request_id: row.get(1)?,
                    tool_name: row.get(2)?,
                    params_json: row.get(3)?,
                    attempt: row.get(4)?,
                    max_attempts: row.get(5)?,
                    policy: row.get(6)?,
                    backoff: row.get(7)?,
                    created_at: row.get(8)?,
                })
            })?;
            rows.collect()
        })?;

        let mut stats = SweepStats::default();
        for row in due {
            self.execution.exec_or_log(
                "UPDATE retry_queue SET status = 'processing' WHERE id = ?1",
                &[&row.id],
            );

            let params: Value =
                serde_json::from_str(&row.params_json).unwrap_or_else(|_| Value::Object(Default::default()));

            match execute(&row.tool_name, &params) {
                Ok(_) => {
                    debug!(tool = %row.tool_name, attempt = row.attempt, "retry succeeded");
                    self.execution
                        .exec_or_log("DELETE FROM retry_queue WHERE id = ?1", &[&row.id]);
                    stats.succeeded += 1;
                }
                Err(err) if row.attempt >= row.max_attempts => {
                    warn!(tool = %row.tool_name, attempts = row.attempt, "retries exhausted, dead-lettering");
                    self.output.exec_or_log(
                        "INSERT INTO dead_letter_queue
                             (request_id, tool_name, params_json, error_message, attempts,
                              first_attempt_at, last_attempt_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, strftime('%s', 'now'))",
                        &[
                            &row.request_id,
                            &row.tool_name,
                            &row.params_json,
                            &err,
                            &row.attempt,
                            &row.created_at,
                        ],
                    );
                    self.execution
                        .exec_or_log("DELETE FROM retry_queue WHERE id = ?1", &[&row.id]);
                    stats.dead_lettered += 1;
                }
                Err(err) => {
                    let next_backoff = match RetryPolicy::parse(&row.policy) {
                        RetryPolicy::Fixed => row.backoff,
                        _ => row.backoff * 2,
                    };
                    self.execution.exec_or_log(
                        "UPDATE retry_queue
                         SET status = 'pending', attempt_number = ?1, backoff_seconds = ?2,
                             next_retry_at = strftime('%s', 'now') + ?2, last_error = ?3
                         WHERE id = ?4",
                        &[&(row.attempt + 1), &next_backoff, &err, &row.id],
                    );
                    stats.rearmed += 1;
                }
            }
        }
        Ok(stats)
    }
}
