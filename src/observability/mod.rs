//! Metrics sampling, heartbeat, alert evaluation, and security events.
//!
//! Request latencies accumulate in a bounded in-memory buffer; a sampler
//! drains it on a fixed cadence, computes p50/p95/p99 and writes a
//! `system_metrics` row to the metadata shard. The heartbeat singleton
//! on the output shard is refreshed separately, and the poison-pill
//! singleton on the metadata shard is how the system asks itself to shut
//! down.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use sysinfo::{Pid, System};
use tracing::warn;

use crate::storage::Shard;

/// Latency buffer cap; overflow discards the oldest half.
const MAX_LATENCIES: usize = 10_000;

/// Percentile triple computed over one sampler window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Percentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Shared metrics state: counters, the latency buffer, and the shard
/// handles the loops write through.
pub struct MetricsHub {
    core: Shard,
    metadata: Shard,
    output: Shard,
    latencies: Mutex<Vec<f64>>,
    system: Mutex<System>,
    requests_processed: AtomicI64,
    requests_failed: AtomicI64,
    inflight: AtomicI64,
}

impl MetricsHub {
    pub fn new(core: Shard, metadata: Shard, output: Shard) -> Self {
        Self {
            core,
            metadata,
            output,
            latencies: Mutex::new(Vec::with_capacity(1024)),
            system: Mutex::new(System::new()),
            requests_processed: AtomicI64::new(0),
            requests_failed: AtomicI64::new(0),
            inflight: AtomicI64::new(0),
        }
    }

    // -- counters ----------------------------------------------------------

    pub fn request_succeeded(&self) {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed_count(&self) -> i64 {
        self.requests_processed.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> i64 {
        self.requests_failed.load(Ordering::Relaxed)
    }

    pub fn task_started(&self) {
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inflight_count(&self) -> i64 {
        self.inflight.load(Ordering::Relaxed)
    }

    // -- latency buffer ----------------------------------------------------

    pub fn record_latency(&self, latency_ms: f64) {
        let mut buf = self.latencies.lock().unwrap();
        if buf.len() >= MAX_LATENCIES {
            buf.drain(..MAX_LATENCIES / 2);
        }
        buf.push(latency_ms);
    }

    /// Drain the buffer and compute percentiles over what was collected.
    fn drain_percentiles(&self) -> Percentiles {
        let mut sorted = {
            let mut buf = self.latencies.lock().unwrap();
            std::mem::take(&mut *buf)
        };
        if sorted.is_empty() {
            return Percentiles::default();
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        Percentiles {
            p50: sorted[n * 50 / 100],
            p95: sorted[(n * 95 / 100).min(n - 1)],
            p99: sorted[(n * 99 / 100).min(n - 1)],
        }
    }

    /// Resident memory of this process in MB.
    fn memory_mb(&self) -> f64 {
        let mut system = self.system.lock().unwrap();
        let pid = Pid::from_u32(std::process::id());
        system.refresh_process(pid);
        system
            .process(pid)
            .map(|p| p.memory() as f64 / 1024.0 / 1024.0)
            .unwrap_or(0.0)
    }

    // -- samplers and writers ---------------------------------------------

    /// One sampler tick: percentiles + process memory into
    /// `system_metrics`.
    pub fn sample_system_metrics(&self) {
        let pct = self.drain_percentiles();
        let memory_mb = self.memory_mb();
        self.metadata.exec_or_log(
            "INSERT INTO system_metrics
                 (cpu_percent, memory_used_mb, tasks, p50_latency_ms, p95_latency_ms, p99_latency_ms)
             VALUES (0, ?1, ?2, ?3, ?4, ?5)",
            &[
                &memory_mb,
                &self.inflight_count(),
                &pct.p50,
                &pct.p95,
                &pct.p99,
            ],
        );
    }

    /// Record one realtime metric point (alert rules read these).
    pub fn record_metric(&self, name: &str, metric_type: &str, value: f64, labels: &serde_json::Value) {
        self.output.exec_or_log(
            "INSERT INTO metrics_realtime (metric_name, metric_type, value, labels)
             VALUES (?1, ?2, ?3, ?4)",
            &[&name, &metric_type, &value, &labels.to_string()],
        );
    }

    /// Refresh the heartbeat singleton. `started_at` is preserved across
    /// refreshes.
    pub fn update_heartbeat(&self, status: &str, tools_loaded: i64) {
        let memory_mb = self.memory_mb() as i64;
        self.output.exec_or_log(
            "INSERT OR REPLACE INTO heartbeat
                 (id, status, pid, started_at, last_heartbeat_at, requests_processed,
                  requests_failed, tools_loaded, memory_mb, tasks)
             VALUES (1, ?1, ?2,
                     COALESCE((SELECT started_at FROM heartbeat WHERE id = 1), strftime('%s', 'now')),
                     strftime('%s', 'now'), ?3, ?4, ?5, ?6, ?7)",
            &[
                &status,
                &(std::process::id() as i64),
                &self.processed_count(),
                &self.failed_count(),
                &tools_loaded,
                &memory_mb,
                &self.inflight_count(),
            ],
        );
    }

    /// Security event row on the core shard (`circuit_open`,
    /// `attach_denied`, ...).
    pub fn record_security_event(&self, event_type: &str, severity: &str, details: &str) {
        self.core.exec_or_log(
            "INSERT INTO telemetry_security_events (event_type, severity, details)
             VALUES (?1, ?2, ?3)",
            &[&event_type, &severity, &details],
        );
    }

    // -- poison pill -------------------------------------------------------

    /// Check the poison-pill singleton; `Some((reason, timeout))` when
    /// triggered.
    pub fn check_poison_pill(&self) -> Option<(String, i64)> {
        let row = self
            .metadata
            .with(|conn| {
                use rusqlite::OptionalExtension;
                conn.query_row(
                    "SELECT triggered, COALESCE(reason, ''), shutdown_timeout_seconds
                     FROM poisonpill WHERE id = 1",
                    [],
                    |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, i64>(2)?)),
                )
                .optional()
            })
            .unwrap_or(None);

        match row {
            Some((1, reason, timeout)) => Some((reason, timeout)),
            _ => None,
        }
    }

    /// Trip the poison pill, asking the supervisor to shut down.
    pub fn trigger_poison_pill(&self, reason: &str, triggered_by: &str) {
        self.metadata.exec_or_log(
            "UPDATE poisonpill
             SET triggered = 1, reason = ?1, triggered_by = ?2,
                 triggered_at = strftime('%s', 'now')
             WHERE id = 1",
            &[&reason, &triggered_by],
        );
    }
}

// ---------------------------------------------------------------------------
// Alert rules
// ---------------------------------------------------------------------------

/// Evaluates enabled `alert_rules` against the latest realtime metric
/// values, emitting `alert_events` and honouring per-rule cooldowns.
pub struct AlertChecker {
    metadata: Shard,
    output: Shard,
}

struct AlertRule {
    id: i64,
    name: String,
    metric_name: String,
    condition: String,
    threshold: f64,
    severity: String,
    cooldown_seconds: i64,
    last_triggered_at: Option<i64>,
}

impl AlertChecker {
    pub fn new(metadata: Shard, output: Shard) -> Self {
        Self { metadata, output }
    }

    /// One evaluation pass. Returns how many rules fired.
    pub fn check_alerts(&self) -> rusqlite::Result<usize> {
        let rules: Vec<AlertRule> = self.metadata.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, metric_name, condition, threshold, severity,
                        cooldown_seconds, last_triggered_at
                 FROM alert_rules
                 WHERE enabled = 1",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(AlertRule {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    metric_name: row.get(2)?,
                    condition: row.get(3)?,
                    threshold: row.get(4)?,
                    severity: row.get(5)?,
                    cooldown_seconds: row.get(6)?,
                    last_triggered_at: row.get(7)?,
                })
            })?;
            rows.collect()
        })?;

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let mut fired = 0;
        for rule in rules {
            if let Some(last) = rule.last_triggered_at {
                if now - last < rule.cooldown_seconds {
                    continue;
                }
            }

            let value: Option<f64> = self
                .output
                .with(|conn| {
                    use rusqlite::OptionalExtension;
                    conn.query_row(
                        "SELECT value FROM metrics_realtime
                         WHERE metric_name = ?1
                         ORDER BY created_at DESC, id DESC LIMIT 1",
                        [&rule.metric_name],
                        |r| r.get(0),
                    )
                    .optional()
                })
                .unwrap_or(None);
            let Some(value) = value else { continue };

            let triggered = match rule.condition.as_str() {
                "gt" => value > rule.threshold,
                "lt" => value < rule.threshold,
                "eq" => value == rule.threshold,
                "ne" => value != rule.threshold,
                other => {
                    warn!(rule = %rule.name, condition = other, "unknown alert condition");
                    false
                }
            };
            if !triggered {
                continue;
            }

            self.output.exec_or_log(
                "INSERT INTO alert_events
                     (alert_rule_id, severity, title, message, metric_name, metric_value, threshold_value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                &[
                    &rule.id,
                    &rule.severity,
                    &rule.name,
                    &format!("{} {} {}", rule.metric_name, rule.condition, rule.threshold),
                    &rule.metric_name,
                    &value,
                    &rule.threshold,
                ],
            );
            self.metadata.exec_or_log(
                "UPDATE alert_rules SET last_triggered_at = strftime('%s', 'now') WHERE id = ?1",
                &[&rule.id],
            );
            fired += 1;
        }
        Ok(fired)
    }
}
