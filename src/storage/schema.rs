//! Embedded bootstrap DDL for the six shards.
//!
//! The `--init` mode executes these batches; `--schemas DIR` can layer
//! additional `.sql` files on top (numbered migrations live under
//! `DIR/migrations/<shard>/`). Every statement is idempotent
//! (`IF NOT EXISTS` / `INSERT OR IGNORE`) so re-running init against an
//! existing installation is safe.

/// Inbox shard: the request queue and its supporting registries.
pub const INPUT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS request_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    method TEXT NOT NULL,
    params_json TEXT NOT NULL DEFAULT '{}',
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'queued',
    received_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_request_queue_status ON request_queue(status, priority DESC);

CREATE TABLE IF NOT EXISTS priority_boosts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    boost INTEGER NOT NULL DEFAULT 1,
    reason TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS request_params (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    param_key TEXT NOT NULL,
    param_value TEXT,
    UNIQUE(request_id, param_key)
);

CREATE TABLE IF NOT EXISTS input_sources (
    name TEXT PRIMARY KEY,
    kind TEXT NOT NULL DEFAULT 'stdio',
    enabled INTEGER NOT NULL DEFAULT 1,
    registered_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
INSERT OR IGNORE INTO input_sources (name, kind) VALUES ('stdio', 'stdio');

CREATE TABLE IF NOT EXISTS validation_schemas (
    name TEXT PRIMARY KEY,
    json_schema TEXT NOT NULL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS source_health (
    source_name TEXT PRIMARY KEY,
    healthy INTEGER NOT NULL DEFAULT 1,
    last_seen_at INTEGER,
    failure_count INTEGER NOT NULL DEFAULT 0
);
"#;

/// Tool shard: definitions, ordered implementation steps, and the
/// trigger-maintained dirty flag that drives hot reload.
pub const TOOLS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tool_definitions (
    name TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    input_schema TEXT NOT NULL DEFAULT '{}',
    category TEXT NOT NULL DEFAULT 'custom',
    version INTEGER NOT NULL DEFAULT 1,
    enabled INTEGER NOT NULL DEFAULT 1,
    timeout_seconds INTEGER NOT NULL DEFAULT 30,
    retry_policy TEXT NOT NULL DEFAULT 'none'
        CHECK (retry_policy IN ('none', 'fixed', 'exponential')),
    max_retries INTEGER NOT NULL DEFAULT 3,
    created_by TEXT NOT NULL DEFAULT 'system',
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS tool_implementations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tool_name TEXT NOT NULL REFERENCES tool_definitions(name),
    step_order INTEGER NOT NULL,
    step_name TEXT NOT NULL,
    step_type TEXT NOT NULL DEFAULT 'sql'
        CHECK (step_type IN ('sql', 'validate', 'attach', 'transform')),
    sql_template TEXT NOT NULL,
    error_handler TEXT,
    condition TEXT,
    UNIQUE(tool_name, step_order)
);

CREATE TABLE IF NOT EXISTS tool_parameters (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tool_name TEXT NOT NULL REFERENCES tool_definitions(name),
    param_name TEXT NOT NULL,
    param_type TEXT NOT NULL DEFAULT 'string',
    required INTEGER NOT NULL DEFAULT 0,
    description TEXT,
    UNIQUE(tool_name, param_name)
);

CREATE TABLE IF NOT EXISTS tool_dependencies (
    tool_name TEXT NOT NULL REFERENCES tool_definitions(name),
    depends_on TEXT NOT NULL,
    PRIMARY KEY (tool_name, depends_on)
);

CREATE TABLE IF NOT EXISTS tool_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tool_name TEXT NOT NULL,
    version INTEGER NOT NULL,
    definition_json TEXT NOT NULL,
    changed_by TEXT,
    changed_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS workflow_state (
    workflow_id TEXT PRIMARY KEY,
    tool_name TEXT NOT NULL,
    current_step INTEGER NOT NULL DEFAULT 0,
    state_json TEXT NOT NULL DEFAULT '{}',
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS hot_reload_flag (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    tools_dirty INTEGER NOT NULL DEFAULT 0,
    last_reload_at INTEGER
);
INSERT OR IGNORE INTO hot_reload_flag (id, tools_dirty) VALUES (1, 0);

CREATE TRIGGER IF NOT EXISTS tool_definitions_dirty_insert
AFTER INSERT ON tool_definitions
BEGIN
    UPDATE hot_reload_flag SET tools_dirty = 1 WHERE id = 1;
END;

CREATE TRIGGER IF NOT EXISTS tool_definitions_dirty_update
AFTER UPDATE ON tool_definitions
BEGIN
    UPDATE hot_reload_flag SET tools_dirty = 1 WHERE id = 1;
END;

CREATE TRIGGER IF NOT EXISTS tool_definitions_dirty_delete
AFTER DELETE ON tool_definitions
BEGIN
    UPDATE hot_reload_flag SET tools_dirty = 1 WHERE id = 1;
END;

INSERT OR IGNORE INTO tool_definitions
    (name, description, input_schema, category, created_by)
VALUES
    ('ping_db', 'Round-trip check against the tool shard', '{"type":"object","properties":{}}',
     'system', 'system');
INSERT OR IGNORE INTO tool_implementations
    (tool_name, step_order, step_name, step_type, sql_template)
VALUES
    ('ping_db', 1, 'execute', 'sql', 'SELECT 1 AS pong');
"#;

/// Execution shard: idempotency ledger, retry queue, breakers and the
/// assorted concurrency-control tables.
pub const EXECUTION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS processed_log (
    hash TEXT PRIMARY KEY,
    request_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('success', 'failed')),
    result_hash TEXT NOT NULL DEFAULT '',
    processing_time_ms INTEGER NOT NULL DEFAULT 0,
    processed_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS retry_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    params_json TEXT NOT NULL DEFAULT '{}',
    attempt_number INTEGER NOT NULL DEFAULT 1,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    retry_policy TEXT NOT NULL DEFAULT 'exponential'
        CHECK (retry_policy IN ('fixed', 'exponential')),
    backoff_seconds INTEGER NOT NULL DEFAULT 2,
    next_retry_at INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'exhausted')),
    last_error TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_retry_queue_due ON retry_queue(status, next_retry_at);

CREATE TABLE IF NOT EXISTS circuit_breakers (
    name TEXT PRIMARY KEY,
    state TEXT NOT NULL DEFAULT 'closed'
        CHECK (state IN ('closed', 'open', 'half_open')),
    failure_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_threshold INTEGER NOT NULL DEFAULT 5,
    success_threshold INTEGER NOT NULL DEFAULT 3,
    timeout_seconds INTEGER NOT NULL DEFAULT 60,
    half_open_max_calls INTEGER NOT NULL DEFAULT 3,
    last_failure_at INTEGER,
    last_success_at INTEGER,
    last_state_change_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS cache (
    cache_key TEXT PRIMARY KEY,
    value_json TEXT NOT NULL,
    expires_at INTEGER,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS rate_limiters (
    name TEXT PRIMARY KEY,
    max_per_window INTEGER NOT NULL,
    window_seconds INTEGER NOT NULL,
    current_count INTEGER NOT NULL DEFAULT 0,
    window_started_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS concurrency_counters (
    name TEXT PRIMARY KEY,
    current INTEGER NOT NULL DEFAULT 0,
    max_allowed INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS resource_locks (
    resource TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    acquired_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
    expires_at INTEGER
);

CREATE TABLE IF NOT EXISTS job_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_type TEXT NOT NULL,
    payload_json TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'queued',
    scheduled_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS job_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER NOT NULL,
    job_type TEXT NOT NULL,
    outcome TEXT NOT NULL,
    detail TEXT,
    finished_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
"#;

/// Core shard: configuration, telemetry, the ATTACH whitelist.
pub const CORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
INSERT OR IGNORE INTO config (key, value) VALUES
    ('server.name', 'holow-mcp'),
    ('server.version', '1.0.0'),
    ('polling.interval_ms', '2000'),
    ('heartbeat.interval_seconds', '15'),
    ('shutdown.timeout_seconds', '60'),
    ('cache.default_ttl_seconds', '3600'),
    ('retry.max_attempts', '3'),
    ('circuit_breaker.failure_threshold', '5');

CREATE TABLE IF NOT EXISTS telemetry_traces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trace_id TEXT NOT NULL,
    span_name TEXT NOT NULL,
    duration_ms REAL,
    attributes TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS telemetry_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    logger TEXT,
    trace_id TEXT,
    fields TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS telemetry_security_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    severity TEXT NOT NULL DEFAULT 'info',
    source_ip TEXT,
    user_id TEXT,
    details TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS secret_references (
    name TEXT PRIMARY KEY,
    provider TEXT NOT NULL,
    hint TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS environment (
    key TEXT PRIMARY KEY,
    value TEXT,
    captured_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS network_settings (
    name TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS allowed_attach_paths (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    worker_name TEXT NOT NULL,
    db_path TEXT NOT NULL UNIQUE,
    db_type TEXT NOT NULL DEFAULT 'sqlite',
    allowed INTEGER NOT NULL DEFAULT 1,
    description TEXT,
    added_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS schema_version_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    shard TEXT NOT NULL,
    version INTEGER NOT NULL,
    migration TEXT,
    applied_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
"#;

/// Output shard: results, heartbeat singleton, metrics, dead letters.
pub const OUTPUT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tool_results (
    hash TEXT PRIMARY KEY,
    request_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    result_json TEXT NOT NULL,
    result_type TEXT NOT NULL DEFAULT 'success',
    consumed INTEGER NOT NULL DEFAULT 0,
    correlation_id TEXT,
    session_id TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_tool_results_tool ON tool_results(tool_name, created_at);

CREATE TABLE IF NOT EXISTS heartbeat (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    status TEXT NOT NULL DEFAULT 'starting'
        CHECK (status IN ('starting', 'running', 'shutting_down', 'stopped')),
    pid INTEGER,
    started_at INTEGER,
    last_heartbeat_at INTEGER,
    requests_processed INTEGER NOT NULL DEFAULT 0,
    requests_failed INTEGER NOT NULL DEFAULT 0,
    tools_loaded INTEGER NOT NULL DEFAULT 0,
    memory_mb INTEGER NOT NULL DEFAULT 0,
    tasks INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO heartbeat (id, status) VALUES (1, 'starting');

CREATE TABLE IF NOT EXISTS metrics_realtime (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    metric_name TEXT NOT NULL,
    metric_type TEXT NOT NULL DEFAULT 'gauge',
    value REAL NOT NULL,
    labels TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
CREATE INDEX IF NOT EXISTS idx_metrics_realtime_name ON metrics_realtime(metric_name, created_at);

CREATE TABLE IF NOT EXISTS metrics_aggregated (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    metric_name TEXT NOT NULL,
    window_seconds INTEGER NOT NULL,
    min_value REAL,
    max_value REAL,
    avg_value REAL,
    sample_count INTEGER NOT NULL DEFAULT 0,
    window_started_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS dead_letter_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    params_json TEXT NOT NULL DEFAULT '{}',
    error_message TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    first_attempt_at INTEGER,
    last_attempt_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS audit_trail (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    subject TEXT,
    detail TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS alert_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    alert_rule_id INTEGER NOT NULL,
    severity TEXT NOT NULL DEFAULT 'warning',
    title TEXT NOT NULL,
    message TEXT,
    metric_name TEXT,
    metric_value REAL,
    threshold_value REAL,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS notifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    delivered INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS health_checks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    component TEXT NOT NULL,
    healthy INTEGER NOT NULL,
    detail TEXT,
    checked_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);
"#;

/// Metadata shard: sampled process metrics, poison pill, alert rules.
pub const METADATA_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS system_metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cpu_percent REAL NOT NULL DEFAULT 0,
    memory_used_mb REAL NOT NULL DEFAULT 0,
    tasks INTEGER NOT NULL DEFAULT 0,
    p50_latency_ms REAL NOT NULL DEFAULT 0,
    p95_latency_ms REAL NOT NULL DEFAULT 0,
    p99_latency_ms REAL NOT NULL DEFAULT 0,
    sampled_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS build_info (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version TEXT NOT NULL,
    built_with TEXT,
    recorded_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS poisonpill (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    triggered INTEGER NOT NULL DEFAULT 0,
    reason TEXT,
    triggered_by TEXT,
    triggered_at INTEGER,
    shutdown_timeout_seconds INTEGER NOT NULL DEFAULT 60
);
INSERT OR IGNORE INTO poisonpill (id, triggered) VALUES (1, 0);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    detail TEXT,
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS performance_baselines (
    metric_name TEXT PRIMARY KEY,
    baseline_value REAL NOT NULL,
    tolerance_pct REAL NOT NULL DEFAULT 20,
    established_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE TABLE IF NOT EXISTS alert_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    metric_name TEXT NOT NULL,
    condition TEXT NOT NULL CHECK (condition IN ('gt', 'lt', 'eq', 'ne')),
    threshold REAL NOT NULL,
    severity TEXT NOT NULL DEFAULT 'warning',
    duration_seconds INTEGER NOT NULL DEFAULT 0,
    cooldown_seconds INTEGER NOT NULL DEFAULT 300,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_triggered_at INTEGER
);

CREATE TABLE IF NOT EXISTS dependency_health (
    dependency TEXT PRIMARY KEY,
    healthy INTEGER NOT NULL DEFAULT 1,
    last_checked_at INTEGER,
    detail TEXT
);

CREATE TABLE IF NOT EXISTS sla_tracking (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sla_name TEXT NOT NULL,
    target_pct REAL NOT NULL,
    achieved_pct REAL,
    window_started_at INTEGER NOT NULL,
    window_ended_at INTEGER
);
"#;
