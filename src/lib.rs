//! HOLOW-MCP: a persistent MCP server whose tool catalog is programmable
//! at runtime through rows in six sharded SQLite databases.
//!
//! Architecture:
//! - `storage/`       -- the six-shard SQLite substrate (pragmas, migrations, attach whitelist)
//! - `execution/`     -- idempotency ledger, circuit breakers, retry/dead-letter
//! - `mcp/`           -- JSON-RPC dispatcher, tool registry, template executor, built-in handlers
//! - `observability/` -- metrics sampler, heartbeat, alert rules, security events
//! - `lifecycle`      -- background-loop supervision and graceful shutdown
//! - `config/`        -- config.json + db-backed runtime settings
//! - `services/`      -- ambient services (structured logging)

pub mod config;
pub mod execution;
pub mod lifecycle;
pub mod mcp;
pub mod observability;
pub mod services;
pub mod sqlcli;
pub mod storage;
