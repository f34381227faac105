//! Six-shard SQLite substrate.
//!
//! Each shard is a single-file database with WAL enabled. Writes are
//! scoped to one shard per transaction; cross-shard reads go through the
//! ATTACH whitelist kept on the core shard. The shard split exists to
//! bound single-writer contention, so every shard gets its own
//! connection behind its own lock.

pub mod resilience;
pub mod schema;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::info;

/// `application_id` stamped into every shard ("HOLW").
pub const HOLOW_APP_ID: i64 = 0x484F_4C57;

/// Shard file names under the base path.
pub const SHARD_NAMES: [&str; 6] = [
    "input",
    "lifecycle-tools",
    "lifecycle-execution",
    "lifecycle-core",
    "output",
    "metadata",
];

/// Session pragmas applied to every connection.
const SHARD_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
    PRAGMA cache_size = -64000;
    PRAGMA wal_autocheckpoint = 10000;
    PRAGMA temp_store = MEMORY;
";

/// Database file name for a shard under `base`.
pub fn shard_path(base: &Path, name: &str) -> PathBuf {
    base.join(format!("holow-mcp.{name}.db"))
}

/// ATTACH rejected: the path has no `allowed = 1` whitelist row.
#[derive(Debug, Clone)]
pub struct AttachDenied {
    pub path: String,
    pub reason: &'static str,
}

impl fmt::Display for AttachDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ATTACH forbidden: {}: {}", self.reason, self.path)
    }
}

impl std::error::Error for AttachDenied {}

/// One shard: a named connection behind a lock.
#[derive(Clone)]
pub struct Shard {
    name: &'static str,
    conn: Arc<Mutex<Connection>>,
}

impl Shard {
    fn open(base: &Path, name: &'static str) -> rusqlite::Result<Self> {
        let conn = Connection::open(shard_path(base, name))?;
        conn.execute_batch(SHARD_PRAGMAS)?;
        Ok(Self {
            name,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Run a closure against the shard connection. The critical section
    /// should stay short; the 5 s busy timeout bounds lock waits on the
    /// SQLite side.
    pub fn with<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> rusqlite::Result<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Best-effort exec: failures are logged, never propagated. Used for
    /// non-critical persistence (breaker flushes, telemetry rows).
    pub fn exec_or_log(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) {
        if let Err(e) = self.with(|conn| conn.execute(sql, params)) {
            tracing::warn!(shard = self.name, error = %e, "best-effort exec failed: {}", sql.trim());
        }
    }
}

/// Handles to all six shards.
#[derive(Clone)]
pub struct Storage {
    base_path: PathBuf,
    pub input: Shard,
    pub tools: Shard,
    pub execution: Shard,
    pub core: Shard,
    pub output: Shard,
    pub metadata: Shard,
}

impl Storage {
    /// Open (creating if needed) all six shards under `base`.
    pub fn open(base: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base)?;

        let storage = Self {
            base_path: base.to_path_buf(),
            input: Shard::open(base, "input")?,
            tools: Shard::open(base, "lifecycle-tools")?,
            execution: Shard::open(base, "lifecycle-execution")?,
            core: Shard::open(base, "lifecycle-core")?,
            output: Shard::open(base, "output")?,
            metadata: Shard::open(base, "metadata")?,
        };
        info!(base = %base.display(), "opened 6 shards");
        Ok(storage)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// All shards paired with their symbolic names, in canonical order.
    pub fn all(&self) -> [&Shard; 6] {
        [
            &self.input,
            &self.tools,
            &self.execution,
            &self.core,
            &self.output,
            &self.metadata,
        ]
    }

    /// Look up a shard by its symbolic name (CLI `--db`, `read_sqlite`).
    pub fn by_name(&self, name: &str) -> Option<&Shard> {
        match name {
            "input" => Some(&self.input),
            "lifecycle-tools" | "tools" => Some(&self.tools),
            "lifecycle-execution" | "execution" => Some(&self.execution),
            "lifecycle-core" | "core" => Some(&self.core),
            "output" => Some(&self.output),
            "metadata" => Some(&self.metadata),
            _ => None,
        }
    }

    /// Execute the embedded bootstrap DDL on every shard, then any extra
    /// `.sql` files found directly in `schemas_dir`.
    pub fn init_schemas(&self, schemas_dir: Option<&Path>) -> anyhow::Result<()> {
        let batches: [(&Shard, &str); 6] = [
            (&self.input, schema::INPUT_SCHEMA),
            (&self.tools, schema::TOOLS_SCHEMA),
            (&self.execution, schema::EXECUTION_SCHEMA),
            (&self.core, schema::CORE_SCHEMA),
            (&self.output, schema::OUTPUT_SCHEMA),
            (&self.metadata, schema::METADATA_SCHEMA),
        ];
        for (shard, ddl) in batches {
            shard
                .with(|conn| conn.execute_batch(ddl))
                .map_err(|e| anyhow::anyhow!("bootstrap {} failed: {e}", shard.name()))?;
        }

        // Optional extra schema files land on the tool shard, mirroring
        // the seeded default-tools convention.
        if let Some(dir) = schemas_dir {
            let mut entries: Vec<_> = match std::fs::read_dir(dir) {
                Ok(rd) => rd
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().is_some_and(|x| x == "sql"))
                    .collect(),
                Err(_) => Vec::new(),
            };
            entries.sort();
            for path in entries {
                let ddl = std::fs::read_to_string(&path)?;
                self.tools
                    .with(|conn| conn.execute_batch(&ddl))
                    .map_err(|e| anyhow::anyhow!("schema {} failed: {e}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Check the core-shard whitelist for an ATTACH target. Every caller
    /// that constructs an ATTACH statement must funnel through here.
    pub fn validate_attach_path(&self, path: &str) -> Result<(), AttachDenied> {
        let allowed: Option<i64> = self
            .core
            .with(|conn| {
                use rusqlite::OptionalExtension;
                conn.query_row(
                    "SELECT allowed FROM allowed_attach_paths WHERE db_path = ?1",
                    [path],
                    |row| row.get(0),
                )
                .optional()
            })
            .unwrap_or(None);

        match allowed {
            Some(1) => Ok(()),
            Some(_) => Err(AttachDenied {
                path: path.to_string(),
                reason: "path disabled",
            }),
            None => Err(AttachDenied {
                path: path.to_string(),
                reason: "path not in whitelist",
            }),
        }
    }

    /// Whitelist a path for ATTACH.
    pub fn add_allowed_attach_path(
        &self,
        worker_name: &str,
        db_path: &str,
        db_type: &str,
        description: &str,
    ) -> rusqlite::Result<()> {
        self.core.with(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO allowed_attach_paths
                     (worker_name, db_path, db_type, allowed, description, added_at)
                 VALUES (?1, ?2, ?3, 1, ?4, strftime('%s', 'now'))",
                rusqlite::params![worker_name, db_path, db_type, description],
            )?;
            Ok(())
        })
    }

    /// Idempotency ledger lookup.
    pub fn check_processed(&self, hash: &str) -> rusqlite::Result<bool> {
        self.execution.with(|conn| {
            use rusqlite::OptionalExtension;
            let row: Option<i64> = conn
                .query_row("SELECT 1 FROM processed_log WHERE hash = ?1", [hash], |r| {
                    r.get(0)
                })
                .optional()?;
            Ok(row.is_some())
        })
    }

    /// Ledger insertion: the commit point of request processing. The
    /// primary key makes concurrent duplicates lose the race.
    pub fn mark_processed(
        &self,
        hash: &str,
        request_id: &str,
        tool_name: &str,
        status: &str,
        result_hash: &str,
        processing_time_ms: i64,
    ) -> rusqlite::Result<()> {
        self.execution.with(|conn| {
            conn.execute(
                "INSERT INTO processed_log
                     (hash, request_id, tool_name, status, result_hash, processing_time_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![hash, request_id, tool_name, status, result_hash, processing_time_ms],
            )?;
            Ok(())
        })
    }

    /// `wal_checkpoint(TRUNCATE)` on every shard. Invoked at shutdown.
    pub fn checkpoint_all(&self) {
        for shard in self.all() {
            if let Err(e) = shard.with(|conn| conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")) {
                tracing::warn!(shard = shard.name(), error = %e, "checkpoint failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_initialized() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.init_schemas(None).unwrap();
        (dir, storage)
    }

    #[test]
    fn test_open_creates_six_shard_files() {
        let (dir, _storage) = open_initialized();
        for name in SHARD_NAMES {
            assert!(shard_path(dir.path(), name).exists(), "missing shard {name}");
        }
    }

    #[test]
    fn test_init_schemas_is_idempotent() {
        let (_dir, storage) = open_initialized();
        storage.init_schemas(None).unwrap();
        let count: i64 = storage
            .tools
            .with(|c| {
                c.query_row(
                    "SELECT COUNT(*) FROM tool_definitions WHERE name = 'ping_db'",
                    [],
                    |r| r.get(0),
                )
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_attach_path_denied_without_row() {
        let (_dir, storage) = open_initialized();
        let err = storage.validate_attach_path("/tmp/x.db").unwrap_err();
        assert_eq!(err.reason, "path not in whitelist");
    }

    #[test]
    fn test_attach_path_allowed_after_insert() {
        let (_dir, storage) = open_initialized();
        storage
            .add_allowed_attach_path("worker1", "/tmp/x.db", "sqlite", "test db")
            .unwrap();
        assert!(storage.validate_attach_path("/tmp/x.db").is_ok());
    }

    #[test]
    fn test_attach_path_disabled_row_denied() {
        let (_dir, storage) = open_initialized();
        storage
            .add_allowed_attach_path("worker1", "/tmp/y.db", "sqlite", "")
            .unwrap();
        storage
            .core
            .with(|c| {
                c.execute(
                    "UPDATE allowed_attach_paths SET allowed = 0 WHERE db_path = '/tmp/y.db'",
                    [],
                )
            })
            .unwrap();
        let err = storage.validate_attach_path("/tmp/y.db").unwrap_err();
        assert_eq!(err.reason, "path disabled");
    }

    #[test]
    fn test_processed_log_single_row_per_hash() {
        let (_dir, storage) = open_initialized();
        assert!(!storage.check_processed("abc").unwrap());
        storage
            .mark_processed("abc", "1", "tools/call", "success", "def", 12)
            .unwrap();
        assert!(storage.check_processed("abc").unwrap());
        // Second insertion with the same fingerprint loses the race.
        assert!(storage
            .mark_processed("abc", "2", "tools/call", "success", "def", 3)
            .is_err());
        let rows: i64 = storage
            .execution
            .with(|c| c.query_row("SELECT COUNT(*) FROM processed_log WHERE hash = 'abc'", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_dirty_flag_raised_by_trigger() {
        let (_dir, storage) = open_initialized();
        storage
            .tools
            .with(|c| {
                c.execute("UPDATE hot_reload_flag SET tools_dirty = 0 WHERE id = 1", [])
            })
            .unwrap();
        storage
            .tools
            .with(|c| {
                c.execute(
                    "INSERT INTO tool_definitions (name, description) VALUES ('t1', 'd')",
                    [],
                )
            })
            .unwrap();
        let dirty: i64 = storage
            .tools
            .with(|c| c.query_row("SELECT tools_dirty FROM hot_reload_flag WHERE id = 1", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(dirty, 1);
    }
}
