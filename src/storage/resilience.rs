//! Boot-time recovery, migrations, and shard health validation.
//!
//! Recovery is deliberately minimal: checkpoint the WAL, stamp the
//! application id, apply any numbered migrations the stored
//! `user_version` has not seen yet. It runs once at startup, never in a
//! background task.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use tracing::{info, warn};

use super::{shard_path, Shard, Storage, HOLOW_APP_ID, SHARD_NAMES};

/// Current schema version; bump with each new migration set.
pub const SCHEMA_VERSION: i64 = 1;

impl Storage {
    /// Run recovery and migrations on every shard. A checkpoint failure
    /// is logged and skipped; a migration failure is fatal.
    pub fn recover_and_migrate(&self, schemas_dir: Option<&Path>) -> anyhow::Result<()> {
        for shard in self.all() {
            recover_shard(shard, schemas_dir)
                .map_err(|e| anyhow::anyhow!("{}: {e}", shard.name()))?;
        }
        Ok(())
    }
}

fn recover_shard(shard: &Shard, schemas_dir: Option<&Path>) -> anyhow::Result<()> {
    // Checkpoint first so a crash-left WAL is folded back into the main file.
    if let Err(e) = shard.with(|c| c.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")) {
        warn!(shard = shard.name(), error = %e, "startup checkpoint failed");
    }

    shard.with(|c| {
        let app_id: i64 = c.query_row("PRAGMA application_id", [], |r| r.get(0))?;
        if app_id == 0 {
            c.execute_batch(&format!("PRAGMA application_id = {HOLOW_APP_ID}"))?;
        }
        Ok(())
    })?;

    let version: i64 = shard.with(|c| c.query_row("PRAGMA user_version", [], |r| r.get(0)))?;
    if version < SCHEMA_VERSION {
        apply_migrations(shard, schemas_dir, version)?;
    }
    Ok(())
}

/// Apply `NNN_description.sql` files under `<schemas>/migrations/<shard>/`
/// whose numeric prefix exceeds `current_version`, then stamp the new
/// `user_version`.
fn apply_migrations(
    shard: &Shard,
    schemas_dir: Option<&Path>,
    current_version: i64,
) -> anyhow::Result<()> {
    let dir = schemas_dir.map(|d| d.join("migrations").join(shard.name()));

    if let Some(dir) = dir.filter(|d| d.is_dir()) {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|x| x == "sql"))
            .collect();
        files.sort();

        for path in files {
            let Some(mig_version) = migration_version(&path) else {
                continue;
            };
            if mig_version <= current_version {
                continue;
            }
            let sql = std::fs::read_to_string(&path)?;
            info!(shard = shard.name(), migration = %path.display(), "applying migration");
            shard
                .with(|c| c.execute_batch(&sql))
                .map_err(|e| anyhow::anyhow!("migration {} failed: {e}", path.display()))?;
        }
    }

    shard.with(|c| c.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION}")))?;
    Ok(())
}

/// Parse the numeric prefix from `001_description.sql`.
fn migration_version(path: &Path) -> Option<i64> {
    let stem = path.file_stem()?.to_str()?;
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

// ---------------------------------------------------------------------------
// Offline health validation (`--mcp-status`)
// ---------------------------------------------------------------------------

/// Health snapshot of a single shard file, gathered without the server
/// running.
#[derive(Debug)]
pub struct ShardHealth {
    pub name: &'static str,
    pub path: PathBuf,
    pub exists: bool,
    pub is_holow: bool,
    pub app_id: i64,
    pub integrity_ok: bool,
    pub integrity_msg: String,
    pub has_wal: bool,
    pub has_shm: bool,
    pub table_count: i64,
    pub schema_version: i64,
}

/// Validate every shard file under `base`.
pub fn validate_databases(base: &Path) -> Vec<ShardHealth> {
    SHARD_NAMES.iter().map(|name| check_shard(base, name)).collect()
}

fn check_shard(base: &Path, name: &'static str) -> ShardHealth {
    let path = shard_path(base, name);
    let mut health = ShardHealth {
        name,
        path: path.clone(),
        exists: false,
        is_holow: false,
        app_id: 0,
        integrity_ok: false,
        integrity_msg: String::new(),
        has_wal: false,
        has_shm: false,
        table_count: 0,
        schema_version: 0,
    };

    if !path.exists() {
        return health;
    }
    health.exists = true;
    health.has_wal = PathBuf::from(format!("{}-wal", path.display())).exists();
    health.has_shm = PathBuf::from(format!("{}-shm", path.display())).exists();

    let conn = match Connection::open(&path) {
        Ok(c) => c,
        Err(e) => {
            health.integrity_msg = format!("cannot open: {e}");
            return health;
        }
    };

    if let Ok(app_id) = conn.query_row("PRAGMA application_id", [], |r| r.get::<_, i64>(0)) {
        health.app_id = app_id;
        health.is_holow = app_id == HOLOW_APP_ID || app_id == 0;
    }
    health.schema_version = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);
    health.table_count = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    match conn.query_row("PRAGMA integrity_check(1)", [], |r| r.get::<_, String>(0)) {
        Ok(msg) if msg == "ok" => health.integrity_ok = true,
        Ok(msg) => health.integrity_msg = msg,
        Err(e) => health.integrity_msg = format!("check failed: {e}"),
    }

    health
}

/// Render a human-readable report for the CLI.
pub fn print_report(base: &Path, healths: &[ShardHealth]) {
    eprintln!("\n--- Shard validation ---");
    eprintln!("base: {}\n", base.display());
    for h in healths {
        let status = if h.exists && h.integrity_ok { "ok " } else { "BAD" };
        let mut details = Vec::new();
        if !h.exists {
            details.push("missing".to_string());
        } else {
            if !h.integrity_ok {
                details.push(format!("corrupt: {}", h.integrity_msg));
            }
            if h.is_holow && h.app_id != 0 {
                details.push("holow".to_string());
            } else if h.app_id != 0 {
                details.push(format!("app_id=0x{:X}", h.app_id));
            }
            details.push(format!("{} tables", h.table_count));
            details.push(format!("v{}", h.schema_version));
            if h.has_wal {
                details.push("orphan WAL".to_string());
            }
        }
        eprintln!("  [{status}] {} ({})", h.name, details.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_version_parsing() {
        assert_eq!(migration_version(Path::new("001_add_index.sql")), Some(1));
        assert_eq!(migration_version(Path::new("042_x.sql")), Some(42));
        assert_eq!(migration_version(Path::new("notes.sql")), None);
    }

    #[test]
    fn test_recover_stamps_app_id_and_version() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.init_schemas(None).unwrap();
        storage.recover_and_migrate(None).unwrap();

        let app_id: i64 = storage
            .tools
            .with(|c| c.query_row("PRAGMA application_id", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(app_id, HOLOW_APP_ID);
        let version: i64 = storage
            .tools
            .with(|c| c.query_row("PRAGMA user_version", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_applies_numbered_migration_once() {
        let dir = tempfile::tempdir().unwrap();
        let schemas = dir.path().join("schemas");
        let mig_dir = schemas.join("migrations").join("lifecycle-tools");
        std::fs::create_dir_all(&mig_dir).unwrap();
        std::fs::write(
            mig_dir.join("001_extra_table.sql"),
            "CREATE TABLE IF NOT EXISTS extra (id INTEGER PRIMARY KEY);",
        )
        .unwrap();

        let storage = Storage::open(dir.path()).unwrap();
        storage.init_schemas(None).unwrap();
        storage.recover_and_migrate(Some(&schemas)).unwrap();

        let tables: i64 = storage
            .tools
            .with(|c| {
                c.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = 'extra'",
                    [],
                    |r| r.get(0),
                )
            })
            .unwrap();
        assert_eq!(tables, 1);

        // Version already stamped: a second pass skips the migration.
        storage.recover_and_migrate(Some(&schemas)).unwrap();
    }

    #[test]
    fn test_validate_reports_missing_shards() {
        let dir = tempfile::tempdir().unwrap();
        let healths = validate_databases(dir.path());
        assert_eq!(healths.len(), 6);
        assert!(healths.iter().all(|h| !h.exists));
    }

    #[test]
    fn test_validate_reports_healthy_shards() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage.init_schemas(None).unwrap();
        storage.checkpoint_all();
        drop(storage);

        let healths = validate_databases(dir.path());
        assert!(healths.iter().all(|h| h.exists && h.integrity_ok));
    }
}
