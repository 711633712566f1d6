//! Versioned schema migrations for the session database.
//!
//! The schema version lives in SQLite's own `user_version` slot. Startup
//! moves a database from whatever version it has up to [`SCHEMA_VERSION`],
//! taking an engine-native snapshot of the whole file first and rolling a
//! failed migration back before surfacing the error. A database stamped
//! newer than this build is never migrated downward.

use rusqlite::{Connection, DatabaseName, Transaction};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use crate::error::MigrationError;

pub const SCHEMA_VERSION: u32 = 3;

const BACKUP_RETENTION: usize = 3;
const BACKUP_SUFFIX: &str = ".backup-";

/// Current schema, installed whole on a fresh database file.
///
/// Foreign keys carry `ON DELETE CASCADE` but are only enforced when the
/// connection enables `PRAGMA foreign_keys`; the store does that on every
/// open.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id                 TEXT PRIMARY KEY,
    created_at         INTEGER NOT NULL,
    first_user_message TEXT NOT NULL,
    last_accessed_at   INTEGER NOT NULL,
    working_directory  TEXT,
    branch_name        TEXT,
    is_worktree        INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS messages (
    id                TEXT PRIMARY KEY,
    session_id        TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    content           TEXT NOT NULL,
    role              TEXT NOT NULL,
    timestamp         INTEGER NOT NULL,
    message_type      TEXT NOT NULL,
    tool_name         TEXT,
    tool_input_data   TEXT,
    is_error          INTEGER NOT NULL DEFAULT 0,
    is_complete       INTEGER NOT NULL DEFAULT 1,
    was_cancelled     INTEGER NOT NULL DEFAULT 0,
    task_group_id     TEXT,
    is_task_container INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS attachments (
    id         TEXT PRIMARY KEY,
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    file_name  TEXT NOT NULL,
    file_path  TEXT NOT NULL,
    file_type  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_last_accessed ON sessions(last_accessed_at DESC);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id);
";

pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: fn(&Transaction<'_>) -> rusqlite::Result<()>,
    pub down: Option<fn(&Transaction<'_>) -> rusqlite::Result<()>>,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 2,
        description: "message task grouping",
        up: migrate_v2_up,
        down: Some(migrate_v2_down),
    },
    Migration {
        version: 3,
        description: "session workspace metadata",
        up: migrate_v3_up,
        down: Some(migrate_v3_down),
    },
];

fn migrate_v2_up(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "ALTER TABLE messages ADD COLUMN task_group_id TEXT;
         ALTER TABLE messages ADD COLUMN is_task_container INTEGER NOT NULL DEFAULT 0;",
    )
}

fn migrate_v2_down(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "ALTER TABLE messages DROP COLUMN task_group_id;
         ALTER TABLE messages DROP COLUMN is_task_container;",
    )
}

fn migrate_v3_up(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "ALTER TABLE sessions ADD COLUMN branch_name TEXT;
         ALTER TABLE sessions ADD COLUMN is_worktree INTEGER NOT NULL DEFAULT 0;",
    )
}

fn migrate_v3_down(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    tx.execute_batch(
        "ALTER TABLE sessions DROP COLUMN branch_name;
         ALTER TABLE sessions DROP COLUMN is_worktree;",
    )
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MigrationReport {
    UpToDate,
    Initialized,
    NewerThanSupported { stored: u32 },
    Migrated { from: u32, to: u32, backup: PathBuf },
}

/// Bring `conn`'s database up to [`SCHEMA_VERSION`].
///
/// Must complete before any session read or write is serviced; a
/// half-migrated schema is unsafe to query.
pub fn run_migrations_if_needed(
    conn: &mut Connection,
    db_path: &Path,
) -> Result<MigrationReport, MigrationError> {
    let stored = current_version(conn)?;

    if stored > SCHEMA_VERSION {
        warn!(
            stored,
            supported = SCHEMA_VERSION,
            "database schema is newer than this build; leaving it untouched"
        );
        return Ok(MigrationReport::NewerThanSupported { stored });
    }
    if stored == SCHEMA_VERSION {
        return Ok(MigrationReport::UpToDate);
    }
    if stored == 0 {
        // Fresh file: install the current schema whole, nothing to migrate.
        conn.execute_batch(SCHEMA)?;
        set_version(conn, SCHEMA_VERSION)?;
        info!(version = SCHEMA_VERSION, "initialized fresh session database");
        return Ok(MigrationReport::Initialized);
    }

    let pending = pending_migrations(stored)?;
    let backup = backup_database(conn, db_path)?;
    info!(
        from = stored,
        to = SCHEMA_VERSION,
        backup = %backup.display(),
        "migrating session database"
    );

    for migration in pending {
        apply_migration(conn, migration)?;
        // The version stamp sits outside the migration body's transaction.
        // A crash between commit and stamp replays an already-applied
        // migration on next start; the pre-run backup is the recovery path.
        set_version(conn, migration.version)?;
        info!(
            version = migration.version,
            description = migration.description,
            "applied migration"
        );
    }

    prune_backups(db_path);
    Ok(MigrationReport::Migrated {
        from: stored,
        to: SCHEMA_VERSION,
        backup,
    })
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<(), MigrationError> {
    let body = {
        let tx = conn.transaction()?;
        match (migration.up)(&tx) {
            Ok(()) => tx.commit(),
            Err(err) => {
                drop(tx);
                Err(err)
            }
        }
    };
    match body {
        Ok(()) => Ok(()),
        Err(source) => {
            attempt_rollback(conn, migration);
            Err(MigrationError::MigrationFailed {
                version: migration.version,
                source,
            })
        }
    }
}

/// Best-effort reverse pass after a failed forward action. The failed
/// transaction has already rolled back; the reverse action exists for
/// migrations whose failure mode can leave state behind anyway (e.g. a
/// batch that errors after its first statement committed via an implicit
/// transaction break).
fn attempt_rollback(conn: &mut Connection, migration: &Migration) {
    let Some(down) = migration.down else {
        warn!(
            version = migration.version,
            "failed migration has no reverse action; restore from the pre-migration backup if needed"
        );
        return;
    };
    let outcome = conn
        .transaction()
        .and_then(|tx| down(&tx).and_then(|()| tx.commit()));
    match outcome {
        Ok(()) => info!(version = migration.version, "rolled back failed migration"),
        Err(err) => warn!(
            version = migration.version,
            error = %err,
            "rollback of failed migration did not apply"
        ),
    }
}

/// Explicitly undo the migration that produced `version`, stepping the
/// stored version back by one. Startup never calls this; it exists for
/// operator tooling.
pub fn revert_migration(conn: &mut Connection, version: u32) -> Result<(), MigrationError> {
    let migration = MIGRATIONS
        .iter()
        .find(|migration| migration.version == version)
        .ok_or(MigrationError::InvalidVersion(version))?;
    let down = migration
        .down
        .ok_or(MigrationError::RollbackNotSupported { version })?;

    let tx = conn.transaction()?;
    down(&tx).map_err(|source| MigrationError::MigrationFailed { version, source })?;
    tx.commit()?;
    set_version(conn, version - 1)?;
    Ok(())
}

/// Migrations with versions in `(stored, SCHEMA_VERSION]`, validated to be
/// a contiguous run.
fn pending_migrations(stored: u32) -> Result<Vec<&'static Migration>, MigrationError> {
    let pending: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|migration| migration.version > stored && migration.version <= SCHEMA_VERSION)
        .collect();

    let mut expected = stored + 1;
    for migration in &pending {
        if migration.version != expected {
            return Err(MigrationError::InvalidVersion(migration.version));
        }
        expected += 1;
    }
    if expected != SCHEMA_VERSION + 1 {
        return Err(MigrationError::InvalidVersion(expected));
    }
    Ok(pending)
}

/// Snapshot the whole database file next to it before mutating the schema.
/// Goes through the engine's backup API rather than a raw file copy so a
/// mid-write file can't be captured half-flushed.
pub fn backup_database(conn: &Connection, db_path: &Path) -> Result<PathBuf, MigrationError> {
    let backup_path = backup_path_for(db_path, now_unix_millis());
    conn.backup(DatabaseName::Main, &backup_path, None)?;
    Ok(backup_path)
}

fn backup_path_for(db_path: &Path, stamp: u64) -> PathBuf {
    let mut name = db_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(BACKUP_SUFFIX);
    name.push_str(&stamp.to_string());
    db_path.with_file_name(name)
}

/// Keep only the newest [`BACKUP_RETENTION`] backups. Best-effort: cleanup
/// failures are logged, never raised.
fn prune_backups(db_path: &Path) {
    let Some(parent) = db_path.parent() else {
        return;
    };
    let Some(file_name) = db_path.file_name() else {
        return;
    };
    let prefix = format!("{}{}", file_name.to_string_lossy(), BACKUP_SUFFIX);

    let entries = match std::fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(error = %err, "could not scan for stale database backups");
            return;
        }
    };

    let mut backups: Vec<(u64, PathBuf)> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stamp) = name.strip_prefix(&prefix) else {
            continue;
        };
        let Ok(stamp) = stamp.parse::<u64>() else {
            continue;
        };
        backups.push((stamp, entry.path()));
    }

    backups.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, stale) in backups.into_iter().skip(BACKUP_RETENTION) {
        if let Err(err) = std::fs::remove_file(&stale) {
            warn!(path = %stale.display(), error = %err, "could not prune stale database backup");
        }
    }
}

/// Advisory consistency check; callers invoke it after suspicious
/// failures, not on every startup.
pub fn integrity_check(conn: &Connection) -> Result<(), MigrationError> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let rows: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<_>>()?;

    if rows.len() == 1 && rows[0] == "ok" {
        Ok(())
    } else {
        Err(MigrationError::DatabaseCorrupted {
            detail: rows.join("; "),
        })
    }
}

fn current_version(conn: &Connection) -> Result<u32, MigrationError> {
    let raw: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(raw as u32)
}

fn set_version(conn: &Connection, version: u32) -> Result<(), MigrationError> {
    conn.pragma_update(None, "user_version", version as i64)?;
    Ok(())
}

fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path(test_name: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push("tandem-tests");
        let _ = std::fs::create_dir_all(&dir);
        dir.push(format!(
            "{test_name}-{}-{}.db",
            std::process::id(),
            now_unix_millis()
        ));
        dir
    }

    fn open_conn(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        conn
    }

    fn table_columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .unwrap();
        stmt.query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap()
    }

    /// Re-creates the schema as it shipped at an older version, the way a
    /// long-lived install would have it on disk.
    fn create_db_at_schema_version(path: &Path, target_version: u32) {
        assert!(target_version == 1 || target_version == 2);
        let conn = open_conn(path);
        conn.execute_batch(
            "CREATE TABLE sessions (
                id                 TEXT PRIMARY KEY,
                created_at         INTEGER NOT NULL,
                first_user_message TEXT NOT NULL,
                last_accessed_at   INTEGER NOT NULL,
                working_directory  TEXT
            );
            CREATE TABLE messages (
                id              TEXT PRIMARY KEY,
                session_id      TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                content         TEXT NOT NULL,
                role            TEXT NOT NULL,
                timestamp       INTEGER NOT NULL,
                message_type    TEXT NOT NULL,
                tool_name       TEXT,
                tool_input_data TEXT,
                is_error        INTEGER NOT NULL DEFAULT 0,
                is_complete     INTEGER NOT NULL DEFAULT 1,
                was_cancelled   INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE attachments (
                id         TEXT PRIMARY KEY,
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                file_name  TEXT NOT NULL,
                file_path  TEXT NOT NULL,
                file_type  TEXT NOT NULL
            );",
        )
        .unwrap();
        if target_version >= 2 {
            conn.execute_batch(
                "ALTER TABLE messages ADD COLUMN task_group_id TEXT;
                 ALTER TABLE messages ADD COLUMN is_task_container INTEGER NOT NULL DEFAULT 0;",
            )
            .unwrap();
        }
        conn.pragma_update(None, "user_version", target_version as i64)
            .unwrap();
    }

    #[test]
    fn fresh_database_is_stamped_to_current_version() {
        let path = temp_db_path("fresh_database_is_stamped_to_current_version");
        let mut conn = open_conn(&path);

        let report = run_migrations_if_needed(&mut conn, &path).unwrap();
        assert_eq!(report, MigrationReport::Initialized);
        assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);

        let columns = table_columns(&conn, "sessions");
        assert!(columns.contains(&"branch_name".to_owned()));
        assert!(columns.contains(&"is_worktree".to_owned()));
    }

    #[test]
    fn fully_migrated_database_is_a_no_op_on_restart() {
        let path = temp_db_path("fully_migrated_database_is_a_no_op_on_restart");
        let mut conn = open_conn(&path);
        run_migrations_if_needed(&mut conn, &path).unwrap();

        let report = run_migrations_if_needed(&mut conn, &path).unwrap();
        assert_eq!(report, MigrationReport::UpToDate);
        assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn newer_database_is_never_mutated() {
        let path = temp_db_path("newer_database_is_never_mutated");
        let mut conn = open_conn(&path);
        conn.execute_batch("CREATE TABLE sessions (id TEXT PRIMARY KEY, future_field TEXT);")
            .unwrap();
        conn.pragma_update(None, "user_version", (SCHEMA_VERSION + 5) as i64)
            .unwrap();

        let report = run_migrations_if_needed(&mut conn, &path).unwrap();
        assert_eq!(
            report,
            MigrationReport::NewerThanSupported {
                stored: SCHEMA_VERSION + 5
            }
        );
        assert_eq!(current_version(&conn).unwrap(), SCHEMA_VERSION + 5);
        assert_eq!(table_columns(&conn, "sessions"), vec!["id", "future_field"]);
    }

    #[test]
    fn v1_database_is_upgraded_in_place_with_data_intact() {
        let path = temp_db_path("v1_database_is_upgraded_in_place_with_data_intact");
        create_db_at_schema_version(&path, 1);
        {
            let conn = open_conn(&path);
            conn.execute(
                "INSERT INTO sessions (id, created_at, first_user_message, last_accessed_at)
                 VALUES ('s1', 100, 'hello', 100)",
                [],
            )
            .unwrap();
        }

        let mut conn = open_conn(&path);
        let report = run_migrations_if_needed(&mut conn, &path).unwrap();
        match report {
            MigrationReport::Migrated { from, to, backup } => {
                assert_eq!(from, 1);
                assert_eq!(to, SCHEMA_VERSION);
                assert!(backup.exists(), "backup should be taken before migrating");
            }
            other => panic!("expected Migrated, got {other:?}"),
        }

        assert!(table_columns(&conn, "messages").contains(&"task_group_id".to_owned()));
        assert!(table_columns(&conn, "sessions").contains(&"is_worktree".to_owned()));
        let kept: String = conn
            .query_row("SELECT first_user_message FROM sessions WHERE id = 's1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(kept, "hello");
    }

    #[test]
    fn backups_are_pruned_to_retention() {
        let path = temp_db_path("backups_are_pruned_to_retention");
        let mut conn = open_conn(&path);
        run_migrations_if_needed(&mut conn, &path).unwrap();

        for stamp in 1..=5u64 {
            std::fs::write(backup_path_for(&path, stamp), b"stale").unwrap();
        }
        prune_backups(&path);

        let mut remaining: Vec<u64> = (1..=5u64)
            .filter(|stamp| backup_path_for(&path, *stamp).exists())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec![3, 4, 5]);
    }

    #[test]
    fn integrity_check_passes_on_healthy_database() {
        let path = temp_db_path("integrity_check_passes_on_healthy_database");
        let mut conn = open_conn(&path);
        run_migrations_if_needed(&mut conn, &path).unwrap();
        integrity_check(&conn).unwrap();
    }

    #[test]
    fn revert_migration_steps_version_back() {
        let path = temp_db_path("revert_migration_steps_version_back");
        create_db_at_schema_version(&path, 2);
        let mut conn = open_conn(&path);
        run_migrations_if_needed(&mut conn, &path).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 3);

        revert_migration(&mut conn, 3).unwrap();
        assert_eq!(current_version(&conn).unwrap(), 2);
        assert!(!table_columns(&conn, "sessions").contains(&"branch_name".to_owned()));

        let err = revert_migration(&mut conn, 99).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidVersion(99)));
    }

    #[test]
    fn failed_migration_reports_version_and_rolls_back() {
        fn failing_up(tx: &Transaction<'_>) -> rusqlite::Result<()> {
            tx.execute_batch("ALTER TABLE sessions ADD COLUMN extra TEXT; SELECT no_such_fn();")
        }

        let path = temp_db_path("failed_migration_reports_version_and_rolls_back");
        create_db_at_schema_version(&path, 2);
        let mut conn = open_conn(&path);

        let migration = Migration {
            version: 3,
            description: "intentionally failing",
            up: failing_up,
            down: None,
        };
        let err = apply_migration(&mut conn, &migration).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::MigrationFailed { version: 3, .. }
        ));
        assert!(
            !table_columns(&conn, "sessions").contains(&"extra".to_owned()),
            "failed body must leave no partial schema change"
        );
    }
}
