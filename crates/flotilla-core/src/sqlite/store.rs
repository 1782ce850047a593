use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::models::{
    CoreError, CoreErrorKind, EventCursor, PlanEvent, PlanId, PlanState, PlanStatus,
};
use crate::persistence::{MigrationStore, PersistenceResult, StateStore};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "flotilla_schema_migrations";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// File-backed state store. Every operation opens its own connection, so the
/// store can be shared freely across blocking worker threads.
pub struct SqliteStateStore {
    database_path: PathBuf,
}

enum WriteOutcome {
    Written(u64),
    Missing,
    Conflict { stored_version: u64 },
}

impl SqliteStateStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStateStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // DDL is IF NOT EXISTS throughout, so re-running it repairs a
                // recorded version whose tables went missing.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl StateStore for SqliteStateStore {
    fn create_plan(&self, state: &PlanState) -> PersistenceResult<u64> {
        let plan_id = state.id().clone();
        let mut stored = state.clone();
        stored.version = 1;
        let state_json = encode_state(&stored)?;

        let inserted = self.with_connection("create_plan", |connection| {
            ensure_schema_ready(connection)?;
            let changed = connection.execute(
                "
INSERT INTO plan_states (
    plan_id, status, version, state_json, created_at_unix, updated_at_unix
) VALUES (?1, ?2, 1, ?3, ?4, ?5)
ON CONFLICT(plan_id) DO NOTHING
",
                params![
                    plan_id.as_str(),
                    stored.status().as_str(),
                    state_json,
                    to_unix_seconds(stored.plan.created_at)?,
                    to_unix_seconds(stored.updated_at)?,
                ],
            )?;
            Ok(changed == 1)
        })?;

        if !inserted {
            return Err(CoreError::new(
                CoreErrorKind::Conflict,
                format!("plan '{plan_id}' already exists"),
            )
            .for_plan(&plan_id));
        }
        Ok(1)
    }

    fn save_plan(&self, state: &PlanState) -> PersistenceResult<u64> {
        let plan_id = state.id().clone();
        let expected_version = to_i64(state.version)
            .map_err(|error| storage_error("save_plan", error))?;
        let next_version = state.version.saturating_add(1);
        let mut stored = state.clone();
        stored.version = next_version;
        let state_json = encode_state(&stored)?;

        let outcome = self.with_connection("save_plan", |connection| {
            ensure_schema_ready(connection)?;
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let changed = transaction.execute(
                "
UPDATE plan_states
SET status = ?1, version = ?2, state_json = ?3, updated_at_unix = ?4
WHERE plan_id = ?5 AND version = ?6
",
                params![
                    stored.status().as_str(),
                    to_i64(next_version)?,
                    state_json,
                    to_unix_seconds(stored.updated_at)?,
                    plan_id.as_str(),
                    expected_version,
                ],
            )?;

            let outcome = if changed == 1 {
                WriteOutcome::Written(next_version)
            } else {
                let stored_version: Option<i64> = transaction
                    .query_row(
                        "SELECT version FROM plan_states WHERE plan_id = ?1",
                        [plan_id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                match stored_version {
                    Some(version) => WriteOutcome::Conflict {
                        stored_version: i64_to_u64(version)?,
                    },
                    None => WriteOutcome::Missing,
                }
            };
            transaction.commit()?;
            Ok(outcome)
        })?;

        match outcome {
            WriteOutcome::Written(version) => Ok(version),
            WriteOutcome::Missing => Err(CoreError::new(
                CoreErrorKind::NotFound,
                format!("plan '{plan_id}' does not exist"),
            )
            .for_plan(&plan_id)),
            WriteOutcome::Conflict { stored_version } => Err(CoreError::new(
                CoreErrorKind::Conflict,
                format!(
                    "plan '{plan_id}' version mismatch: stored {stored_version}, expected {}",
                    state.version
                ),
            )
            .for_plan(&plan_id)),
        }
    }

    fn load_plan(&self, plan_id: &PlanId) -> PersistenceResult<Option<PlanState>> {
        let row = self.with_connection("load_plan", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    "SELECT state_json, version FROM plan_states WHERE plan_id = ?1",
                    [plan_id.as_str()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()
        })?;

        let Some((state_json, version)) = row else {
            return Ok(None);
        };
        let mut state: PlanState = serde_json::from_str(&state_json).map_err(|error| {
            storage_error_text("load_plan", format!("corrupt plan state json: {error}"))
        })?;
        state.version = i64_to_u64(version).map_err(|error| storage_error("load_plan", error))?;
        Ok(Some(state))
    }

    fn list_active_plans(&self) -> PersistenceResult<Vec<PlanId>> {
        self.with_connection("list_active_plans", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT plan_id, status FROM plan_states
WHERE status NOT IN (?1, ?2, ?3)
ORDER BY plan_id ASC
",
            )?;
            let rows = statement.query_map(
                params![
                    PlanStatus::Completed.as_str(),
                    PlanStatus::Failed.as_str(),
                    PlanStatus::Cancelled.as_str(),
                ],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )?;

            let mut active = Vec::new();
            for row in rows {
                let (plan_id, status) = row?;
                parse_plan_status(&status)?;
                active.push(PlanId::new(plan_id));
            }
            Ok(active)
        })
    }

    fn append_trace(&self, event: &PlanEvent) -> PersistenceResult<u64> {
        let plan_id = event.plan_id.clone();
        let mut stored = event.clone();
        self.with_connection("append_trace", |connection| {
            ensure_schema_ready(connection)?;
            let transaction =
                connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let next: i64 = transaction.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM plan_trace WHERE plan_id = ?1",
                [plan_id.as_str()],
                |row| row.get(0),
            )?;
            stored.sequence = i64_to_u64(next)?;
            let event_json = serde_json::to_string(&stored)
                .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
            let event_kind = serde_json::to_value(stored.kind)
                .ok()
                .and_then(|value| value.as_str().map(str::to_string))
                .unwrap_or_default();
            transaction.execute(
                "
INSERT INTO plan_trace (plan_id, sequence, event_kind, event_json, recorded_at_unix)
VALUES (?1, ?2, ?3, ?4, ?5)
",
                params![
                    plan_id.as_str(),
                    next,
                    event_kind,
                    event_json,
                    to_unix_seconds(stored.timestamp)?,
                ],
            )?;
            transaction.commit()?;
            Ok(stored.sequence)
        })
    }

    fn read_trace(
        &self,
        plan_id: &PlanId,
        after: EventCursor,
        limit: usize,
    ) -> PersistenceResult<Vec<PlanEvent>> {
        let rows = self.with_connection("read_trace", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT event_json, sequence FROM plan_trace
WHERE plan_id = ?1 AND sequence > ?2
ORDER BY sequence ASC
LIMIT ?3
",
            )?;
            let rows = statement.query_map(
                params![plan_id.as_str(), to_i64(after.0)?, usize_to_i64(limit)?],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;

        rows.into_iter()
            .map(|(event_json, sequence)| {
                let mut event: PlanEvent = serde_json::from_str(&event_json).map_err(|error| {
                    storage_error_text("read_trace", format!("corrupt trace event json: {error}"))
                })?;
                event.sequence =
                    i64_to_u64(sequence).map_err(|error| storage_error("read_trace", error))?;
                Ok(event)
            })
            .collect()
    }
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    let connection = Connection::open(database_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    Ok(connection)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(
        "
CREATE TABLE IF NOT EXISTS flotilla_schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
",
    )?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version < current_schema_version() {
        return Err(storage_error_sqlite(
            "database schema is not up to date; apply migrations before plan operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn encode_state(state: &PlanState) -> PersistenceResult<String> {
    serde_json::to_string(state).map_err(|error| {
        storage_error_text("encode_state", format!("failed to encode plan state: {error}"))
    })
}

fn parse_plan_status(raw: &str) -> rusqlite::Result<PlanStatus> {
    PlanStatus::parse(raw).ok_or_else(|| {
        storage_error_sqlite(&format!("unknown plan status '{raw}' found in sqlite record"))
    })
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn to_unix_seconds(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    let seconds = i64::try_from(duration.as_secs())
        .map_err(|_| storage_error_sqlite("unix timestamp seconds exceed i64 range"))?;
    Ok(seconds)
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative counter in sqlite record"))
}

fn to_i64(value: u64) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn usize_to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
