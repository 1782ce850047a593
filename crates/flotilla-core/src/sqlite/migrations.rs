#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_plan_state_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS plan_states (
    plan_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    version INTEGER NOT NULL,
    state_json TEXT NOT NULL,
    created_at_unix INTEGER NOT NULL,
    updated_at_unix INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_plan_states_status
    ON plan_states (status);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_plan_states_status;
DROP TABLE IF EXISTS plan_states;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_plan_trace",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS plan_trace (
    plan_id TEXT NOT NULL,
    sequence INTEGER NOT NULL,
    event_kind TEXT NOT NULL,
    event_json TEXT NOT NULL,
    recorded_at_unix INTEGER NOT NULL,
    PRIMARY KEY (plan_id, sequence)
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS plan_trace;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
