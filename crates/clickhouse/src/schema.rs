//! ClickHouse table schemas.
//!
//! - events: ordinary events and session markers in one table, `kind` tells them apart
//! - users: user records, several of which may share a customer identity
//! - projects: per-project settings document, which carries the session checkpoint
//!
//! Timestamps are unix seconds stored as Int64.

/// SQL for creating the database.
pub fn create_database(database: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS {database}")
}

/// SQL for creating the events table.
///
/// `session_id` and `properties` are rewritten in place by mutations.
pub fn create_events_table(database: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {database}.events (
    id String,
    project_id String,
    user_id String,

    -- 'event' or 'session'
    kind LowCardinality(String),
    timestamp Int64,
    created_at Int64,

    -- Encoded property blobs
    properties String,
    user_properties Nullable(String),

    session_id Nullable(String),
    count UInt64 DEFAULT 1,
    skip_session UInt8 DEFAULT 0,
    properties_updated_timestamp Int64 DEFAULT 0
)
ENGINE = MergeTree()
PARTITION BY project_id
ORDER BY (project_id, user_id, timestamp, id)
SETTINGS index_granularity = 8192
"#
    )
}

/// SQL for creating the users table.
pub fn create_users_table(database: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {database}.users (
    id String,
    project_id String,
    customer_user_id Nullable(String),
    properties String,
    properties_updated_timestamp Int64,
    join_timestamp Int64,
    created_at Int64
)
ENGINE = MergeTree()
ORDER BY (project_id, id)
SETTINGS index_granularity = 8192
"#
    )
}

/// SQL for creating the projects table.
///
/// Settings are replaced as a whole document; the highest version wins.
pub fn create_projects_table(database: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {database}.projects (
    project_id String,
    created_at Int64,
    settings String,
    version UInt64
)
ENGINE = ReplacingMergeTree(version)
ORDER BY project_id
"#
    )
}

/// All DDL statements in creation order.
pub fn all_tables(database: &str) -> Vec<String> {
    vec![
        create_database(database),
        create_events_table(database),
        create_users_table(database),
        create_projects_table(database),
    ]
}
