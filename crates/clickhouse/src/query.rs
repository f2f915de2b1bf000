//! Seeding and read-back helpers (used in tests and admin).

use crate::client::ClickHouseClient;
use crate::store::{EventRow, ProjectRow, UserRow};
use engine_core::{Error, Event, Result, UserRecord};

fn query_error(e: clickhouse::error::Error) -> Error {
    Error::store(format!("Query error: {}", e))
}

/// Insert events as-is.
pub async fn insert_events(client: &ClickHouseClient, events: &[Event]) -> Result<usize> {
    if events.is_empty() {
        return Ok(0);
    }

    let mut insert = client
        .inner()
        .insert("events")
        .map_err(|e| Error::store(format!("Insert error: {}", e)))?;
    for event in events {
        insert
            .write(&EventRow::from(event))
            .await
            .map_err(|e| Error::store(format!("Write error: {}", e)))?;
    }
    insert
        .end()
        .await
        .map_err(|e| Error::store(format!("End error: {}", e)))?;

    Ok(events.len())
}

/// Insert user records as-is.
pub async fn insert_users(client: &ClickHouseClient, users: &[UserRecord]) -> Result<usize> {
    if users.is_empty() {
        return Ok(0);
    }

    let mut insert = client
        .inner()
        .insert("users")
        .map_err(|e| Error::store(format!("Insert error: {}", e)))?;
    for user in users {
        insert
            .write(&UserRow::from(user))
            .await
            .map_err(|e| Error::store(format!("Write error: {}", e)))?;
    }
    insert
        .end()
        .await
        .map_err(|e| Error::store(format!("End error: {}", e)))?;

    Ok(users.len())
}

/// Register a project with an empty settings document.
pub async fn insert_project(client: &ClickHouseClient, project_id: &str, created_at: i64) -> Result<()> {
    let mut insert = client
        .inner()
        .insert("projects")
        .map_err(|e| Error::store(format!("Insert error: {}", e)))?;
    insert
        .write(&ProjectRow {
            project_id: project_id.to_string(),
            created_at,
            settings: "{}".to_string(),
            version: 1,
        })
        .await
        .map_err(|e| Error::store(format!("Write error: {}", e)))?;
    insert
        .end()
        .await
        .map_err(|e| Error::store(format!("End error: {}", e)))?;
    Ok(())
}

/// All events of a user, markers included, in (timestamp, creation) order.
pub async fn query_user_events(client: &ClickHouseClient, project_id: &str, user_id: &str) -> Result<Vec<Event>> {
    let rows: Vec<EventRow> = client
        .inner()
        .query(
            "SELECT id, project_id, user_id, kind, timestamp, created_at, properties, user_properties, \
             session_id, count, skip_session FROM events \
             WHERE project_id = ? AND user_id = ? ORDER BY timestamp, created_at",
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_all()
        .await
        .map_err(query_error)?;
    Ok(rows.into_iter().map(Event::from).collect())
}

/// Count session markers for a project.
pub async fn count_sessions(client: &ClickHouseClient, project_id: &str) -> Result<u64> {
    client
        .inner()
        .query("SELECT count() FROM events WHERE project_id = ? AND kind = 'session'")
        .bind(project_id)
        .fetch_one::<u64>()
        .await
        .map_err(query_error)
}

/// Delete everything stored for a project (test cleanup).
pub async fn delete_project_data(client: &ClickHouseClient, project_id: &str) -> Result<()> {
    for table in ["events", "users", "projects"] {
        client
            .inner()
            .query(&format!("ALTER TABLE {table} DELETE WHERE project_id = ?"))
            .bind(project_id)
            .execute()
            .await
            .map_err(|e| Error::store(format!("Delete error: {}", e)))?;
    }
    Ok(())
}
