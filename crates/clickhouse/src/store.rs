//! ClickHouse implementation of the event, user, and project stores.

use std::time::Instant;

use async_trait::async_trait;
use clickhouse::Row;
use engine_core::store::{EventStore, ProjectStore, UserEvents, UserStore};
use engine_core::{Error, Event, EventKind, JsonCodec, PropertiesMap, PropertyCodec, Result, UserRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use telemetry::metrics;
use tracing::debug;

use crate::client::ClickHouseClient;

/// Key of the checkpoint inside the project settings document.
pub const SESSION_CHECKPOINT_KEY: &str = "session_checkpoint";

const EVENT_COLUMNS: &str =
    "id, project_id, user_id, kind, timestamp, created_at, properties, user_properties, session_id, count, skip_session";

const USER_COLUMNS: &str =
    "id, project_id, customer_user_id, properties, properties_updated_timestamp, join_timestamp, created_at";

/// Row of the events table.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct EventRow {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub kind: String,
    pub timestamp: i64,
    pub created_at: i64,
    pub properties: String,
    pub user_properties: Option<String>,
    pub session_id: Option<String>,
    pub count: u64,
    pub skip_session: u8,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event {
            id: row.id,
            project_id: row.project_id,
            user_id: row.user_id,
            kind: EventKind::from_label(&row.kind),
            timestamp: row.timestamp,
            created_at: row.created_at,
            properties: row.properties,
            user_properties: row.user_properties,
            session_id: row.session_id.filter(|s| !s.is_empty()),
            count: row.count,
        }
    }
}

impl From<&Event> for EventRow {
    fn from(event: &Event) -> Self {
        EventRow {
            id: event.id.clone(),
            project_id: event.project_id.clone(),
            user_id: event.user_id.clone(),
            kind: event.kind.as_str().to_string(),
            timestamp: event.timestamp,
            created_at: event.created_at,
            properties: event.properties.clone(),
            user_properties: event.user_properties.clone(),
            session_id: event.session_id.clone(),
            count: event.count,
            skip_session: 0,
        }
    }
}

/// Row of the users table.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct UserRow {
    pub id: String,
    pub project_id: String,
    pub customer_user_id: Option<String>,
    pub properties: String,
    pub properties_updated_timestamp: i64,
    pub join_timestamp: i64,
    pub created_at: i64,
}

impl From<UserRow> for UserRecord {
    fn from(row: UserRow) -> Self {
        UserRecord {
            id: row.id,
            project_id: row.project_id,
            customer_user_id: row.customer_user_id,
            properties: row.properties,
            properties_updated_timestamp: row.properties_updated_timestamp,
            join_timestamp: row.join_timestamp,
            created_at: row.created_at,
        }
    }
}

impl From<&UserRecord> for UserRow {
    fn from(user: &UserRecord) -> Self {
        UserRow {
            id: user.id.clone(),
            project_id: user.project_id.clone(),
            customer_user_id: user.customer_user_id.clone(),
            properties: user.properties.clone(),
            properties_updated_timestamp: user.properties_updated_timestamp,
            join_timestamp: user.join_timestamp,
            created_at: user.created_at,
        }
    }
}

/// Row of the projects table.
#[derive(Debug, Clone, Row, Serialize, Deserialize)]
pub struct ProjectRow {
    pub project_id: String,
    pub created_at: i64,
    pub settings: String,
    pub version: u64,
}

fn query_error(e: clickhouse::error::Error) -> Error {
    Error::store(format!("Query error: {}", e))
}

/// Event, user, and project store backed by ClickHouse.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: ClickHouseClient,
    codec: JsonCodec,
}

impl ClickHouseStore {
    pub fn new(client: ClickHouseClient) -> Self {
        Self {
            client,
            codec: JsonCodec,
        }
    }

    pub fn client(&self) -> &ClickHouseClient {
        &self.client
    }

    async fn project_row(&self, project_id: &str) -> Result<Option<ProjectRow>> {
        self.client
            .inner()
            .query("SELECT project_id, created_at, settings, version FROM projects FINAL WHERE project_id = ?")
            .bind(project_id)
            .fetch_optional::<ProjectRow>()
            .await
            .map_err(query_error)
    }
}

fn observe(start: Instant) {
    metrics().store_latency_ms.observe(start.elapsed().as_millis() as u64);
}

#[async_trait]
impl EventStore for ClickHouseStore {
    async fn fetch_user_events_in_window(&self, project_id: &str, start: i64, end: i64) -> Result<UserEvents> {
        let started = Instant::now();
        let rows: Vec<EventRow> = self
            .client
            .inner()
            .query(&format!(
                "SELECT {EVENT_COLUMNS} FROM events \
                 WHERE project_id = ? AND kind = 'event' AND skip_session = 0 \
                 AND (session_id IS NULL OR session_id = '') \
                 AND timestamp >= ? AND timestamp <= ? \
                 ORDER BY user_id, timestamp, created_at"
            ))
            .bind(project_id)
            .bind(start)
            .bind(end)
            .fetch_all()
            .await
            .map_err(query_error)?;
        observe(started);

        let mut grouped = UserEvents::new();
        for row in rows {
            grouped.entry(row.user_id.clone()).or_default().push(Event::from(row));
        }

        debug!(
            project_id = %project_id,
            users = grouped.len(),
            start,
            end,
            "Fetched un-sessioned events"
        );
        Ok(grouped)
    }

    async fn last_event_with_session(
        &self,
        project_id: &str,
        user_id: &str,
        before_timestamp: i64,
    ) -> Result<Option<Event>> {
        let row: Option<EventRow> = self
            .client
            .inner()
            .query(&format!(
                "SELECT {EVENT_COLUMNS} FROM events \
                 WHERE project_id = ? AND user_id = ? AND kind = 'event' \
                 AND session_id IS NOT NULL AND session_id != '' AND timestamp < ? \
                 ORDER BY timestamp DESC, created_at DESC LIMIT 1"
            ))
            .bind(project_id)
            .bind(user_id)
            .bind(before_timestamp)
            .fetch_optional()
            .await
            .map_err(query_error)?;
        Ok(row.map(Event::from))
    }

    async fn get_session_marker(&self, project_id: &str, user_id: &str, session_id: &str) -> Result<Option<Event>> {
        let row: Option<EventRow> = self
            .client
            .inner()
            .query(&format!(
                "SELECT {EVENT_COLUMNS} FROM events \
                 WHERE project_id = ? AND user_id = ? AND id = ? AND kind = 'session' LIMIT 1"
            ))
            .bind(project_id)
            .bind(user_id)
            .bind(session_id)
            .fetch_optional()
            .await
            .map_err(query_error)?;
        Ok(row.map(Event::from))
    }

    async fn count_session_markers(&self, project_id: &str, user_id: &str) -> Result<u64> {
        self.client
            .inner()
            .query("SELECT count() FROM events WHERE project_id = ? AND user_id = ? AND kind = 'session'")
            .bind(project_id)
            .bind(user_id)
            .fetch_one::<u64>()
            .await
            .map_err(query_error)
    }

    async fn create_session_marker(
        &self,
        project_id: &str,
        user_id: &str,
        timestamp: i64,
        properties: &PropertiesMap,
        user_properties: Option<&str>,
    ) -> Result<Event> {
        let started = Instant::now();
        let count = self.count_session_markers(project_id, user_id).await? + 1;
        let marker = Event {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            user_id: user_id.to_string(),
            kind: EventKind::SessionMarker,
            timestamp,
            created_at: chrono::Utc::now().timestamp(),
            properties: self.codec.encode(properties)?,
            user_properties: user_properties.map(str::to_string),
            session_id: None,
            count,
        };

        let mut insert = self
            .client
            .inner()
            .insert("events")
            .map_err(|e| Error::store(format!("Insert error: {}", e)))?;
        insert
            .write(&EventRow::from(&marker))
            .await
            .map_err(|e| Error::store(format!("Write error: {}", e)))?;
        insert
            .end()
            .await
            .map_err(|e| Error::store(format!("End error: {}", e)))?;
        observe(started);

        debug!(
            project_id = %project_id,
            user_id = %user_id,
            session_id = %marker.id,
            count,
            "Created session marker"
        );
        Ok(marker)
    }

    async fn associate_events(
        &self,
        project_id: &str,
        user_id: &str,
        event_ids: &[String],
        session_id: &str,
    ) -> Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        self.client
            .inner()
            .query("ALTER TABLE events UPDATE session_id = ? WHERE project_id = ? AND user_id = ? AND has(?, id)")
            .bind(session_id)
            .bind(project_id)
            .bind(user_id)
            .bind(event_ids)
            .execute()
            .await
            .map_err(query_error)?;
        observe(started);
        Ok(())
    }

    async fn update_session_properties(
        &self,
        project_id: &str,
        session_id: &str,
        properties: &PropertiesMap,
        update_timestamp: i64,
    ) -> Result<()> {
        let stored: Option<String> = self
            .client
            .inner()
            .query("SELECT properties FROM events WHERE project_id = ? AND id = ? AND kind = 'session' LIMIT 1")
            .bind(project_id)
            .bind(session_id)
            .fetch_optional()
            .await
            .map_err(query_error)?;
        let Some(stored) = stored else {
            return Err(Error::not_found(format!("session {}", session_id)));
        };

        let mut merged = self.codec.decode(&stored)?;
        for (key, value) in properties {
            merged.insert(key.clone(), value.clone());
        }

        self.client
            .inner()
            .query(
                "ALTER TABLE events UPDATE properties = ?, \
                 properties_updated_timestamp = greatest(properties_updated_timestamp, ?) \
                 WHERE project_id = ? AND id = ?",
            )
            .bind(self.codec.encode(&merged)?)
            .bind(update_timestamp)
            .bind(project_id)
            .bind(session_id)
            .execute()
            .await
            .map_err(query_error)?;
        Ok(())
    }
}

#[async_trait]
impl UserStore for ClickHouseStore {
    async fn get_user(&self, project_id: &str, user_id: &str) -> Result<Option<UserRecord>> {
        let row: Option<UserRow> = self
            .client
            .inner()
            .query(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE project_id = ? AND id = ? LIMIT 1"
            ))
            .bind(project_id)
            .bind(user_id)
            .fetch_optional()
            .await
            .map_err(query_error)?;
        Ok(row.map(UserRecord::from))
    }

    async fn get_records_by_customer_identity(
        &self,
        project_id: &str,
        customer_user_id: &str,
    ) -> Result<Vec<UserRecord>> {
        let rows: Vec<UserRow> = self
            .client
            .inner()
            .query(&format!(
                "SELECT {USER_COLUMNS} FROM users \
                 WHERE project_id = ? AND customer_user_id = ? \
                 ORDER BY created_at, id"
            ))
            .bind(project_id)
            .bind(customer_user_id)
            .fetch_all()
            .await
            .map_err(query_error)?;
        Ok(rows.into_iter().map(UserRecord::from).collect())
    }

    async fn overwrite_record_properties(
        &self,
        project_id: &str,
        user_id: &str,
        properties: &PropertiesMap,
        update_timestamp: i64,
    ) -> Result<()> {
        let started = Instant::now();
        self.client
            .inner()
            .query(
                "ALTER TABLE users UPDATE properties = ?, \
                 properties_updated_timestamp = greatest(properties_updated_timestamp, ?) \
                 WHERE project_id = ? AND id = ?",
            )
            .bind(self.codec.encode(properties)?)
            .bind(update_timestamp)
            .bind(project_id)
            .bind(user_id)
            .execute()
            .await
            .map_err(query_error)?;
        observe(started);
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for ClickHouseStore {
    async fn list_project_ids(&self) -> Result<Vec<String>> {
        self.client
            .inner()
            .query("SELECT project_id FROM projects FINAL ORDER BY project_id")
            .fetch_all::<String>()
            .await
            .map_err(query_error)
    }

    async fn project_created_at(&self, project_id: &str) -> Result<Option<i64>> {
        Ok(self.project_row(project_id).await?.map(|row| row.created_at))
    }

    async fn next_session_start(&self, project_id: &str) -> Result<Option<i64>> {
        let Some(row) = self.project_row(project_id).await? else {
            return Ok(None);
        };
        let settings = self.codec.decode(&row.settings)?;
        Ok(settings.get(SESSION_CHECKPOINT_KEY).and_then(Value::as_i64))
    }

    async fn set_next_session_start(&self, project_id: &str, timestamp: i64) -> Result<()> {
        let Some(row) = self.project_row(project_id).await? else {
            return Err(Error::not_found(format!("project {}", project_id)));
        };

        let mut settings = self.codec.decode(&row.settings)?;
        settings.insert(SESSION_CHECKPOINT_KEY.to_string(), Value::from(timestamp));
        let updated = ProjectRow {
            settings: self.codec.encode(&settings)?,
            version: row.version + 1,
            ..row
        };

        let mut insert = self
            .client
            .inner()
            .insert("projects")
            .map_err(|e| Error::store(format!("Insert error: {}", e)))?;
        insert
            .write(&updated)
            .await
            .map_err(|e| Error::store(format!("Write error: {}", e)))?;
        insert
            .end()
            .await
            .map_err(|e| Error::store(format!("End error: {}", e)))?;

        metrics().last_checkpoint.set(timestamp.max(0) as u64);
        debug!(project_id = %project_id, checkpoint = timestamp, "Advanced session checkpoint");
        Ok(())
    }
}
