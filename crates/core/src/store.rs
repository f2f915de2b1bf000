//! Collaborator interfaces over the event, user, and project stores.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::events::{Event, UserRecord};
use crate::properties::PropertiesMap;

/// Events of one project grouped by user, each list ordered by (timestamp, creation order).
pub type UserEvents = BTreeMap<String, Vec<Event>>;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Un-sessioned events in `[start, end]`, excluding session markers and
    /// events flagged to skip sessions.
    async fn fetch_user_events_in_window(&self, project_id: &str, start: i64, end: i64) -> Result<UserEvents>;

    /// Latest event of the user that already belongs to a session and happened
    /// before `before_timestamp`.
    async fn last_event_with_session(
        &self,
        project_id: &str,
        user_id: &str,
        before_timestamp: i64,
    ) -> Result<Option<Event>>;

    async fn get_session_marker(&self, project_id: &str, user_id: &str, session_id: &str) -> Result<Option<Event>>;

    async fn count_session_markers(&self, project_id: &str, user_id: &str) -> Result<u64>;

    /// Creates a marker whose `count` is the user's next session sequence number.
    async fn create_session_marker(
        &self,
        project_id: &str,
        user_id: &str,
        timestamp: i64,
        properties: &PropertiesMap,
        user_properties: Option<&str>,
    ) -> Result<Event>;

    /// Sets the session reference of one chunk of events.
    async fn associate_events(&self, project_id: &str, user_id: &str, event_ids: &[String], session_id: &str)
        -> Result<()>;

    /// Merges the given keys into the marker's stored properties.
    async fn update_session_properties(
        &self,
        project_id: &str,
        session_id: &str,
        properties: &PropertiesMap,
        update_timestamp: i64,
    ) -> Result<()>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, project_id: &str, user_id: &str) -> Result<Option<UserRecord>>;

    /// All records sharing the customer identity, ordered by creation.
    async fn get_records_by_customer_identity(&self, project_id: &str, customer_user_id: &str)
        -> Result<Vec<UserRecord>>;

    /// Replaces the record's properties. The updated timestamp only moves forward.
    async fn overwrite_record_properties(
        &self,
        project_id: &str,
        user_id: &str,
        properties: &PropertiesMap,
        update_timestamp: i64,
    ) -> Result<()>;
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn list_project_ids(&self) -> Result<Vec<String>>;

    async fn project_created_at(&self, project_id: &str) -> Result<Option<i64>>;

    /// Persisted checkpoint. `None` means start from project creation.
    async fn next_session_start(&self, project_id: &str) -> Result<Option<i64>>;

    async fn set_next_session_start(&self, project_id: &str, timestamp: i64) -> Result<()>;
}
