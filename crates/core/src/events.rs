//! Event, user record, and snapshot definitions.

use serde::{Deserialize, Serialize};

/// Kind of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Ordinary,
    SessionMarker,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ordinary => "event",
            Self::SessionMarker => "session",
        }
    }

    /// Parses the stored kind label. Unknown labels are treated as ordinary events.
    pub fn from_label(label: &str) -> Self {
        match label {
            "session" => Self::SessionMarker,
            _ => Self::Ordinary,
        }
    }
}

/// A timestamped user interaction event, or a session marker.
///
/// Property blobs stay encoded until a component needs them, so a malformed
/// blob only fails the run that touches it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub kind: EventKind,
    /// Unix seconds
    pub timestamp: i64,
    /// Insertion order tiebreak for events within the same second
    pub created_at: i64,
    /// Encoded event properties
    pub properties: String,
    /// Encoded user property snapshot taken at ingestion
    pub user_properties: Option<String>,
    /// Session marker this event belongs to. Always `None` on a marker.
    pub session_id: Option<String>,
    /// Per-user sequence number for markers (Nth session), occurrence count otherwise
    pub count: u64,
}

impl Event {
    pub fn is_session_marker(&self) -> bool {
        self.kind == EventKind::SessionMarker
    }

    pub fn has_session(&self) -> bool {
        self.session_id.is_some()
    }
}

/// Orders events by (timestamp, creation order).
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.created_at.cmp(&b.created_at))
    });
}

/// A user record. Several records may share one customer identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub project_id: String,
    /// `None` until the user is identified
    pub customer_user_id: Option<String>,
    /// Encoded user properties
    pub properties: String,
    pub properties_updated_timestamp: i64,
    pub join_timestamp: i64,
    pub created_at: i64,
}

impl UserRecord {
    /// Customer identity, treating the empty string as unidentified.
    pub fn customer_identity(&self) -> Option<&str> {
        self.customer_user_id.as_deref().filter(|c| !c.is_empty())
    }
}

/// Per-event record of the session an event was materialized into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySnapshot {
    pub event_id: String,
    pub user_id: String,
    pub session_id: String,
    pub session_timestamp: i64,
    /// Per-user session sequence number
    pub session_count: u64,
    /// Page count from this run only, not the cumulative aggregate
    pub page_count: f64,
    /// Spent time from this run only, not the cumulative aggregate
    pub spent_time: f64,
    /// Channel, only set when the session was newly created
    pub channel: Option<String>,
    pub event_user_properties: Option<String>,
}
