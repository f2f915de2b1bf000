//! Session materializer.
//!
//! Turns one candidate group into a persisted session:
//! 1. Resolve the session (continue the first event's session or create one)
//! 2. Associate every member event in bounded chunks
//! 3. Recompute and store the session aggregates, latest page, and channel
//! 4. Emit one property snapshot per member

use std::sync::Arc;

use engine_core::properties::keys;
use engine_core::session::latest_page_properties;
use engine_core::store::EventStore;
use engine_core::{
    ChannelClassifier, Error, Event, PropertiesMap, PropertyCodec, PropertySnapshot, Result, SessionAggregate,
    SessionConfig,
};
use serde_json::Value;
use telemetry::metrics;
use tracing::{debug, info, warn};

/// Outcome of looking up the session a group continues.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionResolution {
    Continued(Event),
    New,
}

/// A session after materialization.
#[derive(Debug, Clone)]
pub struct MaterializedSession {
    pub session_id: String,
    pub session_timestamp: i64,
    pub session_count: u64,
    pub continued: bool,
    /// Channel assigned to a new session
    pub channel: Option<String>,
    /// Aggregate of the events associated in this run only
    pub run_aggregate: SessionAggregate,
    /// Aggregate stored on the marker
    pub total_aggregate: SessionAggregate,
    /// Events that received the session reference in this run
    pub associated: usize,
    pub snapshots: Vec<PropertySnapshot>,
}

pub struct SessionMaterializer {
    events: Arc<dyn EventStore>,
    classifier: Arc<dyn ChannelClassifier>,
    codec: Arc<dyn PropertyCodec>,
    config: SessionConfig,
}

impl SessionMaterializer {
    pub fn new(
        events: Arc<dyn EventStore>,
        classifier: Arc<dyn ChannelClassifier>,
        codec: Arc<dyn PropertyCodec>,
        config: SessionConfig,
    ) -> Self {
        Self {
            events,
            classifier,
            codec,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Looks up the session the group's first event already belongs to.
    ///
    /// A missing marker is logged and resolved as a new session.
    pub async fn resolve(&self, project_id: &str, first: &Event) -> Result<SessionResolution> {
        let Some(session_id) = first.session_id.as_deref() else {
            return Ok(SessionResolution::New);
        };

        match self
            .events
            .get_session_marker(project_id, &first.user_id, session_id)
            .await?
        {
            Some(marker) => Ok(SessionResolution::Continued(marker)),
            None => {
                metrics().continuation_misses.inc();
                warn!(
                    project_id = %project_id,
                    user_id = %first.user_id,
                    session_id = %session_id,
                    event_id = %first.id,
                    "Continuation session not found, creating a new session"
                );
                Ok(SessionResolution::New)
            }
        }
    }

    /// Materializes one candidate group.
    ///
    /// `properties` holds the decoded event properties of `members`, index for index.
    pub async fn materialize(
        &self,
        project_id: &str,
        members: &[Event],
        properties: &[PropertiesMap],
    ) -> Result<MaterializedSession> {
        let (Some(first), Some(last)) = (members.first(), properties.last()) else {
            return Err(Error::invalid_argument("empty session group"));
        };
        if members.len() != properties.len() {
            return Err(Error::internal("session group properties out of step with events"));
        }
        let user_id = first.user_id.as_str();

        let (marker, marker_properties, continued) = match self.resolve(project_id, first).await? {
            SessionResolution::Continued(marker) => {
                let stored = self.codec.decode(&marker.properties)?;
                (marker, stored, true)
            }
            SessionResolution::New => {
                let previous = self.events.count_session_markers(project_id, user_id).await?;
                let user_properties = self.codec.decode_optional(first.user_properties.as_deref())?;
                let initial =
                    self.config
                        .initial_session_properties(previous == 0, &properties[0], &user_properties);
                let marker = self
                    .events
                    .create_session_marker(
                        project_id,
                        user_id,
                        first.timestamp - 1,
                        &initial,
                        first.user_properties.as_deref(),
                    )
                    .await?;
                (marker, initial, false)
            }
        };

        let associated = self.associate(project_id, user_id, members, &marker.id).await?;

        // Events that already had a session were counted by an earlier run.
        let run_aggregate = SessionAggregate::from_pages(
            members
                .iter()
                .zip(properties)
                .filter(|(event, _)| event.id != marker.id && !event.has_session())
                .map(|(_, props)| props),
        );
        let total_aggregate = if continued {
            SessionAggregate::from_stored(&marker_properties).plus(run_aggregate)
        } else {
            run_aggregate
        };

        let mut update = PropertiesMap::new();
        total_aggregate.write_to(&mut update);
        match latest_page_properties(last) {
            Some(latest) => update.extend(latest),
            None => info!(
                project_id = %project_id,
                user_id = %user_id,
                session_id = %marker.id,
                "Last session event has no page url"
            ),
        }

        let channel = match self.classifier.classify(project_id, &marker_properties) {
            Ok(channel) => {
                update.insert(keys::CHANNEL.to_string(), Value::String(channel.clone()));
                Some(channel)
            }
            Err(e) => {
                metrics().channel_failures.inc();
                warn!(
                    project_id = %project_id,
                    user_id = %user_id,
                    session_id = %marker.id,
                    error = %e,
                    "Channel classification failed"
                );
                None
            }
        };
        update.insert(keys::SESSION_COUNT.to_string(), Value::from(marker.count));

        self.events
            .update_session_properties(project_id, &marker.id, &update, marker.timestamp + 1)
            .await?;

        if continued {
            metrics().sessions_continued.inc();
        } else {
            metrics().sessions_created.inc();
        }

        debug!(
            project_id = %project_id,
            user_id = %user_id,
            session_id = %marker.id,
            continued,
            members = members.len(),
            associated,
            page_count = total_aggregate.page_count,
            "Materialized session"
        );

        let snapshots = members
            .iter()
            .map(|event| PropertySnapshot {
                event_id: event.id.clone(),
                user_id: event.user_id.clone(),
                session_id: marker.id.clone(),
                session_timestamp: marker.timestamp,
                session_count: marker.count,
                page_count: run_aggregate.page_count,
                spent_time: run_aggregate.spent_time,
                channel: if continued { None } else { channel.clone() },
                event_user_properties: event.user_properties.clone(),
            })
            .collect();

        Ok(MaterializedSession {
            session_id: marker.id,
            session_timestamp: marker.timestamp,
            session_count: marker.count,
            continued,
            channel: if continued { None } else { channel },
            run_aggregate,
            total_aggregate,
            associated,
            snapshots,
        })
    }

    /// Associates the members to the session in chunks of the configured size.
    async fn associate(&self, project_id: &str, user_id: &str, members: &[Event], session_id: &str) -> Result<usize> {
        let ids: Vec<String> = members
            .iter()
            .filter(|event| event.session_id.as_deref() != Some(session_id))
            .map(|event| event.id.clone())
            .collect();

        for chunk in ids.chunks(self.config.association_batch_size.max(1)) {
            self.events
                .associate_events(project_id, user_id, chunk, session_id)
                .await?;
        }

        Ok(ids.len())
    }
}
