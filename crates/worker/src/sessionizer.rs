//! Per-user session run.
//!
//! Boundary detection and materialization for one user's un-sessioned
//! events, followed by the user-level session rollups.

use std::sync::Arc;
use std::time::Instant;

use engine_core::boundary::{effective_end, should_drop_continuation};
use engine_core::store::EventStore;
use engine_core::{
    sort_events, AttributionConfig, BoundaryDetector, Event, PropertiesMap, PropertyCodec, PropertySnapshot, Result,
    RunStatus, ScanEvent,
};
use serde::Serialize;
use telemetry::metrics;
use tracing::{debug, info};

use crate::identity::PropertyMerger;
use crate::materializer::{MaterializedSession, SessionMaterializer};

/// Result of one user run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UserRunOutcome {
    pub user_id: String,
    /// Un-sessioned events handed to the run
    pub events_downloaded: usize,
    /// Events left after window filtering, continuation event excluded
    pub events_processed: usize,
    pub sessions_created: usize,
    pub continued: bool,
    pub user_properties_updated: usize,
    /// Timestamp of the last processed event
    pub last_event_timestamp: Option<i64>,
    #[serde(skip)]
    pub snapshots: Vec<PropertySnapshot>,
}

impl UserRunOutcome {
    pub fn status(&self) -> RunStatus {
        if self.events_processed == 0 {
            RunStatus::NotModified
        } else {
            RunStatus::Ok
        }
    }
}

pub struct UserSessionizer {
    events: Arc<dyn EventStore>,
    materializer: Arc<SessionMaterializer>,
    merger: Arc<PropertyMerger>,
    codec: Arc<dyn PropertyCodec>,
    attribution: AttributionConfig,
}

impl UserSessionizer {
    pub fn new(
        events: Arc<dyn EventStore>,
        materializer: Arc<SessionMaterializer>,
        merger: Arc<PropertyMerger>,
        codec: Arc<dyn PropertyCodec>,
        attribution: AttributionConfig,
    ) -> Self {
        Self {
            events,
            materializer,
            merger,
            codec,
            attribution,
        }
    }

    /// Sessionizes one user's events.
    ///
    /// Sessions materialized before a failure stay in place; a re-run picks
    /// them up through continuation.
    pub async fn run(&self, project_id: &str, user_id: &str, mut events: Vec<Event>, now: i64) -> Result<UserRunOutcome> {
        let started = Instant::now();
        let mut outcome = UserRunOutcome {
            user_id: user_id.to_string(),
            events_downloaded: events.len(),
            ..Default::default()
        };
        if events.is_empty() {
            return Ok(outcome);
        }

        sort_events(&mut events);
        let first_timestamp = events[0].timestamp;
        if let Some(previous) = self
            .events
            .last_event_with_session(project_id, user_id, first_timestamp)
            .await?
        {
            events.insert(0, previous);
        }

        let session_config = self.materializer.config();
        let last_timestamp = events[events.len() - 1].timestamp;
        let end = effective_end(first_timestamp, last_timestamp, now, session_config.buffer_secs);
        events.retain(|event| event.timestamp <= end);

        let mut properties = events
            .iter()
            .map(|event| self.codec.decode(&event.properties))
            .collect::<Result<Vec<PropertiesMap>>>()?;

        let drop_first = should_drop_continuation(&scan_events(&events, &properties), &self.attribution);
        if drop_first {
            debug!(project_id = %project_id, user_id = %user_id, "Dropping continuation event before new attribution");
            events.remove(0);
            properties.remove(0);
        }

        outcome.events_processed = events.iter().filter(|event| !event.has_session()).count();
        outcome.last_event_timestamp = events.last().map(|event| event.timestamp);
        if outcome.events_processed == 0 {
            return Ok(outcome);
        }

        let detector = BoundaryDetector::new(&self.attribution, session_config.inactivity_threshold_secs);
        let detection = detector.detect(&scan_events(&events, &properties));

        for group in &detection.groups {
            debug!(
                project_id = %project_id,
                user_id = %user_id,
                events = group.event_count(),
                reason = group.reason.as_str(),
                "Session boundary"
            );
            let session = self
                .materializer
                .materialize(
                    project_id,
                    &events[group.start..=group.end],
                    &properties[group.start..=group.end],
                )
                .await?;
            record(&mut outcome, session);
        }

        if let Some(index) = detection.deferred {
            // The held-out trailing event is scanned again on its own and
            // always forms a group by itself.
            let rerun = detector.detect(&scan_events(&events[index..=index], &properties[index..=index]));
            for group in &rerun.groups {
                let start = index + group.start;
                let end = index + group.end;
                let session = self
                    .materializer
                    .materialize(project_id, &events[start..=end], &properties[start..=end])
                    .await?;
                record(&mut outcome, session);
            }
        }

        outcome.user_properties_updated = self
            .merger
            .apply_session_rollups(project_id, &outcome.snapshots, now)
            .await?;

        metrics().events_processed.inc_by(outcome.events_processed as u64);
        metrics().user_run_latency_ms.observe(started.elapsed().as_millis() as u64);
        info!(
            project_id = %project_id,
            user_id = %user_id,
            events = outcome.events_processed,
            sessions_created = outcome.sessions_created,
            continued = outcome.continued,
            "User sessionized"
        );
        Ok(outcome)
    }
}

fn scan_events<'a>(events: &[Event], properties: &'a [PropertiesMap]) -> Vec<ScanEvent<'a>> {
    events
        .iter()
        .zip(properties)
        .map(|(event, properties)| ScanEvent {
            timestamp: event.timestamp,
            has_session: event.has_session(),
            properties,
        })
        .collect()
}

fn record(outcome: &mut UserRunOutcome, session: MaterializedSession) {
    if session.continued {
        outcome.continued = true;
    } else {
        outcome.sessions_created += 1;
    }
    outcome.snapshots.extend(session.snapshots);
}
