//! Session boundary detection.
//!
//! Partitions one user's ordered events into candidate groups, each of which
//! becomes one session. The scan is an explicit state machine:
//!
//! - `Scanning`: the current event joins the open group, keep going
//! - `ChainMatching`: the next event matches the group's attribution, keep going
//! - `Closing`: the open group ends at the current event

use crate::attribution::AttributionConfig;
use crate::properties::PropertiesMap;

/// The detector's view of one event.
#[derive(Debug, Clone, Copy)]
pub struct ScanEvent<'a> {
    pub timestamp: i64,
    pub has_session: bool,
    pub properties: &'a PropertiesMap,
}

/// Why a group was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The closing event is an attributed page view
    Attribution,
    /// The gap to the next event exceeds the inactivity threshold
    Inactivity,
    EndOfEvents,
    /// The next event does not continue the attribution chain
    ChainBroken,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attribution => "attribution",
            Self::Inactivity => "inactivity",
            Self::EndOfEvents => "end_of_events",
            Self::ChainBroken => "chain_broken",
        }
    }

    fn signals_new_session(&self) -> bool {
        matches!(self, Self::Attribution | Self::Inactivity)
    }
}

/// An inclusive `[start, end]` range over the scanned events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateGroup {
    pub start: usize,
    pub end: usize,
    pub reason: CloseReason,
}

impl CandidateGroup {
    pub fn event_count(&self) -> usize {
        self.end - self.start + 1
    }
}

/// Result of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub groups: Vec<CandidateGroup>,
    /// Trailing event held out of the last group. It must be scanned again on its own.
    pub deferred: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Scanning,
    ChainMatching,
    Closing(CloseReason),
}

/// Mutable scan position.
#[derive(Debug, Default)]
struct Cursor {
    /// First index of the open group, also the attribution anchor
    start: usize,
    /// An attribution chain has matched since the last new session
    chain_on: bool,
}

pub struct BoundaryDetector<'c> {
    attribution: &'c AttributionConfig,
    inactivity_threshold_secs: i64,
}

impl<'c> BoundaryDetector<'c> {
    pub fn new(attribution: &'c AttributionConfig, inactivity_threshold_secs: i64) -> Self {
        Self {
            attribution,
            inactivity_threshold_secs,
        }
    }

    /// Scans events ordered by (timestamp, creation order).
    pub fn detect(&self, events: &[ScanEvent<'_>]) -> Detection {
        let mut detection = Detection::default();
        let mut cursor = Cursor::default();
        let n = events.len();

        for i in 0..n {
            let reason = match self.transition(events, &mut cursor, i) {
                ScanState::Scanning | ScanState::ChainMatching => continue,
                ScanState::Closing(reason) => reason,
            };

            let is_last = i + 1 == n;
            let defer = is_last
                && reason.signals_new_session()
                && n > 1
                && cursor.start != i
                && !cursor.chain_on;

            if defer {
                detection.groups.push(CandidateGroup {
                    start: cursor.start,
                    end: i - 1,
                    reason,
                });
                detection.deferred = Some(i);
            } else {
                detection.groups.push(CandidateGroup {
                    start: cursor.start,
                    end: i,
                    reason,
                });
            }

            // A group starting without a session creates a new one.
            if !events[cursor.start].has_session {
                cursor.chain_on = false;
            }
            cursor.start = i + 1;
        }

        detection
    }

    fn transition(&self, events: &[ScanEvent<'_>], cursor: &mut Cursor, i: usize) -> ScanState {
        let n = events.len();
        let current = &events[i];
        let is_last = i + 1 == n;
        let gap = (i == 0 && n == 1)
            || (!is_last
                && events[i + 1].timestamp - current.timestamp > self.inactivity_threshold_secs);
        let mut attributed = self.attribution.is_attributed_page_view(current.properties);

        // A continued session is not split because its first known event is attributed.
        if i == 0 && n > 1 && attributed && current.has_session && !gap {
            return ScanState::Scanning;
        }

        let mut back_match = false;
        if !gap && !current.has_session {
            if i > 0
                && self
                    .attribution
                    .attribution_matches(events[i - 1].properties, current.properties)
            {
                attributed = false;
                cursor.chain_on = true;
                back_match = true;
            }
            if i == 0 {
                back_match = true;
            }

            let anchor = &events[cursor.start];
            if !is_last
                && self
                    .attribution
                    .attribution_matches(anchor.properties, events[i + 1].properties)
            {
                return ScanState::ChainMatching;
            }
        }

        if attributed {
            ScanState::Closing(CloseReason::Attribution)
        } else if gap {
            ScanState::Closing(CloseReason::Inactivity)
        } else if is_last {
            ScanState::Closing(CloseReason::EndOfEvents)
        } else if back_match {
            ScanState::Closing(CloseReason::ChainBroken)
        } else {
            ScanState::Scanning
        }
    }
}

/// Upper bound of the events a run may materialize.
///
/// Events after the bound are left for a later run so stragglers can arrive
/// before the session is closed.
pub fn effective_end(start: i64, last: i64, now: i64, buffer_secs: i64) -> i64 {
    let end = last - buffer_secs;
    if end < now - buffer_secs || end <= start {
        last
    } else {
        end
    }
}

/// A continuation event is dropped when the next event starts a fresh marketing touch.
pub fn should_drop_continuation(events: &[ScanEvent<'_>], attribution: &AttributionConfig) -> bool {
    events.len() > 1
        && events[0].has_session
        && attribution.is_attributed_page_view(events[1].properties)
}
