//! Session configuration and session property rules.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::properties::{keys, number_value, numeric_or_zero, PropertiesMap};

/// Default inactivity threshold (30 minutes).
pub const DEFAULT_INACTIVITY_THRESHOLD_SECS: i64 = 1800;

/// Default number of events associated per statement.
pub const DEFAULT_ASSOCIATION_BATCH_SIZE: usize = 100;

/// Session construction settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SessionConfig {
    /// Gap beyond which two consecutive events never share a session
    #[serde(default = "default_inactivity_threshold_secs")]
    #[validate(range(min = 1))]
    pub inactivity_threshold_secs: i64,
    /// Hold-back before a session is closed
    #[serde(default)]
    #[validate(range(min = 0))]
    pub buffer_secs: i64,
    /// Events associated per statement
    #[serde(default = "default_association_batch_size")]
    #[validate(range(min = 1, max = 10000))]
    pub association_batch_size: usize,
    /// User properties copied onto a new session
    #[serde(default = "default_user_to_session_properties")]
    pub user_to_session_properties: Vec<String>,
    /// Event property to session property renames applied to a new session
    #[serde(default = "default_event_to_session_properties")]
    pub event_to_session_properties: BTreeMap<String, String>,
}

fn default_inactivity_threshold_secs() -> i64 {
    DEFAULT_INACTIVITY_THRESHOLD_SECS
}

fn default_association_batch_size() -> usize {
    DEFAULT_ASSOCIATION_BATCH_SIZE
}

fn default_user_to_session_properties() -> Vec<String> {
    [
        keys::PLATFORM,
        keys::BROWSER,
        keys::BROWSER_VERSION,
        keys::BROWSER_WITH_VERSION,
        keys::USER_AGENT,
        keys::OS,
        keys::OS_VERSION,
        keys::OS_WITH_VERSION,
        keys::COUNTRY,
        keys::CITY,
        keys::CONTINENT,
        keys::POSTAL_CODE,
        keys::REGION,
        keys::TIMEZONE,
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
}

fn default_event_to_session_properties() -> BTreeMap<String, String> {
    let renamed = [
        (keys::PAGE_URL, keys::INITIAL_PAGE_URL),
        (keys::PAGE_RAW_URL, keys::INITIAL_PAGE_RAW_URL),
        (keys::PAGE_DOMAIN, keys::INITIAL_PAGE_DOMAIN),
        (keys::PAGE_LOAD_TIME, keys::INITIAL_PAGE_LOAD_TIME),
        (keys::PAGE_SPENT_TIME, keys::INITIAL_PAGE_SPENT_TIME),
        (keys::PAGE_SCROLL_PERCENT, keys::INITIAL_PAGE_SCROLL_PERCENT),
        (keys::REFERRER, keys::INITIAL_REFERRER),
        (keys::REFERRER_URL, keys::INITIAL_REFERRER_URL),
        (keys::REFERRER_DOMAIN, keys::INITIAL_REFERRER_DOMAIN),
    ];
    let same_name = [
        keys::CAMPAIGN,
        keys::CAMPAIGN_ID,
        keys::SOURCE,
        keys::MEDIUM,
        keys::KEYWORD,
        keys::KEYWORD_MATCH_TYPE,
        keys::TERM,
        keys::CONTENT,
        keys::ADGROUP,
        keys::ADGROUP_ID,
        keys::AD,
        keys::AD_ID,
        keys::CREATIVE,
        keys::GCLID,
        keys::FBCLID,
    ];

    renamed
        .iter()
        .map(|(from, to)| (from.to_string(), to.to_string()))
        .chain(same_name.iter().map(|k| (k.to_string(), k.to_string())))
        .collect()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_threshold_secs: default_inactivity_threshold_secs(),
            buffer_secs: 0,
            association_batch_size: default_association_batch_size(),
            user_to_session_properties: default_user_to_session_properties(),
            event_to_session_properties: default_event_to_session_properties(),
        }
    }
}

impl SessionConfig {
    /// Properties of a newly created session marker.
    ///
    /// The first session of a user additionally carries `$is_first_session`.
    pub fn initial_session_properties(
        &self,
        is_first_session: bool,
        event_properties: &PropertiesMap,
        user_properties: &PropertiesMap,
    ) -> PropertiesMap {
        let mut session = PropertiesMap::new();
        if is_first_session {
            session.insert(keys::IS_FIRST_SESSION.to_string(), Value::Bool(true));
        }

        for key in &self.user_to_session_properties {
            if let Some(value) = user_properties.get(key) {
                session.insert(key.clone(), value.clone());
            }
        }

        for (from, to) in &self.event_to_session_properties {
            if let Some(value) = event_properties.get(from) {
                session.insert(to.clone(), value.clone());
            }
        }

        session
    }
}

/// Page count and spent time of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionAggregate {
    pub page_count: f64,
    pub spent_time: f64,
}

impl SessionAggregate {
    /// Aggregates the given page events. Negative spent times count as zero.
    pub fn from_pages<'a>(pages: impl IntoIterator<Item = &'a PropertiesMap>) -> Self {
        pages
            .into_iter()
            .fold(Self::default(), |acc, properties| Self {
                page_count: acc.page_count + 1.0,
                spent_time: acc.spent_time + numeric_or_zero(properties, keys::PAGE_SPENT_TIME).max(0.0),
            })
    }

    /// Aggregate previously stored on a session marker.
    pub fn from_stored(marker_properties: &PropertiesMap) -> Self {
        Self {
            page_count: numeric_or_zero(marker_properties, keys::PAGE_COUNT).max(0.0),
            spent_time: numeric_or_zero(marker_properties, keys::SESSION_SPENT_TIME).max(0.0),
        }
    }

    pub fn plus(self, other: Self) -> Self {
        Self {
            page_count: self.page_count + other.page_count,
            spent_time: self.spent_time + other.spent_time,
        }
    }

    pub fn write_to(&self, properties: &mut PropertiesMap) {
        properties.insert(keys::PAGE_COUNT.to_string(), number_value(self.page_count));
        properties.insert(
            keys::SESSION_SPENT_TIME.to_string(),
            number_value(self.spent_time),
        );
    }
}

/// Latest page of a session, taken from its last member event.
///
/// Returns `None` when the event carries neither a raw nor a normalized URL.
pub fn latest_page_properties(last_event: &PropertiesMap) -> Option<PropertiesMap> {
    let mut latest = PropertiesMap::new();
    if let Some(raw) = last_event.get(keys::PAGE_RAW_URL) {
        latest.insert(keys::SESSION_LATEST_PAGE_RAW_URL.to_string(), raw.clone());
    }
    if let Some(url) = last_event.get(keys::PAGE_URL) {
        latest.insert(keys::SESSION_LATEST_PAGE_URL.to_string(), url.clone());
    }

    if latest.is_empty() {
        None
    } else {
        Some(latest)
    }
}
