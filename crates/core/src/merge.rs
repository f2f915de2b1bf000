//! User property merge rules.
//!
//! Records sharing one customer identity are reconciled into a single
//! property map. Initial-only properties come from the earliest joined
//! record, additive properties are summed, everything else is last writer
//! wins with empty values never replacing a known one.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::properties::{display_value, is_empty_value, keys, number_value, round_to, value_as_f64, PropertiesMap};

/// Default bound on the records taking part in one merge.
pub const DEFAULT_MAX_MERGE_RECORDS: usize = 100;

const ADDITIVE_PRECISION: i32 = 2;

/// Property classes with special merge treatment.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MergeConfig {
    /// Taken once from the earliest joined record
    #[serde(default = "default_initial_properties")]
    pub initial_properties: Vec<String>,
    /// Summed across records
    #[serde(default = "default_additive_properties")]
    pub additive_properties: Vec<String>,
    /// Kept per record on write-back
    #[serde(default = "default_write_back_exceptions")]
    pub write_back_exceptions: Vec<String>,
    #[serde(default = "default_max_records")]
    #[validate(range(min = 2, max = 10000))]
    pub max_records: usize,
}

fn default_initial_properties() -> Vec<String> {
    [
        keys::DAY_OF_FIRST_EVENT,
        keys::HOUR_OF_FIRST_EVENT,
        "$initial_adgroup",
        "$initial_adgroup_id",
        "$initial_campaign",
        "$initial_campaign_id",
        "$initial_content",
        "$initial_creative",
        "$initial_fbclid",
        "$initial_gclid",
        "$initial_keyword",
        "$initial_keyword_match_type",
        "$initial_term",
        "$initial_medium",
        keys::INITIAL_PAGE_DOMAIN,
        keys::INITIAL_PAGE_LOAD_TIME,
        keys::INITIAL_PAGE_RAW_URL,
        keys::INITIAL_PAGE_SCROLL_PERCENT,
        keys::INITIAL_PAGE_SPENT_TIME,
        keys::INITIAL_PAGE_URL,
        keys::INITIAL_REFERRER,
        keys::INITIAL_REFERRER_DOMAIN,
        keys::INITIAL_REFERRER_URL,
        "$initial_source",
        keys::INITIAL_CHANNEL,
        keys::JOIN_TIME,
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
}

fn default_additive_properties() -> Vec<String> {
    vec![keys::PAGE_COUNT.to_string(), keys::SESSION_SPENT_TIME.to_string()]
}

fn default_write_back_exceptions() -> Vec<String> {
    [
        "$hubspot_contact_lead_guid",
        keys::IDENTIFIERS,
        "$hubspot_contact_deleted",
        "$hubspot_contact_merged",
        "$hubspot_contact_primary_contact",
        keys::SESSION_COUNT,
        "$leadsquared_lead_is_deleted",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
}

fn default_max_records() -> usize {
    DEFAULT_MAX_MERGE_RECORDS
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            initial_properties: default_initial_properties(),
            additive_properties: default_additive_properties(),
            write_back_exceptions: default_write_back_exceptions(),
            max_records: default_max_records(),
        }
    }
}

impl MergeConfig {
    pub fn is_initial(&self, key: &str) -> bool {
        self.initial_properties.iter().any(|k| k == key)
    }

    pub fn is_additive(&self, key: &str) -> bool {
        self.additive_properties.iter().any(|k| k == key)
    }

    pub fn is_write_back_exception(&self, key: &str) -> bool {
        self.write_back_exceptions.iter().any(|k| k == key)
    }
}

/// Reconciles new properties with one record's current state.
///
/// A newer or equal timestamp overwrites existing keys, an older one only
/// adds keys the record does not have yet. Returns `None` when nothing would
/// change.
pub fn merge_with_current(
    current: &PropertiesMap,
    current_timestamp: i64,
    new: &PropertiesMap,
    new_timestamp: i64,
) -> Option<PropertiesMap> {
    if new.is_empty() {
        return None;
    }

    let overwrite = new_timestamp >= current_timestamp;
    let mut merged = current.clone();
    for (key, value) in new {
        if overwrite || !merged.contains_key(key) {
            merged.insert(key.clone(), value.clone());
        }
    }

    if &merged == current {
        None
    } else {
        Some(merged)
    }
}

/// One record taking part in a customer identity merge, already decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCandidate {
    pub id: String,
    pub properties: PropertiesMap,
    pub properties_updated_timestamp: i64,
    pub join_timestamp: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub properties: PropertiesMap,
    /// At least one property differed between the records
    pub changed: bool,
}

/// Merges the properties of all records sharing one customer identity.
///
/// When anything changed, the result is stamped with `$merge_timestamp =
/// merged_at` and the per-record session count is removed.
pub fn merge_by_customer_identity(
    config: &MergeConfig,
    candidates: &[MergeCandidate],
    merged_at: i64,
) -> MergeOutcome {
    let mut merged = PropertiesMap::new();

    let mut by_join: Vec<&MergeCandidate> = candidates.iter().collect();
    by_join.sort_by_key(|c| (c.join_timestamp, c.created_at));
    for candidate in &by_join {
        for key in &config.initial_properties {
            if merged.contains_key(key) {
                continue;
            }
            if let Some(value) = candidate.properties.get(key) {
                if !is_empty_value(Some(value)) {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
    }

    let mut by_update: Vec<&MergeCandidate> = candidates.iter().collect();
    by_update.sort_by_key(|c| (c.properties_updated_timestamp, c.created_at));

    let mut values: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();
    for candidate in &by_update {
        for (key, value) in &candidate.properties {
            values.entry(key.as_str()).or_default().push(value);
            if config.is_additive(key) || config.is_initial(key) || is_empty_value(Some(value)) {
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }
    }

    merge_additive(config, &mut merged, &by_update);

    let changed = any_property_changed(&values, candidates.len());
    if changed {
        merged.insert(keys::MERGE_TIMESTAMP.to_string(), Value::from(merged_at));
        merged.remove(keys::SESSION_COUNT);
    }

    MergeOutcome {
        properties: merged,
        changed,
    }
}

/// Sums additive properties across records ordered oldest to newest.
///
/// The newest record's value is the starting point. A record stamped by an
/// earlier merge already includes the sums of its peers, so its full value is
/// added at most once and afterwards only its positive difference.
fn merge_additive(config: &MergeConfig, merged: &mut PropertiesMap, ordered: &[&MergeCandidate]) {
    let Some((latest, rest)) = ordered.split_last() else {
        return;
    };
    let latest_merged = latest.properties.contains_key(keys::MERGE_TIMESTAMP);

    let mut added_once: HashSet<&str> = HashSet::new();
    for key in &config.additive_properties {
        merged.remove(key);
        if let Some(value) = latest.properties.get(key).and_then(value_as_f64) {
            merged.insert(key.clone(), number_value(value));
            if latest_merged {
                added_once.insert(key.as_str());
            }
        }
    }

    for record in rest {
        let merged_before = record.properties.contains_key(keys::MERGE_TIMESTAMP);
        for key in &config.additive_properties {
            let Some(user_value) = record.properties.get(key).and_then(value_as_f64) else {
                continue;
            };
            let current = merged.get(key).and_then(value_as_f64);

            let next = if merged_before {
                if !added_once.contains(key.as_str()) {
                    added_once.insert(key.as_str());
                    Some(current.unwrap_or(0.0) + user_value)
                } else {
                    match current {
                        Some(current) if user_value - current > 0.0 => {
                            Some(current + (user_value - current))
                        }
                        _ => None,
                    }
                }
            } else {
                Some(current.unwrap_or(0.0) + user_value)
            };

            if let Some(next) = next {
                merged.insert(key.clone(), number_value(round_to(next, ADDITIVE_PRECISION)));
            }
        }
    }
}

/// A property present in fewer than all records, or with differing values, is a change.
fn any_property_changed(values: &BTreeMap<&str, Vec<&Value>>, record_count: usize) -> bool {
    values.values().any(|contributed| {
        if contributed.len() < record_count {
            return true;
        }
        match contributed.split_first() {
            Some((first, rest)) => {
                let first = display_value(first);
                rest.iter().any(|v| display_value(v) != first)
            }
            None => false,
        }
    })
}

/// Bounds the records taking part in a merge to the oldest and newest halves.
pub fn bound_fan_in<T: Clone>(records: &[T], max_records: usize) -> Vec<T> {
    if records.len() <= max_records {
        return records.to_vec();
    }

    let half = max_records / 2;
    records[..half]
        .iter()
        .chain(records[records.len() - half..].iter())
        .cloned()
        .collect()
}

/// Properties written back to one record: the merged map, with the record's
/// own values for the write-back exceptions.
pub fn write_back_properties(
    config: &MergeConfig,
    merged: &PropertiesMap,
    record: &PropertiesMap,
) -> PropertiesMap {
    let mut out: PropertiesMap = merged
        .iter()
        .filter(|(key, _)| !config.is_write_back_exception(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    for key in &config.write_back_exceptions {
        if let Some(value) = record.get(key) {
            out.insert(key.clone(), value.clone());
        }
    }

    out
}
