//! User property write-back through the customer identity merge.

use std::collections::BTreeMap;
use std::sync::Arc;

use engine_core::merge::{bound_fan_in, merge_by_customer_identity, merge_with_current, write_back_properties};
use engine_core::properties::{is_empty_value, keys, number_value, numeric_or_zero};
use engine_core::store::UserStore;
use engine_core::{
    Error, MergeCandidate, MergeConfig, PropertiesMap, PropertyCodec, PropertySnapshot, Result, UserRecord,
};
use serde_json::Value;
use telemetry::metrics;
use tracing::{debug, error, warn};

/// Outcome of a user property update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyUpdate {
    /// Nothing would change
    NotModified,
    /// Only the updated record was written
    Single,
    /// The merged properties were written back to every record of the identity
    Merged { records: usize },
}

impl PropertyUpdate {
    pub fn records_written(&self) -> usize {
        match self {
            Self::NotModified => 0,
            Self::Single => 1,
            Self::Merged { records } => *records,
        }
    }
}

pub struct PropertyMerger {
    users: Arc<dyn UserStore>,
    codec: Arc<dyn PropertyCodec>,
    config: MergeConfig,
}

impl PropertyMerger {
    pub fn new(users: Arc<dyn UserStore>, codec: Arc<dyn PropertyCodec>, config: MergeConfig) -> Self {
        Self { users, codec, config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Applies new properties to a user, then reconciles every record sharing
    /// the user's customer identity.
    pub async fn update_user_properties(
        &self,
        project_id: &str,
        user_id: &str,
        new_properties: &PropertiesMap,
        new_timestamp: i64,
    ) -> Result<PropertyUpdate> {
        if project_id.is_empty() || user_id.is_empty() {
            return Err(Error::invalid_argument("project and user id are required"));
        }

        let user = self
            .users
            .get_user(project_id, user_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("user {}", user_id)))?;
        let current = self.codec.decode(&user.properties)?;

        let Some(merged_current) =
            merge_with_current(&current, user.properties_updated_timestamp, new_properties, new_timestamp)
        else {
            return Ok(PropertyUpdate::NotModified);
        };

        let Some(customer_user_id) = user.customer_identity() else {
            return self.write_single(project_id, user_id, &merged_current, new_timestamp).await;
        };

        let records = self
            .users
            .get_records_by_customer_identity(project_id, customer_user_id)
            .await?;
        let mut records = bound_fan_in(&records, self.config.max_records);
        if !records.iter().any(|record| record.id == user.id) {
            records.push(user.clone());
        }
        if records.len() <= 1 {
            return self.write_single(project_id, user_id, &merged_current, new_timestamp).await;
        }

        let candidates = records
            .iter()
            .map(|record| self.candidate(record, &user.id, &merged_current, new_timestamp))
            .collect::<Result<Vec<_>>>()?;
        let outcome = merge_by_customer_identity(&self.config, &candidates, chrono::Utc::now().timestamp());

        if !outcome.changed {
            metrics().merges_skipped.inc();
            debug!(
                project_id = %project_id,
                user_id = %user_id,
                customer_user_id = %customer_user_id,
                "Identity records already agree, writing the updated record only"
            );
            return self.write_single(project_id, user_id, &merged_current, new_timestamp).await;
        }

        let mut failed = 0usize;
        for candidate in &candidates {
            let properties = write_back_properties(&self.config, &outcome.properties, &candidate.properties);
            if let Err(e) = self
                .users
                .overwrite_record_properties(project_id, &candidate.id, &properties, new_timestamp)
                .await
            {
                failed += 1;
                error!(
                    project_id = %project_id,
                    user_id = %candidate.id,
                    customer_user_id = %customer_user_id,
                    error = %e,
                    "Failed to write merged user properties"
                );
            }
        }

        if failed > 0 {
            return Err(Error::store(format!(
                "merged properties not written to {} of {} records",
                failed,
                candidates.len()
            )));
        }

        metrics().merges_written.inc();
        metrics().user_properties_updated.inc_by(candidates.len() as u64);
        debug!(
            project_id = %project_id,
            user_id = %user_id,
            customer_user_id = %customer_user_id,
            records = candidates.len(),
            "Merged user properties across identity"
        );
        Ok(PropertyUpdate::Merged {
            records: candidates.len(),
        })
    }

    fn candidate(
        &self,
        record: &UserRecord,
        updated_id: &str,
        merged_current: &PropertiesMap,
        new_timestamp: i64,
    ) -> Result<MergeCandidate> {
        let (properties, properties_updated_timestamp) = if record.id == updated_id {
            (merged_current.clone(), new_timestamp.max(record.properties_updated_timestamp))
        } else {
            (self.codec.decode(&record.properties)?, record.properties_updated_timestamp)
        };

        Ok(MergeCandidate {
            id: record.id.clone(),
            properties,
            properties_updated_timestamp,
            join_timestamp: record.join_timestamp,
            created_at: record.created_at,
        })
    }

    async fn write_single(
        &self,
        project_id: &str,
        user_id: &str,
        properties: &PropertiesMap,
        timestamp: i64,
    ) -> Result<PropertyUpdate> {
        self.users
            .overwrite_record_properties(project_id, user_id, properties, timestamp)
            .await?;
        metrics().user_properties_updated.inc();
        Ok(PropertyUpdate::Single)
    }

    /// Applies the latest session of each user to the user record.
    ///
    /// Returns the number of user records written.
    pub async fn apply_session_rollups(
        &self,
        project_id: &str,
        snapshots: &[PropertySnapshot],
        now: i64,
    ) -> Result<usize> {
        let mut written = 0;
        for (user_id, rollup) in latest_sessions(snapshots) {
            let base = self.codec.decode_optional(rollup.latest.event_user_properties.as_deref())?;
            if base.is_empty() {
                warn!(
                    project_id = %project_id,
                    user_id = %user_id,
                    session_id = %rollup.latest.session_id,
                    "Empty user properties on the latest session event, skipping rollup"
                );
                continue;
            }

            let mut properties = PropertiesMap::new();
            properties.insert(
                keys::PAGE_COUNT.to_string(),
                number_value(numeric_or_zero(&base, keys::PAGE_COUNT) + rollup.latest.page_count),
            );
            properties.insert(
                keys::SESSION_SPENT_TIME.to_string(),
                number_value(numeric_or_zero(&base, keys::SESSION_SPENT_TIME) + rollup.latest.spent_time),
            );
            properties.insert(keys::SESSION_COUNT.to_string(), Value::from(rollup.latest.session_count));
            if let Some(channel) = rollup.latest_channel {
                properties.insert(keys::LATEST_CHANNEL.to_string(), Value::String(channel));
            }

            if let Some(channel) = rollup.initial_channel {
                let current = self.users.get_user(project_id, user_id).await?;
                let has_initial = match current {
                    Some(user) => {
                        let current = self.codec.decode(&user.properties)?;
                        !is_empty_value(current.get(keys::INITIAL_CHANNEL))
                    }
                    None => false,
                };
                if !has_initial {
                    properties.insert(keys::INITIAL_CHANNEL.to_string(), Value::String(channel));
                }
            }

            match self.update_user_properties(project_id, user_id, &properties, now).await {
                Ok(update) => written += update.records_written(),
                Err(e) if e.is_soft() => {
                    warn!(project_id = %project_id, user_id = %user_id, error = %e, "User record missing, skipping rollup");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(written)
    }
}

/// Per-user view of the sessions in a run.
#[derive(Debug, Clone)]
struct SessionRollup<'a> {
    latest: &'a PropertySnapshot,
    latest_channel: Option<String>,
    initial_channel: Option<String>,
}

/// Latest snapshot of each user by session timestamp, with the latest and
/// earliest assigned channels.
fn latest_sessions(snapshots: &[PropertySnapshot]) -> BTreeMap<&str, SessionRollup<'_>> {
    let mut rollups: BTreeMap<&str, SessionRollup<'_>> = BTreeMap::new();
    let mut channel_bounds: BTreeMap<&str, (i64, i64)> = BTreeMap::new();

    for snapshot in snapshots {
        let rollup = rollups
            .entry(snapshot.user_id.as_str())
            .or_insert_with(|| SessionRollup {
                latest: snapshot,
                latest_channel: None,
                initial_channel: None,
            });
        if snapshot.session_timestamp > rollup.latest.session_timestamp {
            rollup.latest = snapshot;
        }

        let Some(channel) = snapshot.channel.as_ref() else {
            continue;
        };
        match channel_bounds.get_mut(snapshot.user_id.as_str()) {
            None => {
                channel_bounds.insert(
                    snapshot.user_id.as_str(),
                    (snapshot.session_timestamp, snapshot.session_timestamp),
                );
                rollup.latest_channel = Some(channel.clone());
                rollup.initial_channel = Some(channel.clone());
            }
            Some((earliest, latest)) => {
                if snapshot.session_timestamp > *latest {
                    *latest = snapshot.session_timestamp;
                    rollup.latest_channel = Some(channel.clone());
                }
                if snapshot.session_timestamp < *earliest {
                    *earliest = snapshot.session_timestamp;
                    rollup.initial_channel = Some(channel.clone());
                }
            }
        }
    }

    rollups
}
