//! Marketing attribution detection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::properties::{is_empty_value, keys, PropertiesMap};

/// Attribution field names and the page-view flag.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AttributionConfig {
    /// Campaign/source/medium-class fields
    #[serde(default = "default_fields")]
    #[validate(length(min = 1))]
    pub fields: Vec<String>,
    /// Boolean property marking a page view
    #[serde(default = "default_page_view_key")]
    #[validate(length(min = 1))]
    pub page_view_key: String,
}

fn default_fields() -> Vec<String> {
    [
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
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
}

fn default_page_view_key() -> String {
    keys::IS_PAGE_VIEW.to_string()
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            fields: default_fields(),
            page_view_key: default_page_view_key(),
        }
    }
}

impl AttributionConfig {
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_page_view(&self, properties: &PropertiesMap) -> bool {
        matches!(properties.get(&self.page_view_key), Some(Value::Bool(true)))
    }

    /// A page view carrying at least one non-empty attribution field.
    pub fn is_attributed_page_view(&self, properties: &PropertiesMap) -> bool {
        self.is_page_view(properties)
            && self
                .fields
                .iter()
                .any(|field| !is_empty_value(properties.get(field)))
    }

    /// Attribution fields are equal field by field. Missing on both sides is equal.
    pub fn attribution_matches(&self, a: &PropertiesMap, b: &PropertiesMap) -> bool {
        self.fields.iter().all(|field| a.get(field) == b.get(field))
    }
}
