//! Property maps and well-known property keys.

use serde_json::Value;

/// Decoded property map. Keys are unique.
pub type PropertiesMap = serde_json::Map<String, Value>;

/// Well-known property keys.
pub mod keys {
    // Event properties
    pub const IS_PAGE_VIEW: &str = "$is_page_view";
    pub const PAGE_URL: &str = "$page_url";
    pub const PAGE_RAW_URL: &str = "$page_raw_url";
    pub const PAGE_DOMAIN: &str = "$page_domain";
    pub const PAGE_LOAD_TIME: &str = "$page_load_time";
    pub const PAGE_SPENT_TIME: &str = "$page_spent_time";
    pub const PAGE_SCROLL_PERCENT: &str = "$page_scroll_percent";
    pub const REFERRER: &str = "$referrer";
    pub const REFERRER_URL: &str = "$referrer_url";
    pub const REFERRER_DOMAIN: &str = "$referrer_domain";

    // Attribution
    pub const CAMPAIGN: &str = "$campaign";
    pub const CAMPAIGN_ID: &str = "$campaign_id";
    pub const SOURCE: &str = "$source";
    pub const MEDIUM: &str = "$medium";
    pub const KEYWORD: &str = "$keyword";
    pub const KEYWORD_MATCH_TYPE: &str = "$keyword_match_type";
    pub const TERM: &str = "$term";
    pub const CONTENT: &str = "$content";
    pub const ADGROUP: &str = "$adgroup";
    pub const ADGROUP_ID: &str = "$adgroup_id";
    pub const AD: &str = "$ad";
    pub const AD_ID: &str = "$ad_id";
    pub const CREATIVE: &str = "$creative";
    pub const GCLID: &str = "$gclid";
    pub const FBCLID: &str = "$fbclid";

    // Session properties
    pub const PAGE_COUNT: &str = "$page_count";
    pub const SESSION_SPENT_TIME: &str = "$session_spent_time";
    pub const SESSION_LATEST_PAGE_URL: &str = "$session_latest_page_url";
    pub const SESSION_LATEST_PAGE_RAW_URL: &str = "$session_latest_page_raw_url";
    pub const CHANNEL: &str = "$channel";
    pub const SESSION_COUNT: &str = "$session_count";
    pub const IS_FIRST_SESSION: &str = "$is_first_session";
    pub const INITIAL_PAGE_URL: &str = "$initial_page_url";
    pub const INITIAL_PAGE_RAW_URL: &str = "$initial_page_raw_url";
    pub const INITIAL_PAGE_DOMAIN: &str = "$initial_page_domain";
    pub const INITIAL_PAGE_LOAD_TIME: &str = "$initial_page_load_time";
    pub const INITIAL_PAGE_SPENT_TIME: &str = "$initial_page_spent_time";
    pub const INITIAL_PAGE_SCROLL_PERCENT: &str = "$initial_page_scroll_percent";
    pub const INITIAL_REFERRER: &str = "$initial_referrer";
    pub const INITIAL_REFERRER_URL: &str = "$initial_referrer_url";
    pub const INITIAL_REFERRER_DOMAIN: &str = "$initial_referrer_domain";

    // User properties
    pub const PLATFORM: &str = "$platform";
    pub const BROWSER: &str = "$browser";
    pub const BROWSER_VERSION: &str = "$browser_version";
    pub const BROWSER_WITH_VERSION: &str = "$browser_with_version";
    pub const USER_AGENT: &str = "$user_agent";
    pub const OS: &str = "$os";
    pub const OS_VERSION: &str = "$os_version";
    pub const OS_WITH_VERSION: &str = "$os_with_version";
    pub const COUNTRY: &str = "$country";
    pub const CITY: &str = "$city";
    pub const CONTINENT: &str = "$continent";
    pub const POSTAL_CODE: &str = "$postal_code";
    pub const REGION: &str = "$region";
    pub const TIMEZONE: &str = "$timezone";
    pub const MERGE_TIMESTAMP: &str = "$merge_timestamp";
    pub const INITIAL_CHANNEL: &str = "$initial_channel";
    pub const LATEST_CHANNEL: &str = "$latest_channel";
    pub const JOIN_TIME: &str = "$joinTime";
    pub const DAY_OF_FIRST_EVENT: &str = "$day_of_first_event";
    pub const HOUR_OF_FIRST_EVENT: &str = "$hour_of_first_event";
    pub const IDENTIFIERS: &str = "$identifiers";
}

/// True for an absent value, JSON null, or the empty string.
pub fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(_) => false,
    }
}

/// Reads a numeric property. Numeric strings are accepted.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Numeric property lookup, defaulting to zero.
pub fn numeric_or_zero(properties: &PropertiesMap, key: &str) -> f64 {
    properties.get(key).and_then(value_as_f64).unwrap_or(0.0)
}

/// Renders a value for display-level comparison, so that `1` and `1.0` compare equal.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) => f.to_string(),
            None => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// Rounds to the given number of decimal places.
pub fn round_to(value: f64, precision: i32) -> f64 {
    let factor = 10f64.powi(precision);
    (value * factor).round() / factor
}

/// Builds a JSON number from an f64, falling back to zero for NaN or infinity.
pub fn number_value(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or_else(|| Value::from(0))
}
