//! ClickHouse configuration.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// ClickHouse client configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ClickHouseConfig {
    /// ClickHouse HTTP URL
    #[validate(url)]
    pub url: String,
    /// Database name
    #[serde(default = "default_database")]
    #[validate(length(min = 1))]
    pub database: String,
    /// Username (optional)
    pub username: Option<String>,
    /// Password (optional)
    pub password: Option<String>,
    /// Query timeout in seconds
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1))]
    pub timeout_secs: u64,
}

fn default_database() -> String {
    "sessionizer".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: default_database(),
            username: None,
            password: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}
