//! Sessionizer
//!
//! Batch job that groups each user's events into sessions and reconciles
//! user properties across records sharing a customer identity:
//! - Windowed per-project runs with a persisted checkpoint
//! - Attribution and inactivity session boundaries
//! - Session continuation across runs
//! - Customer identity property merge

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info};
use validator::Validate;

use clickhouse_client::{ClickHouseClient, ClickHouseConfig, ClickHouseStore};
use engine_core::store::{EventStore, ProjectStore, UserStore};
use engine_core::{
    AttributionConfig, ChannelClassifier, JsonCodec, MergeConfig, PropertyCodec, RuleChannelClassifier, SessionConfig,
};
use telemetry::init_tracing_from_env;
use worker::{
    DriverConfig, ProjectSessionizer, PropertyMerger, SchedulerConfig, SessionMaterializer, SessionScheduler,
    UserSessionizer,
};

/// Application configuration.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
struct AppConfig {
    #[serde(default)]
    clickhouse: ClickHouseConfig,

    #[serde(default)]
    session: SessionConfig,

    #[serde(default)]
    attribution: AttributionConfig,

    #[serde(default)]
    merge: MergeConfig,

    #[serde(default)]
    scheduler: SchedulerConfig,
}

impl AppConfig {
    fn validate_all(&self) -> Result<()> {
        self.clickhouse.validate().context("Invalid clickhouse configuration")?;
        self.session.validate().context("Invalid session configuration")?;
        self.attribution.validate().context("Invalid attribution configuration")?;
        self.merge.validate().context("Invalid merge configuration")?;
        self.scheduler.validate().context("Invalid scheduler configuration")?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing_from_env();

    info!("Starting Sessionizer v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    config.validate_all()?;

    let clickhouse = ClickHouseClient::new(config.clickhouse.clone()).context("Failed to create ClickHouse client")?;

    if clickhouse_client::check_connection(&clickhouse).await {
        info!("ClickHouse connection: healthy");
    } else {
        error!("ClickHouse connection: unhealthy");
    }

    if let Err(e) = clickhouse_client::init_schema(&clickhouse).await {
        error!("Failed to initialize ClickHouse schema: {}", e);
        // Continue anyway - schema might already exist
    }

    let store = Arc::new(ClickHouseStore::new(clickhouse));
    let events: Arc<dyn EventStore> = store.clone();
    let users: Arc<dyn UserStore> = store.clone();
    let projects: Arc<dyn ProjectStore> = store;
    let codec: Arc<dyn PropertyCodec> = Arc::new(JsonCodec);
    let classifier: Arc<dyn ChannelClassifier> = Arc::new(RuleChannelClassifier::default());

    let materializer = Arc::new(SessionMaterializer::new(
        events.clone(),
        classifier,
        codec.clone(),
        config.session.clone(),
    ));
    let merger = Arc::new(PropertyMerger::new(users, codec.clone(), config.merge.clone()));
    let user_sessionizer = Arc::new(UserSessionizer::new(
        events.clone(),
        materializer,
        merger,
        codec,
        config.attribution.clone(),
    ));
    let driver = Arc::new(ProjectSessionizer::new(
        events,
        projects.clone(),
        user_sessionizer,
        DriverConfig {
            user_concurrency: config.scheduler.user_concurrency,
            max_lookback_secs: config.scheduler.max_lookback_secs,
            buffer_secs: config.session.buffer_secs,
        },
    ));
    let scheduler = Arc::new(SessionScheduler::new(config.scheduler.clone(), projects, driver));

    if config.scheduler.run_once {
        let reports = scheduler
            .run_pass(chrono::Utc::now().timestamp())
            .await
            .context("Session pass failed")?;
        let failed = reports.iter().filter(|r| r.status.is_failure()).count();
        info!(projects = reports.len(), failed, "Single pass complete");
        if failed > 0 {
            anyhow::bail!("{} of {} projects failed", failed, reports.len());
        }
        return Ok(());
    }

    let handle = scheduler.start();

    shutdown_signal().await;
    info!("Shutting down...");
    handle.abort();

    info!("Shutdown complete");
    Ok(())
}

/// Load configuration from files and environment.
fn load_config() -> Result<AppConfig> {
    let config = config::Config::builder()
        // Start with defaults
        .add_source(config::Config::try_from(&AppConfig::default())?)
        // Load from config file if exists
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        // Override with environment variables
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("SESSIONIZER")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: AppConfig = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    // The config crate's nested parsing doesn't work reliably with underscored field names
    if let Ok(url) = std::env::var("SESSIONIZER_CLICKHOUSE_URL") {
        config.clickhouse.url = url;
    }
    if let Ok(database) = std::env::var("SESSIONIZER_CLICKHOUSE_DATABASE") {
        config.clickhouse.database = database;
    }
    if let Ok(username) = std::env::var("SESSIONIZER_CLICKHOUSE_USERNAME") {
        config.clickhouse.username = Some(username);
    }
    if let Ok(password) = std::env::var("SESSIONIZER_CLICKHOUSE_PASSWORD") {
        config.clickhouse.password = Some(password);
    }
    if let Ok(projects) = std::env::var("SESSIONIZER_PROJECTS") {
        config.scheduler.projects = projects
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(run_once) = std::env::var("SESSIONIZER_RUN_ONCE") {
        config.scheduler.run_once = run_once == "1" || run_once.eq_ignore_ascii_case("true");
    }

    info!(
        clickhouse_url = %config.clickhouse.url,
        database = %config.clickhouse.database,
        projects = config.scheduler.projects.len(),
        interval_secs = config.scheduler.interval_secs,
        run_once = config.scheduler.run_once,
        "Loaded configuration"
    );

    Ok(config)
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
