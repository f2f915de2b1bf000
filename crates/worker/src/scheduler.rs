//! Periodic sessionization over all projects.

use std::sync::Arc;
use std::time::Duration;

use engine_core::store::ProjectStore;
use engine_core::Result;
use serde::{Deserialize, Serialize};
use telemetry::metrics;
use tokio::time::interval;
use tracing::{error, info};
use validator::Validate;

use crate::batch::{ProjectReport, ProjectSessionizer, SessionWindow};

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SchedulerConfig {
    /// Pass interval
    #[validate(range(min = 1))]
    pub interval_secs: u64,
    /// Projects to process. Empty means every project in the store.
    #[serde(default)]
    pub projects: Vec<String>,
    /// Users sessionized concurrently within a project
    #[validate(range(min = 1, max = 1024))]
    pub user_concurrency: usize,
    /// Oldest window start relative to now, when set
    #[serde(default)]
    pub max_lookback_secs: Option<i64>,
    /// Run a single pass and exit
    #[serde(default)]
    pub run_once: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            projects: Vec::new(),
            user_concurrency: 8,
            max_lookback_secs: None,
            run_once: false,
        }
    }
}

/// Runs the project driver on a fixed interval.
pub struct SessionScheduler {
    config: SchedulerConfig,
    projects: Arc<dyn ProjectStore>,
    driver: Arc<ProjectSessionizer>,
}

impl SessionScheduler {
    pub fn new(config: SchedulerConfig, projects: Arc<dyn ProjectStore>, driver: Arc<ProjectSessionizer>) -> Self {
        Self {
            config,
            projects,
            driver,
        }
    }

    /// Starts the periodic pass loop.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        info!(
            interval_secs = self.config.interval_secs,
            projects = self.config.projects.len(),
            "Session scheduler started"
        );

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.interval_secs));
            loop {
                ticker.tick().await;

                if let Err(e) = self.run_pass(chrono::Utc::now().timestamp()).await {
                    error!("Session pass error: {}", e);
                }
            }
        })
    }

    /// One pass over the allowed projects. A failing project does not stop the pass.
    pub async fn run_pass(&self, now: i64) -> Result<Vec<ProjectReport>> {
        let project_ids = if self.config.projects.is_empty() {
            self.projects.list_project_ids().await?
        } else {
            self.config.projects.clone()
        };

        let mut reports = Vec::with_capacity(project_ids.len());
        for project_id in &project_ids {
            reports.push(self.driver.run(project_id, SessionWindow::default(), now).await);
        }

        let snapshot = metrics().snapshot();
        info!(
            projects = reports.len(),
            failed = reports.iter().filter(|r| r.status.is_failure()).count(),
            sessions_created = snapshot.sessions_created,
            sessions_continued = snapshot.sessions_continued,
            users_processed = snapshot.users_processed,
            user_runs_failed = snapshot.user_runs_failed,
            merges_written = snapshot.merges_written,
            "Session pass complete"
        );
        Ok(reports)
    }
}
