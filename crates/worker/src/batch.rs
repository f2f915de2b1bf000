//! Per-project batch driver.
//!
//! Pulls un-sessioned events for a window, runs every user concurrently in
//! bounded chunks, and advances the project checkpoint when all users
//! succeeded.

use std::sync::Arc;
use std::time::Instant;

use engine_core::store::{EventStore, ProjectStore};
use engine_core::{Error, Result, RunStatus};
use serde::{Deserialize, Serialize};
use telemetry::metrics;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use validator::Validate;

use crate::sessionizer::{UserRunOutcome, UserSessionizer};

/// Driver settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DriverConfig {
    /// Users sessionized concurrently
    #[validate(range(min = 1, max = 1024))]
    pub user_concurrency: usize,
    /// Oldest window start relative to now, when set
    pub max_lookback_secs: Option<i64>,
    /// Hold-back subtracted from now for the window end
    #[validate(range(min = 0))]
    pub buffer_secs: i64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            user_concurrency: 8,
            max_lookback_secs: None,
            buffer_secs: 0,
        }
    }
}

/// Explicit window bounds. A window with both bounds does not move the checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl SessionWindow {
    pub fn explicit(start: i64, end: i64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    fn bounds(&self) -> Option<(i64, i64)> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        }
    }
}

/// Status report of one project run.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectReport {
    pub project_id: String,
    pub window_start: i64,
    pub window_end: i64,
    pub events_downloaded: usize,
    pub events_processed: usize,
    pub users: usize,
    pub users_failed: usize,
    pub sessions_created: usize,
    pub sessions_continued: usize,
    pub user_properties_updated: usize,
    /// Checkpoint written by this run
    pub checkpoint: Option<i64>,
    pub status: RunStatus,
}

impl ProjectReport {
    fn new(project_id: &str, window_start: i64, window_end: i64) -> Self {
        Self {
            project_id: project_id.to_string(),
            window_start,
            window_end,
            events_downloaded: 0,
            events_processed: 0,
            users: 0,
            users_failed: 0,
            sessions_created: 0,
            sessions_continued: 0,
            user_properties_updated: 0,
            checkpoint: None,
            status: RunStatus::NotModified,
        }
    }

    fn failed(project_id: &str, status: RunStatus) -> Self {
        let mut report = Self::new(project_id, 0, 0);
        report.status = status;
        report
    }

    fn add(&mut self, outcome: &UserRunOutcome) {
        self.events_downloaded += outcome.events_downloaded;
        self.events_processed += outcome.events_processed;
        self.sessions_created += outcome.sessions_created;
        if outcome.continued {
            self.sessions_continued += 1;
        }
        self.user_properties_updated += outcome.user_properties_updated;
    }
}

pub struct ProjectSessionizer {
    events: Arc<dyn EventStore>,
    projects: Arc<dyn ProjectStore>,
    users: Arc<UserSessionizer>,
    config: DriverConfig,
}

impl ProjectSessionizer {
    pub fn new(
        events: Arc<dyn EventStore>,
        projects: Arc<dyn ProjectStore>,
        users: Arc<UserSessionizer>,
        config: DriverConfig,
    ) -> Self {
        Self {
            events,
            projects,
            users,
            config,
        }
    }

    /// Runs one project. Errors are reported through the report status.
    pub async fn run(&self, project_id: &str, window: SessionWindow, now: i64) -> ProjectReport {
        let started = Instant::now();
        let report = match self.try_run(project_id, window, now).await {
            Ok(report) => report,
            Err(e) => {
                error!(
                    project_id = %project_id,
                    error = %e,
                    code = e.error_code(),
                    "Project sessionization failed"
                );
                ProjectReport::failed(project_id, e.run_status())
            }
        };

        metrics().projects_processed.inc();
        if report.status.is_failure() {
            metrics().projects_failed.inc();
        }
        metrics().project_run_latency_ms.observe(started.elapsed().as_millis() as u64);

        info!(
            project_id = %report.project_id,
            window_start = report.window_start,
            window_end = report.window_end,
            events_downloaded = report.events_downloaded,
            events_processed = report.events_processed,
            users = report.users,
            users_failed = report.users_failed,
            sessions_created = report.sessions_created,
            sessions_continued = report.sessions_continued,
            user_properties_updated = report.user_properties_updated,
            status = %report.status,
            "Project sessionization finished"
        );
        report
    }

    async fn try_run(&self, project_id: &str, window: SessionWindow, now: i64) -> Result<ProjectReport> {
        if project_id.is_empty() {
            return Err(Error::invalid_argument("project id is required"));
        }

        let explicit = window.bounds();
        let (start, end) = match explicit {
            Some((start, end)) => {
                if start <= 0 || end <= 0 || start >= end {
                    return Err(Error::invalid_argument(format!(
                        "invalid window [{}, {}]",
                        start, end
                    )));
                }
                (start, end)
            }
            None => self.computed_window(project_id, window, now).await?,
        };

        let mut report = ProjectReport::new(project_id, start, end);
        if start >= end {
            return Ok(report);
        }

        let user_events = self
            .events
            .fetch_user_events_in_window(project_id, start, end)
            .await?;
        if user_events.is_empty() {
            if explicit.is_none() {
                self.projects.set_next_session_start(project_id, end).await?;
                report.checkpoint = Some(end);
            }
            return Ok(report);
        }
        report.users = user_events.len();

        let outcomes = self.run_users(project_id, user_events, now).await;
        let mut checkpoint: Option<i64> = None;
        for outcome in &outcomes {
            match outcome {
                Ok(outcome) => {
                    report.add(outcome);
                    if let Some(last) = outcome.last_event_timestamp {
                        checkpoint = Some(checkpoint.map_or(last, |c| c.min(last)));
                    }
                }
                Err(_) => report.users_failed += 1,
            }
        }

        if report.users_failed > 0 {
            warn!(
                project_id = %project_id,
                users_failed = report.users_failed,
                "Users failed, checkpoint not advanced"
            );
            report.status = RunStatus::InternalError;
            return Ok(report);
        }

        if explicit.is_none() {
            if let Some(checkpoint) = checkpoint {
                self.projects.set_next_session_start(project_id, checkpoint).await?;
                report.checkpoint = Some(checkpoint);
            }
        }

        report.status = if report.sessions_created == 0 {
            RunStatus::NotModified
        } else {
            RunStatus::Ok
        };
        Ok(report)
    }

    /// Window from the checkpoint (or project creation) to now minus the buffer.
    async fn computed_window(&self, project_id: &str, window: SessionWindow, now: i64) -> Result<(i64, i64)> {
        let start = match window.start {
            Some(start) => start,
            None => match self.projects.next_session_start(project_id).await? {
                Some(checkpoint) => checkpoint,
                None => self
                    .projects
                    .project_created_at(project_id)
                    .await?
                    .ok_or_else(|| Error::not_found(format!("project {}", project_id)))?,
            },
        };
        let start = match self.config.max_lookback_secs {
            Some(lookback) => start.max(now - lookback),
            None => start,
        };
        let end = window.end.unwrap_or(now - self.config.buffer_secs);
        Ok((start, end))
    }

    /// Runs users in chunks of `user_concurrency`. One user's failure never
    /// stops the others.
    async fn run_users(
        &self,
        project_id: &str,
        user_events: engine_core::UserEvents,
        now: i64,
    ) -> Vec<Result<UserRunOutcome>> {
        let mut outcomes = Vec::with_capacity(user_events.len());
        let mut pending = user_events.into_iter().peekable();

        while pending.peek().is_some() {
            let mut tasks = JoinSet::new();
            for (user_id, events) in pending.by_ref().take(self.config.user_concurrency.max(1)) {
                let users = self.users.clone();
                let project_id = project_id.to_string();
                tasks.spawn(async move {
                    metrics().active_user_runs.inc();
                    let result = users.run(&project_id, &user_id, events, now).await;
                    metrics().active_user_runs.dec();
                    (user_id, result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                metrics().users_processed.inc();
                let result = match joined {
                    Ok((user_id, Err(e))) => {
                        error!(
                            project_id = %project_id,
                            user_id = %user_id,
                            error = %e,
                            code = e.error_code(),
                            "User sessionization failed"
                        );
                        Err(e)
                    }
                    Ok((_, Ok(outcome))) => Ok(outcome),
                    Err(e) => {
                        error!(project_id = %project_id, error = %e, "User sessionization task panicked");
                        Err(Error::internal(format!("user task failed: {}", e)))
                    }
                };
                if result.is_err() {
                    metrics().user_runs_failed.inc();
                }
                outcomes.push(result);
            }
        }

        outcomes
    }
}
