//! Scheduled rules that keep items and the queue moving.
//!
//! Each cycle runs every rule once. Rules are isolated: an error in one is
//! logged and recorded in the report while the others still run.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument};

use intake_core::defaults::{MANAGER_INTERVAL_SECS, MANAGER_RETRY_MAX_ATTEMPTS, MANAGER_SCAN_LIMIT};
use intake_core::{
    follow_up_for_past_event, transition_effect, FollowUpState, ItemStatus, QueueStore, Result,
    Trigger,
};

/// Configuration for the worker manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Pause between cycles in loop mode.
    pub interval: Duration,
    /// Items or jobs inspected per rule per cycle.
    pub scan_limit: i64,
    /// Failed jobs with at most this many attempts get one more run.
    pub retry_max_attempts: i32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(MANAGER_INTERVAL_SECS),
            scan_limit: MANAGER_SCAN_LIMIT,
            retry_max_attempts: MANAGER_RETRY_MAX_ATTEMPTS,
        }
    }
}

impl ManagerConfig {
    /// Read configuration from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `MANAGER_INTERVAL_SECS` | `60` | Pause between cycles |
    pub fn from_env() -> Self {
        let interval = std::env::var("MANAGER_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(MANAGER_INTERVAL_SECS));

        Self {
            interval,
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Counts from one manager cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerReport {
    pub stale_leases_requeued: u64,
    pub timeline_follow_ups_created: u64,
    pub deferred_follow_ups_resurfaced: u64,
    pub single_attempt_failures_retried: u64,
    /// `(rule, error)` for every rule that failed this cycle.
    pub errors: Vec<(String, String)>,
}

impl ManagerReport {
    pub fn total(&self) -> u64 {
        self.stale_leases_requeued
            + self.timeline_follow_ups_created
            + self.deferred_follow_ups_resurfaced
            + self.single_attempt_failures_retried
    }
}

/// Runs the scheduled rules against a store.
pub struct WorkerManager {
    store: Arc<dyn QueueStore>,
    config: ManagerConfig,
}

impl WorkerManager {
    pub fn new(store: Arc<dyn QueueStore>, config: ManagerConfig) -> Self {
        Self { store, config }
    }

    /// Run every rule once.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> ManagerReport {
        let mut report = ManagerReport::default();

        report.stale_leases_requeued = self
            .isolated("requeue_stale_leases", self.store.requeue_stale_leases(), &mut report)
            .await;
        report.timeline_follow_ups_created = self
            .isolated(
                "create_timeline_follow_ups",
                self.create_timeline_follow_ups(),
                &mut report,
            )
            .await;
        report.deferred_follow_ups_resurfaced = self
            .isolated(
                "resurface_deferred_follow_ups",
                self.resurface_deferred_follow_ups(),
                &mut report,
            )
            .await;
        report.single_attempt_failures_retried = self
            .isolated(
                "retry_single_attempt_failures",
                self.retry_single_attempt_failures(),
                &mut report,
            )
            .await;

        if report.total() > 0 || !report.errors.is_empty() {
            info!(
                subsystem = "jobs",
                component = "manager",
                stale = report.stale_leases_requeued,
                timeline = report.timeline_follow_ups_created,
                resurfaced = report.deferred_follow_ups_resurfaced,
                retried = report.single_attempt_failures_retried,
                errors = report.errors.len(),
                "Manager cycle finished"
            );
        }
        report
    }

    async fn isolated(
        &self,
        rule: &str,
        fut: impl Future<Output = Result<u64>>,
        report: &mut ManagerReport,
    ) -> u64 {
        match fut.await {
            Ok(count) => {
                debug!(subsystem = "jobs", component = "manager", rule, count, "Rule finished");
                count
            }
            Err(e) => {
                error!(subsystem = "jobs", component = "manager", rule, error = %e, "Rule failed");
                report.errors.push((rule.to_string(), e.to_string()));
                0
            }
        }
    }

    /// Move timeline items whose event date passed to a "how did it go" follow-up.
    pub async fn create_timeline_follow_ups(&self) -> Result<u64> {
        let today = Utc::now().date_naive();
        let items = self
            .store
            .list_passed_timeline(today, self.config.scan_limit)
            .await?;

        let mut count = 0;
        for item in items {
            let Some(analysis) = follow_up_for_past_event(&item, today) else {
                continue;
            };
            let effect = transition_effect(item.id, ItemStatus::Timeline, Trigger::EventPassed)?
                .with_analysis(analysis);
            if self.store.apply(&effect).await? {
                info!(
                    subsystem = "jobs",
                    component = "manager",
                    item_id = %item.id,
                    "Event passed, follow-up created"
                );
                count += 1;
            }
        }
        Ok(count)
    }

    /// Put deferred follow-ups whose deferral elapsed back into triage.
    pub async fn resurface_deferred_follow_ups(&self) -> Result<u64> {
        let now = Utc::now();
        let items = self
            .store
            .list_due_deferred(now, self.config.scan_limit)
            .await?;

        let mut count = 0;
        for item in items {
            let Some(mut analysis) = item.analysis else {
                continue;
            };
            if let Some(ref mut follow_up) = analysis.follow_up {
                follow_up.state = FollowUpState::Triage;
            }
            let effect = transition_effect(item.id, ItemStatus::FollowUp, Trigger::Resurfaced)?
                .with_analysis(analysis);
            if self.store.apply(&effect).await? {
                info!(
                    subsystem = "jobs",
                    component = "manager",
                    item_id = %item.id,
                    "Deferred follow-up resurfaced"
                );
                count += 1;
            }
        }
        Ok(count)
    }

    /// Give jobs that failed on their first run one more try.
    pub async fn retry_single_attempt_failures(&self) -> Result<u64> {
        let failed = self.store.list_failed(None, self.config.scan_limit).await?;

        let mut count = 0;
        for job in failed
            .into_iter()
            .filter(|j| j.attempts <= self.config.retry_max_attempts)
        {
            if self.store.requeue_failed(job.id).await? {
                info!(
                    subsystem = "jobs",
                    component = "manager",
                    job_id = %job.id,
                    job_type = %job.job_type,
                    "Requeued single-attempt failure"
                );
                count += 1;
            }
        }
        Ok(count)
    }

    /// Run cycles until `shutdown` resolves.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!(
            subsystem = "jobs",
            component = "manager",
            interval_secs = self.config.interval.as_secs(),
            "Worker manager started"
        );

        loop {
            self.run_cycle().await;
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sleep(self.config.interval) => {}
            }
        }

        info!(subsystem = "jobs", component = "manager", "Worker manager stopped");
    }
}
