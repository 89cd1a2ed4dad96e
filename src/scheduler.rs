//! Recurring SMS tasks.
//!
//! The scheduler wakes once a minute and checks the local wall clock. The
//! first tick at or after `check_hour` each day loads the enabled tasks and
//! fires every one that has never run or whose `interval_days` have passed
//! since `last_run_at`. No cron or OS timer is involved.
//!
//! A second loop fails outgoing records the device never confirmed, so a
//! send lost to a disconnect does not stay `sending` forever.

use anyhow::Result;
use chrono::{Local, NaiveDate, Timelike};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::logutil::mask_phone;
use crate::modem::SmsSender;
use crate::storage::{now_millis, MessageStatus, MessageStore, ScheduledTask, Storage};

pub const CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const MILLIS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

/// Never run, or at least `interval_days` whole days since the last run.
pub fn task_due(task: &ScheduledTask, now_ms: i64) -> bool {
    if !task.enabled {
        return false;
    }
    if task.last_run_at <= 0 {
        return true;
    }
    let interval = i64::from(task.interval_days.max(1)) * MILLIS_PER_DAY;
    now_ms.saturating_sub(task.last_run_at) >= interval
}

/// Outcome of one firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRun {
    pub task_id: String,
    pub message_id: String,
}

pub struct TaskScheduler {
    storage: Arc<Storage>,
    sender: Arc<dyn SmsSender>,
    check_hour: u32,
    last_check_date: Option<NaiveDate>,
}

impl TaskScheduler {
    pub fn new(storage: Arc<Storage>, sender: Arc<dyn SmsSender>, check_hour: u32) -> Self {
        Self {
            storage,
            sender,
            check_hour: check_hour.min(23),
            last_check_date: None,
        }
    }

    /// True once per local date, on the first call at or after `check_hour`.
    pub fn should_check(&mut self, date: NaiveDate, hour: u32) -> bool {
        if hour < self.check_hour || self.last_check_date == Some(date) {
            return false;
        }
        self.last_check_date = Some(date);
        true
    }

    /// Fire every due enabled task. One failing task does not stop the rest.
    pub async fn run_due_tasks(&self, now_ms: i64) -> Result<Vec<TaskRun>> {
        let tasks = self.storage.list_enabled_tasks().await?;
        let due: Vec<ScheduledTask> = tasks.into_iter().filter(|t| task_due(t, now_ms)).collect();
        if due.is_empty() {
            debug!("No scheduled tasks due");
            return Ok(Vec::new());
        }

        info!("{} scheduled task(s) due", due.len());
        let mut runs = Vec::with_capacity(due.len());
        for task in &due {
            match self.fire(task, now_ms).await {
                Ok(run) => runs.push(run),
                Err(e) => error!("Scheduled task '{}' ({}) failed: {:#}", task.name, task.id, e),
            }
        }
        Ok(runs)
    }

    /// Run one task immediately, due or not.
    pub async fn run_task(&self, id: &str) -> Result<Option<TaskRun>> {
        let Some(task) = self.storage.get_task(id).await? else {
            return Ok(None);
        };
        self.fire(&task, now_millis()).await.map(Some)
    }

    async fn fire(&self, task: &ScheduledTask, now_ms: i64) -> Result<TaskRun> {
        info!(
            "Running task '{}' -> {}",
            task.name,
            mask_phone(&task.phone_number)
        );
        let message_id = self
            .sender
            .send_sms(&task.phone_number, &task.content)
            .await?;
        self.storage.record_task_run(&task.id, now_ms, &message_id).await?;

        // The device may have confirmed before the run was recorded.
        if let Some(msg) = self.storage.get_message(&message_id).await? {
            if msg.status != MessageStatus::Sending {
                self.storage.update_task_run_status(&message_id, msg.status).await?;
            }
        }

        Ok(TaskRun {
            task_id: task.id.clone(),
            message_id,
        })
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Task scheduler started (daily check at {:02}:00 local)", self.check_hour);
        let mut ticker = tokio::time::interval(CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let now = Local::now();
                    if !self.should_check(now.date_naive(), now.hour()) {
                        continue;
                    }
                    if let Err(e) = self.run_due_tasks(now.timestamp_millis()).await {
                        error!("Scheduled task check failed: {:#}", e);
                    }
                }
            }
        }
        info!("Task scheduler stopped");
    }
}

/// Periodically fail outgoing records older than `max_age` that are still
/// waiting for a device confirmation.
pub async fn run_send_sweeper(storage: Arc<Storage>, max_age: Duration, shutdown: CancellationToken) {
    let every = (max_age / 2).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => match storage.sweep_stale_sending(max_age).await {
                Ok(ids) if !ids.is_empty() => {
                    warn!("{} unconfirmed SMS send(s) marked failed", ids.len());
                }
                Ok(_) => {}
                Err(e) => error!("Send confirmation sweep failed: {:#}", e),
            },
        }
    }
    debug!("Send sweeper stopped");
}
