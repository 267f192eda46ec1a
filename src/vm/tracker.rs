//! Long-running task tracking
//!
//! The VM API answers state-changing calls with a task id (UPID) and keeps
//! working in the background. [`TaskTracker`] follows such a task in two
//! phases: it reads the task log until the last line says the work is done,
//! then polls the task status until the task has actually stopped.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use crate::Result;
use crate::config::TrackerConfig;

/// Status of a task as reported by the VM API
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskStatus {
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

/// Where a tracker reads task progress from
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Latest line of the task log
    async fn task_log(&self, upid: &str) -> Result<String>;

    async fn task_status(&self, upid: &str) -> Result<TaskStatus>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    NoneYet,
    Running,
    Ok,
    Error,
}

/// A submitted task and what has been observed about it so far
#[derive(Debug, Clone, PartialEq)]
pub struct TaskHandle {
    pub upid: String,
    pub last_known_percent: Option<f64>,
    pub terminal_state: TerminalState,
}

impl TaskHandle {
    pub fn new(upid: impl Into<String>) -> Self {
        Self {
            upid: upid.into(),
            last_known_percent: None,
            terminal_state: TerminalState::NoneYet,
        }
    }
}

/// Final verdict on a tracked task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    /// The task reported an error; carries the log line or exit status
    Failed(String),
    /// Tracking stopped before a verdict could be observed
    Unknown(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded)
    }
}

/// Receives progress while a task is tracked
pub trait ProgressSink: Send + Sync {
    fn begin(&self, _message: &str) {}

    fn update(&self, percent: f64);

    /// The log reports completion; waiting for the task to stop
    fn settling(&self) {}

    fn finish(&self, _outcome: &TaskOutcome) {}
}

/// Discards all progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&self, _percent: f64) {}
}

/// Meaning of a single task log line
#[derive(Debug, Clone, PartialEq)]
pub enum LogLine {
    /// Work is finished (including "already in that state" errors)
    Complete,
    Failed,
    Progress(f64),
    /// Nothing usable; keep the previous percentage
    Unparsable,
}

/// Interpret the latest task log line
pub fn interpret_log_line(line: &str) -> LogLine {
    if line.contains("TASK ERROR") {
        // e.g. "TASK ERROR: VM 101 already running" is a no-op, not a failure
        if line.contains("already") {
            return LogLine::Complete;
        }
        return LogLine::Failed;
    }
    if line.contains("TASK OK") {
        return LogLine::Complete;
    }

    let trimmed = line.trim_end_matches(|c: char| c.is_whitespace() || c == '%' || c == ')');
    let token = trimmed
        .split_whitespace()
        .last()
        .unwrap_or_default()
        .trim_matches(|c| c == '(' || c == ')' || c == '%');

    match token.parse::<f64>() {
        Ok(percent) if percent.is_finite() => LogLine::Progress(percent.clamp(0.0, 100.0)),
        _ => LogLine::Unparsable,
    }
}

/// Follows tasks to completion
#[derive(Debug, Clone, Copy)]
pub struct TaskTracker {
    log_interval: Duration,
    settle_interval: Duration,
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(2))
    }
}

impl TaskTracker {
    pub fn new(log_interval: Duration, settle_interval: Duration) -> Self {
        Self {
            log_interval,
            settle_interval,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.log_interval(), config.settle_interval())
    }

    /// Poll `source` until the task behind `handle` reaches a verdict
    ///
    /// Errors while polling never surface as success: they end tracking
    /// with [`TaskOutcome::Unknown`].
    pub async fn track<S: TaskSource + ?Sized>(
        &self,
        source: &S,
        handle: &mut TaskHandle,
        sink: &dyn ProgressSink,
    ) -> TaskOutcome {
        handle.terminal_state = TerminalState::Running;

        let outcome = match self.poll(source, handle, sink).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!("Lost track of task {}: {}", handle.upid, e);
                TaskOutcome::Unknown(e.to_string())
            }
        };

        match outcome {
            TaskOutcome::Succeeded => handle.terminal_state = TerminalState::Ok,
            TaskOutcome::Failed(_) => handle.terminal_state = TerminalState::Error,
            TaskOutcome::Unknown(_) => {}
        }
        sink.finish(&outcome);
        outcome
    }

    async fn poll<S: TaskSource + ?Sized>(
        &self,
        source: &S,
        handle: &mut TaskHandle,
        sink: &dyn ProgressSink,
    ) -> Result<TaskOutcome> {
        loop {
            let line = source.task_log(&handle.upid).await?;
            tracing::debug!("Task {} log: {}", handle.upid, line);

            match interpret_log_line(&line) {
                LogLine::Failed => return Ok(TaskOutcome::Failed(line)),
                LogLine::Complete => {
                    handle.last_known_percent = Some(100.0);
                    sink.update(100.0);
                    break;
                }
                LogLine::Progress(percent) => {
                    handle.last_known_percent = Some(percent);
                    sink.update(percent);
                    if percent >= 100.0 {
                        break;
                    }
                }
                LogLine::Unparsable => {}
            }

            tokio::time::sleep(self.log_interval).await;
        }

        sink.settling();
        loop {
            let status = source.task_status(&handle.upid).await?;
            if status.status != "running" {
                return Ok(settle(status));
            }
            tokio::time::sleep(self.settle_interval).await;
        }
    }
}

fn settle(status: TaskStatus) -> TaskOutcome {
    if status.status != "stopped" {
        return TaskOutcome::Unknown(format!("task ended in state '{}'", status.status));
    }
    match status.exitstatus.as_deref() {
        Some("OK") => TaskOutcome::Succeeded,
        Some(other) => TaskOutcome::Failed(other.to_string()),
        None => TaskOutcome::Failed("no exit status".to_string()),
    }
}
