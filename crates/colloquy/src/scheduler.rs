//! Pairing round work with unrelated background work
//!
//! Every consume attempt, and every round as a whole, runs side by side with a
//! [`BackgroundTask`] in the same scheduling step. The pair completes when both
//! halves do, and only the primary's output is returned. A failing or
//! panicking background task is logged and counted, nothing more.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{info, trace, warn};

use crate::{stats::StatsCollector, types::Role};

/// Error type background tasks may return
pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Where in the conversation a background task is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    pub role: Role,
    pub round: usize,
    /// Consume attempt number; `None` for the round-level pairing
    pub attempt: Option<u32>,
}

impl TaskContext {
    /// Context for the round-level background task
    pub fn round(role: Role, round: usize) -> Self {
        Self {
            role,
            round,
            attempt: None,
        }
    }

    /// Context for one consume attempt
    pub fn attempt(role: Role, round: usize, attempt: u32) -> Self {
        Self {
            role,
            round,
            attempt: Some(attempt),
        }
    }
}

/// Work that runs alongside the conversation without affecting it
#[async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Name used in log lines
    fn name(&self) -> &str;

    /// Run once for the given context
    async fn run(&self, ctx: TaskContext) -> Result<(), TaskError>;
}

/// Logs one line per invocation
#[derive(Debug, Clone, Copy, Default)]
pub struct Heartbeat;

#[async_trait]
impl BackgroundTask for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn run(&self, ctx: TaskContext) -> Result<(), TaskError> {
        info!(
            role = %ctx.role,
            round = ctx.round,
            attempt = ?ctx.attempt,
            "Doing other work while the conversation waits"
        );
        Ok(())
    }
}

/// Does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct Idle;

#[async_trait]
impl BackgroundTask for Idle {
    fn name(&self) -> &str {
        "idle"
    }

    async fn run(&self, _ctx: TaskContext) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Runs a primary future together with a background task
#[derive(Clone)]
pub struct Scheduler {
    task: Arc<dyn BackgroundTask>,
    stats: StatsCollector,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("task", &self.task.name())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(task: Arc<dyn BackgroundTask>, stats: StatsCollector) -> Self {
        Self { task, stats }
    }

    /// Scheduler whose background half does nothing
    pub fn idle(stats: StatsCollector) -> Self {
        Self::new(Arc::new(Idle), stats)
    }

    /// Name of the paired background task
    pub fn task_name(&self) -> &str {
        self.task.name()
    }

    /// Run `primary` and the background task concurrently, wait for both,
    /// and return the primary's output
    pub async fn pair<F>(&self, primary: F, ctx: TaskContext) -> F::Output
    where
        F: Future,
    {
        let background = AssertUnwindSafe(self.task.run(ctx)).catch_unwind();
        let (output, outcome) = tokio::join!(primary, background);

        match outcome {
            Ok(Ok(())) => {
                trace!(task = self.task.name(), round = ctx.round, "Background task finished");
            }
            Ok(Err(error)) => {
                warn!(
                    task = self.task.name(),
                    role = %ctx.role,
                    round = ctx.round,
                    error = %error,
                    "Background task failed; round continues"
                );
                self.stats.record_background_failure().await;
            }
            Err(panic) => {
                warn!(
                    task = self.task.name(),
                    role = %ctx.role,
                    round = ctx.round,
                    panic = panic_message(panic.as_ref()),
                    "Background task panicked; round continues"
                );
                self.stats.record_background_failure().await;
            }
        }

        output
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
