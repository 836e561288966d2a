//! Deferred-task scheduling.
//!
//! Lock expiry cleanup and provisional-node deletion run as one-shot
//! delayed tasks. The trait exists so tests can inject their own clock
//! and so the gateway never reaches for a global executor.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

pub type ScheduledTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs a task once, after a delay.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule_once(&self, delay: Duration, task: ScheduledTask);
}

/// `Scheduler` on top of the tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, task: ScheduledTask) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }
}
