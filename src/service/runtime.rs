//! Clock and scheduler seams.
//!
//! Both exist so the payment polling loop can be driven deterministically
//! in tests; production wiring uses the system clock and the tokio runtime.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub type ScheduledTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Fire-and-forget delayed execution. Each poll attempt is one discrete
/// scheduled unit; "cancelling" a polling chain is simply not rescheduling.
pub trait Scheduler: Send + Sync {
    fn schedule_once(&self, delay: Duration, task: ScheduledTask);
}

pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_once(&self, delay: Duration, task: ScheduledTask) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }
}
