//! The scheduler core and its collectors: a single timer thread per
//! collector family dispatching work to a bounded pool, gated by cron
//! windows and guarded against slow tasks.

#![forbid(unsafe_code)]

pub mod alimetric;
pub mod exporter;
pub mod module;
pub mod pool;
pub mod scheduler;
pub mod script;
pub mod timeperiod;

pub use scheduler::{Scheduler, SchedulerOptions, TaskRunner, TaskSpec};
pub use timeperiod::TimePeriod;

use skywatch_metrics::CommonMetric;

/// Where collected metrics go. The agent wires channel names to concrete
/// outputs; collectors only know the name and the per-channel config blob.
pub trait OutputChannel: Send + Sync {
    fn send_metrics(&self, conf: &str, metrics: &[CommonMetric]) -> Result<(), String>;
}
