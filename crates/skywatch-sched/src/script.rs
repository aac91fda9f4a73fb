//! The script collector: run a configured command line, parse its output
//! as metric lines, deliver like any other collector.

use std::collections::BTreeMap;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use skywatch_metrics::labels::{build_filter_map, filter_metric_name, LabelPlan, LabelSource};
use skywatch_metrics::prometheus;
use skywatch_metrics::CommonMetric;
use skywatch_registry::model::ScriptItem;
use skywatch_registry::TaskManager;
use skywatch_common::host;
use tracing::warn;

use crate::scheduler::{TaskRunner, TaskSpec};
use crate::OutputChannel;

impl TaskSpec for ScriptItem {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        ScriptItem::interval(self)
    }

    fn cron_expr(&self) -> &str {
        &self.cron_expr
    }

    fn spread_window(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

struct HostLabels {
    manager: Arc<TaskManager>,
}

impl LabelSource for HostLabels {
    fn get(&self, key: &str) -> String {
        match key {
            "ip" => host::main_ip(),
            "hostname" | "__hostname__" => host::hostname(),
            "sn" => self.manager.cloud_agent_info().serial_number.clone(),
            _ => String::new(),
        }
    }
}

pub struct ScriptCollector {
    manager: Arc<TaskManager>,
    sinks: BTreeMap<String, Arc<dyn OutputChannel>>,
}

impl ScriptCollector {
    pub fn new(
        manager: Arc<TaskManager>,
        sinks: BTreeMap<String, Arc<dyn OutputChannel>>,
    ) -> Self {
        Self { manager, sinks }
    }

    fn timeout(item: &ScriptItem) -> Duration {
        if item.timeout_secs > 0 {
            Duration::from_secs(item.timeout_secs)
        } else {
            ScriptItem::interval(item)
        }
    }
}

/// Run a command line through the shell, killing it when `timeout`
/// elapses. Returns stdout, falling back to stderr when stdout is empty.
pub fn run_command(command_line: &str, timeout: Duration) -> Result<String, String> {
    #[cfg(unix)]
    let mut command = {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command_line);
        c
    };
    #[cfg(not(unix))]
    let mut command = {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command_line);
        c
    };

    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("spawning '{command_line}': {e}"))?;

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("'{command_line}' timed out after {timeout:?}"));
                }
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(format!("waiting for '{command_line}': {e}")),
        }
    }

    let output = child
        .wait_with_output()
        .map_err(|e| format!("collecting output of '{command_line}': {e}"))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if stdout.is_empty() {
        Ok(String::from_utf8_lossy(&output.stderr).into_owned())
    } else {
        Ok(stdout)
    }
}

impl TaskRunner<ScriptItem> for ScriptCollector {
    fn run_once(&self, item: &ScriptItem) -> Result<(), String> {
        let output = run_command(&item.target, Self::timeout(item))?;
        if output.trim().is_empty() {
            return Err(format!("script '{}' produced no output", item.name));
        }

        let metrics = prometheus::parse_metrics(&output);
        if metrics.is_empty() {
            return Err(format!("script '{}' produced no parseable metrics", item.name));
        }

        let filters = build_filter_map(&item.metric_filters);
        let plan = LabelPlan::build(
            &item.add_labels,
            &HostLabels {
                manager: self.manager.clone(),
            },
        );

        let mut out = Vec::with_capacity(metrics.len());
        for mut metric in metrics {
            match filter_metric_name(&metric, &filters) {
                None => continue,
                Some(renamed) if !renamed.is_empty() => metric.name = renamed,
                Some(_) => {}
            }
            plan.apply(&mut metric);
            out.push(metric);
        }

        deliver(&self.sinks, item, &out)
    }
}

fn deliver(
    sinks: &BTreeMap<String, Arc<dyn OutputChannel>>,
    item: &ScriptItem,
    metrics: &[CommonMetric],
) -> Result<(), String> {
    if metrics.is_empty() {
        return Ok(());
    }
    let mut first_error = None;
    for sink in &item.output {
        match sinks.get(&sink.channel) {
            Some(channel) => {
                if let Err(e) = channel.send_metrics(&sink.conf, metrics) {
                    warn!("delivering '{}' to channel '{}': {e}", item.name, sink.channel);
                    first_error.get_or_insert(e);
                }
            }
            None => warn!("task '{}' names unknown channel '{}'", item.name, sink.channel),
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
