//! The self monitor: samples the agent's own resource usage and pulls the
//! plug when it stays over budget, so a supervisor can restart a degraded
//! process.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use skywatch_channel::CloudChannel;
use skywatch_common::config::AgentConfig;
use skywatch_common::host::{ProcessSampler, ProcessStat};
use skywatch_control::dump::{self, ResourceWaterLevel};
use skywatch_metrics::module_data::{CollectData, MetricData};
use skywatch_metrics::CommonMetric;
use skywatch_registry::TaskManager;
use tracing::{info, warn};

use crate::status_file::{AgentStatus, StatusKind};

pub type KillFn = Box<dyn Fn(i32) + Send>;
pub type StatusSource = Box<dyn Fn() -> CommonMetric + Send>;

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    /// CPU budget as a fraction of one core.
    pub cpu_fraction: f64,
    pub rss_bytes: u64,
    pub fd_count: u64,
    /// Consecutive over-budget windows before the process exits.
    pub max_exceed: u32,
}

impl ResourceLimits {
    pub fn from_config(config: &AgentConfig) -> Self {
        let default_fd = if cfg!(windows) { 700 } else { 300 };
        Self {
            cpu_fraction: config.get_parsed("agent.resource.cpu.limit", 0.5f64),
            rss_bytes: config.get_parsed("agent.resource.memory.limit", 200u64) * 1024 * 1024,
            fd_count: config.get_parsed("agent.resource.fd.limit", default_fd),
            max_exceed: config.get_parsed("agent.resource.exceed.limit", 4u32),
        }
    }
}

fn accumulate<T: PartialOrd>(value: T, threshold: T, counter: &mut u32) {
    if value >= threshold {
        *counter += 1;
    } else {
        *counter = 0;
    }
}

pub struct SelfMonitor {
    config: AgentConfig,
    manager: Arc<TaskManager>,
    channel: Arc<CloudChannel>,
    limits: ResourceLimits,
    interval: Duration,
    status_every: u64,
    status_sources: Vec<StatusSource>,
    cpu_exceed: u32,
    memory_exceed: u32,
    fd_exceed: u32,
    queue_exceed: u32,
    last_stat: Option<ProcessStat>,
    killed: bool,
    kill: KillFn,
    /// Time granted to the dump upload before exiting.
    exit_grace: Duration,
}

impl SelfMonitor {
    pub fn new(
        config: AgentConfig,
        manager: Arc<TaskManager>,
        channel: Arc<CloudChannel>,
    ) -> Self {
        let limits = ResourceLimits::from_config(&config);
        let interval =
            Duration::from_secs(config.get_parsed("agent.resource.interval", 15u64).max(1));
        let status_interval = config.get_parsed("agent.status.interval", 600u64);
        let status_every = (status_interval / interval.as_secs().max(1)).max(1);
        Self {
            config,
            manager,
            channel,
            limits,
            interval,
            status_every,
            status_sources: Vec::new(),
            cpu_exceed: 0,
            memory_exceed: 0,
            fd_exceed: 0,
            queue_exceed: 0,
            last_stat: None,
            killed: false,
            kill: Box::new(|code| std::process::exit(code)),
            exit_grace: Duration::from_secs(3),
        }
    }

    /// Add a per-family status sampler (exporter/script/module schedulers).
    pub fn add_status_source(&mut self, source: StatusSource) {
        self.status_sources.push(source);
    }

    /// Replace the process-kill hook. Tests count invocations instead of
    /// dying.
    pub fn with_kill(mut self, kill: KillFn) -> Self {
        self.kill = kill;
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Feed one sample. Returns whether the budgets demand an exit.
    pub fn observe(
        &mut self,
        stat: &ProcessStat,
        queue_empty_count: u32,
        modules_active: bool,
    ) -> bool {
        accumulate(stat.cpu_fraction, self.limits.cpu_fraction, &mut self.cpu_exceed);
        accumulate(stat.rss_bytes, self.limits.rss_bytes, &mut self.memory_exceed);
        accumulate(stat.open_fd_count, self.limits.fd_count, &mut self.fd_exceed);

        if modules_active {
            accumulate(queue_empty_count, 1, &mut self.queue_exceed);
        } else {
            self.queue_exceed = 0;
        }

        self.last_stat = Some(*stat);

        let max = self.limits.max_exceed;
        self.cpu_exceed >= max
            || self.memory_exceed >= max
            || self.fd_exceed >= max
            // the queue signal is deliberately slower to trip
            || self.queue_exceed >= 2 * max
    }

    /// Report the breach upstream, then invoke the kill hook. Idempotent.
    pub fn trip(&mut self, status: &mut AgentStatus) {
        if self.killed {
            return;
        }
        self.killed = true;

        status.update(StatusKind::Resource);

        let stat = self.last_stat.unwrap_or_default();
        let resources = vec![
            ResourceWaterLevel {
                name: "cpu",
                value: stat.cpu_fraction,
                threshold: self.limits.cpu_fraction,
                times: self.cpu_exceed,
            },
            ResourceWaterLevel {
                name: "memory",
                value: stat.rss_bytes as f64 / (1024.0 * 1024.0),
                threshold: self.limits.rss_bytes as f64 / (1024.0 * 1024.0),
                times: self.memory_exceed,
            },
            ResourceWaterLevel {
                name: "openFiles",
                value: stat.open_fd_count as f64,
                threshold: self.limits.fd_count as f64,
                times: self.fd_exceed,
            },
        ];

        let stacks = std::backtrace::Backtrace::force_capture().to_string();
        dump::send_thread_dump(&resources, &[], &stacks, &self.manager, &self.config);

        // give the transport a moment before dying
        std::thread::sleep(self.exit_grace);
        (self.kill)(1);
    }

    /// Sampling loop. Runs until shutdown or a resource breach.
    pub fn run(&mut self, keep_running: &AtomicBool, status: &mut AgentStatus) {
        let Some(mut sampler) = ProcessSampler::new() else {
            warn!("cannot observe own process, self monitor disabled");
            return;
        };

        let mut iteration: u64 = 0;
        let mut trim_countdown: u32 = 0;
        loop {
            iteration += 1;

            if let Some(stat) = sampler.sample() {
                let queue_empty = self.channel.queue_empty_count();
                let modules_active = !self.manager.module_items().is_empty()
                    || !self.manager.exporter_items().is_empty();

                // the first window has no CPU delta yet
                let will_exit =
                    iteration > 1 && self.observe(&stat, queue_empty, modules_active);

                info!(
                    "cpuUsage={:.2}%[>={:.2}% {}/{}], memory={:.3}MB[>={:.2}MB {}/{}], openFiles={}[>={} {}/{}], outputChannelEmpty={}[{}/{}]{}",
                    stat.cpu_fraction * 100.0,
                    self.limits.cpu_fraction * 100.0,
                    self.cpu_exceed,
                    self.limits.max_exceed,
                    stat.rss_bytes as f64 / (1024.0 * 1024.0),
                    self.limits.rss_bytes as f64 / (1024.0 * 1024.0),
                    self.memory_exceed,
                    self.limits.max_exceed,
                    stat.open_fd_count,
                    self.limits.fd_count,
                    self.fd_exceed,
                    self.limits.max_exceed,
                    queue_empty > 0,
                    self.queue_exceed,
                    2 * self.limits.max_exceed,
                    if will_exit { " => will exit" } else { "" }
                );

                if will_exit {
                    self.trip(status);
                    return;
                }
            }

            heap_trim_hint(&mut trim_countdown);

            if iteration % self.status_every == 0 {
                self.emit_status();
            }

            if !skywatch_channel::channel::sleep_while_running(self.interval, keep_running) {
                return;
            }
        }
    }

    /// Sample every registered status source plus the agent summary and
    /// queue them for the reporting channel.
    fn emit_status(&self) {
        let mut metrics: Vec<CommonMetric> =
            self.status_sources.iter().map(|source| source()).collect();

        let agent_status = metrics.iter().map(|m| m.value).fold(0.0f64, f64::max);
        let mut summary = CommonMetric::new(
            "agent_status",
            agent_status,
            jiff::Timestamp::now().as_millisecond(),
        );
        summary
            .tags
            .insert("agent_version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        metrics.push(summary);

        let mut collect = CollectData {
            module_name: "agent_status".to_string(),
            data: Vec::with_capacity(metrics.len()),
        };
        for metric in &metrics {
            let mut data = MetricData::default();
            data.tags.insert("metricName".to_string(), metric.name.clone());
            data.tags.insert("ns".to_string(), "agent".to_string());
            for (key, value) in &metric.tags {
                data.tags.insert(key.clone(), value.clone());
            }
            data.values.insert("metricValue".to_string(), metric.value);
            collect.data.push(data);
        }

        self.channel.add_message("agent_status", collect.encode());
    }
}

#[cfg(target_os = "linux")]
fn heap_trim_hint(countdown: &mut u32) {
    *countdown += 1;
    if *countdown >= 60 {
        info!("will malloc_trim");
        *countdown = 0;
        unsafe {
            libc::malloc_trim(0);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn heap_trim_hint(_countdown: &mut u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use skywatch_common::clock::ClockSource;
    use skywatch_common::properties::Properties;
    use skywatch_transport::HttpResponse;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_monitor(limits_cpu: &str) -> (SelfMonitor, Arc<AtomicUsize>) {
        let mut config =
            AgentConfig::new(Properties::new(), PathBuf::from("."), PathBuf::from("."));
        config.set("agent.resource.cpu.limit", limits_cpu);
        config.set("agent.resource.exceed.limit", "4");

        let manager = TaskManager::new();
        let channel = Arc::new(CloudChannel::with_post(
            config.clone(),
            manager.clone(),
            Box::new(|_| HttpResponse {
                res_code: 200,
                ..Default::default()
            }),
        ));

        let kills = Arc::new(AtomicUsize::new(0));
        let counted = kills.clone();
        let monitor = SelfMonitor::new(config, manager, channel)
            .with_kill(Box::new(move |_| {
                counted.fetch_add(1, Ordering::SeqCst);
            }))
            .with_exit_grace(Duration::ZERO);
        (monitor, kills)
    }

    fn stat(cpu: f64) -> ProcessStat {
        ProcessStat {
            cpu_fraction: cpu,
            rss_bytes: 10 * 1024 * 1024,
            open_fd_count: 20,
        }
    }

    #[test]
    fn sustained_cpu_overage_trips_after_max_windows() {
        let (mut monitor, _) = test_monitor("0.1");

        assert!(!monitor.observe(&stat(0.5), 0, false));
        assert!(!monitor.observe(&stat(0.5), 0, false));
        assert!(!monitor.observe(&stat(0.5), 0, false));
        assert!(monitor.observe(&stat(0.5), 0, false));
    }

    #[test]
    fn a_single_good_window_resets_the_streak() {
        let (mut monitor, _) = test_monitor("0.1");

        for _ in 0..3 {
            assert!(!monitor.observe(&stat(0.5), 0, false));
        }
        assert!(!monitor.observe(&stat(0.01), 0, false));
        // the streak starts over
        for _ in 0..3 {
            assert!(!monitor.observe(&stat(0.5), 0, false));
        }
        assert!(monitor.observe(&stat(0.5), 0, false));
    }

    #[test]
    fn kill_hook_fires_exactly_once() {
        let (mut monitor, kills) = test_monitor("0.1");
        let dir = tempfile::tempdir().unwrap();
        let mut status = AgentStatus::load(
            dir.path().join("agent.status"),
            ClockSource::new_mock(1_700_000_000_000),
        );

        for _ in 0..4 {
            monitor.observe(&stat(0.9), 0, false);
        }
        monitor.trip(&mut status);
        monitor.trip(&mut status);
        assert_eq!(kills.load(Ordering::SeqCst), 1);
        assert_eq!(status.get(StatusKind::Resource), 1);
    }

    #[test]
    fn queue_liveness_needs_twice_the_windows_and_active_modules() {
        let (mut monitor, _) = test_monitor("0.9");

        // inactive modules: the queue signal is ignored
        for _ in 0..20 {
            assert!(!monitor.observe(&stat(0.0), 99, false));
        }

        // active modules: 2 * max consecutive empty windows trip
        for i in 1..8 {
            assert!(!monitor.observe(&stat(0.0), i, true), "window {i}");
        }
        assert!(monitor.observe(&stat(0.0), 8, true));
    }

    #[test]
    fn emit_status_queues_one_module_message() {
        let (mut monitor, _) = test_monitor("0.5");
        monitor.add_status_source(Box::new(|| {
            CommonMetric::new("exporter_status", 1.0, 0)
                .with_tag("number_of_tasks", "2")
        }));

        monitor.emit_status();
        assert_eq!(monitor.channel.queue_len(), 1);
    }
}
