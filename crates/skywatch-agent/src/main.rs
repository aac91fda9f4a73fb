//!
//! # Agent Operating Model
//!
//! - **Thread per plane**: bootstrap runs once on the main thread, then
//!   the control client, the reporting channel, each scheduler family and
//!   the self monitor run on their own named threads.
//!
//! - **Shared state by snapshot**: every cache in the task manager is an
//!   immutable snapshot swapped by pointer; no component blocks another
//!   while reading.
//!
//! - **Pipeline**: bootstrap -> heartbeat -> task caches -> schedulers ->
//!   collectors -> reporting channel -> metric hub.
//!
mod args;
mod selfmon;
mod sinks;
mod status_file;

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Relaxed, Release};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use skywatch_bootstrap::ProxyManager;
use skywatch_channel::channel::sleep_while_running;
use skywatch_channel::CloudChannel;
use skywatch_common::clock::ClockSource;
use skywatch_common::config::AgentConfig;
use skywatch_control::ControlClient;
use skywatch_registry::model::{ExporterItem, ModuleItem, ScriptItem};
use skywatch_registry::TaskManager;
use skywatch_sched::exporter::ExporterCollector;
use skywatch_sched::module::{CollectorRegistry, ModuleCollector};
use skywatch_sched::script::ScriptCollector;
use skywatch_sched::{OutputChannel, Scheduler, SchedulerOptions};
use tracing::{debug, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{filter, Layer};

use crate::args::Args;
use crate::selfmon::SelfMonitor;
use crate::status_file::{AgentStatus, StatusKind};

/// Global flag flipped to `false` when every thread should exit.
static KEEP_RUNNING: AtomicBool = AtomicBool::new(true);

fn main() {
    set_ctrlc_handler();

    let args = Args::parse();
    enable_logging(&args);
    debug!("{args:?}");

    let log_dir = args.log_dir();
    let _ = std::fs::create_dir_all(&args.base_dir);
    let _ = std::fs::create_dir_all(&log_dir);

    let mut config = AgentConfig::load(args.base_dir.clone(), log_dir);
    for (key, value) in args.define_pairs() {
        config.set(&key, &value);
    }
    if args.insecure_tls {
        config.set("tls.verify", "false");
    }

    let manager = TaskManager::new();

    let mut status = AgentStatus::load(
        config.base_dir().join("agent.status"),
        ClockSource::System,
    );
    status.update(StatusKind::Start);

    // network identity, exactly once; the control client re-runs it on
    // sustained heartbeat failure
    let proxy_manager = Arc::new(Mutex::new(ProxyManager::new(config.clone())));
    let agent_info = proxy_manager.lock().unwrap().init(&KEEP_RUNNING);
    manager.set_cloud_agent_info(agent_info);

    let channel = Arc::new(CloudChannel::new(config.clone(), manager.clone()));

    let cloud_output: Arc<dyn OutputChannel> =
        Arc::new(sinks::CloudOutput::new(channel.clone()));
    let output_channels = BTreeMap::from([("cloud".to_string(), cloud_output)]);

    let exporter_scheduler = Arc::new(Scheduler::start(
        scheduler_options(&config, "exporter", "agent.exporter.pool.max", 5),
        ExporterCollector::new(manager.clone(), output_channels.clone()),
    ));
    let script_scheduler = Arc::new(Scheduler::start(
        scheduler_options(&config, "script", "agent.script.pool.max", 100),
        ScriptCollector::new(manager.clone(), output_channels),
    ));
    let module_scheduler = Arc::new(Scheduler::start(
        scheduler_options(&config, "module", "agent.module.pool.max", 5),
        ModuleCollector::new(
            Arc::new(CollectorRegistry::new()),
            Arc::new(sinks::CloudResultSink::new(channel.clone())),
        ),
    ));

    let mut monitor = SelfMonitor::new(config.clone(), manager.clone(), channel.clone());
    {
        let sched = exporter_scheduler.clone();
        monitor.add_status_source(Box::new(move || sched.status_metric("exporter_status")));
        let sched = script_scheduler.clone();
        monitor.add_status_source(Box::new(move || sched.status_metric("script_status")));
        let sched = module_scheduler.clone();
        monitor.add_status_source(Box::new(move || sched.status_metric("module_status")));
    }

    let mut threads = Vec::new();

    {
        let config = config.clone();
        let manager = manager.clone();
        let proxy_manager = proxy_manager.clone();
        threads.push(spawn_named("control", move || {
            let mut client = ControlClient::new(config, manager, proxy_manager);
            client.run(&KEEP_RUNNING);
        }));
    }

    {
        let channel = channel.clone();
        threads.push(spawn_named("channel", move || {
            channel.run(&KEEP_RUNNING);
        }));
    }

    {
        let manager = manager.clone();
        let exporter = exporter_scheduler.clone();
        let script = script_scheduler.clone();
        let module = module_scheduler.clone();
        threads.push(spawn_named("task-sync", move || {
            task_sync_loop(manager, exporter, script, module);
        }));
    }

    threads.push(spawn_named("self-monitor", move || {
        // a resource breach exits the process inside run(); returning
        // here is a normal shutdown or a disabled monitor
        monitor.run(&KEEP_RUNNING, &mut status);
    }));

    for thread in threads {
        let _ = thread.join();
    }

    info!("Agent finished");
}

fn spawn_named<F>(name: &str, body: F) -> std::thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .expect("spawning thread")
}

fn scheduler_options(
    config: &AgentConfig,
    family: &str,
    workers_key: &str,
    default_workers: usize,
) -> SchedulerOptions {
    let mut options = SchedulerOptions::named(family);
    options.workers = config.get_parsed(workers_key, default_workers).max(1);
    options.queue_capacity = options.workers * 4;
    options.schedule_factor = Duration::from_secs(
        config.get_parsed("agent.schedule.factor", 120u64).max(1),
    );
    options
}

/// Push task cache replacements into the schedulers. Each published map is
/// an `Arc` snapshot, so a pointer comparison is enough to detect change.
fn task_sync_loop(
    manager: Arc<TaskManager>,
    exporter: Arc<Scheduler<ExporterItem, ExporterCollector>>,
    script: Arc<Scheduler<ScriptItem, ScriptCollector>>,
    module: Arc<Scheduler<ModuleItem, ModuleCollector>>,
) {
    let mut prev_exporters = manager.exporter_items();
    let mut prev_scripts = manager.script_items();
    let mut prev_modules = manager.module_items();

    while KEEP_RUNNING.load(Relaxed) {
        let exporters = manager.exporter_items();
        if !Arc::ptr_eq(&prev_exporters, &exporters) {
            info!("exporter task set changed ({} tasks)", exporters.len());
            exporter.set_items((*exporters).clone());
            prev_exporters = exporters;
        }

        let scripts = manager.script_items();
        if !Arc::ptr_eq(&prev_scripts, &scripts) {
            info!("script task set changed ({} tasks)", scripts.len());
            script.set_items((*scripts).clone());
            prev_scripts = scripts;
        }

        let modules = manager.module_items();
        if !Arc::ptr_eq(&prev_modules, &modules) {
            info!("module task set changed ({} tasks)", modules.len());
            module.set_items((*modules).clone());
            prev_modules = modules;
        }

        if !sleep_while_running(Duration::from_secs(1), &KEEP_RUNNING) {
            break;
        }
    }
}

fn set_ctrlc_handler() {
    ctrlc::set_handler(|| {
        info!("Received Ctrl-C, exiting...");
        KEEP_RUNNING.store(false, Release);
    })
    .expect("Error setting Ctrl-C handler");
}

fn enable_logging(args: &Args) {
    // the HTTP and TLS stacks are chatty; "normal" for them is WARN
    let stack_verbosity = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        3.. => tracing::Level::TRACE,
    };

    let verbosity = if args.quiet {
        tracing::Level::ERROR
    } else {
        match args.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            2.. => tracing::Level::TRACE,
        }
    };

    let filters = filter::Targets::new()
        .with_target("ureq", stack_verbosity)
        .with_target("rustls", stack_verbosity)
        .with_default(verbosity);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_filter(filters);

    tracing_subscriber::registry().with(fmt_layer).init();
}
