//! The generic timer-queue scheduler.
//!
//! One dedicated thread per collector family manages the timer queue and
//! nothing else; execution happens on a bounded worker pool. Tasks are
//! single-flight: a fire that lands while the previous execution is still
//! running is accounted as a skip, never run concurrently.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use skywatch_metrics::CommonMetric;
use tracing::{debug, info};

use crate::pool::WorkerPool;
use crate::timeperiod::TimePeriod;

/// Upper bound on any single wait, so system anomalies cannot park the
/// loop forever.
const MAX_WAIT: Duration = Duration::from_secs(300);

/// A schedulable task descriptor.
pub trait TaskSpec: Clone + Send + Sync + 'static {
    fn name(&self) -> &str;
    fn interval(&self) -> Duration;

    /// Cron expression gating execution; empty means always active.
    fn cron_expr(&self) -> &str {
        ""
    }

    /// Phase-spread window override; zero uses the scheduler's factor.
    fn spread_window(&self) -> Duration {
        Duration::ZERO
    }
}

/// Executes one collection for a task. Implementations are shared across
/// worker threads.
pub trait TaskRunner<T: TaskSpec>: Send + Sync + 'static {
    fn run_once(&self, item: &T) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub name: String,
    pub workers: usize,
    pub queue_capacity: usize,
    /// Phase-spread window for initial fires.
    pub schedule_factor: Duration,
    /// Consecutive over-budget executions before a cool-down starts.
    pub exceed_threshold: u32,
    /// Fires skipped during a cool-down.
    pub cool_down_skips: u32,
    /// How long a dispatch may wait for a pool slot.
    pub commit_timeout: Duration,
    /// Execution budget as a fraction of the interval.
    pub max_exec_ratio: f64,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            name: "scheduler".to_string(),
            workers: 5,
            queue_capacity: 32,
            schedule_factor: Duration::from_secs(120),
            exceed_threshold: 3,
            cool_down_skips: 3,
            commit_timeout: Duration::from_secs(1),
            max_exec_ratio: 0.8,
        }
    }
}

impl SchedulerOptions {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// Runtime companion of a descriptor. Counters are atomics so workers and
/// the status sampler never contend with the timer loop.
pub struct TaskState<T> {
    item: T,
    cron: Option<TimePeriod>,
    max_exec: Duration,
    run_times: AtomicU64,
    error_count: AtomicU64,
    skip_count: AtomicU64,
    continue_exceed_times: AtomicU32,
    exceed_skip_times: AtomicU32,
    last_exec_millis: AtomicU64,
    in_flight: AtomicBool,
}

impl<T: TaskSpec> TaskState<T> {
    fn new(item: T, options: &SchedulerOptions) -> Self {
        let cron = match item.cron_expr() {
            "" => None,
            expr => match TimePeriod::parse(expr) {
                Ok(period) => Some(period),
                Err(e) => {
                    tracing::warn!("task '{}' has an invalid cron ({e}), ignoring", item.name());
                    None
                }
            },
        };
        let max_exec = item.interval().mul_f64(options.max_exec_ratio);
        Self {
            item,
            cron,
            max_exec,
            run_times: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            skip_count: AtomicU64::new(0),
            continue_exceed_times: AtomicU32::new(0),
            exceed_skip_times: AtomicU32::new(0),
            last_exec_millis: AtomicU64::new(0),
            in_flight: AtomicBool::new(false),
        }
    }
}

struct TimerEntry<T> {
    name: String,
    state: Weak<TaskState<T>>,
}

struct Core<T: TaskSpec> {
    published: Arc<BTreeMap<String, T>>,
    reconciled: Option<Arc<BTreeMap<String, T>>>,
    states: BTreeMap<String, Arc<TaskState<T>>>,
    timer: BTreeMap<(Instant, u64), TimerEntry<T>>,
    seq: u64,
    closed: bool,
}

struct Inner<T: TaskSpec> {
    core: Mutex<Core<T>>,
    cv: Condvar,
}

/// A snapshot row of [`Scheduler::status_metric`] internals, mostly for
/// tests and logs.
#[derive(Debug, Clone, Default)]
pub struct TaskSnapshot {
    pub name: String,
    pub run_times: u64,
    pub error_count: u64,
    pub skip_count: u64,
    pub continue_exceed_times: u32,
    pub exceed_skip_times: u32,
    pub last_exec: Duration,
}

pub struct Scheduler<T: TaskSpec, R: TaskRunner<T>> {
    inner: Arc<Inner<T>>,
    options: Arc<SchedulerOptions>,
    thread: Option<JoinHandle<()>>,
    _runner: std::marker::PhantomData<R>,
}

impl<T: TaskSpec, R: TaskRunner<T>> Scheduler<T, R> {
    /// Create the scheduler and start its timer thread.
    pub fn start(options: SchedulerOptions, runner: R) -> Self {
        let inner = Arc::new(Inner {
            core: Mutex::new(Core {
                published: Arc::new(BTreeMap::new()),
                reconciled: None,
                states: BTreeMap::new(),
                timer: BTreeMap::new(),
                seq: 0,
                closed: false,
            }),
            cv: Condvar::new(),
        });
        let options = Arc::new(options);
        let runner = Arc::new(runner);

        let pool = WorkerPool::new(
            &options.name,
            options.workers,
            options.queue_capacity.max(options.workers),
        );

        let thread = {
            let inner = inner.clone();
            let options = options.clone();
            std::thread::Builder::new()
                .name(format!("{}-timer", options.name))
                .spawn(move || run_loop(inner, runner, options, pool))
                .expect("spawning scheduler thread")
        };

        Self {
            inner,
            options,
            thread: Some(thread),
            _runner: std::marker::PhantomData,
        }
    }

    /// Publish a new descriptor set. New names get fresh state, removed
    /// names are destroyed, unchanged names keep their counters.
    pub fn set_items(&self, items: BTreeMap<String, T>) {
        let mut core = self.inner.core.lock().unwrap();
        core.published = Arc::new(items);
        self.inner.cv.notify_all();
    }

    pub fn items(&self) -> Arc<BTreeMap<String, T>> {
        self.inner.core.lock().unwrap().published.clone()
    }

    /// Counter snapshots, without clearing anything.
    pub fn snapshots(&self) -> Vec<TaskSnapshot> {
        let core = self.inner.core.lock().unwrap();
        core.states
            .iter()
            .map(|(name, state)| TaskSnapshot {
                name: name.clone(),
                run_times: state.run_times.load(Relaxed),
                error_count: state.error_count.load(Relaxed),
                skip_count: state.skip_count.load(Relaxed),
                continue_exceed_times: state.continue_exceed_times.load(Relaxed),
                exceed_skip_times: state.exceed_skip_times.load(Relaxed),
                last_exec: Duration::from_millis(state.last_exec_millis.load(Relaxed)),
            })
            .collect()
    }

    /// The family's status metric: 1 when any task skipped or failed since
    /// the previous sample, else 0. Sampling clears the skip and error
    /// counters.
    pub fn status_metric(&self, metric_name: &str) -> CommonMetric {
        let core = self.inner.core.lock().unwrap();

        let mut ok_list = Vec::new();
        let mut error_list = Vec::new();
        let mut skip_list = Vec::new();
        for (name, state) in &core.states {
            let errors = state.error_count.swap(0, Relaxed);
            let skips = state.skip_count.swap(0, Relaxed);
            if errors > 0 {
                error_list.push(name.clone());
            }
            if skips > 0 {
                skip_list.push(name.clone());
            }
            if errors == 0 && skips == 0 {
                ok_list.push(name.clone());
            }
        }

        let value = if error_list.is_empty() && skip_list.is_empty() {
            0.0
        } else {
            1.0
        };
        let timestamp = jiff::Timestamp::now().as_millisecond();

        CommonMetric::new(metric_name, value, timestamp)
            .with_tag("number_of_tasks", core.states.len().to_string())
            .with_tag("ok_list", ok_list.join(","))
            .with_tag("error_list", error_list.join(","))
            .with_tag("skip_list", skip_list.join(","))
    }

    /// Stop the loop, wait for it, release the pool and clear state.
    pub fn close(&mut self) {
        {
            // notify under the lock so a worker mid-reschedule cannot race
            // this shutdown into a missed wakeup
            let mut core = self.inner.core.lock().unwrap();
            core.closed = true;
            self.inner.cv.notify_all();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let mut core = self.inner.core.lock().unwrap();
        core.states.clear();
        core.timer.clear();
        debug!("{} closed", self.options.name);
    }
}

impl<T: TaskSpec, R: TaskRunner<T>> Drop for Scheduler<T, R> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Initial fire offset: a stable hash of the task name inside the spread
/// window, so herds of same-interval tasks do not fire together.
pub fn spread_delay(name: &str, factor: Duration) -> Duration {
    if factor.is_zero() {
        return Duration::ZERO;
    }
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    Duration::from_millis(hasher.finish() % factor.as_millis() as u64)
}

fn run_loop<T: TaskSpec, R: TaskRunner<T>>(
    inner: Arc<Inner<T>>,
    runner: Arc<R>,
    options: Arc<SchedulerOptions>,
    pool: WorkerPool,
) {
    let mut guard = inner.core.lock().unwrap();
    loop {
        if guard.closed {
            break;
        }

        reconcile(&mut guard, &options);

        let Some((&key, _)) = guard.timer.iter().next() else {
            guard = inner.cv.wait_timeout(guard, MAX_WAIT).unwrap().0;
            continue;
        };

        let now = Instant::now();
        if key.0 > now {
            let wait = (key.0 - now).min(MAX_WAIT);
            guard = inner.cv.wait_timeout(guard, wait).unwrap().0;
            continue;
        }

        let entry = guard.timer.remove(&key).expect("entry just observed");
        let Some(state) = entry.state.upgrade() else {
            continue; // task was removed
        };

        let scheduled = key.0;
        let job = execution_job(
            inner.clone(),
            runner.clone(),
            options.clone(),
            entry.name.clone(),
            state.clone(),
            scheduled,
        );

        if !pool.commit_timeout(&entry.name, options.commit_timeout, job) {
            // pool saturated: push the fire one interval out and record
            // the miss
            state.skip_count.fetch_add(1, Relaxed);
            let next = Instant::now() + tick_interval(&state.item);
            guard.seq += 1;
            let seq = guard.seq;
            guard.timer.insert(
                (next, seq),
                TimerEntry {
                    name: entry.name,
                    state: Arc::downgrade(&state),
                },
            );
        }
    }
    info!("{} loop exit", options.name);
    drop(guard);
    drop(pool);
}

fn tick_interval<T: TaskSpec>(item: &T) -> Duration {
    item.interval().max(Duration::from_millis(1))
}

/// Build the closure a worker runs for one fire: execute (unless gated or
/// cooling down), update the duration guard, then re-arm the timer with
/// skip fast-forward.
fn execution_job<T: TaskSpec, R: TaskRunner<T>>(
    inner: Arc<Inner<T>>,
    runner: Arc<R>,
    options: Arc<SchedulerOptions>,
    name: String,
    state: Arc<TaskState<T>>,
    scheduled: Instant,
) -> impl FnOnce() + Send + 'static {
    move || {
        let started = Instant::now();

        if state.in_flight.swap(true, Relaxed) {
            state.skip_count.fetch_add(1, Relaxed);
        } else {
            run_one(&*runner, &state, &options, started);
            state.in_flight.store(false, Relaxed);
        }

        // re-arm, fast-forwarding past any intervals lost to a slow run
        let interval = tick_interval(&state.item);
        let mut next = scheduled + interval;
        let now = Instant::now();
        if now > next {
            let lost = ((now - next).as_nanos() / interval.as_nanos()) as u64 + 1;
            state.skip_count.fetch_add(lost, Relaxed);
            next += interval * lost as u32;
        }

        let mut core = inner.core.lock().unwrap();
        if core.closed {
            return;
        }
        core.seq += 1;
        let seq = core.seq;
        let notify = core
            .timer
            .keys()
            .next()
            .map(|k| k.0 >= next)
            .unwrap_or(true);
        core.timer.insert(
            (next, seq),
            TimerEntry {
                name,
                state: Arc::downgrade(&state),
            },
        );
        if notify {
            inner.cv.notify_all();
        }
    }
}

fn run_one<T: TaskSpec, R: TaskRunner<T>>(
    runner: &R,
    state: &TaskState<T>,
    options: &SchedulerOptions,
    started: Instant,
) {
    // a cool-down fire is a deliberate no-op, not an error
    if state.exceed_skip_times.load(Relaxed) > 0 {
        state.exceed_skip_times.fetch_sub(1, Relaxed);
        return;
    }

    // outside the cron window the fire is also a no-op
    let due = state
        .cron
        .as_ref()
        .map(|cron| cron.matches_datetime(jiff::Zoned::now().datetime()))
        .unwrap_or(true);
    if !due {
        return;
    }

    state.run_times.fetch_add(1, Relaxed);
    if runner.run_once(&state.item).is_err() {
        state.error_count.fetch_add(1, Relaxed);
    }

    let elapsed = started.elapsed();
    state
        .last_exec_millis
        .store(elapsed.as_millis() as u64, Relaxed);
    if elapsed > state.max_exec {
        let streak = state.continue_exceed_times.fetch_add(1, Relaxed) + 1;
        if streak >= options.exceed_threshold {
            state
                .exceed_skip_times
                .store(options.cool_down_skips, Relaxed);
            state.continue_exceed_times.store(0, Relaxed);
        }
    } else {
        state.continue_exceed_times.store(0, Relaxed);
    }
}

fn reconcile<T: TaskSpec>(core: &mut Core<T>, options: &SchedulerOptions) {
    let published = core.published.clone();
    let changed = match &core.reconciled {
        Some(prev) => !Arc::ptr_eq(prev, &published),
        None => true,
    };
    if !changed {
        return;
    }
    core.reconciled = Some(published.clone());

    let mut next_states = BTreeMap::new();
    for (name, item) in published.iter() {
        if let Some(existing) = core.states.get(name) {
            next_states.insert(name.clone(), existing.clone());
            continue;
        }

        let state = Arc::new(TaskState::new(item.clone(), options));
        let factor = if item.spread_window().is_zero() {
            options.schedule_factor
        } else {
            item.spread_window()
        };
        let mut delay = spread_delay(name, factor);

        // a spread that lands outside the task's cron window starts
        // immediately instead
        if let Some(cron) = &state.cron {
            let probe = jiff::Zoned::now()
                .checked_add(jiff::SignedDuration::from_millis(delay.as_millis() as i64))
                .map(|z| z.datetime())
                .unwrap_or_else(|_| jiff::Zoned::now().datetime());
            if !cron.matches_datetime(probe) {
                delay = Duration::ZERO;
            }
        }

        info!(
            "first run of <{name}>, delay {:.3}ms, interval {:?}",
            delay.as_secs_f64() * 1000.0,
            item.interval()
        );

        let next = Instant::now() + delay;
        core.seq += 1;
        let seq = core.seq;
        core.timer.insert(
            (next, seq),
            TimerEntry {
                name: name.clone(),
                state: Arc::downgrade(&state),
            },
        );
        next_states.insert(name.clone(), state);
    }
    core.states = next_states;
}
