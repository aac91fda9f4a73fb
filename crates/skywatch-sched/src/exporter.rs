//! The HTTP exporter collector: scrape a target, parse the body, decorate
//! and deliver.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use skywatch_common::clock::ClockSource;
use skywatch_common::host;
use skywatch_metrics::labels::{
    build_filter_map, filter_metric_name, LabelPlan, LabelSource,
};
use skywatch_metrics::prometheus;
use skywatch_metrics::CommonMetric;
use skywatch_registry::model::ExporterItem;
use skywatch_registry::TaskManager;
use skywatch_transport::{http_get, HttpRequest, HttpResponse};
use tracing::warn;

use crate::scheduler::{TaskRunner, TaskSpec};
use crate::{alimetric, OutputChannel};

/// Exporter body shapes.
pub const KIND_PROMETHEUS: i32 = 0;
pub const KIND_QUANTIZED_JSON: i32 = 1;

impl TaskSpec for ExporterItem {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> std::time::Duration {
        ExporterItem::interval(self)
    }

    fn cron_expr(&self) -> &str {
        &self.cron_expr
    }
}

pub type FetchFn = Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// Resolves host-derived labels (type 0 additions).
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

pub struct ExporterCollector {
    manager: Arc<TaskManager>,
    sinks: BTreeMap<String, Arc<dyn OutputChannel>>,
    fetch: FetchFn,
    clock: ClockSource,
    /// Per-task, per-metric last reported bucket for the quantized shape.
    buckets: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl ExporterCollector {
    pub fn new(
        manager: Arc<TaskManager>,
        sinks: BTreeMap<String, Arc<dyn OutputChannel>>,
    ) -> Self {
        Self::with_fetch(manager, sinks, Box::new(|request| http_get(request)))
    }

    pub fn with_fetch(
        manager: Arc<TaskManager>,
        sinks: BTreeMap<String, Arc<dyn OutputChannel>>,
        fetch: FetchFn,
    ) -> Self {
        Self {
            manager,
            sinks,
            fetch,
            clock: ClockSource::System,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: ClockSource) -> Self {
        self.clock = clock;
        self
    }

    /// Parse a scrape body into metrics. Returns the metrics plus whether
    /// any line failed to parse.
    fn parse_body(&self, item: &ExporterItem, body: &str) -> Result<(Vec<CommonMetric>, bool), String> {
        if item.kind == KIND_QUANTIZED_JSON {
            let metric_map = alimetric::build_metric_map(&item.metric_filters);
            let mut buckets = self.buckets.lock().unwrap();
            let last = buckets.entry(item.name.clone()).or_default();
            return alimetric::parse(body, &metric_map, last).map(|metrics| (metrics, false));
        }

        let stamp = self.clock.epoch_millis() as i64;
        let mut metrics = Vec::new();
        let mut had_invalid = false;
        for line in body.lines() {
            match prometheus::parse_line(line) {
                Ok(mut metric) => {
                    if metric.timestamp == 0 {
                        metric.timestamp = stamp;
                    }
                    metrics.push(metric);
                }
                Err(prometheus::LineError::Skip) => {}
                Err(_) => had_invalid = true,
            }
        }
        Ok((metrics, had_invalid))
    }

    /// Filter/rename, decorate, and hand off to every configured sink.
    fn deliver(&self, item: &ExporterItem, metrics: Vec<CommonMetric>) -> Result<(), String> {
        let filters = build_filter_map(&item.metric_filters);
        let plan = LabelPlan::build(
            &item.add_labels,
            &HostLabels {
                manager: self.manager.clone(),
            },
        );

        let mut out = Vec::with_capacity(metrics.len());
        for mut metric in metrics {
            // the quantized shape pre-filters by metric map
            if item.kind != KIND_QUANTIZED_JSON {
                match filter_metric_name(&metric, &filters) {
                    None => continue,
                    Some(renamed) if !renamed.is_empty() => metric.name = renamed,
                    Some(_) => {}
                }
            }
            plan.apply(&mut metric);
            out.push(metric);
        }

        if out.is_empty() {
            return Ok(());
        }

        let mut first_error = None;
        for sink in &item.output {
            match self.sinks.get(&sink.channel) {
                Some(channel) => {
                    if let Err(e) = channel.send_metrics(&sink.conf, &out) {
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
}

impl TaskRunner<ExporterItem> for ExporterCollector {
    fn run_once(&self, item: &ExporterItem) -> Result<(), String> {
        let request = HttpRequest::new(item.target.clone()).with_timeout(item.timeout());
        let response = (self.fetch)(&request);

        if response.res_code == 0 {
            return Err(format!(
                "scrape of {} failed: {}",
                item.target, response.error_msg
            ));
        }
        if !response.is_ok() {
            return Err(format!(
                "scrape of {} answered {}",
                item.target, response.res_code
            ));
        }

        let (metrics, had_invalid) = self.parse_body(item, &response.result)?;
        self.deliver(item, metrics)?;

        if had_invalid {
            Err(format!("scrape of {} contained invalid lines", item.target))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skywatch_metrics::labels::LabelAddInfo;
    use skywatch_registry::model::OutputSink;
    use std::sync::Mutex as StdMutex;

    struct RecordingChannel {
        batches: StdMutex<Vec<(String, Vec<CommonMetric>)>>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: StdMutex::new(Vec::new()),
            })
        }
    }

    impl OutputChannel for RecordingChannel {
        fn send_metrics(&self, conf: &str, metrics: &[CommonMetric]) -> Result<(), String> {
            self.batches
                .lock()
                .unwrap()
                .push((conf.to_string(), metrics.to_vec()));
            Ok(())
        }
    }

    fn collector_for(
        body: &'static str,
        status: u16,
    ) -> (ExporterCollector, Arc<RecordingChannel>) {
        let channel = RecordingChannel::new();
        let mut sinks: BTreeMap<String, Arc<dyn OutputChannel>> = BTreeMap::new();
        sinks.insert("cloud".to_string(), channel.clone());

        let fetch: FetchFn = Box::new(move |_| HttpResponse {
            res_code: status,
            result: body.to_string(),
            ..Default::default()
        });
        let collector = ExporterCollector::with_fetch(TaskManager::new(), sinks, fetch)
            .with_clock(ClockSource::new_mock(1_700_000_000_000));
        (collector, channel)
    }

    fn exporter(name: &str) -> ExporterItem {
        ExporterItem {
            name: name.to_string(),
            target: "http://127.0.0.1:9100/metrics".to_string(),
            interval_secs: 15,
            output: vec![OutputSink {
                channel: "cloud".to_string(),
                conf: "{}".to_string(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn scrape_parses_and_delivers() {
        let body = "# HELP node_load1 load\n\
                    node_load1 0.52\n\
                    node_cpu_seconds_total{cpu=\"0\"} 12345 1681875279000\n";
        let (collector, channel) = collector_for(body, 200);

        collector.run_once(&exporter("node")).unwrap();

        let batches = channel.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let (_, metrics) = &batches[0];
        assert_eq!(metrics.len(), 2);
        // absent timestamps are stamped at receive
        assert_eq!(metrics[0].timestamp, 1_700_000_000_000);
        // present timestamps are kept
        assert_eq!(metrics[1].timestamp, 1_681_875_279_000);
    }

    #[test]
    fn network_failure_is_an_error() {
        let channel = RecordingChannel::new();
        let mut sinks: BTreeMap<String, Arc<dyn OutputChannel>> = BTreeMap::new();
        sinks.insert("cloud".to_string(), channel.clone());
        let fetch: FetchFn = Box::new(|_| HttpResponse {
            res_code: 0,
            error_msg: "connect timed out".to_string(),
            ..Default::default()
        });
        let collector = ExporterCollector::with_fetch(TaskManager::new(), sinks, fetch);

        assert!(collector.run_once(&exporter("node")).is_err());
        assert!(channel.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn http_error_status_is_an_error() {
        let (collector, channel) = collector_for("not found", 404);
        assert!(collector.run_once(&exporter("node")).is_err());
        assert!(channel.batches.lock().unwrap().is_empty());
    }

    #[test]
    fn invalid_lines_count_as_error_but_valid_ones_deliver() {
        let body = "good_metric 1\n3bad_line 1\n";
        let (collector, channel) = collector_for(body, 200);

        assert!(collector.run_once(&exporter("node")).is_err());
        let batches = channel.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1.len(), 1);
        assert_eq!(batches[0].1[0].name, "good_metric");
    }

    #[test]
    fn labels_are_added_before_delivery() {
        let (collector, channel) = collector_for("node_load1 0.5\n", 200);
        let mut item = exporter("node");
        item.add_labels = vec![LabelAddInfo {
            name: "cluster".to_string(),
            value: "blue".to_string(),
            kind: 2,
        }];

        collector.run_once(&item).unwrap();
        let batches = channel.batches.lock().unwrap();
        assert_eq!(batches[0].1[0].tags["cluster"], "blue");
    }

    #[test]
    fn quantized_shape_dedupes_buckets_across_runs() {
        let body = r#"{"success":true,"data":{"jvm":[
            {"metric":"heap_used","timestamp":1700000005000,"interval":15,"value":1.5}
        ]}}"#;
        let channel = RecordingChannel::new();
        let mut sinks: BTreeMap<String, Arc<dyn OutputChannel>> = BTreeMap::new();
        sinks.insert("cloud".to_string(), channel.clone());
        let fetch: FetchFn = Box::new(move |_| HttpResponse {
            res_code: 200,
            result: body.to_string(),
            ..Default::default()
        });
        let collector = ExporterCollector::with_fetch(TaskManager::new(), sinks, fetch);

        let mut item = exporter("jvm");
        item.kind = KIND_QUANTIZED_JSON;
        item.metric_filters = vec![skywatch_metrics::labels::MetricFilterInfo {
            name: "jvm$heap_used".to_string(),
            ..Default::default()
        }];

        collector.run_once(&item).unwrap();
        // same bucket again: suppressed
        collector.run_once(&item).unwrap();

        let batches = channel.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].1[0].name, "heap_used");
    }
}
