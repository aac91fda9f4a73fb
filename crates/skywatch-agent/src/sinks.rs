//! Adapters wiring the reporting channel into the scheduler traits.

use std::sync::Arc;

use skywatch_channel::CloudChannel;
use skywatch_metrics::CommonMetric;
use skywatch_sched::module::ResultSink;
use skywatch_sched::OutputChannel;

/// Exporter/script output: pre-formed metrics via the direct path.
pub struct CloudOutput {
    channel: Arc<CloudChannel>,
}

impl CloudOutput {
    pub fn new(channel: Arc<CloudChannel>) -> Self {
        Self { channel }
    }
}

impl OutputChannel for CloudOutput {
    fn send_metrics(&self, conf: &str, metrics: &[CommonMetric]) -> Result<(), String> {
        self.channel
            .add_common_metrics(metrics, conf)
            .map_err(|e| e.to_string())
    }
}

/// Module output: encoded result records through the message queue.
pub struct CloudResultSink {
    channel: Arc<CloudChannel>,
}

impl CloudResultSink {
    pub fn new(channel: Arc<CloudChannel>) -> Self {
        Self { channel }
    }
}

impl ResultSink for CloudResultSink {
    fn push(&self, module: &str, payload: String) {
        self.channel.add_message(module, payload);
    }
}
