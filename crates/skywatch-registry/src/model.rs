//! Data model shared across the agent.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use skywatch_metrics::labels::{LabelAddInfo, MetricFilterInfo};

/// Identity of this agent after a successful heartbeat. An empty
/// `instance_id` means "not yet registered".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeItem {
    pub instance_id: String,
    pub serial_number: String,
    /// Arrives as a JSON number, kept as its decimal string for protocol
    /// compatibility.
    pub ali_uid: String,
    pub host_name: String,
    pub operating_system: String,
    pub region: String,
}

impl fmt::Display for NodeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"{{"instanceId":"{}","serialNumber":"{}","aliUid":"{}","hostName":"{}","operatingSystem":"{}","region":"{}"}}"#,
            self.instance_id,
            self.serial_number,
            self.ali_uid,
            self.host_name,
            self.operating_system,
            self.region
        )
    }
}

/// Connection parameters to the control plane, produced by bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudAgentInfo {
    pub heartbeat_url: String,
    pub proxy_url: String,
    pub user: String,
    pub password: String,
    pub access_key_id: String,
    pub access_secret: String,
    pub serial_number: String,
}

/// One upload endpoint. Equality is structural over all three fields; the
/// reporting channel resets its cursor whenever the published list changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MetricItem {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub gzip: bool,
    #[serde(rename = "useProxy", default)]
    pub use_proxy: bool,
}

/// A pending module result queued for the reporting channel.
#[derive(Debug, Clone, Default)]
pub struct CloudMsg {
    pub name: String,
    /// Milliseconds since the UNIX epoch at enqueue time.
    pub timestamp: i64,
    pub payload: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HpcNodeInstance {
    #[serde(rename = "instanceId", default)]
    pub instance_id: String,
    #[serde(default)]
    pub ip: String,
}

/// RDMA cluster membership pushed by the control plane; the cached version
/// is echoed back in the next heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HpcClusterItem {
    pub cluster_id: String,
    pub region_id: String,
    pub version: String,
    pub instances: Vec<HpcNodeInstance>,
    pub is_valid: bool,
}

fn default_interval_secs() -> u64 {
    60
}

/// Where a collector's output goes: a named channel plus an opaque
/// per-channel configuration string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OutputSink {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub conf: String,
}

/// A scheduled HTTP exporter scrape.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExporterItem {
    #[serde(default)]
    pub name: String,
    /// 0 = Prometheus text, 1 = quantized JSON.
    #[serde(rename = "type", default)]
    pub kind: i32,
    #[serde(rename = "interval", default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(rename = "cronExpr", default)]
    pub cron_expr: String,
    #[serde(default)]
    pub target: String,
    #[serde(rename = "timeout", default)]
    pub timeout_secs: u64,
    #[serde(rename = "output", default)]
    pub output: Vec<OutputSink>,
    #[serde(rename = "add_labels", default)]
    pub add_labels: Vec<LabelAddInfo>,
    #[serde(rename = "metric_filters", default)]
    pub metric_filters: Vec<MetricFilterInfo>,
}

impl ExporterItem {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        if self.timeout_secs == 0 {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(self.timeout_secs)
        }
    }
}

/// A scheduled script execution.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScriptItem {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "interval", default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(rename = "cronExpr", default)]
    pub cron_expr: String,
    /// Command line to run.
    #[serde(rename = "collectUrl", default)]
    pub target: String,
    #[serde(rename = "timeout", default)]
    pub timeout_secs: u64,
    #[serde(rename = "scriptUser", default)]
    pub user: String,
    /// Phase-spread window override; 0 uses the global schedule factor.
    #[serde(rename = "duration", default)]
    pub duration_secs: u64,
    #[serde(rename = "output", default)]
    pub output: Vec<OutputSink>,
    #[serde(rename = "add_labels", default)]
    pub add_labels: Vec<LabelAddInfo>,
    #[serde(rename = "metric_filters", default)]
    pub metric_filters: Vec<MetricFilterInfo>,
}

impl ScriptItem {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// A scheduled in-process module collection.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModuleItem {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "module", default)]
    pub module: String,
    #[serde(rename = "moduleArgs", default)]
    pub args: String,
    #[serde(rename = "interval", default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(rename = "cronExpr", default)]
    pub cron_expr: String,
    #[serde(rename = "output", default)]
    pub output: Vec<OutputSink>,
}

impl ModuleItem {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Compare two endpoint lists field by field.
pub fn metric_items_equal(a: &[MetricItem], b: &[MetricItem]) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(l, r)| l == r)
}

/// Index task descriptors by name, the shape the schedulers consume.
pub fn index_by_name<T, F>(items: Vec<T>, name: F) -> BTreeMap<String, T>
where
    F: Fn(&T) -> &str,
{
    items
        .into_iter()
        .map(|item| (name(&item).to_string(), item))
        .collect()
}
