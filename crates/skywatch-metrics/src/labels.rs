//! Label augmentation and metric filtering applied between collection and
//! reporting.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::warn;

use crate::metric::CommonMetric;

/// One label mutation from a task descriptor.
///
/// `kind` selects the value source: 0 derives from the host (`ip`,
/// `hostname`, `sn`, `cluster`), 1 reads the environment variable named by
/// `value`, 2 takes `value` literally, 3 renames an existing label from
/// `name` to `value`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LabelAddInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(rename = "type", default)]
    pub kind: i32,
}

/// Filter entry: keep a metric only when its name and listed tags match,
/// optionally renaming it to `metric_name` on the way out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MetricFilterInfo {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "metric_name", default)]
    pub metric_name: String,
    #[serde(rename = "tag_map", default)]
    pub tags: BTreeMap<String, String>,
}

/// Source of host-derived label values (type 0 entries).
pub trait LabelSource {
    fn get(&self, key: &str) -> String;
}

/// Tags to add and labels to rename, built once per task from its
/// descriptor.
#[derive(Debug, Clone, Default)]
pub struct LabelPlan {
    add: BTreeMap<String, String>,
    rename: BTreeMap<String, String>,
}

impl LabelPlan {
    pub fn build(infos: &[LabelAddInfo], source: &dyn LabelSource) -> Self {
        let mut plan = LabelPlan::default();
        for info in infos {
            match info.kind {
                0 => {
                    let value = source.get(&info.name);
                    if value.is_empty() {
                        warn!("host label '{}' resolved to empty", info.name);
                    }
                    plan.add.insert(info.name.clone(), value);
                }
                1 => {
                    let value = skywatch_common::host::env_var(&info.value);
                    if !value.is_empty() {
                        plan.add.insert(info.name.clone(), value);
                    }
                }
                2 => {
                    plan.add.insert(info.name.clone(), info.value.clone());
                }
                3 => {
                    plan.rename.insert(info.name.clone(), info.value.clone());
                }
                other => {
                    warn!("skip label add info '{}' with unknown type {other}", info.name);
                }
            }
        }
        plan
    }

    /// Apply additions and renames to a metric in place.
    pub fn apply(&self, metric: &mut CommonMetric) {
        for (key, value) in &self.add {
            metric
                .tags
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        for (from, to) in &self.rename {
            if to.is_empty() {
                continue;
            }
            if let Some(value) = metric.tags.remove(from) {
                metric.tags.insert(to.clone(), value);
            }
        }
    }
}

/// Decide whether `metric` passes `filters`, and under which name.
///
/// An empty filter set passes everything unrenamed. Otherwise the metric
/// must match an entry by name and carry every tag the entry lists.
pub fn filter_metric_name(
    metric: &CommonMetric,
    filters: &BTreeMap<String, MetricFilterInfo>,
) -> Option<String> {
    if filters.is_empty() {
        return Some(String::new());
    }

    let info = filters.get(&metric.name)?;
    if metric.tags.len() < info.tags.len() {
        return None;
    }
    for (key, expected) in &info.tags {
        if metric.tags.get(key) != Some(expected) {
            return None;
        }
    }
    Some(info.metric_name.clone())
}

/// Index filters by metric name for lookup during collection.
pub fn build_filter_map(filters: &[MetricFilterInfo]) -> BTreeMap<String, MetricFilterInfo> {
    filters
        .iter()
        .map(|f| (f.name.clone(), f.clone()))
        .collect()
}
