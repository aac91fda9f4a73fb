//! The quantized JSON exporter shape:
//! `{"success":true,"data":{"<type>":[{metric,timestamp,interval,value}]}}`.
//!
//! Samples are quantized to their interval boundary and at most one sample
//! per bucket is reported. Filter names carry a `type$metric` form.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use skywatch_metrics::labels::MetricFilterInfo;
use skywatch_metrics::CommonMetric;
use tracing::{info, warn};

/// Index `type$metric` filter names into per-type metric sets.
pub fn build_metric_map(filters: &[MetricFilterInfo]) -> HashMap<String, BTreeSet<String>> {
    let mut map: HashMap<String, BTreeSet<String>> = HashMap::new();
    for filter in filters {
        match filter.name.split_once('$') {
            Some((kind, metric)) => {
                map.entry(kind.to_string())
                    .or_default()
                    .insert(metric.to_string());
            }
            None => warn!("skip invalid metric:{} with no $", filter.name),
        }
    }
    map
}

/// Parse one response body. `last_buckets` carries the last reported
/// bucket per metric name across calls; duplicates in the same bucket are
/// suppressed.
pub fn parse(
    body: &str,
    metric_map: &HashMap<String, BTreeSet<String>>,
    last_buckets: &mut HashMap<String, i64>,
) -> Result<Vec<CommonMetric>, String> {
    let root: Value =
        serde_json::from_str(body).map_err(|e| format!("result is not valid json: {e}"))?;

    if !root.get("success").and_then(Value::as_bool).unwrap_or(false) {
        return Err("result carries success=false".to_string());
    }
    let Some(data) = root.get("data").and_then(Value::as_object) else {
        return Err("result has no data object".to_string());
    };

    let mut metrics = Vec::new();
    for (kind, wanted) in metric_map {
        let Some(entries) = data.get(kind).and_then(Value::as_array) else {
            info!("no type({kind}) in this result");
            continue;
        };

        for entry in entries {
            let name = entry.get("metric").and_then(Value::as_str).unwrap_or("");
            if name.is_empty() {
                info!("skip metric-item with invalid metric");
                continue;
            }
            if !wanted.contains(name) {
                continue;
            }

            let timestamp = entry
                .get("timestamp")
                .and_then(Value::as_i64)
                .unwrap_or(-1);
            if timestamp < 0 {
                info!("skip metric-item with invalid timestamp");
                continue;
            }
            let interval = entry.get("interval").and_then(Value::as_i64).unwrap_or(0);
            if interval <= 0 {
                info!("skip metric-item with invalid interval");
                continue;
            }
            let Some(value) = entry.get("value").and_then(Value::as_f64) else {
                info!("skip metric-item with invalid value");
                continue;
            };

            // one sample per interval bucket
            let bucket = (timestamp / 1000) / interval * interval;
            let last = last_buckets.get(name).copied().unwrap_or(i64::MIN / 2);
            if bucket < last + interval {
                continue;
            }
            last_buckets.insert(name.to_string(), bucket);

            metrics.push(CommonMetric::new(name, value, bucket * 1000));
        }
    }
    Ok(metrics)
}
