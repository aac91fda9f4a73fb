//! Wire codec for module collection results.
//!
//! A module result is a single space-separated text record:
//! `MODULE_DATA <module> <count> {<nvalues> {k v}... <ntags> {k enc(v)}...}...`
//! Tag values are URL-encoded; an empty tag value is carried as an encoded
//! single space.

use std::collections::BTreeMap;

use skywatch_common::encoding::{url_decode, url_encode};
use tracing::warn;

const RECORD_PREFIX: &str = "MODULE_DATA";

/// Placeholder for empty tag values; a bare token must never be empty.
const EMPTY_VALUE: &str = " ";

/// One data point of a module result: free-form tag and value maps. The
/// reporting channel requires `metricName`, `ns` and `metricValue` entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricData {
    pub tags: BTreeMap<String, String>,
    pub values: BTreeMap<String, f64>,
}

impl MetricData {
    pub fn metric_name(&self) -> &str {
        self.tags.get("metricName").map(String::as_str).unwrap_or("")
    }

    /// A reportable data point names its metric, its namespace and its
    /// primary value.
    pub fn check(&self, index: usize) -> bool {
        if !self.tags.contains_key("metricName") {
            warn!("metric[{index}]: invalid metricData without metricName");
            return false;
        }
        if !self.values.contains_key("metricValue") {
            warn!("metric[{index}]: invalid metricData without metricValue");
            return false;
        }
        if !self.tags.contains_key("ns") {
            warn!("metric[{index}]: invalid metricData without namespace");
            return false;
        }
        true
    }
}

/// A module's full collection output: its name plus data points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectData {
    pub module_name: String,
    pub data: Vec<MetricData>,
}

impl CollectData {
    /// Serialize to the wire record. Empty module names produce an empty
    /// string (nothing to report).
    pub fn encode(&self) -> String {
        if self.module_name.is_empty() {
            return String::new();
        }

        let mut out = format!("{RECORD_PREFIX} {} {}", self.module_name, self.data.len());
        for metric in &self.data {
            out.push(' ');
            encode_metric_data(metric, &mut out);
        }
        out
    }

    /// Parse a wire record. With `check` set, each data point must pass
    /// [`MetricData::check`].
    pub fn decode(content: &str, check: bool) -> Option<CollectData> {
        if content.is_empty() {
            return None;
        }

        let result = try_decode(content, check);
        if result.is_none() {
            warn!("content: {content}");
        }
        result
    }
}

fn encode_metric_data(metric: &MetricData, out: &mut String) {
    out.push_str(&metric.values.len().to_string());
    for (key, value) in &metric.values {
        out.push(' ');
        out.push_str(key);
        out.push(' ');
        out.push_str(&format_value(*value));
    }

    out.push(' ');
    out.push_str(&metric.tags.len().to_string());
    for (key, value) in &metric.tags {
        let value = if value.is_empty() { EMPTY_VALUE } else { value };
        out.push(' ');
        out.push_str(key);
        out.push(' ');
        out.push_str(&url_encode(value));
    }
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        (if value > 0.0 { "inf" } else { "-inf" }).to_string()
    } else {
        format!("{value}")
    }
}

fn parse_value(token: &str) -> f64 {
    match token.to_ascii_lowercase().as_str() {
        "inf" | "+inf" => f64::INFINITY,
        "-inf" => f64::NEG_INFINITY,
        "nan" | "+nan" => f64::NAN,
        "-nan" => -f64::NAN,
        _ => token.parse().unwrap_or(f64::NAN),
    }
}

fn try_decode(content: &str, check: bool) -> Option<CollectData> {
    let mut tokens = content.split_ascii_whitespace();

    let prefix = tokens.next()?;
    if prefix != RECORD_PREFIX {
        warn!("invalid prefix: {prefix}");
        return None;
    }

    let module_name = tokens.next()?.to_string();
    if module_name.is_empty() {
        warn!("empty moduleName");
        return None;
    }

    let count: usize = tokens.next()?.parse().ok()?;
    let mut collect = CollectData {
        module_name,
        data: Vec::with_capacity(count),
    };

    for i in 0..count {
        let Some(metric) = decode_metric_data(&mut tokens) else {
            warn!("metric[{i}]: invalid content");
            return None;
        };
        if check && !metric.check(i) {
            return None;
        }
        collect.data.push(metric);
    }

    Some(collect)
}

fn decode_metric_data<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Option<MetricData> {
    let mut metric = MetricData::default();

    let value_count: usize = tokens.next()?.parse().ok()?;
    for _ in 0..value_count {
        let key = tokens.next()?.to_string();
        let value = parse_value(tokens.next()?);
        metric.values.insert(key, value);
    }

    let tag_count: usize = tokens.next()?.parse().ok()?;
    for _ in 0..tag_count {
        let key = tokens.next()?.to_string();
        let mut value = url_decode(tokens.next()?);
        if value == EMPTY_VALUE {
            value.clear();
        }
        metric.tags.insert(key, value);
    }

    Some(metric)
}
