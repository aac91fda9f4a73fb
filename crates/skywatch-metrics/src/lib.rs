//! Metric data model and the text codecs the agent speaks: single-line
//! Prometheus metrics and the module-result wire format.

#![forbid(unsafe_code)]

pub mod labels;
pub mod metric;
pub mod module_data;
pub mod prometheus;

pub use metric::CommonMetric;
