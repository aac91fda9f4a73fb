//! The in-memory metric record shared by collectors and reporters.

use std::collections::BTreeMap;

/// One parsed metric sample. Label iteration order is deterministic
/// (sorted), which keeps framed output stable across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommonMetric {
    pub name: String,
    /// May be NaN or ±Inf.
    pub value: f64,
    /// Milliseconds since the UNIX epoch; 0 means "not stamped".
    pub timestamp: i64,
    pub tags: BTreeMap<String, String>,
}

impl CommonMetric {
    pub fn new(name: impl Into<String>, value: f64, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
            tags: BTreeMap::new(),
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}
