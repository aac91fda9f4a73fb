//! Single-line Prometheus text format: parsing and rendering.
//!
//! References:
//! 1. https://prometheus.io/docs/concepts/data_model/
//! 2. https://prometheus.io/docs/instrumenting/exposition_formats/

use std::collections::BTreeMap;

use crate::metric::CommonMetric;

/// Why a line failed to parse. `position` is the 1-based byte offset into
/// the trimmed line.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LineError {
    #[error("empty or comment line")]
    Skip,

    #[error("at {position}: {reason}")]
    Invalid { position: usize, reason: String },
}

impl LineError {
    /// The 1-based error offset, or 0 for skipped lines.
    pub fn position(&self) -> usize {
        match self {
            LineError::Skip => 0,
            LineError::Invalid { position, .. } => *position,
        }
    }
}

/// Parse every non-empty, non-comment line of `text`, dropping lines that
/// fail to parse.
pub fn parse_metrics(text: &str) -> Vec<CommonMetric> {
    text.lines()
        .filter_map(|line| parse_line(line).ok())
        .collect()
}

/// Parse one metric line: `name{label="value",...} value [timestamp_ms]`.
///
/// The metric name may be absent (`{} 1.0`), label lists allow a trailing
/// comma, label values carry `\\`, `\"` and `\n` escapes, and the value
/// accepts decimals, `0x` hex, `NaN` and `±Inf` case-insensitively.
pub fn parse_line(line: &str) -> Result<CommonMetric, LineError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Err(LineError::Skip);
    }

    let mut cursor = Cursor::new(line.as_bytes());

    let name = cursor.parse_metric_name()?;
    let tags = cursor.parse_labels()?;
    let value = cursor.parse_value()?;
    let timestamp = cursor.parse_timestamp();

    Ok(CommonMetric {
        name,
        value,
        timestamp,
        tags,
    })
}

/// Render a metric in the line format. `{}` wraps the labels whenever the
/// name is empty or any labels exist.
pub fn metric_to_line(metric: &CommonMetric, with_timestamp: bool) -> String {
    let mut line = metric.name.clone();
    if metric.name.is_empty() || !metric.tags.is_empty() {
        line.push('{');
        let mut sep = "";
        for (key, value) in &metric.tags {
            line.push_str(sep);
            line.push_str(key);
            line.push_str("=\"");
            line.push_str(&escape_label_value(value));
            line.push('"');
            sep = ",";
        }
        line.push('}');
    }

    line.push(' ');
    if metric.value.is_nan() {
        line.push_str("NaN");
    } else if metric.value.is_infinite() {
        line.push_str(if metric.value > 0.0 { "+Inf" } else { "-Inf" });
    } else {
        line.push_str(&format!("{}", metric.value));
    }

    if with_timestamp {
        line.push_str(&format!(" {}", metric.timestamp));
    }

    line
}

/// Escape `\`, `"` and newline for use inside a quoted label value.
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_space(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn invalid(&self, reason: impl Into<String>) -> LineError {
        LineError::Invalid {
            position: self.pos + 1,
            reason: reason.into(),
        }
    }

    fn invalid_at(&self, position: usize, reason: impl Into<String>) -> LineError {
        LineError::Invalid {
            position: position + 1,
            reason: reason.into(),
        }
    }

    /// Metric name: `[a-zA-Z_:][a-zA-Z0-9_:]*`, or anonymous when the line
    /// opens with `{`.
    fn parse_metric_name(&mut self) -> Result<String, LineError> {
        self.skip_space();
        let start = self.pos;

        match self.peek() {
            Some(b'{') => return Ok(String::new()),
            Some(c) if c == b':' || c == b'_' || c.is_ascii_alphabetic() => {}
            _ => {
                return Err(self.invalid_at(
                    start,
                    "the first char of metric name don't satisfied: [a-zA-Z_:]",
                ))
            }
        }

        self.pos += 1;
        while matches!(self.peek(), Some(c) if c == b':' || c == b'_' || c.is_ascii_alphanumeric())
        {
            self.pos += 1;
        }

        // the name must be followed by labels or a value
        match self.peek() {
            Some(b'{') => {}
            Some(c) if c.is_ascii_whitespace() => {}
            other => {
                let shown = other.map(|c| c as char).unwrap_or('\0');
                return Err(self.invalid(format!(
                    "invalid metricName char: '{shown}', validated regex: [a-zA-Z_:][a-zA-Z0-9_:]*"
                )));
            }
        }

        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn parse_labels(&mut self) -> Result<BTreeMap<String, String>, LineError> {
        let mut labels = BTreeMap::new();

        self.skip_space();
        if self.peek() != Some(b'{') {
            return Ok(labels);
        }
        self.pos += 1;

        loop {
            self.skip_space();
            match self.peek() {
                None | Some(b'}') => break,
                _ => {}
            }

            let name = self.parse_label_name()?;
            self.skip_space();
            if self.peek() != Some(b'=') {
                return Err(self.invalid("format error: expected '='"));
            }
            self.pos += 1;

            let value = self.parse_label_value()?;
            labels.insert(name, value);

            self.skip_space();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {}
                _ => return Err(self.invalid("format error: expected '}'")),
            }
        }

        if self.peek() == Some(b'}') {
            self.pos += 1;
        }

        Ok(labels)
    }

    fn parse_label_name(&mut self) -> Result<String, LineError> {
        self.skip_space();
        let start = self.pos;

        match self.peek() {
            Some(c) if c == b'_' || c.is_ascii_alphabetic() => {}
            _ => {
                return Err(self.invalid_at(
                    start,
                    "the first char of label name don't satisfied: [a-zA-Z_]",
                ))
            }
        }

        self.pos += 1;
        while matches!(self.peek(), Some(c) if c == b'_' || c.is_ascii_alphanumeric()) {
            self.pos += 1;
        }

        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn parse_label_value(&mut self) -> Result<String, LineError> {
        self.skip_space();
        if self.peek() != Some(b'"') {
            return Err(self.invalid("format error: label value should start with '\"'"));
        }
        self.pos += 1;

        let mut raw = Vec::new();
        while let Some(c) = self.peek() {
            if c == b'"' {
                break;
            }
            if c == b'\\' {
                match self.bytes.get(self.pos + 1) {
                    Some(b'n') => {
                        self.pos += 2;
                        raw.push(b'\n');
                        continue;
                    }
                    Some(b'\\') | Some(b'"') => {
                        self.pos += 1;
                    }
                    _ => {}
                }
            }
            raw.push(self.bytes[self.pos]);
            self.pos += 1;
        }
        if self.peek() == Some(b'"') {
            self.pos += 1;
        }

        let value = String::from_utf8_lossy(&raw).into_owned();
        Ok(value.trim_matches([' ', '\t']).to_string())
    }

    fn parse_value(&mut self) -> Result<f64, LineError> {
        self.skip_space();
        if self.peek().is_none() {
            return Err(self.invalid("unexpected EOF"));
        }

        let start = self.pos;
        while matches!(self.peek(), Some(c) if !c.is_ascii_whitespace()) {
            self.pos += 1;
        }
        let token = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();

        Ok(parse_number(&token))
    }

    fn parse_timestamp(&mut self) -> i64 {
        self.skip_space();
        let start = self.pos;
        while matches!(self.peek(), Some(c) if !c.is_ascii_whitespace()) {
            self.pos += 1;
        }
        let token = &self.bytes[start..self.pos];

        // leading integer only, like a stream extraction would read
        let mut end = 0;
        for (i, &c) in token.iter().enumerate() {
            if (i == 0 && (c == b'+' || c == b'-')) || c.is_ascii_digit() {
                end = i + 1;
            } else {
                break;
            }
        }
        std::str::from_utf8(&token[..end])
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

/// Special names, decimals and `0x` hex. Anything unparseable yields 0.
fn parse_number(token: &str) -> f64 {
    match token.to_ascii_lowercase().as_str() {
        "inf" | "+inf" => return f64::INFINITY,
        "-inf" => return f64::NEG_INFINITY,
        "nan" | "+nan" => return f64::NAN,
        "-nan" => return -f64::NAN,
        _ => {}
    }

    if let Some(hex) = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
    {
        if let Ok(v) = u64::from_str_radix(hex, 16) {
            return v as f64;
        }
    }

    token.parse().unwrap_or(0.0)
}
