//! `key = value` properties files: the configuration format used by the
//! agent config, the access-key drop file and the persisted serial number.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::{fs, io};

#[derive(Debug, Default, Clone)]
pub struct Properties {
    entries: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse properties from text. Blank lines and lines starting with `#`
    /// or `!` are ignored; everything after the first `=` is the value.
    /// Lines without a `=` are skipped.
    pub fn from_str(content: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                entries.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
        Self { entries }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        Ok(Self::from_str(&fs::read_to_string(path)?))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// The value for `key`, or `default` when absent or empty.
    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        match self.entries.get(key) {
            Some(v) if !v.is_empty() => v,
            _ => default,
        }
    }

    /// Parse the value for `key`, falling back to `default` when the key is
    /// absent or does not parse.
    pub fn get_parsed<T: FromStr>(&self, key: &str, default: T) -> T {
        self.entries
            .get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// `true`/`1` are truthy, `false`/`0` are falsy, anything else is the
    /// default.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.entries.get(key).map(|v| v.trim()) {
            Some("true") | Some("1") => true,
            Some("false") | Some("0") => false,
            _ => default,
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Render back to `key=value` lines, sorted by key.
    pub fn to_string(&self) -> String {
        let mut out = String::new();
        for (k, v) in &self.entries {
            out.push_str(k);
            out.push('=');
            out.push_str(v);
            out.push('\n');
        }
        out
    }

    pub fn store(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_pairs() {
        let props = Properties::from_str(
            "# comment\n\
             \n\
             cms.agent.accesskey = abc123\n\
             cms.agent.secretkey=s3cret=with=equals\n\
             bad line without separator\n",
        );
        assert_eq!(props.get("cms.agent.accesskey"), Some("abc123"));
        assert_eq!(props.get("cms.agent.secretkey"), Some("s3cret=with=equals"));
        assert_eq!(props.get("bad line without separator"), None);
    }

    #[test]
    fn typed_getters_fall_back() {
        let props = Properties::from_str("a=15\nb=\nc=notanumber\nd=true\n");
        assert_eq!(props.get_parsed("a", 0u64), 15);
        assert_eq!(props.get_parsed("c", 7u64), 7);
        assert_eq!(props.get_parsed("missing", 9i32), 9);
        assert_eq!(props.get_or("b", "fallback"), "fallback");
        assert!(props.get_bool("d", false));
        assert!(!props.get_bool("missing", false));
    }

    #[test]
    fn store_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/serial_number.properties");

        let mut props = Properties::new();
        props.set("cms.agent.serialNumber", "61fddc94-3544-11eb-9a78");
        props.store(&path).unwrap();

        let loaded = Properties::load(&path).unwrap();
        assert_eq!(
            loaded.get("cms.agent.serialNumber"),
            Some("61fddc94-3544-11eb-9a78")
        );
    }
}
