//! Agent configuration: a properties map plus the directories everything
//! else resolves files against.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::warn;

use crate::properties::Properties;

/// Parsed agent configuration. Cheap to clone; components hold their own
/// copy taken at startup.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    props: Properties,
    base_dir: PathBuf,
    log_dir: PathBuf,
}

impl AgentConfig {
    pub fn new(props: Properties, base_dir: PathBuf, log_dir: PathBuf) -> Self {
        Self {
            props,
            base_dir,
            log_dir,
        }
    }

    /// Load `agent.properties` from the base directory. A missing file is
    /// not an error; the defaults apply.
    pub fn load(base_dir: PathBuf, log_dir: PathBuf) -> Self {
        let path = base_dir.join("agent.properties");
        let props = match Properties::load(&path) {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Properties::new(),
            Err(e) => {
                warn!("reading {}: {e}", path.display());
                Properties::new()
            }
        };
        Self::new(props, base_dir, log_dir)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn get(&self, key: &str, default: &str) -> String {
        self.props.get_or(key, default).to_string()
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str, default: T) -> T {
        self.props.get_parsed(key, default)
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.props.get_bool(key, default)
    }

    /// Override a value. Used by tests and by the CLI `-D key=value` flags.
    pub fn set(&mut self, key: &str, value: &str) {
        self.props.set(key, value);
    }

    /// Whether outbound TLS verifies the peer. Default on; cloud tunnels
    /// with self-issued certificates need an explicit opt-out.
    pub fn tls_verify(&self) -> bool {
        self.props.get_bool("tls.verify", true)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new(Properties::new(), PathBuf::from("."), PathBuf::from("."))
    }
}
