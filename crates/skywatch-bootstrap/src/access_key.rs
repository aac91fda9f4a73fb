//! Access key loading: in-memory config first, then `accesskey.properties`
//! drop files in priority order.

use std::path::PathBuf;

use skywatch_common::config::AgentConfig;
use skywatch_common::properties::Properties;
use tracing::info;

const AK_FILE_NAME: &str = "accesskey.properties";

/// Recognized key spellings, either casing.
const ACCESS_KEY_NAMES: [&str; 2] = ["cms.agent.accesskey", "CMS_AGENT_ACCESSKEY"];
const SECRET_KEY_NAMES: [&str; 2] = ["cms.agent.secretkey", "CMS_AGENT_SECRETKEY"];

/// Resolve the access key pair. Config wins; otherwise the first drop file
/// that yields both halves does:
/// `<base>/local_data/conf/`, `<base>/`, then the executable's directory.
pub fn read_access_key(config: &AgentConfig) -> (String, String) {
    let key = config.get("cms.agent.accesskey", "");
    let secret = config.get("cms.agent.secretkey", "");
    if !key.is_empty() && !secret.is_empty() {
        return (key, secret);
    }

    let mut candidates = vec![
        config.base_dir().join("local_data").join("conf").join(AK_FILE_NAME),
        config.base_dir().join(AK_FILE_NAME),
    ];
    if let Some(dir) = exec_dir() {
        candidates.push(dir.join(AK_FILE_NAME));
    }

    for path in candidates {
        let Ok(props) = Properties::load(&path) else {
            continue;
        };
        info!("accesskey file: {}", path.display());

        let key = get_any(&props, &ACCESS_KEY_NAMES);
        let secret = get_any(&props, &SECRET_KEY_NAMES);
        if !key.is_empty() && !secret.is_empty() {
            return (key, secret);
        }
    }

    (String::new(), String::new())
}

fn get_any(props: &Properties, names: &[&str]) -> String {
    names
        .iter()
        .find_map(|name| props.get(name).filter(|v| !v.is_empty()))
        .unwrap_or("")
        .to_string()
}

fn exec_dir() -> Option<PathBuf> {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
}
