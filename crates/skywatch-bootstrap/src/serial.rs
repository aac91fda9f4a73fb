//! Serial-number discovery. Sources are tried in priority order and the
//! first non-empty answer wins; the last resort is a locally generated,
//! persisted UUID.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use skywatch_common::config::AgentConfig;
use skywatch_common::properties::Properties;
use skywatch_transport::{http_get, HttpRequest};
use tracing::{error, info, warn};

/// Config key for the metadata service root; tests point it at a local
/// server.
pub const VPC_SERVER_KEY: &str = "cms.vpc.server";
pub const DEFAULT_VPC_SERVER: &str = "http://100.100.100.200";

const LOCAL_SN_KEY: &str = "cms.agent.serialNumber";

#[cfg(target_os = "windows")]
const ECS_ASSIST_MACHINE_ID: &str = "C:\\ProgramData\\aliyun\\assist\\hybrid\\machine-id";
#[cfg(not(target_os = "windows"))]
const ECS_ASSIST_MACHINE_ID: &str = "/usr/local/share/aliyun-assist/hybrid/machine-id";

/// The discovered serial number plus which source produced it.
#[derive(Debug, Clone, Default)]
pub struct SerialNumber {
    pub value: String,
    pub source: &'static str,
}

/// Walk the source chain. With an access key present the cloud sources are
/// skipped and only the persistent local UUID applies.
pub fn discover(config: &AgentConfig, have_access_key: bool) -> SerialNumber {
    type Source<'a> = (&'static str, Box<dyn Fn() -> String + 'a>);

    let mut sources: Vec<Source<'_>> = Vec::with_capacity(5);
    if !have_access_key {
        if !config.get_bool("sn.skip.ecs.vpc.server", false) {
            sources.push(("VPCServer", Box::new(|| from_vpc(config))));
        }
        sources.push((
            "EcsAssist",
            Box::new(|| from_ecs_assist(Path::new(ECS_ASSIST_MACHINE_ID))),
        ));
        sources.push((
            "Config File",
            Box::new(|| config.get("cms.agent.ecs.serialNumber", "")),
        ));
        sources.push(("OS", Box::new(from_os)));
    }
    sources.push(("guid.New", Box::new(|| from_local(config))));

    for (name, source) in sources {
        let value = source();
        if !value.is_empty() {
            info!("serialNumber={value}, from={name}");
            return SerialNumber {
                value,
                source: name,
            };
        }
    }
    SerialNumber::default()
}

/// ECS metadata service.
fn from_vpc(config: &AgentConfig) -> String {
    let url = format!(
        "{}/latest/meta-data/serial-number",
        config.get(VPC_SERVER_KEY, DEFAULT_VPC_SERVER)
    );
    let response = http_get(&HttpRequest::new(url).with_timeout(Duration::from_secs(5)));
    if response.is_ok() {
        response.result.trim().to_string()
    } else {
        String::new()
    }
}

/// Machine id persisted by the host-local assist agent. Missing file means
/// "not a managed instance": empty, no error.
pub fn from_ecs_assist(machine_id_file: &Path) -> String {
    match std::fs::read_to_string(machine_id_file) {
        Ok(content) => content.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => {
            error!("read sn from ecs-assist error: {e}");
            String::new()
        }
    }
}

#[cfg(target_os = "linux")]
fn from_os() -> String {
    let serial = dmidecode("system-serial-number");
    // the hardware serial is a 36-char uuid on ECS; anything else is junk
    if serial.len() == 36 {
        serial
    } else {
        dmidecode("system-uuid")
    }
}

#[cfg(target_os = "macos")]
fn from_os() -> String {
    run_command("system_profiler", &["SPHardwareDataType"])
        .lines()
        .find_map(|line| {
            line.trim()
                .strip_prefix("Serial Number (system):")
                .map(|v| v.trim().to_string())
        })
        .unwrap_or_default()
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn from_os() -> String {
    String::new()
}

#[cfg(target_os = "linux")]
fn dmidecode(keyword: &str) -> String {
    parse_dmidecode(&run_command("dmidecode", &["-s", keyword]))
}

#[allow(dead_code)]
fn run_command(program: &str, args: &[&str]) -> String {
    match Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).into_owned()
        }
        Ok(output) => {
            warn!("{program} exited with {}", output.status);
            String::new()
        }
        Err(e) => {
            warn!("running {program}: {e}");
            String::new()
        }
    }
}

/// First non-comment, non-empty line of dmidecode output.
pub fn parse_dmidecode(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .unwrap_or("")
        .to_string()
}

/// Persistent locally generated UUID.
fn from_local(config: &AgentConfig) -> String {
    let path = local_sn_path(config);
    from_local_at(&path)
}

pub fn local_sn_path(config: &AgentConfig) -> PathBuf {
    let app_data = {
        let from_config = config.get("APPDATA", "");
        if !from_config.is_empty() {
            from_config
        } else {
            let from_env = skywatch_common::host::env_var("APPDATA");
            if from_env.is_empty() {
                "/etc".to_string()
            } else {
                from_env
            }
        }
    };
    Path::new(&app_data)
        .join("cloudmonitor")
        .join("serial_number.properties")
}

pub fn from_local_at(path: &Path) -> String {
    if let Ok(props) = Properties::load(path) {
        if let Some(sn) = props.get(LOCAL_SN_KEY) {
            if !sn.is_empty() {
                return sn.to_string();
            }
        }
    }

    let sn = uuid::Uuid::new_v4().to_string();
    let mut props = Properties::new();
    props.set(LOCAL_SN_KEY, &sn);
    if let Err(e) = props.store(path) {
        warn!("persisting serial number to {}: {e}", path.display());
    }
    sn
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_ecs_assist_file_is_empty() {
        let sn = from_ecs_assist(Path::new("/nonexistent/machine-id"));
        assert_eq!(sn, "");
    }

    #[test]
    fn ecs_assist_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine-id");
        std::fs::write(&path, "17bd5a3b-62af-5a0e-b3e7-fe8ead2c67c0\n").unwrap();
        assert_eq!(
            from_ecs_assist(&path),
            "17bd5a3b-62af-5a0e-b3e7-fe8ead2c67c0"
        );
    }

    #[test]
    fn dmidecode_output_skips_comments() {
        let output = "# dmidecode 3.3\n\n2102f0vd-8666-11ec-8ff5-eeeeeeeeeeee\n";
        assert_eq!(parse_dmidecode(output), "2102f0vd-8666-11ec-8ff5-eeeeeeeeeeee");
        assert_eq!(parse_dmidecode("# only comments\n"), "");
        assert_eq!(parse_dmidecode(""), "");
    }

    #[test]
    fn local_uuid_is_generated_once_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloudmonitor").join("serial_number.properties");

        let first = from_local_at(&path);
        assert_eq!(first.len(), 36);

        let second = from_local_at(&path);
        assert_eq!(first, second);
    }

    #[test]
    fn config_key_is_used_when_cloud_sources_fail() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::new(
            Properties::new(),
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
        );
        config.set("sn.skip.ecs.vpc.server", "true");
        config.set("cms.agent.ecs.serialNumber", "sn-from-config");
        config.set("APPDATA", dir.path().to_str().unwrap());

        // dmidecode is unavailable in test sandboxes, so the config source
        // must win before the OS probe
        let sn = discover(&config, false);
        assert_eq!(sn.value, "sn-from-config");
        assert_eq!(sn.source, "Config File");
    }

    #[test]
    fn access_key_presence_skips_cloud_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig::new(
            Properties::new(),
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
        );
        config.set("APPDATA", dir.path().to_str().unwrap());

        let sn = discover(&config, true);
        assert_eq!(sn.source, "guid.New");
        assert_eq!(sn.value.len(), 36);
    }
}
