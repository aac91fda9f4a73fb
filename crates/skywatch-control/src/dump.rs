//! Crash and resource dump reporting. The server accepts two envelope
//! shapes: a rich one for registered agents and a reduced one keyed by
//! serial number for agents that never completed a heartbeat.

use std::time::Duration;

use serde_json::{json, Value};
use skywatch_common::config::AgentConfig;
use skywatch_common::host;
use skywatch_registry::TaskManager;
use skywatch_transport::http_post;
use tracing::{error, info, warn};

use crate::heartbeat::ControlClient;
use crate::AGENT_VERSION;

const SAVE_DUMP_URI: &str = "/agent/saveMiniDump";

/// A core file younger than this is considered "ours to report".
const CORE_DOWN_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// One exceeded resource in a thread-dump report.
#[derive(Debug, Clone)]
pub struct ResourceWaterLevel {
    pub name: &'static str,
    pub value: f64,
    pub threshold: f64,
    pub times: u32,
}

/// One task in the top-N CPU consumer list.
#[derive(Debug, Clone)]
pub struct ResourceConsumption {
    pub thread_id: u64,
    pub millis: u64,
    pub task_name: String,
}

fn target_os_arch() -> String {
    format!("{}-{}", std::env::consts::OS, host::arch())
}

/// Build the upload envelope. An empty `instanceId` selects the reduced
/// schema so the server accepts unregistered agents.
pub fn make_dump_body(dump_type: &str, detail: Value, manager: &TaskManager) -> String {
    let node = manager.node_item();
    let agent_info = manager.cloud_agent_info();

    let mut dump = json!({
        "version": AGENT_VERSION,
        "type": dump_type,
        "hostname": host::hostname(),
        "detail": detail,
    });

    let envelope = if node.instance_id.is_empty() {
        dump["sn"] = json!(agent_info.serial_number);
        json!({
            "sn": agent_info.serial_number,
            "agentVersion": AGENT_VERSION,
            "targetOsArch": target_os_arch(),
            "dump": dump.to_string(),
        })
    } else {
        dump["sn"] = json!(node.serial_number);
        json!({
            "__ver__": "2.0",
            "sn": node.serial_number,
            "agentVersion": AGENT_VERSION,
            "userId": node.ali_uid,
            "instanceId": node.instance_id,
            "hostname": host::hostname(),
            "os": node.operating_system,
            "targetOsArch": target_os_arch(),
            "region": node.region,
            "type": dump_type,
            "dump": dump.to_string(),
        })
    };
    envelope.to_string()
}

/// POST one dump envelope. Success requires HTTP 200 and a JSON body with
/// `success: true`.
pub fn save_dump(
    dump_type: &str,
    body: String,
    manager: &TaskManager,
    config: &AgentConfig,
) -> bool {
    let request =
        ControlClient::complete_request(manager, config, SAVE_DUMP_URI, body, "text/json");
    let response = http_post(&request);

    let ok = response.is_ok()
        && serde_json::from_str::<Value>(&response.result)
            .ok()
            .and_then(|v| v.get("success").and_then(Value::as_bool))
            .unwrap_or(false);

    if ok {
        info!("send {dump_type} to {} success", request.url);
    } else {
        error!(
            "send {dump_type} to {} fail, http status code: {}, response: {}{}",
            request.url,
            response.res_code,
            response.result,
            if response.error_msg.is_empty() {
                String::new()
            } else {
                format!(", errMsg: {}", response.error_msg)
            }
        );
    }
    ok
}

/// Report a crash dump left behind by a previous run, if one is fresh
/// enough to matter.
pub fn send_core_dump(config: &AgentConfig, manager: &TaskManager) -> bool {
    let marker = config.log_dir().join("dumps").join("last-core-down");
    let metadata = match std::fs::metadata(&marker) {
        Ok(m) => m,
        Err(_) => return false,
    };

    let fresh = metadata
        .modified()
        .ok()
        .and_then(|t| t.elapsed().ok())
        .map(|age| age <= CORE_DOWN_MAX_AGE)
        .unwrap_or(false);
    if !fresh {
        return false;
    }

    let content = std::fs::read_to_string(&marker).unwrap_or_default();
    let detail = json!({
        "filename": marker.display().to_string(),
        "content": content,
    });

    let body = make_dump_body("CoreDown", detail, manager);
    let ok = save_dump("CoreDown", body, manager, config);
    if ok {
        if let Err(e) = std::fs::remove_file(&marker) {
            warn!("removing {}: {e}", marker.display());
        }
    }
    ok
}

/// Report the self-monitor's findings before the process exits.
pub fn send_thread_dump(
    resources: &[ResourceWaterLevel],
    top_tasks: &[ResourceConsumption],
    thread_stacks: &str,
    manager: &TaskManager,
    config: &AgentConfig,
) -> bool {
    let resources: Vec<Value> = resources
        .iter()
        .map(|r| {
            json!({
                "resource": r.name,
                "value": r.value,
                "threshold": r.threshold,
                "times": r.times,
            })
        })
        .collect();

    let top_n: Vec<Value> = top_tasks
        .iter()
        .map(|t| {
            json!({
                "threadId": t.thread_id,
                "millis": t.millis,
                "taskName": t.task_name,
            })
        })
        .collect();

    let detail = json!({
        "resources": resources,
        "topTasks": top_n,
        "threads": thread_stacks,
    });

    let body = make_dump_body("ThreadDump", detail, manager);
    save_dump("ThreadDump", body, manager, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use skywatch_common::properties::Properties;
    use skywatch_registry::model::{CloudAgentInfo, NodeItem};
    use std::path::PathBuf;

    fn test_config() -> AgentConfig {
        AgentConfig::new(Properties::new(), PathBuf::from("."), PathBuf::from("."))
    }

    #[test]
    fn unregistered_agents_use_the_reduced_envelope() {
        let manager = TaskManager::new();
        manager.set_cloud_agent_info(CloudAgentInfo {
            serial_number: "sn-unregistered".into(),
            ..Default::default()
        });

        let body = make_dump_body("CoreDown", json!({"x": 1}), &manager);
        let value: Value = serde_json::from_str(&body).unwrap();

        assert_eq!(value["sn"], "sn-unregistered");
        assert!(value.get("instanceId").is_none());
        assert!(value.get("__ver__").is_none());
        assert_eq!(value["agentVersion"], AGENT_VERSION);

        // the inner dump is carried stringified
        let inner: Value = serde_json::from_str(value["dump"].as_str().unwrap()).unwrap();
        assert_eq!(inner["type"], "CoreDown");
        assert_eq!(inner["sn"], "sn-unregistered");
    }

    #[test]
    fn registered_agents_use_the_rich_envelope() {
        let manager = TaskManager::new();
        manager.set_node_item(NodeItem {
            instance_id: "i-abc".into(),
            serial_number: "sn-node".into(),
            ali_uid: "42".into(),
            operating_system: "Linux".into(),
            region: "cn-hangzhou".into(),
            ..Default::default()
        });

        let body = make_dump_body("ThreadDump", json!({}), &manager);
        let value: Value = serde_json::from_str(&body).unwrap();

        assert_eq!(value["__ver__"], "2.0");
        assert_eq!(value["instanceId"], "i-abc");
        assert_eq!(value["userId"], "42");
        assert_eq!(value["sn"], "sn-node");
        assert_eq!(value["type"], "ThreadDump");
    }

    #[test]
    fn save_dump_requires_success_true() {
        let mut server = mockito::Server::new();
        let manager = TaskManager::new();
        manager.set_cloud_agent_info(CloudAgentInfo {
            heartbeat_url: server.url(),
            ..Default::default()
        });

        let accepted = server
            .mock("POST", "/agent/saveMiniDump")
            .with_status(200)
            .with_body(r#"{"success":true}"#)
            .create();
        assert!(save_dump("CoreDown", "{}".into(), &manager, &test_config()));
        accepted.assert();
        drop(accepted);

        let _rejected = server
            .mock("POST", "/agent/saveMiniDump")
            .with_status(200)
            .with_body(r#"{"success":false}"#)
            .create();
        assert!(!save_dump("CoreDown", "{}".into(), &manager, &test_config()));
    }

    #[test]
    fn stale_or_missing_core_markers_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::new(
            Properties::new(),
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
        );
        let manager = TaskManager::new();

        // no dumps directory at all
        assert!(!send_core_dump(&config, &manager));
    }

    #[test]
    fn thread_dump_detail_carries_water_levels() {
        let manager = TaskManager::new();
        let resources = vec![ResourceWaterLevel {
            name: "cpu",
            value: 0.93,
            threshold: 0.5,
            times: 4,
        }];

        let body = make_dump_body(
            "ThreadDump",
            json!({"resources": [{"resource": resources[0].name}]}),
            &manager,
        );
        let value: Value = serde_json::from_str(&body).unwrap();
        let inner: Value = serde_json::from_str(value["dump"].as_str().unwrap()).unwrap();
        assert_eq!(inner["detail"]["resources"][0]["resource"], "cpu");
    }
}
