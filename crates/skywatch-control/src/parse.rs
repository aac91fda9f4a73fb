//! Heartbeat response distribution: each recognized top-level section
//! updates its cache; unrecognized content is ignored without poisoning
//! previous state.

use std::path::PathBuf;

use serde_json::Value;
use skywatch_common::config::AgentConfig;
use skywatch_common::encoding;
use skywatch_registry::model::{
    index_by_name, ExporterItem, HpcClusterItem, HpcNodeInstance, MetricItem, ModuleItem,
    NodeItem, ScriptItem,
};
use skywatch_registry::TaskManager;
use tracing::{error, info, warn};

/// Detection sections forwarded verbatim to registered parsers.
const RAW_SECTIONS: [&str; 4] = ["processInfo", "httpInfo", "telnetInfo", "pingInfo"];

/// Parse a heartbeat response and update every cache it addresses.
pub fn distribute(response: &str, manager: &TaskManager, config: &AgentConfig) {
    let root: Value = match serde_json::from_str(response) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) => {
            warn!("the heartbeat response is not a json object");
            return;
        }
        Err(e) => {
            warn!("the heartbeat response is invalid: {e}");
            return;
        }
    };

    parse_node(&root, manager);
    parse_metric_hub(&root, manager, config);
    parse_hpc_cluster(&root, manager);
    parse_file_store(&root, config);
    parse_task_config(&root, manager);

    for section in RAW_SECTIONS {
        if let Some(value) = root.get(section) {
            manager.dispatch_raw(section, value);
        }
    }
    manager.dispatch_raw("unifiedConfig", &root);
}

fn parse_node(root: &Value, manager: &TaskManager) {
    let Some(node) = root.get("node") else {
        warn!("no node in the response json");
        return;
    };

    let get = |key: &str| {
        node.get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };

    // aliUid arrives as a number; it is carried as its decimal string
    let ali_uid = match node.get("aliUid") {
        Some(Value::Number(n)) => n
            .as_u64()
            .map(|v| v.to_string())
            .unwrap_or_else(|| n.to_string()),
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    };

    manager.set_node_item(NodeItem {
        instance_id: get("instanceId"),
        serial_number: get("serialNumber"),
        ali_uid,
        host_name: get("hostName"),
        operating_system: get("operatingSystem"),
        region: get("region"),
    });
}

fn parse_metric_hub(root: &Value, manager: &TaskManager, config: &AgentConfig) {
    let override_url = config.get("cms.metrichub_url", "");

    let extract = |value: &Value, with_override: bool| -> MetricItem {
        let url = if with_override && !override_url.is_empty() {
            override_url.clone()
        } else {
            value
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string()
        };
        MetricItem {
            url,
            gzip: value.get("gzip").and_then(Value::as_bool).unwrap_or(false),
            use_proxy: value
                .get("useProxy")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    };

    let mut items = Vec::with_capacity(2);
    match root.get("metricHubConfig") {
        Some(value) => items.push(extract(value, true)),
        None => warn!("no metricHubConfig in the response json"),
    }
    match root.get("metricConfig") {
        Some(value) => items.push(extract(value, false)),
        None => warn!("no metricConfig in the response json"),
    }

    if !items.is_empty() {
        manager.set_metric_items(items);
    }
}

fn parse_hpc_cluster(root: &Value, manager: &TaskManager) {
    let Some(value) = root.get("hpcClusterConfig") else {
        let cached = manager.hpc_cluster();
        info!(
            "no hpcClusterConfig in the response json, {}",
            if cached.is_valid { "use cached" } else { "no rdma" }
        );
        return;
    };

    let get = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };

    let mut item = HpcClusterItem {
        cluster_id: get("clusterId"),
        region_id: get("regionId"),
        version: get("version"),
        instances: Vec::new(),
        is_valid: false,
    };
    item.is_valid = !item.version.is_empty();

    if let Some(instances) = value.get("instances").and_then(Value::as_array) {
        for instance in instances {
            item.instances.push(HpcNodeInstance {
                instance_id: instance
                    .get("instanceId")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                ip: instance
                    .get("ip")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
            });
        }
    }

    manager.set_hpc_cluster(item);
}

fn parse_file_store(root: &Value, config: &AgentConfig) {
    let Some(files) = root.get("fileStore").and_then(Value::as_array) else {
        return;
    };

    for file in files {
        let path = file
            .get("filePath")
            .and_then(Value::as_str)
            .unwrap_or("");
        let content = file.get("content").and_then(Value::as_str).unwrap_or("");
        let user = file.get("user").and_then(Value::as_str).unwrap_or("root");
        if path.is_empty() || content.is_empty() || user.is_empty() {
            warn!("fileStore file path or content or user empty, skip");
            continue;
        }
        if !store_file(path, content, user, config) {
            warn!("store file: {path} failed");
        }
    }
}

/// Write one distributed file. The content is base64; relative paths land
/// under the base directory; ownership is applied best effort.
pub fn store_file(path: &str, content_b64: &str, user: &str, config: &AgentConfig) -> bool {
    let mut abs_path = PathBuf::from(path);
    if abs_path.is_relative() {
        abs_path = config.base_dir().join(abs_path);
    }

    let content = match encoding::decode_base64(content_b64) {
        Ok(bytes) if !bytes.is_empty() => bytes,
        Ok(_) => {
            warn!("file content after base64 decode is empty, skip file: {}", abs_path.display());
            return false;
        }
        Err(e) => {
            warn!("file content is not valid base64 ({e}), skip file: {}", abs_path.display());
            return false;
        }
    };

    if let Some(parent) = abs_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!("creating {}: {e}", parent.display());
            return false;
        }
    }
    if let Err(e) = std::fs::write(&abs_path, content) {
        error!("store file error: {e}, file: {}", abs_path.display());
        return false;
    }

    apply_owner(&abs_path, user);
    info!("store file success, path: {}", abs_path.display());
    true
}

#[cfg(unix)]
fn apply_owner(path: &std::path::Path, user: &str) {
    let status = std::process::Command::new("chown")
        .arg(user)
        .arg(path)
        .status();
    if let Err(e) = status {
        warn!("chown {} {}: {e}", user, path.display());
    }
}

#[cfg(not(unix))]
fn apply_owner(_path: &std::path::Path, _user: &str) {}

/// The unified task config: exporter, script and module descriptor arrays.
fn parse_task_config(root: &Value, manager: &TaskManager) {
    let Some(task_config) = root.get("taskConfig") else {
        return;
    };

    if let Some(value) = task_config.get("exporterTasks") {
        match serde_json::from_value::<Vec<ExporterItem>>(value.clone()) {
            Ok(items) => {
                let items: Vec<_> = items.into_iter().filter(valid_exporter).collect();
                manager.set_exporter_items(index_by_name(items, |i| i.name.as_str()));
            }
            Err(e) => warn!("invalid exporterTasks: {e}"),
        }
    }

    if let Some(value) = task_config.get("scriptTasks") {
        match serde_json::from_value::<Vec<ScriptItem>>(value.clone()) {
            Ok(items) => {
                let items: Vec<_> = items
                    .into_iter()
                    .filter(|i| !i.name.is_empty() && i.interval_secs > 0)
                    .collect();
                manager.set_script_items(index_by_name(items, |i| i.name.as_str()));
            }
            Err(e) => warn!("invalid scriptTasks: {e}"),
        }
    }

    if let Some(value) = task_config.get("moduleTasks") {
        match serde_json::from_value::<Vec<ModuleItem>>(value.clone()) {
            Ok(items) => {
                let items: Vec<_> = items
                    .into_iter()
                    .filter(|i| !i.name.is_empty() && i.interval_secs > 0)
                    .collect();
                manager.set_module_items(index_by_name(items, |i| i.name.as_str()));
            }
            Err(e) => warn!("invalid moduleTasks: {e}"),
        }
    }
}

fn valid_exporter(item: &ExporterItem) -> bool {
    let ok = !item.name.is_empty() && !item.target.is_empty() && item.interval_secs > 0;
    if !ok {
        warn!("skip invalid exporter task '{}'", item.name);
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use skywatch_common::properties::Properties;

    fn test_config() -> AgentConfig {
        AgentConfig::new(
            Properties::new(),
            PathBuf::from("."),
            PathBuf::from("."),
        )
    }

    #[test]
    fn node_section_populates_identity() {
        let manager = TaskManager::new();
        distribute(
            r#"{"node":{"instanceId":"i-abc","serialNumber":"sn-1","aliUid":1234567,
                "hostName":"web-1","operatingSystem":"Linux","region":"cn-hangzhou"}}"#,
            &manager,
            &test_config(),
        );

        let node = manager.node_item();
        assert_eq!(node.instance_id, "i-abc");
        assert_eq!(node.ali_uid, "1234567");
        assert_eq!(node.region, "cn-hangzhou");
    }

    #[test]
    fn metric_hub_sections_build_the_endpoint_list() {
        let manager = TaskManager::new();
        distribute(
            r#"{"metricHubConfig":{"url":"https://hub.example.com/put","gzip":true,"useProxy":true},
                "metricConfig":{"url":"https://metric.example.com/put","gzip":false}}"#,
            &manager,
            &test_config(),
        );

        let items = manager.metric_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].url, "https://hub.example.com/put");
        assert!(items[0].gzip && items[0].use_proxy);
        assert_eq!(items[1].url, "https://metric.example.com/put");
        assert!(!items[1].gzip);
    }

    #[test]
    fn metrichub_url_override_replaces_the_hub_endpoint_only() {
        let manager = TaskManager::new();
        let mut config = test_config();
        config.set("cms.metrichub_url", "https://override.example.com/put");

        distribute(
            r#"{"metricHubConfig":{"url":"https://hub.example.com/put"},
                "metricConfig":{"url":"https://metric.example.com/put"}}"#,
            &manager,
            &config,
        );

        let items = manager.metric_items();
        assert_eq!(items[0].url, "https://override.example.com/put");
        assert_eq!(items[1].url, "https://metric.example.com/put");
    }

    #[test]
    fn malformed_response_keeps_previous_caches() {
        let manager = TaskManager::new();
        manager.set_node_item(NodeItem {
            instance_id: "i-kept".into(),
            ..Default::default()
        });

        distribute("not json at all", &manager, &test_config());
        distribute(r#"["an","array"]"#, &manager, &test_config());

        assert_eq!(manager.node_item().instance_id, "i-kept");
    }

    #[test]
    fn hpc_cluster_is_cached_with_members() {
        let manager = TaskManager::new();
        distribute(
            r#"{"hpcClusterConfig":{"clusterId":"hpc-1","regionId":"cn-beijing","version":"3",
                "instances":[{"instanceId":"i-1","ip":"192.168.0.1"}]}}"#,
            &manager,
            &test_config(),
        );

        let hpc = manager.hpc_cluster();
        assert!(hpc.is_valid);
        assert_eq!(hpc.version, "3");
        assert_eq!(hpc.instances.len(), 1);
        assert_eq!(hpc.instances[0].ip, "192.168.0.1");
    }

    #[test]
    fn file_store_materializes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::new(
            Properties::new(),
            dir.path().to_path_buf(),
            dir.path().to_path_buf(),
        );

        let manager = TaskManager::new();
        let content = encoding::encode_base64(b"plugin contents");
        let response = format!(
            r#"{{"fileStore":[{{"filePath":"plugins/probe.sh","content":"{content}","user":"root"}}]}}"#
        );
        distribute(&response, &manager, &config);

        let written = std::fs::read(dir.path().join("plugins/probe.sh")).unwrap();
        assert_eq!(written, b"plugin contents");
    }

    #[test]
    fn task_config_fills_typed_descriptor_maps() {
        let manager = TaskManager::new();
        distribute(
            r#"{"taskConfig":{
                "exporterTasks":[
                    {"name":"node","target":"http://127.0.0.1:9100/metrics","interval":15},
                    {"name":"","target":"http://ignored","interval":15}],
                "scriptTasks":[{"name":"disk","collectUrl":"/opt/check.sh","interval":60}],
                "moduleTasks":[{"name":"cpu","module":"cpu","interval":15}]}}"#,
            &manager,
            &test_config(),
        );

        assert_eq!(manager.exporter_items().len(), 1);
        assert!(manager.exporter_items().contains_key("node"));
        assert_eq!(manager.script_items()["disk"].target, "/opt/check.sh");
        assert_eq!(manager.module_items()["cpu"].module, "cpu");
    }
}
