//! The task manager: typed slots published by pointer swap.
//!
//! Writers build a new value and swap it in; readers grab an `Arc`
//! snapshot and never block a writer. Components take the manager by
//! `Arc<TaskManager>`; there are no globals.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use arc_swap::ArcSwap;
use serde_json::Value;
use tracing::{debug, info};

use crate::model::{
    metric_items_equal, CloudAgentInfo, ExporterItem, HpcClusterItem, MetricItem, ModuleItem,
    NodeItem, ScriptItem,
};

type RawConfigParser = Box<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
pub struct TaskManager {
    node_item: ArcSwap<NodeItem>,
    cloud_agent_info: ArcSwap<CloudAgentInfo>,
    metric_items: ArcSwap<Vec<MetricItem>>,
    hpc_cluster: ArcSwap<HpcClusterItem>,
    exporter_items: ArcSwap<BTreeMap<String, ExporterItem>>,
    script_items: ArcSwap<BTreeMap<String, ScriptItem>>,
    module_items: ArcSwap<BTreeMap<String, ModuleItem>>,
    raw_parsers: Mutex<BTreeMap<String, Vec<RawConfigParser>>>,
}

impl TaskManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn node_item(&self) -> Arc<NodeItem> {
        self.node_item.load_full()
    }

    pub fn set_node_item(&self, node: NodeItem) {
        info!(
            r#"dimension: {{"userId":"{}","instanceId":"{}"}}"#,
            node.ali_uid, node.instance_id
        );
        self.node_item.store(Arc::new(node));
    }

    pub fn cloud_agent_info(&self) -> Arc<CloudAgentInfo> {
        self.cloud_agent_info.load_full()
    }

    pub fn set_cloud_agent_info(&self, info: CloudAgentInfo) {
        self.cloud_agent_info.store(Arc::new(info));
    }

    /// The published endpoint list. Consumers compare the returned `Arc`
    /// pointer against their previous snapshot to detect replacement.
    pub fn metric_items(&self) -> Arc<Vec<MetricItem>> {
        self.metric_items.load_full()
    }

    /// Publish a new endpoint list unless it is structurally identical to
    /// the current one. Returns whether a swap happened.
    pub fn set_metric_items(&self, items: Vec<MetricItem>) -> bool {
        let current = self.metric_items.load();
        if metric_items_equal(&current, &items) {
            info!("metricConfig is the same, no change");
            return false;
        }
        info!("metricConfig is not the same, will use new metricConfig");
        self.metric_items.store(Arc::new(items));
        true
    }

    pub fn hpc_cluster(&self) -> Arc<HpcClusterItem> {
        self.hpc_cluster.load_full()
    }

    pub fn set_hpc_cluster(&self, item: HpcClusterItem) {
        self.hpc_cluster.store(Arc::new(item));
    }

    pub fn exporter_items(&self) -> Arc<BTreeMap<String, ExporterItem>> {
        self.exporter_items.load_full()
    }

    pub fn set_exporter_items(&self, items: BTreeMap<String, ExporterItem>) {
        self.exporter_items.store(Arc::new(items));
    }

    pub fn script_items(&self) -> Arc<BTreeMap<String, ScriptItem>> {
        self.script_items.load_full()
    }

    pub fn set_script_items(&self, items: BTreeMap<String, ScriptItem>) {
        self.script_items.store(Arc::new(items));
    }

    pub fn module_items(&self) -> Arc<BTreeMap<String, ModuleItem>> {
        self.module_items.load_full()
    }

    pub fn set_module_items(&self, items: BTreeMap<String, ModuleItem>) {
        self.module_items.store(Arc::new(items));
    }

    /// Register a parser for a raw heartbeat section (`processInfo`,
    /// `httpInfo`, `telnetInfo`, `pingInfo`, the unified task config).
    /// Sections are forwarded verbatim; this crate never interprets them.
    pub fn register_raw_parser(
        &self,
        key: impl Into<String>,
        parser: impl Fn(&Value) + Send + Sync + 'static,
    ) {
        self.raw_parsers
            .lock()
            .unwrap()
            .entry(key.into())
            .or_default()
            .push(Box::new(parser));
    }

    /// Hand a raw section to its registered parsers. Unhandled sections
    /// are dropped silently.
    pub fn dispatch_raw(&self, key: &str, value: &Value) {
        let parsers = self.raw_parsers.lock().unwrap();
        match parsers.get(key) {
            Some(list) => {
                for parser in list {
                    parser(value);
                }
            }
            None => debug!("no parser registered for section '{key}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn node_item_snapshot_round_trip() {
        let manager = TaskManager::new();
        assert!(manager.node_item().instance_id.is_empty());

        manager.set_node_item(NodeItem {
            instance_id: "i-9".into(),
            ..Default::default()
        });
        assert_eq!(manager.node_item().instance_id, "i-9");
    }

    #[test]
    fn metric_items_swap_only_on_change() {
        let manager = TaskManager::new();
        let items = vec![MetricItem {
            url: "https://hub.example.com/put".into(),
            gzip: true,
            use_proxy: false,
        }];

        assert!(manager.set_metric_items(items.clone()));
        let snapshot = manager.metric_items();

        // identical content: no new pointer published
        assert!(!manager.set_metric_items(items.clone()));
        assert!(Arc::ptr_eq(&snapshot, &manager.metric_items()));

        let mut changed = items;
        changed[0].gzip = false;
        assert!(manager.set_metric_items(changed));
        assert!(!Arc::ptr_eq(&snapshot, &manager.metric_items()));
    }

    #[test]
    fn raw_sections_reach_registered_parsers() {
        let manager = TaskManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counted = hits.clone();
        manager.register_raw_parser("processInfo", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        });

        let value = serde_json::json!([{"name": "nginx"}]);
        manager.dispatch_raw("processInfo", &value);
        manager.dispatch_raw("unknownSection", &value);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
