//! In-process collector modules: a registry of collector kinds and the
//! scheduler runner that drives them.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skywatch_registry::model::ModuleItem;
use tracing::warn;

use crate::scheduler::{TaskRunner, TaskSpec};

impl TaskSpec for ModuleItem {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        ModuleItem::interval(self)
    }

    fn cron_expr(&self) -> &str {
        &self.cron_expr
    }
}

/// One pluggable collector. `collect` returns an encoded module-result
/// record (see `skywatch_metrics::module_data`); an empty string means
/// "nothing this round".
pub trait Collector: Send {
    fn init(&mut self, args: &str) -> Result<(), String>;
    fn collect(&mut self) -> Result<String, String>;
    fn close(&mut self) {}
}

pub type CollectorCtor = fn() -> Box<dyn Collector>;

/// Collector kinds by tag. The agent registers its built-ins at startup;
/// the scheduler only ever talks to the [`Collector`] trait.
#[derive(Default)]
pub struct CollectorRegistry {
    ctors: BTreeMap<String, CollectorCtor>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, ctor: CollectorCtor) {
        self.ctors.insert(kind.into(), ctor);
    }

    pub fn create(&self, kind: &str) -> Option<Box<dyn Collector>> {
        self.ctors.get(kind).map(|ctor| ctor())
    }

    pub fn kinds(&self) -> Vec<String> {
        self.ctors.keys().cloned().collect()
    }
}

/// Accepts encoded module results. The reporting channel is the one
/// production implementation.
pub trait ResultSink: Send + Sync {
    fn push(&self, module: &str, payload: String);
}

pub struct ModuleCollector {
    registry: Arc<CollectorRegistry>,
    sink: Arc<dyn ResultSink>,
    instances: Mutex<BTreeMap<String, Box<dyn Collector>>>,
}

impl ModuleCollector {
    pub fn new(registry: Arc<CollectorRegistry>, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            registry,
            sink,
            instances: Mutex::new(BTreeMap::new()),
        }
    }
}

impl TaskRunner<ModuleItem> for ModuleCollector {
    fn run_once(&self, item: &ModuleItem) -> Result<(), String> {
        let mut instances = self.instances.lock().unwrap();

        if !instances.contains_key(&item.name) {
            let Some(mut collector) = self.registry.create(&item.module) else {
                warn!("task '{}' names unknown module '{}'", item.name, item.module);
                return Err(format!("unknown module '{}'", item.module));
            };
            collector.init(&item.args)?;
            instances.insert(item.name.clone(), collector);
        }

        let collector = instances.get_mut(&item.name).expect("just inserted");
        let payload = collector.collect()?;
        if payload.is_empty() {
            return Ok(());
        }

        self.sink.push(&item.name, payload);
        Ok(())
    }
}
