//! Instance registry: the durable record of which instances exist
//!
//! The supervision core only needs three things from the registry: look an
//! instance up, list instances, and record the pid of its live process. The
//! daemon uses [`MemoryRegistry`], seeded from the `[instances]` table of the
//! config file.

use crate::config::InstanceConfig;
use crate::supervisor::LaunchSpec;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Metadata for one supervised instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRecord {
    pub id: String,
    pub config: InstanceConfig,
    /// Pid of the live process, as last reported by the supervisor
    pub pid: Option<u32>,
}

impl InstanceRecord {
    pub fn new(id: &str, config: InstanceConfig) -> Self {
        Self {
            id: id.to_string(),
            config,
            pid: None,
        }
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec::from(&self.config)
    }
}

/// Lookup and pid bookkeeping used by the supervision core
pub trait InstanceRegistry: Send + Sync {
    fn get(&self, id: &str) -> Option<InstanceRecord>;

    fn list(&self) -> Vec<InstanceRecord>;

    /// Record the pid of the instance's live process, or clear it
    fn set_pid(&self, id: &str, pid: Option<u32>);
}

/// In-memory registry
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: RwLock<HashMap<String, InstanceRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(instances: &HashMap<String, InstanceConfig>) -> Self {
        let records = instances
            .iter()
            .map(|(id, config)| (id.clone(), InstanceRecord::new(id, config.clone())))
            .collect();
        Self {
            records: RwLock::new(records),
        }
    }

    /// Insert or replace an instance's configuration, keeping its recorded pid.
    /// Returns true if the instance is new.
    pub fn upsert(&self, id: &str, config: InstanceConfig) -> bool {
        let mut records = self.records.write();
        match records.get_mut(id) {
            Some(record) => {
                record.config = config;
                false
            }
            None => {
                records.insert(id.to_string(), InstanceRecord::new(id, config));
                true
            }
        }
    }

    pub fn remove(&self, id: &str) -> Option<InstanceRecord> {
        self.records.write().remove(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl InstanceRegistry for MemoryRegistry {
    fn get(&self, id: &str) -> Option<InstanceRecord> {
        self.records.read().get(id).cloned()
    }

    fn list(&self) -> Vec<InstanceRecord> {
        let mut records: Vec<InstanceRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    fn set_pid(&self, id: &str, pid: Option<u32>) {
        if let Some(record) = self.records.write().get_mut(id) {
            record.pid = pid;
        }
    }
}
