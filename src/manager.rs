//! Id-resolving control surface over the supervisor, restart policy and bus
//!
//! Everything outside the core (admin API, daemon, config reload) goes
//! through [`InstanceManager`]: it looks instances up in the registry, keeps
//! the restart policy informed of manual actions, and publishes the
//! lifecycle events that belong to user-initiated operations.

use crate::config::{Config, InstanceConfig};
use crate::error::{Result, SupervisorError};
use crate::events::{Event, EventBus, InstanceStatus, Observer};
use crate::logs::LogEntry;
use crate::registry::{InstanceRecord, InstanceRegistry, MemoryRegistry};
use crate::restart::RestartPolicy;
use crate::supervisor::Supervisor;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// What a reload of the `[instances]` table changed
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReloadResult {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

impl ReloadResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

pub struct InstanceManager {
    registry: Arc<MemoryRegistry>,
    supervisor: Arc<Supervisor>,
    policy: Arc<RestartPolicy>,
    events: EventBus,
}

impl InstanceManager {
    pub fn new(
        registry: Arc<MemoryRegistry>,
        supervisor: Arc<Supervisor>,
        policy: Arc<RestartPolicy>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            supervisor,
            policy,
            events,
        })
    }

    /// Wire up registry, bus, supervisor and restart policy from a config.
    ///
    /// Spawns the restart policy task, so this must run inside a tokio runtime.
    pub fn from_config(config: &Config) -> Arc<Self> {
        let registry = Arc::new(MemoryRegistry::from_config(&config.instances));
        let events = EventBus::new(config.server.observer_buffer);
        let (supervisor, exits) =
            Supervisor::new(config.supervisor.clone(), registry.clone(), events.clone());
        let policy = RestartPolicy::new(
            config.restart.clone(),
            supervisor.clone(),
            registry.clone(),
            events.clone(),
        );
        policy.spawn(exits);
        Self::new(registry, supervisor, policy, events)
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn record(&self, instance_id: &str) -> Result<InstanceRecord> {
        self.registry
            .get(instance_id)
            .ok_or_else(|| SupervisorError::NotFound(instance_id.to_string()))
    }

    /// Start a registered instance. Clears any restart give-up state.
    pub fn start(&self, instance_id: &str) -> Result<u32> {
        let record = self.record(instance_id)?;
        self.policy.reset(instance_id);

        self.supervisor.start(instance_id, &record.launch_spec())
    }

    /// Request a stop. A pending automatic restart is cancelled either way.
    pub fn stop(&self, instance_id: &str, force: bool) -> Result<()> {
        self.record(instance_id)?;
        self.policy.cancel(instance_id);

        self.supervisor.stop(instance_id, force)
    }

    pub async fn restart(&self, instance_id: &str) -> Result<u32> {
        let record = self.record(instance_id)?;
        self.policy.reset(instance_id);

        self.supervisor
            .restart(instance_id, &record.launch_spec())
            .await
    }

    pub fn is_running(&self, instance_id: &str) -> bool {
        self.supervisor.is_running(instance_id)
    }

    pub fn logs(&self, instance_id: &str, limit: Option<usize>) -> Result<Vec<LogEntry>> {
        self.record(instance_id)?;
        Ok(self.supervisor.logs(instance_id, limit))
    }

    pub fn status(&self, instance_id: &str) -> Result<InstanceStatus> {
        let record = self.record(instance_id)?;
        Ok(self.status_of(&record))
    }

    pub fn list(&self) -> Vec<InstanceStatus> {
        self.registry
            .list()
            .iter()
            .map(|record| self.status_of(record))
            .collect()
    }

    fn status_of(&self, record: &InstanceRecord) -> InstanceStatus {
        let pid = self.supervisor.pid(&record.id);
        InstanceStatus {
            instance_id: record.id.clone(),
            name: record.config.name.clone(),
            running: pid.is_some(),
            pid,
            started_at: self.supervisor.started_at(&record.id),
            auto_restart: record.config.auto_restart,
            restart_attempts: self.policy.attempts(&record.id),
        }
    }

    pub fn snapshot(&self) -> Event {
        Event::Snapshot {
            instances: self.list(),
        }
    }

    /// Register an observer; its first message is the current snapshot
    pub fn subscribe(&self) -> Observer {
        self.events.subscribe_with(|| self.snapshot())
    }

    /// Relay an event from an external collaborator onto the bus
    pub fn relay(&self, topic: &str, instance_id: Option<String>, payload: serde_json::Value) {
        self.events.publish(Event::Notice {
            topic: topic.to_string(),
            instance_id,
            payload,
        });
    }

    /// Kill the instance if running, drop its logs and unregister it
    pub async fn delete(&self, instance_id: &str) -> Result<()> {
        self.record(instance_id)?;
        self.policy.forget(instance_id);

        if self.supervisor.is_running(instance_id) {
            // NotRunning here means it is already exiting
            if let Err(e) = self.supervisor.stop(instance_id, true) {
                warn!(instance_id, error = %e, "Stop during delete failed");
            }
            let grace = self.supervisor.settings().kill_grace();
            if !self.supervisor.wait_for_exit(instance_id, grace).await {
                warn!(instance_id, "Deleted instance is still exiting");
            }
        }

        self.registry.remove(instance_id);
        self.supervisor.forget(instance_id);
        self.policy.forget(instance_id);
        info!(instance_id, "Instance deleted");
        self.events.publish(Event::InstanceDeleted {
            instance_id: instance_id.to_string(),
        });
        Ok(())
    }

    /// Start every registered instance with `auto_start` set.
    /// Returns the ids that were started.
    pub fn autostart(&self) -> Vec<String> {
        let mut started = Vec::new();
        for record in self.registry.list() {
            if !record.config.auto_start {
                continue;
            }
            match self.start(&record.id) {
                Ok(pid) => {
                    info!(instance_id = %record.id, pid, "Auto-started instance");
                    started.push(record.id);
                }
                Err(e) => warn!(instance_id = %record.id, error = %e, "Auto-start failed"),
            }
        }
        started
    }

    /// Replace the registered instances with `instances`.
    ///
    /// Removed instances are deleted; new ones are registered and started
    /// when `auto_start` is set; changed ones take effect on their next start.
    pub async fn apply_config(&self, instances: &HashMap<String, InstanceConfig>) -> ReloadResult {
        let mut result = ReloadResult::default();

        for instance_id in self.registry.ids() {
            if instances.contains_key(&instance_id) {
                continue;
            }
            if let Err(e) = self.delete(&instance_id).await {
                warn!(instance_id = %instance_id, error = %e, "Failed to remove instance on reload");
                continue;
            }
            result.removed.push(instance_id);
        }

        let mut ids: Vec<&String> = instances.keys().collect();
        ids.sort();
        for instance_id in ids {
            let config = &instances[instance_id];
            match self.registry.get(instance_id) {
                Some(record) if record.config == *config => {}
                Some(_) => {
                    self.registry.upsert(instance_id, config.clone());
                    result.updated.push(instance_id.clone());
                }
                None => {
                    self.registry.upsert(instance_id, config.clone());
                    result.added.push(instance_id.clone());
                    if config.auto_start {
                        if let Err(e) = self.start(instance_id) {
                            warn!(instance_id = %instance_id, error = %e, "Auto-start failed");
                        }
                    }
                }
            }
        }

        info!(
            added = result.added.len(),
            removed = result.removed.len(),
            updated = result.updated.len(),
            "Instances reloaded"
        );
        result
    }

    /// Re-read the config file and apply its `[instances]` table.
    /// Server, supervisor and restart settings only take effect on restart.
    pub async fn reload_config(&self, path: &Path) -> anyhow::Result<ReloadResult> {
        let config = Config::load(path)?;
        Ok(self.apply_config(&config.instances).await)
    }

    /// Cancel pending restarts and stop every process
    pub async fn shutdown(&self) {
        for instance_id in self.registry.ids() {
            self.policy.cancel(&instance_id);
        }
        self.supervisor.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> InstanceConfig {
        InstanceConfig::new("/bin/sh", "/tmp").with_args(vec!["-c".to_string(), script.to_string()])
    }

    fn manager_with(instances: &[(&str, InstanceConfig)]) -> Arc<InstanceManager> {
        let mut config = Config::default();
        config.supervisor.stop_poll_interval_ms = 20;
        for (id, instance) in instances {
            config.instances.insert(id.to_string(), instance.clone());
        }
        InstanceManager::from_config(&config)
    }

    #[tokio::test]
    async fn test_unknown_instance_is_not_found() {
        let manager = manager_with(&[]);
        assert!(matches!(manager.start("nope"), Err(SupervisorError::NotFound(_))));
        assert!(matches!(manager.stop("nope", false), Err(SupervisorError::NotFound(_))));
        assert!(matches!(manager.restart("nope").await, Err(SupervisorError::NotFound(_))));
        assert!(matches!(manager.logs("nope", None), Err(SupervisorError::NotFound(_))));
        assert!(matches!(manager.delete("nope").await, Err(SupervisorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_status_tracks_lifecycle() {
        let manager = manager_with(&[("i1", sh("exec sleep 30"))]);

        let status = manager.status("i1").unwrap();
        assert!(!status.running);
        assert_eq!(status.pid, None);

        let pid = manager.start("i1").unwrap();
        let status = manager.status("i1").unwrap();
        assert!(status.running);
        assert_eq!(status.pid, Some(pid));
        assert!(status.started_at.is_some());

        manager.stop("i1", false).unwrap();
        assert!(manager.supervisor().wait_for_exit("i1", std::time::Duration::from_secs(5)).await);
        assert!(!manager.status("i1").unwrap().running);
        assert!(matches!(manager.stop("i1", false), Err(SupervisorError::NotRunning(_))));
    }

    #[tokio::test]
    async fn test_snapshot_lists_every_instance() {
        let manager = manager_with(&[("b", sh("exec sleep 30")), ("a", sh("exec sleep 30"))]);
        manager.start("b").unwrap();

        let mut observer = manager.subscribe();
        let first = observer.try_recv().unwrap();
        let Event::Snapshot { instances } = &*first else {
            panic!("expected snapshot, got {:?}", first);
        };
        let summary: Vec<(&str, bool)> = instances
            .iter()
            .map(|s| (s.instance_id.as_str(), s.running))
            .collect();
        assert_eq!(summary, vec![("a", false), ("b", true)]);

        manager.shutdown().await;
        assert!(!manager.is_running("b"));
    }

    #[tokio::test]
    async fn test_delete_stops_and_forgets() {
        let manager = manager_with(&[("i1", sh("echo hi; exec sleep 30"))]);
        manager.start("i1").unwrap();
        let mut observer = manager.events().subscribe();

        manager.delete("i1").await.unwrap();
        assert!(!manager.is_running("i1"));
        assert!(manager.supervisor().logs("i1", None).is_empty());
        assert!(matches!(manager.status("i1"), Err(SupervisorError::NotFound(_))));

        let mut deleted = false;
        while let Some(event) = observer.try_recv() {
            if matches!(*event, Event::InstanceDeleted { .. }) {
                deleted = true;
            }
        }
        assert!(deleted);
    }

    #[tokio::test]
    async fn test_apply_config_reports_changes() {
        let manager = manager_with(&[("keep", sh("exec sleep 30")), ("edit", sh("exec sleep 30")), ("drop", sh("exec sleep 30"))]);
        manager.start("drop").unwrap();

        let mut next = HashMap::new();
        next.insert("keep".to_string(), sh("exec sleep 30"));
        next.insert("edit".to_string(), sh("exec sleep 60"));
        next.insert("new".to_string(), sh("exec sleep 30"));

        let result = manager.apply_config(&next).await;
        assert_eq!(result.added, vec!["new"]);
        assert_eq!(result.removed, vec!["drop"]);
        assert_eq!(result.updated, vec!["edit"]);
        assert!(!manager.is_running("drop"));
        assert!(!manager.is_running("new"));

        let again = manager.apply_config(&next).await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_autostart_only_flagged_instances() {
        let mut flagged = sh("exec sleep 30");
        flagged.auto_start = true;
        let manager = manager_with(&[("auto", flagged), ("manual", sh("exec sleep 30"))]);

        assert_eq!(manager.autostart(), vec!["auto"]);
        assert!(manager.is_running("auto"));
        assert!(!manager.is_running("manual"));

        manager.shutdown().await;
        assert!(!manager.is_running("auto"));
    }

    #[tokio::test]
    async fn test_relay_publishes_notice() {
        let manager = manager_with(&[]);
        let mut observer = manager.events().subscribe();

        manager.relay("configChanged", Some("i1".to_string()), serde_json::json!({"path": "config.json"}));

        let event = observer.try_recv().unwrap();
        assert_eq!(event.instance_id(), Some("i1"));
        assert!(matches!(&*event, Event::Notice { topic, .. } if topic == "configChanged"));
    }
}
