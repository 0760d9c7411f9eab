use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the supervisor daemon
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin API settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Process supervision settings
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Automatic restart policy
    #[serde(default)]
    pub restart: RestartSettings,

    /// Supervised instances keyed by instance id
    #[serde(default)]
    pub instances: HashMap<String, InstanceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API and event socket
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Events queued per observer before it is considered stuck and dropped
    #[serde(default = "default_observer_buffer")]
    pub observer_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            observer_buffer: default_observer_buffer(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorSettings {
    /// Log entries retained per instance
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,

    /// Interval between liveness polls while restart waits for the old process
    #[serde(default = "default_stop_poll_interval")]
    pub stop_poll_interval_ms: u64,

    /// How long restart waits for a graceful stop before escalating
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// How long restart waits after escalating to SIGKILL before giving up
    #[serde(default = "default_kill_grace")]
    pub kill_grace_ms: u64,

    /// How long shutdown waits for graceful exits before killing stragglers
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            log_buffer_lines: default_log_buffer_lines(),
            stop_poll_interval_ms: default_stop_poll_interval(),
            stop_timeout_secs: default_stop_timeout(),
            kill_grace_ms: default_kill_grace(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl SupervisorSettings {
    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RestartSettings {
    /// Respawn attempts allowed inside one window before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Length of the attempt window in seconds
    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// Backoff grows linearly by this step per attempt
    #[serde(default = "default_backoff_step")]
    pub backoff_step_ms: u64,

    /// A respawned process that stays up this long counts as recovered
    #[serde(default = "default_stable_uptime")]
    pub stable_uptime_secs: u64,
}

impl Default for RestartSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            window_secs: default_window(),
            backoff_step_ms: default_backoff_step(),
            stable_uptime_secs: default_stable_uptime(),
        }
    }
}

impl RestartSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Delay before the given 1-based attempt
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_step_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn stable_uptime(&self) -> Duration {
        Duration::from_secs(self.stable_uptime_secs)
    }
}

/// Configuration for a single supervised proxy instance
///
/// # Security Warning
///
/// `binary_path` and `args` are executed directly with the permissions of
/// the supervisor. Configuration files must be readable only by the service
/// user.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct InstanceConfig {
    /// Display name
    pub name: Option<String>,

    /// Path of the proxy binary to execute
    pub binary_path: String,

    /// Working directory for the process
    pub working_dir: String,

    /// Arguments to pass to the binary
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables to set
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Respawn automatically after an unsolicited exit
    #[serde(default)]
    pub auto_restart: bool,

    /// Start when the supervisor starts
    #[serde(default)]
    pub auto_start: bool,
}

impl InstanceConfig {
    pub fn new(binary_path: &str, working_dir: &str) -> Self {
        Self {
            name: None,
            binary_path: binary_path.to_string(),
            working_dir: working_dir.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            auto_restart: false,
            auto_start: false,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_auto_restart(mut self, enabled: bool) -> Self {
        self.auto_restart = enabled;
        self
    }

    /// Validate the instance configuration
    pub fn validate(&self, id: &str) -> Result<(), String> {
        if id.trim().is_empty() || id.contains('/') {
            return Err(format!("Instance '{}': id must be non-empty and contain no '/'", id));
        }
        if self.binary_path.trim().is_empty() {
            return Err(format!("Instance '{}': 'binary_path' must not be empty", id));
        }
        if self.working_dir.trim().is_empty() {
            return Err(format!("Instance '{}': 'working_dir' must not be empty", id));
        }
        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    8730
}

fn default_observer_buffer() -> usize {
    crate::events::DEFAULT_OBSERVER_BUFFER
}

fn default_log_buffer_lines() -> usize {
    crate::logs::DEFAULT_LOG_BUFFER_LINES
}

fn default_stop_poll_interval() -> u64 {
    100
}

fn default_stop_timeout() -> u64 {
    10
}

fn default_kill_grace() -> u64 {
    2000
}

fn default_shutdown_grace() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    5
}

fn default_window() -> u64 {
    60
}

fn default_backoff_step() -> u64 {
    1000 // 1s, 2s, 3s, ...
}

fn default_stable_uptime() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.supervisor.log_buffer_lines == 0 {
            errors.push("supervisor.log_buffer_lines must be greater than 0".to_string());
        }
        if self.restart.window_secs == 0 {
            errors.push("restart.window_secs must be greater than 0".to_string());
        }

        let mut ids: Vec<&String> = self.instances.keys().collect();
        ids.sort();
        for id in ids {
            if let Err(e) = self.instances[id].validate(id) {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
