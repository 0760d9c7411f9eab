use crate::config::{InstanceConfig, SupervisorSettings};
use crate::error::{Result, SupervisorError};
use crate::events::{Event, EventBus};
use crate::logs::{LogBuffer, LogChannel, LogEntry};
use crate::registry::InstanceRegistry;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long the exit watcher waits, in total, for the output readers to hit
/// EOF. A grandchild that inherited the pipes keeps them open past this.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// What to execute for an instance
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub binary_path: PathBuf,
    pub working_dir: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl LaunchSpec {
    pub fn new(binary_path: impl Into<PathBuf>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary_path: binary_path.into(),
            working_dir: working_dir.into(),
            args: Vec::new(),
            env: HashMap::new(),
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
}

impl From<&InstanceConfig> for LaunchSpec {
    fn from(config: &InstanceConfig) -> Self {
        LaunchSpec::new(&config.binary_path, &config.working_dir)
            .with_args(config.args.clone())
            .with_env(config.env.clone())
    }
}

/// Which signal a stop request delivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// SIGTERM
    Graceful,
    /// SIGKILL
    Force,
}

/// Sent to the restart policy once per process lifetime
#[derive(Debug, Clone, PartialEq)]
pub struct ExitNotice {
    pub instance_id: String,
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The exit followed a stop request
    pub requested: bool,
    pub uptime: Duration,
}

/// A live process as seen from outside the supervisor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningProcess {
    pub instance_id: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// Where a live handle is in its process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    /// Slot claimed, fork/exec in progress
    Spawning,
    Running(u32),
    /// Reaped, output still draining
    Exiting,
}

impl ProcessState {
    fn pid(self) -> Option<u32> {
        match self {
            ProcessState::Running(pid) => Some(pid),
            ProcessState::Spawning | ProcessState::Exiting => None,
        }
    }
}

/// Live handle for one process. The `Child` itself is owned by the exit
/// watcher task; stop requests reach it over `stop_tx`.
struct LiveHandle {
    state: ProcessState,
    started_at: DateTime<Utc>,
    generation: u64,
    stop_tx: mpsc::UnboundedSender<StopSignal>,
    stop_requested: Arc<AtomicBool>,
}

/// Everything the exit watcher needs besides the child
struct ProcessWatch {
    pid: u32,
    generation: u64,
    started: Instant,
    stop_rx: mpsc::UnboundedReceiver<StopSignal>,
    stop_requested: Arc<AtomicBool>,
    readers: Vec<JoinHandle<()>>,
    buffer: Arc<Mutex<LogBuffer>>,
}

/// Owns every supervised child process and its captured output.
///
/// # Usage
///
/// `Supervisor` is designed to be used behind an `Arc`: each spawned process
/// gets a watcher task holding a clone. [`new`](Supervisor::new) returns the
/// `Arc` together with the receiving end of the exit-notice channel, which
/// is meant for the restart policy.
///
/// ```ignore
/// let (supervisor, exits) = Supervisor::new(settings, registry, events);
/// let pid = supervisor.start("edge-1", &launch)?;
/// ```
///
/// # Invariants
///
/// - at most one live handle per instance id; the check and the claim of
///   the slot in [`start`](Supervisor::start) happen under the same map
///   entry lock, fork/exec happens after the lock is released
/// - a process's lifecycle events (started, stopped, exit) are published
///   in that order: started before its watcher exists, exit before its
///   handle is released
/// - log buffers outlive processes and are only dropped by
///   [`forget`](Supervisor::forget)
/// - no event is published while a map guard is held
pub struct Supervisor {
    /// Live processes keyed by instance id
    handles: DashMap<String, LiveHandle>,
    /// Retained output keyed by instance id
    logs: DashMap<String, Arc<Mutex<LogBuffer>>>,
    registry: Arc<dyn InstanceRegistry>,
    events: EventBus,
    exits: mpsc::UnboundedSender<ExitNotice>,
    settings: SupervisorSettings,
    next_generation: AtomicU64,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        registry: Arc<dyn InstanceRegistry>,
        events: EventBus,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ExitNotice>) {
        let (exits, exit_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(Self {
            handles: DashMap::new(),
            logs: DashMap::new(),
            registry,
            events,
            exits,
            settings,
            next_generation: AtomicU64::new(1),
        });
        (supervisor, exit_rx)
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Check if an instance holds a live handle. This stays true while a
    /// reaped process's output is drained, so a new start cannot overtake it.
    pub fn is_running(&self, instance_id: &str) -> bool {
        self.handles.contains_key(instance_id)
    }

    /// Get the pid of an instance's live process. None once it was reaped.
    pub fn pid(&self, instance_id: &str) -> Option<u32> {
        self.handles.get(instance_id).and_then(|h| h.state.pid())
    }

    pub fn started_at(&self, instance_id: &str) -> Option<DateTime<Utc>> {
        self.handles
            .get(instance_id)
            .filter(|h| h.state.pid().is_some())
            .map(|h| h.started_at)
    }

    /// List all live processes
    pub fn running(&self) -> Vec<RunningProcess> {
        let mut running: Vec<RunningProcess> = self
            .handles
            .iter()
            .filter_map(|entry| {
                entry.state.pid().map(|pid| RunningProcess {
                    instance_id: entry.key().clone(),
                    pid,
                    started_at: entry.started_at,
                })
            })
            .collect();
        running.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        running
    }

    /// Retained log entries, limited to the most recent `limit` when given
    pub fn logs(&self, instance_id: &str, limit: Option<usize>) -> Vec<LogEntry> {
        self.logs
            .get(instance_id)
            .map(|buffer| buffer.lock().tail(limit))
            .unwrap_or_default()
    }

    /// Append a supervisor notice to an instance's log
    pub fn log_system(&self, instance_id: &str, message: impl AsRef<str>) {
        let buffer = self.buffer(instance_id);
        record(
            &buffer,
            &self.events,
            instance_id,
            LogEntry::new(LogChannel::System, message),
        );
    }

    /// Drop the log buffer of a deleted instance. Returns true if one existed.
    pub fn forget(&self, instance_id: &str) -> bool {
        self.logs.remove(instance_id).is_some()
    }

    fn buffer(&self, instance_id: &str) -> Arc<Mutex<LogBuffer>> {
        if let Some(buffer) = self.logs.get(instance_id) {
            return Arc::clone(buffer.value());
        }
        let capacity = self.settings.log_buffer_lines;
        let buffer = self
            .logs
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LogBuffer::with_capacity(capacity))));
        Arc::clone(buffer.value())
    }

    /// Spawn the instance's process, publish `instanceStarted` and return
    /// its pid.
    ///
    /// Fails with `AlreadyRunning` if the instance has a live process, and
    /// with `SpawnError` if the OS cannot create it. A failed start records
    /// no handle.
    pub fn start(self: &Arc<Self>, instance_id: &str, launch: &LaunchSpec) -> Result<u32> {
        self.launch(instance_id, launch, false)
    }

    fn launch(self: &Arc<Self>, instance_id: &str, launch: &LaunchSpec, restarted: bool) -> Result<u32> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let stop_requested = Arc::new(AtomicBool::new(false));

        match self.handles.entry(instance_id.to_string()) {
            Entry::Occupied(_) => {
                debug!(instance_id, "Instance already running");
                return Err(SupervisorError::AlreadyRunning(instance_id.to_string()));
            }
            Entry::Vacant(slot) => {
                slot.insert(LiveHandle {
                    state: ProcessState::Spawning,
                    started_at: Utc::now(),
                    generation,
                    stop_tx,
                    stop_requested: Arc::clone(&stop_requested),
                });
            }
        }

        let spawned = spawn_child(launch).and_then(|mut child| match child.id() {
            Some(pid) => Ok((child, pid)),
            None => {
                let _ = child.start_kill();
                Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "process exited before a pid was obtained",
                ))
            }
        });

        let (mut child, pid) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                self.handles
                    .remove_if(instance_id, |_, handle| handle.generation == generation);
                error!(
                    instance_id,
                    binary = %launch.binary_path.display(),
                    error = %e,
                    "Failed to spawn instance"
                );
                self.log_system(
                    instance_id,
                    format!("failed to start {}: {}", launch.binary_path.display(), e),
                );
                self.events.publish(Event::ProcessError {
                    instance_id: instance_id.to_string(),
                    message: e.to_string(),
                });
                return Err(SupervisorError::spawn(instance_id, e));
            }
        };

        if let Some(mut handle) = self.handles.get_mut(instance_id) {
            if handle.generation == generation {
                handle.state = ProcessState::Running(pid);
            }
        }

        info!(
            instance_id,
            pid,
            binary = %launch.binary_path.display(),
            cwd = %launch.working_dir.display(),
            "Instance process spawned"
        );

        let buffer = self.buffer(instance_id);
        record(
            &buffer,
            &self.events,
            instance_id,
            LogEntry::new(LogChannel::System, format!("process started (pid {})", pid)),
        );
        self.registry.set_pid(instance_id, Some(pid));

        // Before the watcher exists, so this process's exit cannot overtake it
        let instance = instance_id.to_string();
        self.events.publish(if restarted {
            Event::InstanceRestarted {
                instance_id: instance,
                pid: Some(pid),
            }
        } else {
            Event::InstanceStarted {
                instance_id: instance,
                pid: Some(pid),
            }
        });

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(self.spawn_reader(instance_id, stdout, LogChannel::Stdout, &buffer));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(self.spawn_reader(instance_id, stderr, LogChannel::Stderr, &buffer));
        }

        let watch = ProcessWatch {
            pid,
            generation,
            started: Instant::now(),
            stop_rx,
            stop_requested,
            readers,
            buffer,
        };
        let supervisor = Arc::clone(self);
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            supervisor.watch_exit(instance_id, child, watch).await;
        });

        Ok(pid)
    }

    /// Copy one output stream into the instance's log, line by line
    fn spawn_reader<R>(
        &self,
        instance_id: &str,
        stream: R,
        channel: LogChannel,
        buffer: &Arc<Mutex<LogBuffer>>,
    ) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let events = self.events.clone();
        let buffer = Arc::clone(buffer);
        let instance_id = instance_id.to_string();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line);
                        record(&buffer, &events, &instance_id, LogEntry::new(channel, text));
                    }
                    Err(e) => {
                        debug!(
                            instance_id = %instance_id,
                            channel = channel.as_str(),
                            error = %e,
                            "Output stream read failed"
                        );
                        break;
                    }
                }
            }
        })
    }

    /// Own the child until it exits, delivering stop signals meanwhile
    async fn watch_exit(self: Arc<Self>, instance_id: String, mut child: Child, mut watch: ProcessWatch) {
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(signal) = watch.stop_rx.recv() => {
                    deliver_signal(&instance_id, &mut child, watch.pid, signal);
                }
            }
        };

        // Reaped: the pid is no longer ours
        if let Some(mut handle) = self.handles.get_mut(&instance_id) {
            if handle.generation == watch.generation {
                handle.state = ProcessState::Exiting;
            }
        }
        self.registry.set_pid(&instance_id, None);

        let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        for mut reader in watch.readers.drain(..) {
            if tokio::time::timeout_at(deadline, &mut reader).await.is_err() {
                debug!(instance_id = %instance_id, "Output stream still open after exit, detaching");
                reader.abort();
                let _ = reader.await;
            }
        }

        let uptime = watch.started.elapsed();
        let requested = watch.stop_requested.load(Ordering::SeqCst);
        let (code, signal) = match status {
            Ok(status) => {
                let (code, signal) = exit_parts(&status);
                if requested {
                    info!(instance_id = %instance_id, pid = watch.pid, ?code, ?signal, "Instance exited after stop request");
                } else {
                    warn!(
                        instance_id = %instance_id,
                        pid = watch.pid,
                        ?code,
                        ?signal,
                        uptime_ms = uptime.as_millis() as u64,
                        "Instance exited unexpectedly"
                    );
                }
                record(
                    &watch.buffer,
                    &self.events,
                    &instance_id,
                    LogEntry::new(LogChannel::System, describe_exit(watch.pid, code, signal)),
                );
                (code, signal)
            }
            Err(e) => {
                error!(instance_id = %instance_id, pid = watch.pid, error = %e, "Failed to wait on instance process");
                record(
                    &watch.buffer,
                    &self.events,
                    &instance_id,
                    LogEntry::new(LogChannel::System, format!("lost track of process {}: {}", watch.pid, e)),
                );
                self.events.publish(Event::ProcessError {
                    instance_id: instance_id.clone(),
                    message: e.to_string(),
                });
                (None, None)
            }
        };

        // Exit event first, then release the handle: a following start's
        // events can never overtake this process's exit.
        self.events.publish(Event::ProcessExit {
            instance_id: instance_id.clone(),
            code,
            signal,
        });
        self.handles
            .remove_if(&instance_id, |_, handle| handle.generation == watch.generation);

        let _ = self.exits.send(ExitNotice {
            instance_id,
            pid: watch.pid,
            code,
            signal,
            requested,
            uptime,
        });
    }

    /// Ask an instance's process to exit. Does not wait for the exit.
    ///
    /// The first request for a process publishes `instanceStopped` before
    /// the signal goes out; escalations only log.
    pub fn stop(&self, instance_id: &str, force: bool) -> Result<()> {
        let signal = if force { StopSignal::Force } else { StopSignal::Graceful };
        let not_running = || SupervisorError::NotRunning(instance_id.to_string());

        let (pid, stop_tx, first_request) = {
            let handle = self.handles.get(instance_id).ok_or_else(not_running)?;
            let pid = handle.state.pid().ok_or_else(not_running)?;
            let first_request = !handle.stop_requested.swap(true, Ordering::SeqCst);
            (pid, handle.stop_tx.clone(), first_request)
        };

        let signal_name = if force { "SIGKILL" } else { "SIGTERM" };
        info!(instance_id, pid, signal = signal_name, "Stop requested");
        self.log_system(instance_id, format!("stop requested (pid {}, {})", pid, signal_name));
        if first_request {
            self.events.publish(Event::InstanceStopped {
                instance_id: instance_id.to_string(),
                pid: Some(pid),
            });
        }

        stop_tx.send(signal).map_err(|_| not_running())
    }

    /// Stop the instance if running, wait for it to exit, then start it
    /// again and publish `instanceRestarted`.
    ///
    /// If the graceful stop does not complete within the stop timeout the
    /// process is killed; if it is still alive after the kill grace period
    /// the restart fails with `StopTimeout` rather than spawning a second copy.
    pub async fn restart(self: &Arc<Self>, instance_id: &str, launch: &LaunchSpec) -> Result<u32> {
        if self.is_running(instance_id) {
            match self.stop(instance_id, false) {
                // Exited on its own in the meantime
                Ok(()) | Err(SupervisorError::NotRunning(_)) => {}
                Err(e) => return Err(e),
            }

            let stop_timeout = self.settings.stop_timeout();
            if !self.wait_for_exit(instance_id, stop_timeout).await {
                warn!(
                    instance_id,
                    timeout_ms = stop_timeout.as_millis() as u64,
                    "Instance did not stop in time, sending SIGKILL"
                );
                let _ = self.stop(instance_id, true);

                let kill_grace = self.settings.kill_grace();
                if !self.wait_for_exit(instance_id, kill_grace).await {
                    error!(instance_id, "Instance survived SIGKILL, not restarting");
                    return Err(SupervisorError::StopTimeout {
                        instance_id: instance_id.to_string(),
                        waited_ms: (stop_timeout + kill_grace).as_millis() as u64,
                    });
                }
            }
        }

        self.launch(instance_id, launch, true)
    }

    /// Poll until the instance has no live process. Returns false on timeout.
    pub async fn wait_for_exit(&self, instance_id: &str, timeout: Duration) -> bool {
        self.wait_until_exited(instance_id, Instant::now() + timeout).await
    }

    async fn wait_until_exited(&self, instance_id: &str, deadline: Instant) -> bool {
        let interval = self.settings.stop_poll_interval();
        while self.is_running(instance_id) {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(interval).await;
        }
        true
    }

    /// Stop every live process: SIGTERM, wait for the shutdown grace period,
    /// then SIGKILL whatever is left. Per-instance failures are only logged.
    pub async fn stop_all(&self) {
        let instance_ids: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        if instance_ids.is_empty() {
            return;
        }
        info!(count = instance_ids.len(), "Stopping all instances");

        for instance_id in &instance_ids {
            if let Err(e) = self.stop(instance_id, false) {
                warn!(instance_id = %instance_id, error = %e, "Failed to stop instance");
            }
        }

        let deadline = Instant::now() + self.settings.shutdown_grace();
        let mut stragglers = Vec::new();
        for instance_id in &instance_ids {
            if !self.wait_until_exited(instance_id, deadline).await {
                stragglers.push(instance_id);
            }
        }

        if stragglers.is_empty() {
            return;
        }
        for instance_id in &stragglers {
            warn!(instance_id = %instance_id, "Grace period exceeded, sending SIGKILL");
            if let Err(e) = self.stop(instance_id, true) {
                warn!(instance_id = %instance_id, error = %e, "Failed to kill instance");
            }
        }
        let deadline = Instant::now() + self.settings.kill_grace();
        for instance_id in stragglers {
            if !self.wait_until_exited(instance_id, deadline).await {
                error!(instance_id = %instance_id, "Instance still alive after SIGKILL");
            }
        }
    }
}

/// Append to a buffer and publish the matching log event under the buffer
/// lock, so buffer order and event order agree per instance.
fn record(buffer: &Mutex<LogBuffer>, events: &EventBus, instance_id: &str, entry: LogEntry) {
    if entry.message.is_empty() {
        return;
    }
    let mut buffer = buffer.lock();
    events.publish(Event::Log {
        instance_id: instance_id.to_string(),
        channel: entry.channel,
        message: entry.message.clone(),
        timestamp: entry.timestamp,
    });
    buffer.push(entry);
}

fn spawn_child(launch: &LaunchSpec) -> std::io::Result<Child> {
    let mut cmd = Command::new(&launch.binary_path);
    cmd.args(&launch.args);
    cmd.current_dir(&launch.working_dir);
    cmd.envs(&launch.env);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    // If the supervisor dies, take the child down with it
    #[cfg(target_os = "linux")]
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn()
}

fn deliver_signal(instance_id: &str, child: &mut Child, pid: u32, signal: StopSignal) {
    match signal {
        StopSignal::Graceful => {
            debug!(instance_id, pid, "Sending SIGTERM");

            // The watcher has not reaped the child yet, so the pid is still ours
            #[cfg(unix)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }

            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }
        }
        StopSignal::Force => {
            debug!(instance_id, pid, "Sending SIGKILL");
            if let Err(e) = child.start_kill() {
                warn!(instance_id, pid, error = %e, "Failed to kill process");
            }
        }
    }
}

fn exit_parts(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }

    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

fn describe_exit(pid: u32, code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("process {} exited with code {}", pid, code),
        (None, Some(signal)) => format!("process {} terminated by signal {}", pid, signal),
        (None, None) => format!("process {} exited", pid),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    struct Harness {
        supervisor: Arc<Supervisor>,
        registry: Arc<MemoryRegistry>,
        events: EventBus,
        exits: mpsc::UnboundedReceiver<ExitNotice>,
    }

    fn harness() -> Harness {
        let mut settings = SupervisorSettings::default();
        settings.stop_poll_interval_ms = 20;
        settings.stop_timeout_secs = 1;
        settings.kill_grace_ms = 2000;
        settings.shutdown_grace_secs = 2;
        harness_with(settings)
    }

    fn harness_with(settings: SupervisorSettings) -> Harness {
        let registry = Arc::new(MemoryRegistry::new());
        let events = EventBus::new(4096);
        let (supervisor, exits) = Supervisor::new(settings, registry.clone(), events.clone());
        Harness {
            supervisor,
            registry,
            events,
            exits,
        }
    }

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sh", std::env::temp_dir())
            .with_args(vec!["-c".to_string(), script.to_string()])
    }

    async fn next_exit(exits: &mut mpsc::UnboundedReceiver<ExitNotice>) -> ExitNotice {
        tokio::time::timeout(Duration::from_secs(10), exits.recv())
            .await
            .expect("exit notice in time")
            .expect("exit channel open")
    }

    fn messages(entries: &[LogEntry], channel: LogChannel) -> Vec<String> {
        entries
            .iter()
            .filter(|e| e.channel == channel)
            .map(|e| e.message.clone())
            .collect()
    }

    #[test]
    fn test_launch_spec_from_config() {
        let mut env = HashMap::new();
        env.insert("MODE".to_string(), "edge".to_string());
        let config = InstanceConfig::new("/opt/proxy", "/srv/a")
            .with_args(vec!["-v".to_string()])
            .with_env(env.clone());

        let spec = LaunchSpec::from(&config);
        assert_eq!(spec.binary_path, PathBuf::from("/opt/proxy"));
        assert_eq!(spec.args, vec!["-v"]);
        assert_eq!(spec.env, env);
    }

    #[test]
    fn test_describe_exit() {
        assert_eq!(describe_exit(7, Some(1), None), "process 7 exited with code 1");
        assert_eq!(describe_exit(7, None, Some(9)), "process 7 terminated by signal 9");
        assert_eq!(describe_exit(7, None, None), "process 7 exited");
    }

    #[tokio::test]
    async fn test_initial_state_is_stopped() {
        let h = harness();
        assert!(!h.supervisor.is_running("i1"));
        assert_eq!(h.supervisor.pid("i1"), None);
        assert!(h.supervisor.logs("i1", None).is_empty());
        assert!(h.supervisor.running().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut h = harness();
        h.registry.upsert("i1", InstanceConfig::new("/bin/sh", "/tmp"));

        let pid = h.supervisor.start("i1", &sh("exec sleep 30")).unwrap();
        assert!(h.supervisor.is_running("i1"));
        assert_eq!(h.supervisor.pid("i1"), Some(pid));
        assert!(h.supervisor.started_at("i1").is_some());
        assert_eq!(h.registry.get("i1").unwrap().pid, Some(pid));

        let logs = h.supervisor.logs("i1", None);
        assert_eq!(logs[0].channel, LogChannel::System);
        assert!(logs[0].message.contains(&pid.to_string()));

        h.supervisor.stop("i1", false).unwrap();
        let exit = next_exit(&mut h.exits).await;
        assert_eq!(exit.instance_id, "i1");
        assert_eq!(exit.pid, pid);
        assert!(exit.requested);
        assert_eq!(exit.code, None);
        assert_eq!(exit.signal, Some(libc::SIGTERM));

        assert!(!h.supervisor.is_running("i1"));
        assert_eq!(h.supervisor.pid("i1"), None);
        assert_eq!(h.registry.get("i1").unwrap().pid, None);
    }

    #[tokio::test]
    async fn test_force_stop_kills() {
        let mut h = harness();
        h.supervisor.start("i1", &sh("trap '' TERM; exec sleep 30")).unwrap();

        h.supervisor.stop("i1", true).unwrap();
        let exit = next_exit(&mut h.exits).await;
        assert_eq!(exit.signal, Some(libc::SIGKILL));
        assert!(exit.requested);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let mut h = harness();
        let pid = h.supervisor.start("i1", &sh("exec sleep 30")).unwrap();

        let err = h.supervisor.start("i1", &sh("exec sleep 30")).unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(ref id) if id == "i1"));
        assert_eq!(h.supervisor.pid("i1"), Some(pid));

        h.supervisor.stop("i1", true).unwrap();
        next_exit(&mut h.exits).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_spawn_exactly_once() {
        let mut h = harness();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let supervisor = Arc::clone(&h.supervisor);
                tokio::spawn(async move { supervisor.start("i1", &sh("exec sleep 30")) })
            })
            .collect();

        let mut started = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => started += 1,
                Err(SupervisorError::AlreadyRunning(_)) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(started, 1);
        assert_eq!(rejected, 15);

        h.supervisor.stop("i1", true).unwrap();
        next_exit(&mut h.exits).await;
    }

    #[tokio::test]
    async fn test_stop_without_process_is_not_running() {
        let h = harness();
        for _ in 0..3 {
            let err = h.supervisor.stop("missing-id", false).unwrap_err();
            assert!(matches!(err, SupervisorError::NotRunning(ref id) if id == "missing-id"));
        }
        assert!(h.supervisor.logs("missing-id", None).is_empty());
    }

    #[tokio::test]
    async fn test_spawn_error_leaves_no_handle() {
        let h = harness();
        let mut observer = h.events.subscribe();
        let launch = LaunchSpec::new("/nonexistent/proxy-binary", std::env::temp_dir());

        let err = h.supervisor.start("i1", &launch).unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnError { .. }));
        assert!(!h.supervisor.is_running("i1"));
        assert!(h.supervisor.running().is_empty());

        let logs = h.supervisor.logs("i1", None);
        assert_eq!(logs.len(), 1);
        assert!(logs[0].message.starts_with("failed to start"));

        let mut saw_error = false;
        while let Some(event) = observer.try_recv() {
            if let Event::ProcessError { instance_id, .. } = &*event {
                assert_eq!(instance_id, "i1");
                saw_error = true;
            }
        }
        assert!(saw_error);

        // A later start with a valid binary still works
        h.supervisor.start("i1", &sh("exit 0")).unwrap();
    }

    #[tokio::test]
    async fn test_exit_code_and_output_are_captured() {
        let mut h = harness();
        let mut observer = h.events.subscribe();

        h.supervisor
            .start("i1", &sh("echo hello; echo oops 1>&2; exit 3"))
            .unwrap();
        let exit = next_exit(&mut h.exits).await;
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.signal, None);
        assert!(!exit.requested);

        let logs = h.supervisor.logs("i1", None);
        assert_eq!(messages(&logs, LogChannel::Stdout), vec!["hello"]);
        assert_eq!(messages(&logs, LogChannel::Stderr), vec!["oops"]);
        let last = logs.last().unwrap();
        assert_eq!(last.channel, LogChannel::System);
        assert!(last.message.ends_with("exited with code 3"));

        let mut exits = Vec::new();
        while let Some(event) = observer.try_recv() {
            if let Event::ProcessExit { code, signal, .. } = &*event {
                exits.push((*code, *signal));
            }
        }
        assert_eq!(exits, vec![(Some(3), None)]);
    }

    #[tokio::test]
    async fn test_log_events_match_buffer_order() {
        let mut h = harness();
        let mut observer = h.events.subscribe();

        h.supervisor
            .start("i1", &sh("for i in 1 2 3 4 5; do echo line$i; done"))
            .unwrap();
        next_exit(&mut h.exits).await;

        let mut streamed = Vec::new();
        while let Some(event) = observer.try_recv() {
            if let Event::Log { message, .. } = &*event {
                streamed.push(message.clone());
            }
        }
        let buffered: Vec<String> = h
            .supervisor
            .logs("i1", None)
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(streamed, buffered);
    }

    #[tokio::test]
    async fn test_logs_survive_restart_and_forget_drops_them() {
        let mut h = harness();
        h.supervisor.start("i1", &sh("echo first")).unwrap();
        next_exit(&mut h.exits).await;
        h.supervisor.start("i1", &sh("echo second")).unwrap();
        next_exit(&mut h.exits).await;

        let stdout = messages(&h.supervisor.logs("i1", None), LogChannel::Stdout);
        assert_eq!(stdout, vec!["first", "second"]);
        assert_eq!(h.supervisor.logs("i1", Some(1)).len(), 1);

        assert!(h.supervisor.forget("i1"));
        assert!(h.supervisor.logs("i1", None).is_empty());
        assert!(!h.supervisor.forget("i1"));
    }

    #[tokio::test]
    async fn test_restart_running_instance() {
        let mut h = harness();
        let first = h.supervisor.start("i1", &sh("exec sleep 30")).unwrap();

        let second = h.supervisor.restart("i1", &sh("exec sleep 30")).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(h.supervisor.pid("i1"), Some(second));

        let exit = next_exit(&mut h.exits).await;
        assert_eq!(exit.pid, first);
        assert!(exit.requested);

        h.supervisor.stop("i1", true).unwrap();
        next_exit(&mut h.exits).await;
    }

    #[tokio::test]
    async fn test_restart_stopped_instance_just_starts() {
        let mut h = harness();
        let pid = h.supervisor.restart("i1", &sh("exec sleep 30")).await.unwrap();
        assert_eq!(h.supervisor.pid("i1"), Some(pid));

        h.supervisor.stop("i1", true).unwrap();
        next_exit(&mut h.exits).await;
    }

    #[tokio::test]
    async fn test_restart_escalates_when_term_is_ignored() {
        let mut h = harness();
        let first = h
            .supervisor
            .start("i1", &sh("trap '' TERM; exec sleep 30"))
            .unwrap();

        let second = h.supervisor.restart("i1", &sh("exec sleep 30")).await.unwrap();
        assert_ne!(first, second);

        let exit = next_exit(&mut h.exits).await;
        assert_eq!(exit.pid, first);
        assert_eq!(exit.signal, Some(libc::SIGKILL));

        h.supervisor.stop("i1", true).unwrap();
        next_exit(&mut h.exits).await;
    }

    /// Lifecycle events of one instance, in the order an observer saw them
    fn lifecycle(events: &[Arc<Event>], instance: &str) -> Vec<&'static str> {
        events
            .iter()
            .filter(|e| e.instance_id() == Some(instance))
            .filter_map(|e| match **e {
                Event::InstanceStarted { .. } => Some("started"),
                Event::InstanceStopped { .. } => Some("stopped"),
                Event::InstanceRestarted { .. } => Some("restarted"),
                Event::ProcessExit { .. } => Some("exit"),
                _ => None,
            })
            .collect()
    }

    fn drain(observer: &mut crate::events::Observer) -> Vec<Arc<Event>> {
        std::iter::from_fn(|| observer.try_recv()).collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_started_precedes_exit_for_instant_crashes() {
        let mut h = harness();
        let mut observer = h.events.subscribe();
        let ids: Vec<String> = (0..40).map(|i| format!("i{}", i)).collect();

        for _ in 0..2 {
            for id in &ids {
                h.supervisor.start(id, &sh("exit 1")).unwrap();
            }
            for _ in &ids {
                next_exit(&mut h.exits).await;
            }
        }

        let events = drain(&mut observer);
        for id in &ids {
            assert_eq!(
                lifecycle(&events, id),
                vec!["started", "exit", "started", "exit"],
                "instance {}",
                id
            );
        }
    }

    #[tokio::test]
    async fn test_stop_announces_once_before_exit() {
        let mut h = harness();
        h.supervisor.start("i1", &sh("trap '' TERM; exec sleep 30")).unwrap();
        let mut observer = h.events.subscribe();

        h.supervisor.stop("i1", false).unwrap();
        h.supervisor.stop("i1", true).unwrap();
        next_exit(&mut h.exits).await;

        let events = drain(&mut observer);
        assert_eq!(lifecycle(&events, "i1"), vec!["stopped", "exit"]);
    }

    #[tokio::test]
    async fn test_restart_announces_stop_exit_then_restart() {
        let mut h = harness();
        h.supervisor.start("i1", &sh("exec sleep 30")).unwrap();
        let mut observer = h.events.subscribe();

        let pid = h.supervisor.restart("i1", &sh("exec sleep 30")).await.unwrap();
        next_exit(&mut h.exits).await;

        let events = drain(&mut observer);
        assert_eq!(lifecycle(&events, "i1"), vec!["stopped", "exit", "restarted"]);
        assert!(events.iter().any(|e| matches!(
            **e,
            Event::InstanceRestarted { pid: Some(p), .. } if p == pid
        )));

        h.supervisor.stop("i1", true).unwrap();
        next_exit(&mut h.exits).await;
    }

    #[tokio::test]
    async fn test_inherited_pipe_does_not_hold_exit() {
        let mut h = harness();
        let started = Instant::now();
        h.supervisor
            .start("i1", &sh("(sleep 1; echo late) & echo early; exit 1"))
            .unwrap();

        let exit = next_exit(&mut h.exits).await;
        assert_eq!(exit.code, Some(1));
        assert!(
            started.elapsed() < Duration::from_millis(900),
            "exit took {:?}",
            started.elapsed()
        );
        assert!(!h.supervisor.is_running("i1"));
        assert_eq!(h.supervisor.pid("i1"), None);

        // The detached grandchild's output never lands after the exit record
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let logs = h.supervisor.logs("i1", None);
        assert_eq!(messages(&logs, LogChannel::Stdout), vec!["early"]);
        assert!(logs.last().unwrap().message.ends_with("exited with code 1"));
    }

    #[tokio::test]
    async fn test_crash_in_one_instance_does_not_touch_another() {
        let mut h = harness();
        h.supervisor.start("b", &sh("echo b-ready; exec sleep 30")).unwrap();
        h.supervisor.start("a", &sh("echo a-crash; exit 1")).unwrap();

        let exit = next_exit(&mut h.exits).await;
        assert_eq!(exit.instance_id, "a");

        assert!(h.supervisor.is_running("b"));
        assert!(!h.supervisor.is_running("a"));
        // b's first line may still be in flight
        assert!(h.supervisor.wait_for_exit("a", Duration::from_millis(10)).await);
        assert!(!h.supervisor.logs("b", None).is_empty());

        h.supervisor.stop("b", true).unwrap();
        next_exit(&mut h.exits).await;
    }

    #[tokio::test]
    async fn test_stop_all() {
        let h = harness();
        h.supervisor.start("a", &sh("exec sleep 30")).unwrap();
        h.supervisor.start("b", &sh("exec sleep 30")).unwrap();
        h.supervisor.start("c", &sh("trap '' TERM; exec sleep 30")).unwrap();
        assert_eq!(h.supervisor.running().len(), 3);

        h.supervisor.stop_all().await;

        assert!(h.supervisor.running().is_empty());
        assert!(!h.supervisor.is_running("a"));
        assert!(!h.supervisor.is_running("c"));
    }

    #[tokio::test]
    async fn test_working_dir_and_env_are_applied() {
        let mut h = harness();
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("PROXY_MODE".to_string(), "edge".to_string());
        let launch = LaunchSpec::new("/bin/sh", dir.path())
            .with_args(vec!["-c".to_string(), "pwd; echo $PROXY_MODE".to_string()])
            .with_env(env);

        h.supervisor.start("i1", &launch).unwrap();
        next_exit(&mut h.exits).await;

        let stdout = messages(&h.supervisor.logs("i1", None), LogChannel::Stdout);
        let expected_dir = dir.path().canonicalize().unwrap();
        assert_eq!(PathBuf::from(&stdout[0]).canonicalize().unwrap(), expected_dir);
        assert_eq!(stdout[1], "edge");
    }
}
