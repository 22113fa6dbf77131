//! Local server process management: find the binary, launch it detached,
//! and confirm it came up.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;

use crate::error::WardenError;
use crate::health::TAGS_PATH;
use crate::transport::{RequestOptions, Transport};

/// Timeout for each verification probe.
pub const VERIFY_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Destination for the server's output, one line at a time (no trailing newline).
pub trait ServerLogSink: Send + Sync {
    fn append(&self, stream: LogStream, line: String);
}

/// Forwards server output to `tracing` under its own target.
pub struct TracingLogSink;

impl ServerLogSink for TracingLogSink {
    fn append(&self, stream: LogStream, line: String) {
        tracing::debug!(target: "warden::server_log", stream = stream.as_str(), "{line}");
    }
}

/// Finds the server executable.
pub trait BinaryLocator: Send + Sync {
    fn locate(&self) -> Option<PathBuf>;
}

/// Platform search: a fixed install path on Windows, `PATH` plus well-known
/// install directories elsewhere.
pub struct SystemLocator {
    binary: String,
}

impl SystemLocator {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn candidates(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();

        #[cfg(windows)]
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            dirs.push(PathBuf::from(local).join("Programs").join("Ollama"));
        }

        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }

        #[cfg(unix)]
        {
            for d in [
                "/usr/local/bin",
                "/usr/bin",
                "/opt/homebrew/bin",
                "/Applications/Ollama.app/Contents/Resources",
            ] {
                dirs.push(PathBuf::from(d));
            }
            if let Some(home) = std::env::var_os("HOME") {
                dirs.push(PathBuf::from(home).join(".local").join("bin"));
            }
        }

        let file_name = if cfg!(windows) && !self.binary.ends_with(".exe") {
            format!("{}.exe", self.binary)
        } else {
            self.binary.clone()
        };
        dirs.into_iter().map(|d| d.join(&file_name)).collect()
    }
}

impl BinaryLocator for SystemLocator {
    fn locate(&self) -> Option<PathBuf> {
        let direct = Path::new(&self.binary);
        if direct.is_absolute() {
            return is_executable(direct).then(|| direct.to_path_buf());
        }
        self.candidates().into_iter().find(|p| is_executable(p))
    }
}

/// Always answers with the same result. Useful when the binary location is
/// already known (or known to be absent).
pub struct StaticLocator(pub Option<PathBuf>);

impl BinaryLocator for StaticLocator {
    fn locate(&self) -> Option<PathBuf> {
        self.0.clone()
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// A launched server process. The supervisor never awaits its exit.
pub trait ManagedProcess: Send {
    fn pid(&self) -> Option<u32>;
    fn is_alive(&mut self) -> bool;
    fn terminate(&mut self) -> Result<(), WardenError>;
}

/// Starts the server process.
pub trait ProcessLauncher: Send + Sync {
    fn launch(
        &self,
        binary: &Path,
        sink: Arc<dyn ServerLogSink>,
    ) -> Result<Box<dyn ManagedProcess>, WardenError>;
}

/// Spawns `<binary> serve` in its own process group with piped output.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    fn launch(
        &self,
        binary: &Path,
        sink: Arc<dyn ServerLogSink>,
    ) -> Result<Box<dyn ManagedProcess>, WardenError> {
        let mut cmd = tokio::process::Command::new(binary);
        cmd.arg("serve")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The server must outlive us: no kill_on_drop.
            .kill_on_drop(false);

        // Own process group: terminal signals aimed at us don't reach it, and
        // terminate() can signal the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(windows)]
        {
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let mut child = cmd.spawn().map_err(|e| {
            WardenError::ProcessSpawnFailed(format!("{}: {e}", binary.display()))
        })?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.append(LogStream::Stdout, line);
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sink.append(LogStream::Stderr, line);
                }
            });
        }

        tracing::info!(binary = %binary.display(), pid = ?pid, "server process spawned");
        Ok(Box::new(ServerProcess { child, pid }))
    }
}

/// OS process handle for a server we spawned.
pub struct ServerProcess {
    child: tokio::process::Child,
    pid: Option<u32>,
}

impl ManagedProcess for ServerProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self) -> Result<(), WardenError> {
        if !self.is_alive() {
            return Ok(());
        }
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            // Signal the group (pgid == pid because of process_group(0)).
            let rc = unsafe { libc::kill(-(pid as i32), libc::SIGTERM) };
            if rc == 0 {
                return Ok(());
            }
            tracing::warn!(pid, "SIGTERM to server process group failed, killing leader");
        }
        self.child
            .start_kill()
            .map_err(|e| WardenError::UnexpectedFailure(format!("failed to kill server: {e}")))
    }
}

/// Waits between verification probes after a spawn.
#[derive(Debug, Clone)]
pub struct VerifySchedule {
    pub waits: Vec<Duration>,
}

impl Default for VerifySchedule {
    fn default() -> Self {
        Self {
            waits: [2, 3, 4, 5, 6].into_iter().map(Duration::from_secs).collect(),
        }
    }
}

/// Result of [`ProcessSupervisor::ensure_process_running`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Server already answered; nothing was spawned.
    AlreadyRunning,
    /// Spawned (or reused our live process) and verified on the given attempt.
    Started { pid: Option<u32>, attempt: usize },
    /// Process is running but never answered within the schedule. It is
    /// left running since it may still be loading.
    Unverified { pid: Option<u32>, detail: String },
}

impl StartOutcome {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::AlreadyRunning | Self::Started { .. })
    }
}

pub struct ProcessSupervisor {
    transport: Transport,
    locator: Box<dyn BinaryLocator>,
    launcher: Box<dyn ProcessLauncher>,
    sink: Arc<dyn ServerLogSink>,
    schedule: VerifySchedule,
    /// Held for the whole spawn+verify sequence. This is the in-flight guard:
    /// a second caller waits here, then sees the server up instead of spawning.
    process: Mutex<Option<Box<dyn ManagedProcess>>>,
}

impl ProcessSupervisor {
    pub fn new(transport: Transport, binary: impl Into<String>) -> Self {
        Self {
            transport,
            locator: Box::new(SystemLocator::new(binary)),
            launcher: Box::new(OsLauncher),
            sink: Arc::new(TracingLogSink),
            schedule: VerifySchedule::default(),
            process: Mutex::new(None),
        }
    }

    pub fn with_locator(mut self, locator: impl BinaryLocator + 'static) -> Self {
        self.locator = Box::new(locator);
        self
    }

    pub fn with_launcher(mut self, launcher: impl ProcessLauncher + 'static) -> Self {
        self.launcher = Box::new(launcher);
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn ServerLogSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_schedule(mut self, schedule: VerifySchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn locate_binary(&self) -> Option<PathBuf> {
        self.locator.locate()
    }

    /// True while a spawn/verify sequence is running.
    pub fn is_starting(&self) -> bool {
        self.process.try_lock().is_err()
    }

    /// Make sure a server is answering, spawning one if needed.
    ///
    /// Concurrent calls are serialized: only the first spawns, later callers
    /// find the server up (or our process still alive) and do not spawn again.
    pub async fn ensure_process_running(&self) -> Result<StartOutcome, WardenError> {
        let mut slot = self.process.lock().await;

        if self.probe_once(Duration::from_secs(2)).await {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let live_pid = match slot.as_mut() {
            Some(p) => p.is_alive().then(|| p.pid()),
            None => None,
        };

        let pid = match live_pid {
            Some(pid) => {
                tracing::info!(pid = ?pid, "server process already spawned, re-verifying");
                pid
            }
            None => {
                let binary = self.locator.locate().ok_or(WardenError::NotInstalled)?;
                let process = self.launcher.launch(&binary, self.sink.clone())?;
                let pid = process.pid();
                *slot = Some(process);
                pid
            }
        };

        for (i, wait) in self.schedule.waits.iter().enumerate() {
            tokio::time::sleep(*wait).await;
            let attempt = i + 1;
            if self.probe_once(VERIFY_PROBE_TIMEOUT).await {
                tracing::info!(pid = ?pid, attempt, "server verified");
                return Ok(StartOutcome::Started { pid, attempt });
            }
            if let Some(process) = slot.as_mut()
                && !process.is_alive()
            {
                *slot = None;
                tracing::warn!(pid = ?pid, attempt, "server process exited during startup");
                return Err(WardenError::ProcessSpawnFailed(
                    "server process exited during startup".to_string(),
                ));
            }
            tracing::debug!(pid = ?pid, attempt, "server not ready yet");
        }

        let detail = format!(
            "server did not answer after {} checks",
            self.schedule.waits.len()
        );
        tracing::warn!(pid = ?pid, "{detail}");
        Ok(StartOutcome::Unverified { pid, detail })
    }

    /// Terminate a server this supervisor spawned. Returns false if there is none.
    pub async fn stop(&self) -> Result<bool, WardenError> {
        let mut slot = self.process.lock().await;
        match slot.take() {
            Some(mut process) => {
                tracing::info!(pid = ?process.pid(), "stopping server process");
                process.terminate()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// PID of a live process we spawned. `None` while a start is in flight,
    /// see [`is_starting`](Self::is_starting); never waits on it.
    pub fn spawned_pid(&self) -> Option<u32> {
        let mut slot = self.process.try_lock().ok()?;
        let process = slot.as_mut()?;
        if process.is_alive() { process.pid() } else { None }
    }

    async fn probe_once(&self, timeout: Duration) -> bool {
        let opts = RequestOptions::with_timeout(timeout);
        match self.transport.get(TAGS_PATH, &opts).await {
            Ok(resp) => resp.status == 200,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_grows() {
        let s = VerifySchedule::default();
        let secs: Vec<u64> = s.waits.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![2, 3, 4, 5, 6]);
    }

    #[cfg(unix)]
    #[test]
    fn system_locator_finds_absolute_executable() {
        let loc = SystemLocator::new("/bin/sh");
        assert_eq!(loc.locate(), Some(PathBuf::from("/bin/sh")));
        let missing = SystemLocator::new("/nonexistent/warden-test-binary");
        assert_eq!(missing.locate(), None);
    }

    #[test]
    fn system_locator_misses_unknown_name() {
        let loc = SystemLocator::new("warden-definitely-not-installed-xyz");
        assert_eq!(loc.locate(), None);
    }
}
