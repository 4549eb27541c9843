//! Process-isolated execution of inputs.
//!
//! The [`Supervisor`] owns one loopback listener for its whole life and at most
//! one worker process at a time. A worker that hangs or dies is discarded and
//! the next [`Supervisor::analyze`] call launches a fresh one on the same port.

use crate::channel::{ChannelError, Connection, ExecutionReport, Request, WorkerHello};
use crate::input::InputFile;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::mem;
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to bind the control listener: {0}")]
    Bind(#[source] std::io::Error),
    #[error("Failed to spawn worker {executable:?}: {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Worker could not load target '{target}': {reason}")]
    TargetUnavailable { target: String, reason: String },
    #[error("{attempts} worker launches failed in a row; last failure: {reason}")]
    WorkerUnstable { attempts: u32, reason: String },
    #[error("Supervisor is closed")]
    Closed,
}

/// How a single input fared. Only [`AnalysisOutcome::Completed`] carries data
/// for the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Completed(ExecutionReport),
    /// The deadline passed; the worker was terminated.
    TimedOut,
    /// The worker crashed, disconnected or never came up for this input.
    WorkerLost(String),
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub executable: PathBuf,
    pub target: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Per-input deadline. `None` waits forever.
    pub timeout: Option<Duration>,
    pub launch_timeout: Duration,
    pub shutdown_grace: Duration,
    pub restart_grace: Duration,
    pub max_consecutive_launch_failures: u32,
}

impl SupervisorSettings {
    pub fn new(executable: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            target: target.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            timeout: Some(Duration::from_secs(10)),
            launch_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            restart_grace: Duration::from_millis(500),
            max_consecutive_launch_failures: 3,
        }
    }
}

enum WorkerState {
    NotConnected,
    Connected { child: Child, conn: Connection },
}

enum LaunchFailure {
    Fatal(SupervisorError),
    Transient(String),
}

pub struct Supervisor {
    settings: SupervisorSettings,
    listener: Option<TcpListener>,
    port: u16,
    state: WorkerState,
    launches: usize,
    consecutive_launch_failures: u32,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Result<Self, SupervisorError> {
        let listener =
            TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(SupervisorError::Bind)?;
        listener.set_nonblocking(true).map_err(SupervisorError::Bind)?;
        let port = listener.local_addr().map_err(SupervisorError::Bind)?.port();
        tracing::debug!("Control listener bound on port {}", port);
        Ok(Self {
            settings,
            listener: Some(listener),
            port,
            state: WorkerState::NotConnected,
            launches: 0,
            consecutive_launch_failures: 0,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Number of worker processes started so far.
    pub fn launches(&self) -> usize {
        self.launches
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, WorkerState::Connected { .. })
    }

    /// Runs one input in the worker, launching it first if needed.
    ///
    /// Hangs and crashes are reported as outcomes. `Err` is reserved for
    /// conditions that make further analysis pointless.
    pub fn analyze(&mut self, input: &InputFile) -> Result<AnalysisOutcome, SupervisorError> {
        if self.listener.is_none() {
            return Err(SupervisorError::Closed);
        }
        if !self.is_connected() {
            match self.launch() {
                Ok(()) => self.consecutive_launch_failures = 0,
                Err(LaunchFailure::Fatal(e)) => return Err(e),
                Err(LaunchFailure::Transient(reason)) => {
                    self.consecutive_launch_failures += 1;
                    tracing::warn!(
                        "Worker launch failed ({}/{}): {}",
                        self.consecutive_launch_failures,
                        self.settings.max_consecutive_launch_failures,
                        reason
                    );
                    if self.consecutive_launch_failures
                        >= self.settings.max_consecutive_launch_failures
                    {
                        return Err(SupervisorError::WorkerUnstable {
                            attempts: self.consecutive_launch_failures,
                            reason,
                        });
                    }
                    return Ok(AnalysisOutcome::WorkerLost(reason));
                }
            }
        }

        let deadline = self.settings.timeout.map(|t| Instant::now() + t);
        let result = match &mut self.state {
            WorkerState::Connected { conn, .. } => {
                tracing::debug!("Sending {:?} to worker", input.path);
                conn.send(&Request::Input(input.path.clone()))
                    .and_then(|()| conn.receive_until::<ExecutionReport>(deadline))
            }
            WorkerState::NotConnected => Err(ChannelError::Closed),
        };

        match result {
            Ok(report) => Ok(AnalysisOutcome::Completed(report)),
            Err(ChannelError::Timeout) => {
                tracing::warn!("Input {:?} timed out; restarting worker", input.path);
                self.discard(self.settings.restart_grace);
                Ok(AnalysisOutcome::TimedOut)
            }
            Err(e) => {
                tracing::warn!("Worker lost while analyzing {:?}: {}", input.path, e);
                self.discard(self.settings.restart_grace);
                Ok(AnalysisOutcome::WorkerLost(e.to_string()))
            }
        }
    }

    /// Asks the worker to stop, waits up to the shutdown grace period, then
    /// releases the listener. Further `analyze` calls fail.
    pub fn close(&mut self) {
        if let WorkerState::Connected { conn, .. } = &mut self.state {
            if let Err(e) = conn.send(&Request::Shutdown) {
                tracing::debug!("Shutdown request not delivered: {}", e);
            }
        }
        self.discard(self.settings.shutdown_grace);
        self.listener = None;
    }

    fn launch(&mut self) -> Result<(), LaunchFailure> {
        let settings = &self.settings;
        let mut cmd = Command::new(&settings.executable);
        cmd.arg(self.port.to_string())
            .arg(&settings.target)
            .args(&settings.args)
            .envs(&settings.env)
            .env("RUST_LIB_BACKTRACE", "1")
            .stdin(Stdio::null());
        if let Some(dir) = &settings.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| {
            LaunchFailure::Fatal(SupervisorError::Spawn {
                executable: settings.executable.clone(),
                source,
            })
        })?;
        self.launches += 1;
        tracing::debug!("Launched worker pid {} (launch #{})", child.id(), self.launches);

        let stream = match self.accept_worker(&mut child) {
            Ok(stream) => stream,
            Err(reason) => {
                terminate(child, None, self.settings.restart_grace);
                return Err(LaunchFailure::Transient(reason));
            }
        };
        let hello_deadline = Instant::now() + self.settings.launch_timeout;
        let handshake = Connection::new(stream).and_then(|mut conn| {
            let hello: WorkerHello = conn.receive_until(Some(hello_deadline))?;
            Ok((conn, hello))
        });
        let (conn, hello) = match handshake {
            Ok(pair) => pair,
            Err(e) => {
                terminate(child, None, self.settings.restart_grace);
                return Err(LaunchFailure::Transient(format!("handshake failed: {e}")));
            }
        };

        if let Err(reason) = hello.status {
            terminate(child, Some(conn), self.settings.restart_grace);
            return Err(LaunchFailure::Fatal(SupervisorError::TargetUnavailable {
                target: hello.target,
                reason,
            }));
        }
        tracing::info!("Worker for '{}' connected", hello.target);
        self.state = WorkerState::Connected { child, conn };
        Ok(())
    }

    /// Polls for the worker's callback while watching for it to exit early.
    fn accept_worker(&self, child: &mut Child) -> Result<TcpStream, String> {
        let listener = self.listener.as_ref().ok_or("listener closed")?;
        let start = Instant::now();
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream
                        .set_nonblocking(false)
                        .map_err(|e| format!("failed to configure worker socket: {e}"))?;
                    return Ok(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(format!("accept failed: {e}")),
            }
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(format!("worker exited before connecting ({status})"));
                }
                Ok(None) => {
                    if start.elapsed() > self.settings.launch_timeout {
                        return Err(format!(
                            "worker did not connect within {:?}",
                            self.settings.launch_timeout
                        ));
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(format!("error waiting for worker: {e}")),
            }
        }
    }

    fn discard(&mut self, grace: Duration) {
        if let WorkerState::Connected { child, conn } =
            mem::replace(&mut self.state, WorkerState::NotConnected)
        {
            terminate(child, Some(conn), grace);
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.discard(self.settings.restart_grace);
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("target", &self.settings.target)
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .field("launches", &self.launches)
            .finish()
    }
}

/// Closing the connection is the cooperative stop request. A worker still
/// running after `grace` is killed, then reaped.
fn terminate(mut child: Child, conn: Option<Connection>, grace: Duration) {
    if let Some(conn) = conn {
        conn.close();
    }
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!("Worker pid {} exited with {}", child.id(), status);
                return;
            }
            Ok(None) if start.elapsed() < grace => thread::sleep(POLL_INTERVAL),
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Error waiting for worker pid {}: {}", child.id(), e);
                break;
            }
        }
    }
    tracing::debug!("Killing worker pid {}", child.id());
    if let Err(e) = child.kill() {
        tracing::warn!("Failed to kill worker pid {}: {}", child.id(), e);
    }
    if let Err(e) = child.wait() {
        tracing::warn!("Failed to reap worker pid {}: {}", child.id(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn input() -> InputFile {
        InputFile::new("/nonexistent/input", 0)
    }

    #[test]
    fn missing_executable_is_fatal() {
        let settings = SupervisorSettings::new("/nonexistent/forkline-worker", "demo");
        let mut supervisor = Supervisor::new(settings).unwrap();
        assert_ne!(supervisor.port(), 0);
        match supervisor.analyze(&input()) {
            Err(SupervisorError::Spawn { executable, .. }) => {
                assert_eq!(executable, PathBuf::from("/nonexistent/forkline-worker"));
            }
            other => panic!("Expected Spawn error, got {other:?}"),
        }
        assert_eq!(supervisor.launches(), 0);
    }

    #[test]
    fn workers_that_never_connect_eventually_become_fatal() {
        if !Path::new("/bin/false").is_file() {
            return;
        }
        let mut settings = SupervisorSettings::new("/bin/false", "demo");
        settings.launch_timeout = Duration::from_secs(5);
        let mut supervisor = Supervisor::new(settings).unwrap();

        for _ in 0..2 {
            match supervisor.analyze(&input()) {
                Ok(AnalysisOutcome::WorkerLost(reason)) => {
                    assert!(reason.contains("exited before connecting"), "{reason}");
                }
                other => panic!("Expected WorkerLost, got {other:?}"),
            }
        }
        match supervisor.analyze(&input()) {
            Err(SupervisorError::WorkerUnstable { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("Expected WorkerUnstable, got {other:?}"),
        }
        assert_eq!(supervisor.launches(), 3);
    }

    #[test]
    fn closed_supervisor_rejects_work() {
        let settings = SupervisorSettings::new("/nonexistent/forkline-worker", "demo");
        let mut supervisor = Supervisor::new(settings).unwrap();
        supervisor.close();
        supervisor.close();
        assert!(matches!(
            supervisor.analyze(&input()),
            Err(SupervisorError::Closed)
        ));
    }
}
