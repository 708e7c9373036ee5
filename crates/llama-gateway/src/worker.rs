//! One llama-server child process.
//!
//! A worker is spawned with stdout and stderr piped into a single reader task
//! that scans for the server's startup line, extracts the dynamically
//! assigned port, and keeps the last lines of output in a bounded ring for
//! failure diagnostics. Readiness and exit are surfaced as channels the
//! supervisor arms a wait on.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::config::{ModelSpec, RuntimeSpec};

pub const OUTPUT_RING_CAPACITY: usize = 200;

const STOP_GRACE: Duration = Duration::from_secs(15);
const KILL_GRACE: Duration = Duration::from_secs(5);
/// An exit this soon after a stop request counts as a clean shutdown even if
/// the exit status says otherwise.
const SOFT_EXIT_WINDOW: Duration = Duration::from_secs(10);

lazy_static! {
    // llama.cpp: "main: server is listening on http://127.0.0.1:8080 - starting the main loop"
    static ref PORT_URL_RE: Regex = Regex::new(r"http://127\.0\.0\.1:(\d+)").unwrap();
    // ik.llama: `... HTTP server listening ... port="8080" ...`
    static ref PORT_ATTR_RE: Regex = Regex::new(r#"port="(\d+)""#).unwrap();
}

/// Extracts the listening port from a startup line, if it is one.
pub(crate) fn parse_startup_port(line: &str) -> Option<u16> {
    if line.contains("main: server is listening on") {
        PORT_URL_RE
            .captures(line)
            .and_then(|caps| caps[1].parse().ok())
    } else if line.contains("HTTP server listening") {
        PORT_ATTR_RE
            .captures(line)
            .and_then(|caps| caps[1].parse().ok())
    } else {
        None
    }
}

/// Builds the llama-server argv for a model. Pure: the same spec always
/// yields the same argv (parameter maps iterate in sorted key order).
pub fn build_args(spec: &ModelSpec) -> Vec<String> {
    let port = spec
        .parameters
        .get("port")
        .map(flag_value)
        .unwrap_or_else(|| "0".to_string());

    let mut args = vec![
        "--model".to_string(),
        spec.model_path.display().to_string(),
        "--alias".to_string(),
        spec.name.clone(),
        "--host".to_string(),
        "127.0.0.1".to_string(),
        "--port".to_string(),
        port,
    ];

    for (key, value) in &spec.parameters {
        if key == "port" {
            continue;
        }
        let flag = format!("--{}", key.replace('_', "-"));
        match value {
            Value::Bool(true) => args.push(flag),
            Value::Bool(false) => {}
            other => {
                args.push(flag);
                args.push(flag_value(other));
            }
        }
    }
    args
}

fn flag_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Bounded ring of the most recent output lines.
#[derive(Debug)]
pub struct OutputRing {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().expect("output ring poisoned");
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("output ring poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// True for expected shutdowns: zero exit, SIGTERM, or any exit shortly
    /// after a stop request.
    pub clean: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to start worker for '{model}': {message}")]
pub struct SpawnError {
    pub model: String,
    pub message: String,
}

#[derive(Debug)]
pub struct WorkerSignals {
    /// Fires once with the parsed port.
    pub ready: oneshot::Receiver<u16>,
    /// Becomes `Some` when the process has terminated and its output drained.
    pub exit: watch::Receiver<Option<WorkerExit>>,
}

#[derive(Debug)]
pub struct Worker {
    model_name: String,
    pid: u32,
    ring: Arc<OutputRing>,
    port: Arc<OnceLock<u16>>,
    stop_requested: Arc<AtomicBool>,
    stop_at: Arc<Mutex<Option<Instant>>>,
    exit_rx: watch::Receiver<Option<WorkerExit>>,
}

impl Worker {
    /// Spawns the worker process and its reader/wait tasks.
    pub fn spawn(spec: &ModelSpec, runtime: &RuntimeSpec) -> Result<(Self, WorkerSignals), SpawnError> {
        let args = build_args(spec);
        debug!(
            "starting worker for '{}': {} {}",
            spec.name,
            runtime.command,
            args.join(" ")
        );

        let mut child = Command::new(&runtime.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SpawnError {
                model: spec.name.clone(),
                message: format!("could not execute '{}': {}", runtime.command, err),
            })?;

        let pid = child.id().ok_or_else(|| SpawnError {
            model: spec.name.clone(),
            message: "process exited before it could be observed".to_string(),
        })?;

        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");

        let ring = Arc::new(OutputRing::new(OUTPUT_RING_CAPACITY));
        let port = Arc::new(OnceLock::new());
        let stop_requested = Arc::new(AtomicBool::new(false));
        let stop_at = Arc::new(Mutex::new(None));

        let (ready_tx, ready_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        // Single reader over both pipes; every line lands in the ring, the
        // first startup match fires the ready signal.
        let reader = {
            let ring = ring.clone();
            let port = port.clone();
            let model_name = spec.name.clone();
            let stdout_lines = LinesStream::new(BufReader::new(stdout).lines());
            let stderr_lines = LinesStream::new(BufReader::new(stderr).lines());
            let mut merged = stdout_lines.merge(stderr_lines);
            let mut ready_tx = Some(ready_tx);
            tokio::spawn(async move {
                while let Some(item) = merged.next().await {
                    let line = match item {
                        Ok(line) => line,
                        Err(err) => {
                            debug!("worker '{}' output read error: {}", model_name, err);
                            break;
                        }
                    };
                    if port.get().is_none() {
                        if let Some(parsed) = parse_startup_port(&line) {
                            let _ = port.set(parsed);
                            info!("worker '{}' is listening on port {}", model_name, parsed);
                            if let Some(tx) = ready_tx.take() {
                                let _ = tx.send(parsed);
                            }
                        }
                    }
                    ring.push(line);
                }
            })
        };

        // Waits for termination, then for the reader to finish draining, and
        // only then reports the exit.
        {
            let model_name = spec.name.clone();
            let stop_requested = stop_requested.clone();
            let stop_at = stop_at.clone();
            tokio::spawn(async move {
                let status = child.wait().await;
                let _ = reader.await;
                let exit = match status {
                    Ok(status) => {
                        let code = status.code();
                        #[cfg(unix)]
                        let signal = {
                            use std::os::unix::process::ExitStatusExt;
                            status.signal()
                        };
                        #[cfg(not(unix))]
                        let signal: Option<i32> = None;

                        let stopped_recently = stop_requested.load(Ordering::SeqCst)
                            && stop_at
                                .lock()
                                .ok()
                                .and_then(|at| *at)
                                .map(|at: std::time::Instant| at.elapsed() < SOFT_EXIT_WINDOW)
                                .unwrap_or(false);
                        #[cfg(unix)]
                        let terminated_softly = signal == Some(nix::sys::signal::Signal::SIGTERM as i32);
                        #[cfg(not(unix))]
                        let terminated_softly = false;

                        WorkerExit {
                            code,
                            signal,
                            clean: status.success() || terminated_softly || stopped_recently,
                        }
                    }
                    Err(err) => {
                        warn!("failed to wait on worker '{}': {}", model_name, err);
                        WorkerExit {
                            code: None,
                            signal: None,
                            clean: false,
                        }
                    }
                };
                debug!(
                    "worker '{}' exited (code {:?}, signal {:?}, clean {})",
                    model_name, exit.code, exit.signal, exit.clean
                );
                let _ = exit_tx.send(Some(exit));
            });
        }

        let worker = Worker {
            model_name: spec.name.clone(),
            pid,
            ring,
            port,
            stop_requested,
            stop_at,
            exit_rx: exit_rx.clone(),
        };
        let signals = WorkerSignals {
            ready: ready_rx,
            exit: exit_rx,
        };
        Ok((worker, signals))
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn port(&self) -> Option<u16> {
        self.port.get().copied()
    }

    pub fn output_snapshot(&self) -> Vec<String> {
        self.ring.snapshot()
    }

    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_status(&self) -> Option<WorkerExit> {
        *self.exit_rx.borrow()
    }

    /// Subscribe to the exit notification.
    pub fn exit_signal(&self) -> watch::Receiver<Option<WorkerExit>> {
        self.exit_rx.clone()
    }

    /// Asks the process to terminate and waits for it to go away. Soft signal
    /// first, hard kill after a grace period. Idempotent: a second call just
    /// waits alongside the first.
    pub async fn stop(&self) {
        if self.exit_rx.borrow().is_some() {
            debug!("worker '{}' already stopped", self.model_name);
            return;
        }

        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            if let Ok(mut at) = self.stop_at.lock() {
                *at = Some(Instant::now());
            }
            info!("stopping worker '{}' (pid {})", self.model_name, self.pid);
            self.send_term();
        }

        let mut rx = self.exit_rx.clone();
        if Self::await_exit(&mut rx, STOP_GRACE).await {
            return;
        }

        warn!(
            "worker '{}' did not exit within {:?}, killing",
            self.model_name, STOP_GRACE
        );
        self.send_kill();
        if !Self::await_exit(&mut rx, KILL_GRACE).await {
            warn!("worker '{}' did not exit after kill", self.model_name);
        }
    }

    async fn await_exit(rx: &mut watch::Receiver<Option<WorkerExit>>, grace: Duration) -> bool {
        tokio::time::timeout(grace, async {
            while rx.borrow_and_update().is_none() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }

    #[cfg(unix)]
    fn send_term(&self) {
        self.send_signal(nix::sys::signal::Signal::SIGTERM);
    }

    #[cfg(unix)]
    fn send_kill(&self) {
        self.send_signal(nix::sys::signal::Signal::SIGKILL);
    }

    #[cfg(unix)]
    fn send_signal(&self, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;
        if let Err(err) = kill(Pid::from_raw(self.pid as i32), signal) {
            debug!(
                "sending {} to worker '{}' (pid {}): {}",
                signal, self.model_name, self.pid, err
            );
        }
    }

    #[cfg(not(unix))]
    fn send_term(&self) {
        debug!("soft termination not supported on this platform");
    }

    #[cfg(not(unix))]
    fn send_kill(&self) {
        debug!("hard kill not supported on this platform");
    }
}
