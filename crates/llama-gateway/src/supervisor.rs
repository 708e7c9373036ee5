//! Worker lifecycle supervision.
//!
//! The supervisor owns every live worker. All mutations of the worker set go
//! through one async mutex, which is also the serialization point for the
//! stop-before-start dance at `concurrentRunners = 1`. Concurrent `ensure`
//! calls for the same model join a single outstanding startup request and all
//! observe the same outcome.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, warn};

use crate::config::{Config, ConfigHandle, ModelSpec, RuntimeSpec};
use crate::error::GatewayError;
use crate::worker::{Worker, WorkerExit, WorkerSignals};

pub const DEFAULT_ENSURE_DEADLINE: Duration = Duration::from_secs(240);
/// Bound on stopping a worker that is in the way of a new start.
const SERIAL_STOP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Stopping,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Starting { model: String },
    Ready { model: String, port: u16 },
    Stopped { model: String },
    Failed { model: String, message: String },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StartupError {
    #[error("{0}")]
    Configuration(String),

    #[error("concurrent runner limit reached")]
    CapacityExceeded,

    #[error("{message}")]
    Failed { message: String, output: Vec<String> },

    #[error("timed out waiting for the worker for '{0}' to become ready")]
    Timeout(String),

    #[error("gateway is shutting down")]
    Shutdown,
}

impl From<StartupError> for GatewayError {
    fn from(err: StartupError) -> Self {
        match err {
            StartupError::Configuration(message) => GatewayError::Configuration(message),
            StartupError::CapacityExceeded => GatewayError::CapacityExceeded,
            StartupError::Failed { message, output } => {
                GatewayError::StartupFailed { message, output }
            }
            StartupError::Timeout(model) => GatewayError::StartupFailed {
                message: format!("timed out starting runner for model '{}'", model),
                output: Vec::new(),
            },
            StartupError::Shutdown => GatewayError::StartupFailed {
                message: "gateway is shutting down".to_string(),
                output: Vec::new(),
            },
        }
    }
}

type StartupResult = Result<u16, StartupError>;

struct WorkerSlot {
    worker: Arc<Worker>,
    state: WorkerState,
    generation: u64,
}

#[derive(Default)]
struct SupervisorInner {
    workers: HashMap<String, WorkerSlot>,
    /// One outstanding startup request per model; joiners subscribe.
    pending: HashMap<String, watch::Sender<Option<StartupResult>>>,
    next_generation: u64,
    shutting_down: bool,
}

struct SupervisorShared {
    inner: Mutex<SupervisorInner>,
    events: broadcast::Sender<WorkerEvent>,
}

#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<SupervisorShared>,
    config: ConfigHandle,
}

impl Supervisor {
    pub fn new(config: ConfigHandle) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(SupervisorShared {
                inner: Mutex::new(SupervisorInner::default()),
                events,
            }),
            config,
        }
    }

    /// Ordered stream of worker state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events.subscribe()
    }

    pub async fn is_running(&self, model_name: &str) -> bool {
        let inner = self.shared.inner.lock().await;
        inner
            .workers
            .get(model_name)
            .map(|slot| slot.worker.is_alive())
            .unwrap_or(false)
    }

    pub async fn port_of(&self, model_name: &str) -> Option<u16> {
        let inner = self.shared.inner.lock().await;
        inner.workers.get(model_name).and_then(|slot| {
            if slot.worker.is_alive() {
                slot.worker.port()
            } else {
                None
            }
        })
    }

    /// Output ring of a model's worker, for observability consumers.
    pub async fn output_of(&self, model_name: &str) -> Vec<String> {
        let inner = self.shared.inner.lock().await;
        inner
            .workers
            .get(model_name)
            .map(|slot| slot.worker.output_snapshot())
            .unwrap_or_default()
    }

    /// Names of models whose workers are currently alive.
    pub async fn running_models(&self) -> std::collections::HashSet<String> {
        let inner = self.shared.inner.lock().await;
        inner
            .workers
            .iter()
            .filter(|(_, slot)| slot.worker.is_alive())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of workers counting against the concurrency cap.
    pub async fn live_count(&self) -> usize {
        let inner = self.shared.inner.lock().await;
        inner
            .workers
            .values()
            .filter(|slot| {
                matches!(slot.state, WorkerState::Starting | WorkerState::Ready)
                    && slot.worker.is_alive()
            })
            .count()
    }

    /// Returns the port of a ready worker for the model, starting one if
    /// needed. Blocks up to `deadline`. A caller that gives up does not
    /// cancel the startup; other callers may still be waiting on it.
    pub async fn ensure(&self, model_name: &str, deadline: Duration) -> StartupResult {
        match tokio::time::timeout(deadline, self.ensure_inner(model_name)).await {
            Ok(result) => result,
            Err(_) => Err(StartupError::Timeout(model_name.to_string())),
        }
    }

    async fn ensure_inner(&self, model_name: &str) -> StartupResult {
        loop {
            let mut rx = {
                let mut inner = self.shared.inner.lock().await;
                if inner.shutting_down {
                    return Err(StartupError::Shutdown);
                }

                // A startup for this model is already in flight: join it.
                if let Some(tx) = inner.pending.get(model_name) {
                    tx.subscribe()
                } else if let Some(slot) = inner.workers.get(model_name) {
                    if slot.worker.is_alive() {
                        if slot.state == WorkerState::Ready {
                            if let Some(port) = slot.worker.port() {
                                return Ok(port);
                            }
                        }
                        // A worker on its way down; wait for it to exit and
                        // try again.
                        let mut exit = slot.worker.exit_signal();
                        drop(inner);
                        wait_worker_exit(&mut exit).await;
                        continue;
                    }
                    // Exited but not yet reaped by its monitor; clear it out.
                    let generation = slot.generation;
                    remove_worker(&mut inner, model_name, generation);
                    continue;
                } else {
                    self.begin_startup(&mut inner, model_name).await?
                }
            };

            // Outside the lock: wait for the startup outcome.
            loop {
                if let Some(result) = rx.borrow_and_update().clone() {
                    return result;
                }
                if rx.changed().await.is_err() {
                    return Err(StartupError::Shutdown);
                }
            }
        }
    }

    /// Starts a worker for the model and registers the startup request.
    /// Caller holds the supervisor lock.
    async fn begin_startup(
        &self,
        inner: &mut SupervisorInner,
        model_name: &str,
    ) -> Result<watch::Receiver<Option<StartupResult>>, StartupError> {
        let config = self.config.current();
        let limit = config.concurrent_runners.max(1);

        let live: Vec<(String, Arc<Worker>)> = inner
            .workers
            .iter()
            .filter(|(_, slot)| {
                matches!(slot.state, WorkerState::Starting | WorkerState::Ready)
                    && slot.worker.is_alive()
            })
            .map(|(name, slot)| (name.clone(), slot.worker.clone()))
            .collect();

        if live.len() >= limit {
            if limit == 1 {
                // Serial reuse: stop whatever is running, then start fresh.
                for (name, worker) in live {
                    info!(
                        "stopping worker '{}' to make room for '{}'",
                        name, model_name
                    );
                    if let Some(slot) = inner.workers.get_mut(&name) {
                        slot.state = WorkerState::Stopping;
                    }
                    if tokio::time::timeout(SERIAL_STOP_TIMEOUT, worker.stop())
                        .await
                        .is_err()
                    {
                        return Err(StartupError::Failed {
                            message: format!(
                                "timed out stopping worker '{}' to make room for '{}'",
                                name, model_name
                            ),
                            output: worker.output_snapshot(),
                        });
                    }
                    inner.workers.remove(&name);
                    // A startup still outstanding for the stopped model can
                    // no longer succeed.
                    if let Some(tx) = inner.pending.remove(&name) {
                        let _ = tx.send(Some(Err(StartupError::Failed {
                            message: format!("worker for '{}' was stopped before becoming ready", name),
                            output: worker.output_snapshot(),
                        })));
                    }
                    let _ = self.shared.events.send(WorkerEvent::Stopped { model: name });
                }
            } else {
                return Err(StartupError::CapacityExceeded);
            }
        }

        let (spec, runtime) = resolve_model(&config, model_name)?;

        let (worker, signals) = match Worker::spawn(&spec, &runtime) {
            Ok(pair) => pair,
            Err(err) => {
                return Err(StartupError::Failed {
                    message: err.to_string(),
                    output: Vec::new(),
                });
            }
        };
        let worker = Arc::new(worker);

        let generation = inner.next_generation;
        inner.next_generation += 1;

        let (tx, rx) = watch::channel(None);
        inner.pending.insert(model_name.to_string(), tx);
        inner.workers.insert(
            model_name.to_string(),
            WorkerSlot {
                worker: worker.clone(),
                state: WorkerState::Starting,
                generation,
            },
        );
        crate::metrics::set_live_workers(inner.workers.len() as i64);

        let _ = self.shared.events.send(WorkerEvent::Starting {
            model: model_name.to_string(),
        });

        let shared = self.shared.clone();
        let model = model_name.to_string();
        tokio::spawn(async move {
            monitor_worker(shared, model, generation, worker, signals).await;
        });

        Ok(rx)
    }

    /// Stops the worker for one model, if any. Used by config reload when a
    /// model's spec changed.
    pub async fn stop_worker(&self, model_name: &str) {
        let worker = {
            let mut inner = self.shared.inner.lock().await;
            match inner.workers.get_mut(model_name) {
                Some(slot) => {
                    slot.state = WorkerState::Stopping;
                    slot.worker.clone()
                }
                None => return,
            }
        };
        worker.stop().await;
    }

    /// Stops every worker and cancels outstanding startup requests. Returns
    /// once every worker has exited.
    pub async fn stop_all(&self) {
        let (workers, pending) = {
            let mut inner = self.shared.inner.lock().await;
            inner.shutting_down = true;
            for slot in inner.workers.values_mut() {
                slot.state = WorkerState::Stopping;
            }
            let workers: Vec<Arc<Worker>> =
                inner.workers.values().map(|slot| slot.worker.clone()).collect();
            let pending: Vec<_> = inner.pending.drain().collect();
            (workers, pending)
        };

        for (_, tx) in pending {
            let _ = tx.send(Some(Err(StartupError::Shutdown)));
        }

        info!("stopping {} worker(s)", workers.len());
        join_all(workers.iter().map(|worker| worker.stop())).await;

        let mut inner = self.shared.inner.lock().await;
        inner.workers.clear();
        crate::metrics::set_live_workers(0);
    }
}

fn resolve_model(config: &Config, model_name: &str) -> Result<(ModelSpec, RuntimeSpec), StartupError> {
    let spec = config
        .model(model_name)
        .cloned()
        .ok_or_else(|| {
            StartupError::Configuration(format!("model '{}' is not configured", model_name))
        })?;

    if !spec.model_path.exists() {
        return Err(StartupError::Configuration(format!(
            "model file not found: {}",
            spec.model_path.display()
        )));
    }

    let mut runtime = config.runtime_for(&spec);
    if runtime.command.trim().is_empty() {
        return Err(StartupError::Configuration(format!(
            "runtime for model '{}' has no command configured",
            model_name
        )));
    }

    let command_path = Path::new(&runtime.command);
    if command_path.components().count() > 1 {
        if !command_path.exists() {
            return Err(StartupError::Configuration(format!(
                "runtime binary not found at '{}'",
                runtime.command
            )));
        }
    } else {
        match which::which(&runtime.command) {
            Ok(resolved) => runtime.command = resolved.display().to_string(),
            Err(_) => {
                return Err(StartupError::Configuration(format!(
                    "runtime command '{}' not found in PATH",
                    runtime.command
                )));
            }
        }
    }

    Ok((spec, runtime))
}

fn remove_worker(inner: &mut SupervisorInner, model: &str, generation: u64) -> Option<WorkerSlot> {
    match inner.workers.get(model) {
        Some(slot) if slot.generation == generation => {
            let removed = inner.workers.remove(model);
            crate::metrics::set_live_workers(inner.workers.len() as i64);
            removed
        }
        _ => None,
    }
}

async fn wait_worker_exit(rx: &mut watch::Receiver<Option<WorkerExit>>) {
    while rx.borrow_and_update().is_none() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Follows one worker from spawn to exit, driving the supervisor's view of
/// its state and completing the startup request.
async fn monitor_worker(
    shared: Arc<SupervisorShared>,
    model: String,
    generation: u64,
    worker: Arc<Worker>,
    signals: WorkerSignals,
) {
    let WorkerSignals { ready, mut exit } = signals;
    let mut exit_before_ready = exit.clone();

    tokio::select! {
        ready_result = ready => {
            if let Ok(port) = ready_result {
                let mut inner = shared.inner.lock().await;
                if let Some(slot) = inner.workers.get_mut(&model) {
                    if slot.generation == generation {
                        slot.state = WorkerState::Ready;
                    }
                }
                if let Some(tx) = inner.pending.remove(&model) {
                    let _ = tx.send(Some(Ok(port)));
                }
                drop(inner);
                info!("worker for '{}' is ready on port {}", model, port);
                let _ = shared.events.send(WorkerEvent::Ready { model: model.clone(), port });
            }
            // Ready (or the reader ended early); either way the process is
            // still running, so keep following it until it exits.
            wait_worker_exit(&mut exit).await;
        }
        _ = wait_worker_exit(&mut exit_before_ready) => {}
    }

    let exit_info = (*exit.borrow()).unwrap_or(WorkerExit {
        code: None,
        signal: None,
        clean: false,
    });

    let mut inner = shared.inner.lock().await;
    let removed = remove_worker(&mut inner, &model, generation);
    if removed.is_none() {
        // Someone else (serial reuse, stop_all) already reaped this worker.
        return;
    }

    // A crash during startup fails the outstanding request and hands the
    // callers the output ring for diagnosis.
    if let Some(tx) = inner.pending.remove(&model) {
        let output = worker.output_snapshot();
        let message = format!(
            "worker for '{}' exited during startup (exit code {:?})",
            model, exit_info.code
        );
        let _ = tx.send(Some(Err(StartupError::Failed {
            message: message.clone(),
            output,
        })));
        drop(inner);
        warn!("{}", message);
        let _ = shared.events.send(WorkerEvent::Failed { model, message });
        return;
    }
    drop(inner);

    if exit_info.clean {
        info!("worker for '{}' stopped", model);
        let _ = shared.events.send(WorkerEvent::Stopped { model });
    } else {
        let message = format!(
            "worker for '{}' exited unexpectedly (exit code {:?})",
            model, exit_info.code
        );
        warn!("{}", message);
        let _ = shared.events.send(WorkerEvent::Failed { model, message });
    }
}
