//! Engine lifecycle: start/stop orchestration, the worker registry, and the
//! shared cancellation signal.
pub mod identity;
mod interpreter;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{info, warn};

use crate::error::AppResult;
use crate::flow::{FlowMap, RunnerConfig};
use crate::http::url::TargetBase;
use crate::metrics::{MetricsAggregator, MetricsSnapshot};

pub type ShutdownSender = broadcast::Sender<()>;
pub type ShutdownReceiver = broadcast::Receiver<()>;

/// How long `stop` waits for workers to drain before aborting them.
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Initializing,
    Running,
    Stopped,
    Error,
}

impl EngineStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EngineStatus::Initializing => "initializing",
            EngineStatus::Running => "running",
            EngineStatus::Stopped => "stopped",
            EngineStatus::Error => "error",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => EngineStatus::Running,
            2 => EngineStatus::Stopped,
            3 => EngineStatus::Error,
            _ => EngineStatus::Initializing,
        }
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct RunState {
    shutdown_tx: Option<ShutdownSender>,
    workers: Vec<JoinHandle<()>>,
}

/// The traffic-generation engine exposed to the control collaborator.
///
/// `start` validates the payload and spawns one worker task per simulated
/// user; `stop` cancels them and waits for the drain; `status` and
/// `snapshot` are cheap concurrent reads.
pub struct Engine {
    status: AtomicU8,
    state: Mutex<RunState>,
    metrics: Arc<MetricsAggregator>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(EngineStatus::Initializing as u8),
            state: Mutex::new(RunState::default()),
            metrics: Arc::new(MetricsAggregator::new()),
        }
    }

    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    /// A consistent copy of the live metrics.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    #[must_use]
    pub fn active_users(&self) -> u64 {
        self.metrics.active_users()
    }

    /// Validates the payload and starts generating traffic.
    ///
    /// A running engine is stopped implicitly before the new run begins, and
    /// only after the new payload validated, so a bad payload never kills a
    /// healthy run.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the config or flow is malformed; the
    /// previous run (if any) keeps going in that case.
    pub async fn start(&self, config: RunnerConfig, flowmap: FlowMap) -> AppResult<()> {
        let validated = config.validate().and_then(|()| TargetBase::from_config(&config));
        let base = match validated {
            Ok(base) => base,
            Err(err) => {
                if self.status() != EngineStatus::Running {
                    self.set_status(EngineStatus::Error);
                }
                return Err(err.into());
            }
        };

        let mut state = self.state.lock().await;
        if let Some(shutdown_tx) = state.shutdown_tx.take() {
            info!("Engine already running; performing implicit stop before restart.");
            drain_workers(&mut state, shutdown_tx).await;
        }

        info!(
            "Starting flow '{}' against {} with {} simulated users.",
            flowmap.name, config.flow_target_url, config.sim_users
        );
        let (shutdown_tx, _) = broadcast::channel(16);
        let config = Arc::new(config);
        let flow = Arc::new(flowmap);
        let base = Arc::new(base);

        self.metrics.set_running(true);
        for user_id in 0..config.sim_users {
            // Receivers are created before spawning so a stop issued right
            // after start cannot race past an unsubscribed worker.
            state.workers.push(tokio::spawn(worker::run_user(
                user_id,
                Arc::clone(&config),
                Arc::clone(&flow),
                Arc::clone(&base),
                Arc::clone(&self.metrics),
                shutdown_tx.subscribe(),
            )));
        }
        state.shutdown_tx = Some(shutdown_tx);
        self.set_status(EngineStatus::Running);
        Ok(())
    }

    /// Stops traffic generation and waits for every worker to finish.
    ///
    /// Idempotent: stopping an engine that never ran, or ran and stopped,
    /// only settles the status at `stopped`.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(shutdown_tx) = state.shutdown_tx.take() {
            info!("Stopping flow generation.");
            drain_workers(&mut state, shutdown_tx).await;
        }
        self.metrics.set_running(false);
        self.set_status(EngineStatus::Stopped);
    }

    fn set_status(&self, status: EngineStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }
}

/// Signals cancellation and joins every worker, aborting stragglers once the
/// grace period runs out.
async fn drain_workers(state: &mut RunState, shutdown_tx: ShutdownSender) {
    drop(shutdown_tx.send(()));
    let workers = std::mem::take(&mut state.workers);
    let deadline = Instant::now() + STOP_GRACE;

    for mut handle in workers {
        match timeout_at(deadline, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if err.is_panic() {
                    warn!("Worker task panicked during shutdown: {}", err);
                }
            }
            Err(_) => {
                warn!("Worker did not stop within the grace period; aborting.");
                handle.abort();
                drop(handle.await);
            }
        }
    }
    info!("All workers drained.");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_payload() -> Result<(RunnerConfig, FlowMap), String> {
        let config: RunnerConfig = serde_json::from_value(json!({
            "flow_target_url": "http://flow.test",
            "sim_users": 2,
            "min_sleep_ms": 0,
            "max_sleep_ms": 0
        }))
        .map_err(|err| format!("config build failed: {}", err))?;
        let flow: FlowMap = serde_json::from_value(json!({"name": "noop", "steps": []}))
            .map_err(|err| format!("flow build failed: {}", err))?;
        Ok((config, flow))
    }

    fn run_async<F>(future: F) -> Result<(), String>
    where
        F: std::future::Future<Output = Result<(), String>>,
    {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|err| format!("runtime build failed: {}", err))?;
        runtime.block_on(future)
    }

    #[test]
    fn starts_and_stops_cleanly() -> Result<(), String> {
        run_async(async {
            let engine = Engine::new();
            if engine.status() != EngineStatus::Initializing {
                return Err("fresh engine should be initializing".to_owned());
            }
            let (config, flow) = test_payload()?;
            engine
                .start(config, flow)
                .await
                .map_err(|err| format!("start failed: {}", err))?;
            if engine.status() != EngineStatus::Running {
                return Err("engine should be running after start".to_owned());
            }

            engine.stop().await;
            if engine.status() != EngineStatus::Stopped {
                return Err("engine should be stopped after stop".to_owned());
            }
            if engine.active_users() != 0 {
                return Err(format!(
                    "active users should be 0 after stop, got {}",
                    engine.active_users()
                ));
            }
            Ok(())
        })
    }

    #[test]
    fn stop_is_idempotent() -> Result<(), String> {
        run_async(async {
            let engine = Engine::new();
            engine.stop().await;
            engine.stop().await;
            if engine.status() != EngineStatus::Stopped {
                return Err("stop on an idle engine should settle at stopped".to_owned());
            }
            Ok(())
        })
    }

    #[test]
    fn invalid_config_does_not_kill_a_running_engine() -> Result<(), String> {
        run_async(async {
            let engine = Engine::new();
            let (config, flow) = test_payload()?;
            engine
                .start(config.clone(), flow.clone())
                .await
                .map_err(|err| format!("start failed: {}", err))?;

            let bad_config: RunnerConfig = serde_json::from_value(json!({
                "flow_target_url": "http://flow.test",
                "sim_users": 0
            }))
            .map_err(|err| format!("config build failed: {}", err))?;
            if engine.start(bad_config, flow).await.is_ok() {
                return Err("expected validation error".to_owned());
            }
            if engine.status() != EngineStatus::Running {
                return Err("running engine must survive a bad restart payload".to_owned());
            }

            engine.stop().await;
            Ok(())
        })
    }

    #[test]
    fn invalid_config_from_idle_marks_error() -> Result<(), String> {
        run_async(async {
            let engine = Engine::new();
            let bad_config: RunnerConfig = serde_json::from_value(json!({
                "flow_target_url": "::::not a url::::",
                "sim_users": 1
            }))
            .map_err(|err| format!("config build failed: {}", err))?;
            let flow: FlowMap = serde_json::from_value(json!({"name": "f", "steps": []}))
                .map_err(|err| format!("flow build failed: {}", err))?;
            if engine.start(bad_config, flow).await.is_ok() {
                return Err("expected validation error".to_owned());
            }
            if engine.status() != EngineStatus::Error {
                return Err("idle engine should report error status".to_owned());
            }
            Ok(())
        })
    }
}
