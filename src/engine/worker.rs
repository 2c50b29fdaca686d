//! The continuous lifecycle of one simulated user.
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::flow::{FlowMap, RunnerConfig};
use crate::http::client::build_user_client;
use crate::http::url::TargetBase;
use crate::metrics::MetricsAggregator;

use super::ShutdownReceiver;
use super::identity::UserIdentity;
use super::interpreter::{FlowExecutor, flow_error};

/// Floor for inter-iteration rest so a zero-delay config cannot busy-spin.
const MIN_REST: Duration = Duration::from_millis(1);

/// Decrements the active-user gauge on every exit path, including unwind.
struct ActiveUserGuard {
    metrics: Arc<MetricsAggregator>,
}

impl ActiveUserGuard {
    fn acquire(metrics: &Arc<MetricsAggregator>) -> Self {
        metrics.user_started();
        Self {
            metrics: Arc::clone(metrics),
        }
    }
}

impl Drop for ActiveUserGuard {
    fn drop(&mut self) {
        self.metrics.user_finished();
    }
}

/// Runs one simulated user until the shutdown signal fires.
///
/// Each iteration builds a fresh identity and context, executes the flow's
/// steps sequentially, records the iteration duration when it finished
/// without an error, and rests before the next pass. The HTTP client is
/// owned by this task and released when it exits.
pub(crate) async fn run_user(
    user_id: usize,
    config: Arc<RunnerConfig>,
    flow: Arc<FlowMap>,
    base: Arc<TargetBase>,
    metrics: Arc<MetricsAggregator>,
    mut shutdown_rx: ShutdownReceiver,
) {
    let user_tag = format!("user {}", user_id);

    let client = match build_user_client(&base) {
        Ok(client) => client,
        Err(err) => {
            error!("{}: failed to build HTTP client: {}. Worker exiting.", user_tag, err);
            return;
        }
    };
    let _active = ActiveUserGuard::acquire(&metrics);
    info!("{}: started for flow '{}'.", user_tag, flow.name);

    let mut iteration: u64 = 0;
    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }
        let identity = UserIdentity::random();
        let session_headers = identity.session_headers();
        let mut context = build_iteration_context(&flow, user_id, iteration, &identity);
        debug!(
            "{}: iteration {} starting (IP {}, UA {}).",
            user_tag, iteration, identity.source_ip, identity.user_agent
        );

        let executor = FlowExecutor {
            config: &config,
            base: &base,
            flow: &flow,
            client: &client,
            session_headers: &session_headers,
            metrics: &metrics,
            user_tag: user_tag.clone(),
        };
        let started = Instant::now();
        let cancelled = executor.run_flow(&mut shutdown_rx, &mut context).await;
        if cancelled {
            break;
        }

        let elapsed = started.elapsed();
        match flow_error(&context) {
            None => {
                metrics.record_flow_duration(elapsed);
                info!(
                    "{}: iteration {} finished in {:.3}s.",
                    user_tag,
                    iteration,
                    elapsed.as_secs_f64()
                );
            }
            Some(err) => {
                warn!("{}: iteration {} finished with error: {}", user_tag, iteration, err);
            }
        }
        iteration = iteration.saturating_add(1);

        let rest = rest_duration(&config).max(MIN_REST);
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            () = sleep(rest) => {}
        }
    }

    debug!("{}: worker exiting.", user_tag);
}

/// Fresh context for one iteration: a deep copy of the flow's static
/// variables plus the injected identity keys.
fn build_iteration_context(
    flow: &FlowMap,
    user_id: usize,
    iteration: u64,
    identity: &UserIdentity,
) -> Value {
    let mut map = flow.static_vars.clone();
    map.insert("sim_user_id".to_owned(), Value::from(user_id));
    map.insert(
        "iteration_source_ip".to_owned(),
        Value::String(identity.source_ip.clone()),
    );
    map.insert(
        "iteration_user_agent".to_owned(),
        Value::String(identity.user_agent.clone()),
    );
    map.insert("flow_iteration_index".to_owned(), Value::from(iteration));
    Value::Object(map)
}

fn rest_duration(config: &RunnerConfig) -> Duration {
    if let Some(fixed_ms) = config.flow_cycle_delay_ms {
        return Duration::from_millis(fixed_ms);
    }
    if config.max_sleep_ms == 0 {
        return Duration::ZERO;
    }
    let ms = rand::thread_rng().gen_range(config.min_sleep_ms..=config.max_sleep_ms);
    Duration::from_millis(ms)
}
