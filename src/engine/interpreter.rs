//! The step interpreter: walks a step sequence against a per-iteration
//! context, dispatching request, condition, and loop steps.
use std::collections::BTreeMap;

use rand::Rng;
use reqwest::Client;
use serde_json::Value;
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use crate::condition;
use crate::context::{deep_merge, get_path, set_path, substitute, value_to_string};
use crate::extract::apply_extract_rules;
use crate::flow::{
    ConditionStep, FlowMap, FlowStep, LoopStep, OnFailure, RequestStep, RunnerConfig,
};
use crate::http::executor::{
    PreparedRequest, STATUS_INVALID_REQUEST, execute_step_request, headers_to_value, insert_header,
    merge_headers,
};
use crate::http::url::TargetBase;
use crate::metrics::MetricsAggregator;

use super::ShutdownReceiver;

/// Context key that halts the current iteration when set to a non-null
/// value.
pub(crate) const FLOW_ERROR_KEY: &str = "_flow_error";

/// Everything one worker needs to execute flow iterations. All references
/// are read-only shared state; the context passed to `execute_steps` is the
/// only thing mutated.
pub(crate) struct FlowExecutor<'run> {
    pub config: &'run RunnerConfig,
    pub base: &'run TargetBase,
    pub flow: &'run FlowMap,
    pub client: &'run Client,
    pub session_headers: &'run [(String, String)],
    pub metrics: &'run MetricsAggregator,
    pub user_tag: String,
}

impl FlowExecutor<'_> {
    /// Runs the flow's top-level steps; returns true when cancelled.
    pub async fn run_flow(
        &self,
        shutdown_rx: &mut ShutdownReceiver,
        context: &mut Value,
    ) -> bool {
        self.execute_steps(shutdown_rx, &self.flow.steps, context, 0)
            .await
    }

    /// Executes a step sequence. Returns true when cancellation interrupted
    /// execution; a `_flow_error` in the context halts the sequence without
    /// counting as cancellation.
    async fn execute_steps(
        &self,
        shutdown_rx: &mut ShutdownReceiver,
        steps: &[FlowStep],
        context: &mut Value,
        depth: usize,
    ) -> bool {
        for (index, step) in steps.iter().enumerate() {
            if index > 0 && self.sleep_between_steps(shutdown_rx).await {
                return true;
            }
            if let Some(error) = flow_error(context) {
                warn!(
                    "{}: flow error detected ('{}'), halting step sequence.",
                    self.user_tag, error
                );
                return false;
            }

            debug!(
                "{}: executing step {} {}/{} at depth {}",
                self.user_tag,
                step.label(),
                index + 1,
                steps.len(),
                depth
            );
            match step {
                FlowStep::Request(request) => {
                    if self.run_request_step(shutdown_rx, request, context).await {
                        return true;
                    }
                }
                FlowStep::Condition(condition) => {
                    if self
                        .run_condition_step(shutdown_rx, condition, context, depth)
                        .await
                    {
                        return true;
                    }
                }
                FlowStep::Loop(loop_step) => {
                    if self
                        .run_loop_step(shutdown_rx, loop_step, context, depth)
                        .await
                    {
                        return true;
                    }
                }
            }
        }
        false
    }

    async fn run_request_step(
        &self,
        shutdown_rx: &mut ShutdownReceiver,
        step: &RequestStep,
        context: &mut Value,
    ) -> bool {
        let label = step.label();
        let context_prefix = format!("response_{}", step.id);

        let url = substituted_string(&step.url, context);
        let plan = match self.base.plan_step_url(&url) {
            Ok(plan) => plan,
            Err(err) => {
                warn!("{}: step {}: {}. Skipping request.", self.user_tag, label, err);
                let message = format!("invalid URL: {}", err);
                store(
                    context,
                    &format!("{}_status", context_prefix),
                    Value::from(STATUS_INVALID_REQUEST),
                );
                store(
                    context,
                    &format!("{}_error", context_prefix),
                    Value::String(message.clone()),
                );
                set_flow_error(context, format!("step {} failed: {}", label, message));
                return false;
            }
        };

        let flow_headers = substituted_headers(&self.flow.headers, context);
        let step_headers = substituted_headers(&step.headers, context);
        let mut headers = merge_headers(self.session_headers, &flow_headers, &step_headers);
        if !self.config.xff_header_name.is_empty()
            && let Some(ip) = get_path(context, "iteration_source_ip")
        {
            insert_header(&mut headers, &self.config.xff_header_name, &value_to_string(ip));
        }

        let body = step.body.as_ref().map(|body| substitute(body, context));
        let prepared = PreparedRequest {
            method: step.method,
            plan,
            headers,
            body,
        };

        let Some(outcome) =
            execute_step_request(self.client, shutdown_rx, &prepared, self.metrics, &label).await
        else {
            return true;
        };

        store(context, &format!("{}_status", context_prefix), Value::from(outcome.status));
        store(
            context,
            &format!("{}_headers", context_prefix),
            headers_to_value(&outcome.headers),
        );
        store(context, &format!("{}_body", context_prefix), outcome.body.clone());
        store(
            context,
            &format!("{}_error", context_prefix),
            outcome.error.clone().map_or(Value::Null, Value::String),
        );

        match outcome.error {
            Some(error) => {
                warn!("{}: step {} failed: {}", self.user_tag, label, error);
                set_flow_error(context, format!("step {} failed: {}", label, error));
            }
            None => {
                info!(
                    "{}: step {} received {} {} {}",
                    self.user_tag,
                    label,
                    outcome.status,
                    step.method.as_str(),
                    prepared.plan.request_url
                );
                // Extraction sees every received response, even one that is
                // about to stop the iteration.
                apply_extract_rules(
                    &step.extract,
                    outcome.status,
                    &outcome.headers,
                    &outcome.body,
                    context,
                );
                let failed = !(200..=299).contains(&outcome.status);
                if failed {
                    match step.on_failure {
                        OnFailure::Stop => {
                            let message = format!(
                                "step {} failed with status {} and onFailure=stop",
                                label, outcome.status
                            );
                            warn!("{}: {}. Halting iteration.", self.user_tag, message);
                            set_flow_error(context, message);
                        }
                        OnFailure::Continue => {
                            info!(
                                "{}: step {} failed with status {}, onFailure=continue. Proceeding.",
                                self.user_tag, label, outcome.status
                            );
                        }
                    }
                }
            }
        }
        false
    }

    async fn run_condition_step(
        &self,
        shutdown_rx: &mut ShutdownReceiver,
        step: &ConditionStep,
        context: &mut Value,
        depth: usize,
    ) -> bool {
        let label = step.label();
        let result = match step.condition_data.as_ref() {
            Some(data) => condition::evaluate(data, context),
            None => {
                warn!(
                    "{}: condition {} has no conditionData. Defaulting to false.",
                    self.user_tag, label
                );
                false
            }
        };
        info!("{}: condition {} -> {}", self.user_tag, label, result);

        let branch = if result { &step.then } else { &step.else_steps };
        if branch.is_empty() {
            return false;
        }

        // The branch runs on its own copy; its mutations merge back into the
        // caller context afterwards.
        let mut branch_context = context.clone();
        let cancelled = Box::pin(self.execute_steps(
            shutdown_rx,
            branch,
            &mut branch_context,
            depth + 1,
        ))
        .await;
        deep_merge(context, branch_context);
        cancelled
    }

    async fn run_loop_step(
        &self,
        shutdown_rx: &mut ShutdownReceiver,
        step: &LoopStep,
        context: &mut Value,
        depth: usize,
    ) -> bool {
        let label = step.label();
        let source_path = strip_braces(&step.source);
        if source_path.is_empty() {
            warn!("{}: loop {} has an empty source path. Skipping.", self.user_tag, label);
            return false;
        }

        let items = match get_path(context, source_path) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                warn!(
                    "{}: loop {} source '{}' is not a list (found {}). Skipping.",
                    self.user_tag,
                    label,
                    source_path,
                    type_name(other)
                );
                return false;
            }
            None => {
                warn!(
                    "{}: loop {} source '{}' not found in context. Skipping.",
                    self.user_tag, label, source_path
                );
                return false;
            }
        };
        if items.is_empty() {
            debug!("{}: loop {} source '{}' is empty.", self.user_tag, label, source_path);
            return false;
        }

        let index_key = format!("{}_index", step.loop_variable);
        for (index, item) in items.iter().enumerate() {
            debug!(
                "{}: loop {} iteration {}/{}",
                self.user_tag,
                label,
                index + 1,
                items.len()
            );
            // Each iteration gets an isolated copy of the pre-loop context;
            // only errors propagate back.
            let mut iteration_context = context.clone();
            store(&mut iteration_context, &step.loop_variable, item.clone());
            store(&mut iteration_context, &index_key, Value::from(index));
            if Box::pin(self.execute_steps(
                shutdown_rx,
                &step.steps,
                &mut iteration_context,
                depth + 1,
            ))
            .await
            {
                return true;
            }
            if let Some(error) = flow_error(&iteration_context) {
                let message = format!(
                    "error in loop {} iteration {}: {}",
                    label,
                    index + 1,
                    error
                );
                warn!("{}: {}", self.user_tag, message);
                set_flow_error(context, message);
                return false;
            }
        }
        false
    }

    /// Uniform random sleep in `[min_sleep_ms, max_sleep_ms]`; returns true
    /// when cancellation woke it.
    async fn sleep_between_steps(&self, shutdown_rx: &mut ShutdownReceiver) -> bool {
        let min = self.config.min_sleep_ms;
        let max = self.config.max_sleep_ms;
        let duration_ms = if max == 0 {
            0
        } else {
            rand::thread_rng().gen_range(min..=max)
        };
        if duration_ms == 0 {
            return false;
        }
        tokio::select! {
            _ = shutdown_rx.recv() => true,
            () = sleep(Duration::from_millis(duration_ms)) => false,
        }
    }
}

/// Substitutes a string template, flattening a whole-string unquoted marker
/// to its string form.
fn substituted_string(template: &str, context: &Value) -> String {
    match substitute(&Value::String(template.to_owned()), context) {
        Value::String(text) => text,
        other => value_to_string(&other),
    }
}

fn substituted_headers(
    headers: &BTreeMap<String, String>,
    context: &Value,
) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                substituted_string(name, context),
                substituted_string(value, context),
            )
        })
        .collect()
}

fn strip_braces(source: &str) -> &str {
    let trimmed = source.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map_or(trimmed, str::trim)
}

pub(crate) fn flow_error(context: &Value) -> Option<String> {
    match get_path(context, FLOW_ERROR_KEY) {
        Some(Value::Null) | None => None,
        Some(value) => Some(value_to_string(value)),
    }
}

pub(crate) fn set_flow_error(context: &mut Value, message: String) {
    store(context, FLOW_ERROR_KEY, Value::String(message));
}

fn store(context: &mut Value, key: &str, value: Value) {
    if let Err(err) = set_path(context, key, value) {
        warn!("Failed to store context key '{}': {}", key, err);
    }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
