use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::ValidationError;

use super::config::RunnerConfig;

/// A complete flow definition as authored by the flow builder tool.
///
/// Unknown top-level fields (UI layout hints and the like) are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowMap {
    /// Opaque flow id; external tooling supplies either a string or a number.
    #[serde(default)]
    pub id: Option<Value>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Global headers applied to every request step; values may contain
    /// `{{variable}}` templates.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Initial context values, deep-copied at the start of every iteration.
    #[serde(default, rename = "staticVars")]
    pub static_vars: serde_json::Map<String, Value>,
    pub steps: Vec<FlowStep>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FlowStep {
    Request(RequestStep),
    Condition(ConditionStep),
    Loop(LoopStep),
}

impl FlowStep {
    pub fn id(&self) -> &str {
        match self {
            FlowStep::Request(step) => &step.id,
            FlowStep::Condition(step) => &step.id,
            FlowStep::Loop(step) => &step.id,
        }
    }

    pub fn label(&self) -> String {
        match self {
            FlowStep::Request(step) => step.label(),
            FlowStep::Condition(step) => step.label(),
            FlowStep::Loop(step) => step.label(),
        }
    }
}

fn step_label(id: &str, name: Option<&str>) -> String {
    match name {
        Some(name) => format!("'{}' ({})", name, id),
        None => format!("({})", id),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RequestStep {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub method: HttpMethod,
    /// URL path relative to the target, or a full URL. May contain
    /// `{{variable}}` templates and may be empty when the host override is
    /// active.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON object, list, or raw string; `##VAR:...##` markers are expanded
    /// before dispatch.
    #[serde(default)]
    pub body: Option<Value>,
    /// Mapping of context variable name to extraction path, e.g.
    /// `"token": "body.data.sessionToken"` or `"status_code": ".status"`.
    #[serde(default)]
    pub extract: BTreeMap<String, String>,
    #[serde(default, rename = "onFailure")]
    pub on_failure: OnFailure,
}

impl RequestStep {
    #[must_use]
    pub fn label(&self) -> String {
        step_label(&self.id, self.name.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConditionStep {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "conditionData")]
    pub condition_data: Option<ConditionData>,
    #[serde(default)]
    pub then: Vec<FlowStep>,
    #[serde(default, rename = "else")]
    pub else_steps: Vec<FlowStep>,
}

impl ConditionStep {
    #[must_use]
    pub fn label(&self) -> String {
        step_label(&self.id, self.name.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopStep {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Path (optionally wrapped in `{{...}}`) resolving to a list in the
    /// context.
    pub source: String,
    #[serde(default = "default_loop_variable", rename = "loopVariable")]
    pub loop_variable: String,
    #[serde(default)]
    pub steps: Vec<FlowStep>,
}

impl LoopStep {
    #[must_use]
    pub fn label(&self) -> String {
        step_label(&self.id, self.name.as_deref())
    }
}

fn default_loop_variable() -> String {
    "item".to_owned()
}

/// Structured condition produced by the flow builder's condition editor.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConditionData {
    #[serde(default)]
    pub variable: String,
    #[serde(default)]
    pub operator: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Head,
}

impl HttpMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Head => "HEAD",
        }
    }

    #[must_use]
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Options => reqwest::Method::OPTIONS,
            HttpMethod::Head => reqwest::Method::HEAD,
        }
    }

    /// Whether requests with this method carry no body.
    #[must_use]
    pub const fn is_bodyless(self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Head)
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "OPTIONS" => Ok(HttpMethod::Options),
            "HEAD" => Ok(HttpMethod::Head),
            _ => Err(ValidationError::InvalidHttpMethod {
                value: s.to_owned(),
            }),
        }
    }
}

impl<'de> Deserialize<'de> for HttpMethod {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Action taken when a request step receives a non-2xx response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnFailure {
    #[default]
    Stop,
    Continue,
}

impl std::str::FromStr for OnFailure {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop" => Ok(OnFailure::Stop),
            "continue" => Ok(OnFailure::Continue),
            _ => Err(ValidationError::InvalidOnFailure {
                value: s.to_owned(),
            }),
        }
    }
}

impl<'de> Deserialize<'de> for OnFailure {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// The payload the control collaborator delivers to `Engine::start`.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    pub config: RunnerConfig,
    pub flowmap: FlowMap,
}
