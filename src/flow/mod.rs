//! Serde models for the start payload: runtime configuration and the flow
//! definition delivered by the control collaborator.
mod config;
mod types;

pub use config::RunnerConfig;
pub use types::{
    ConditionData, ConditionStep, FlowMap, FlowStep, HttpMethod, LoopStep, OnFailure, RequestStep,
    StartRequest,
};
