use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid flow_target_url '{url}': {source}")]
    InvalidTargetUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("flow_target_url '{url}' must be an absolute URL with a host.")]
    TargetUrlMissingHost { url: String },
    #[error("sim_users must be at least 1.")]
    NoSimUsers,
    #[error("min_sleep_ms ({min}) cannot be greater than max_sleep_ms ({max}).")]
    SleepRangeInverted { min: u64, max: u64 },
    #[error("Invalid IP address for flow_target_dns_override: '{value}'")]
    InvalidDnsOverride { value: String },
    #[error("Invalid HTTP method '{value}'.")]
    InvalidHttpMethod { value: String },
    #[error("Invalid onFailure action '{value}'.")]
    InvalidOnFailure { value: String },
}
