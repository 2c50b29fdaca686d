use std::net::IpAddr;

use serde::Deserialize;

use crate::error::ValidationError;

/// Runtime configuration delivered alongside the flow definition.
///
/// Unknown fields are ignored so the control collaborator can carry extra
/// container-level keys in the same document.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Base URL of the target application; must be absolute.
    pub flow_target_url: String,
    /// IP literal to connect to instead of resolving the target hostname.
    #[serde(default)]
    pub flow_target_dns_override: Option<String>,
    /// Header used to inject each iteration's random source IP.
    #[serde(default = "default_xff_header_name")]
    pub xff_header_name: String,
    /// Number of concurrently simulated users.
    pub sim_users: usize,
    /// Minimum sleep between steps, milliseconds.
    #[serde(default = "default_min_sleep_ms")]
    pub min_sleep_ms: u64,
    /// Maximum sleep between steps, milliseconds.
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_ms: u64,
    /// Fixed delay between flow iterations; when unset a random delay in
    /// `[min_sleep_ms, max_sleep_ms]` is used instead.
    #[serde(default)]
    pub flow_cycle_delay_ms: Option<u64>,
    /// When true the target URL exclusively forms the request base and only
    /// path/query/fragment are taken from step URLs.
    #[serde(default = "default_true")]
    pub override_step_url_host: bool,
    #[serde(default)]
    pub debug: bool,
}

fn default_xff_header_name() -> String {
    "X-Forwarded-For".to_owned()
}

const fn default_min_sleep_ms() -> u64 {
    100
}

const fn default_max_sleep_ms() -> u64 {
    1000
}

const fn default_true() -> bool {
    true
}

impl RunnerConfig {
    /// Checks the cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns an error when `sim_users` is zero, the sleep range is
    /// inverted, or the DNS override is not an IP literal. The target URL
    /// itself is validated when it is parsed into a
    /// [`crate::http::url::TargetBase`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sim_users == 0 {
            return Err(ValidationError::NoSimUsers);
        }
        if self.min_sleep_ms > self.max_sleep_ms {
            return Err(ValidationError::SleepRangeInverted {
                min: self.min_sleep_ms,
                max: self.max_sleep_ms,
            });
        }
        self.dns_override()?;
        Ok(())
    }

    /// The DNS override as a parsed address; an empty string counts as unset.
    ///
    /// # Errors
    ///
    /// Returns an error when the configured value is not an IP literal.
    pub fn dns_override(&self) -> Result<Option<IpAddr>, ValidationError> {
        match self.flow_target_dns_override.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse::<IpAddr>()
                .map(Some)
                .map_err(|_| ValidationError::InvalidDnsOverride {
                    value: raw.to_owned(),
                }),
        }
    }
}
