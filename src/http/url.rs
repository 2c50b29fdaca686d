use std::net::{IpAddr, SocketAddr};

use reqwest::Url;
use tracing::debug;

use crate::error::{HttpError, ValidationError};
use crate::flow::RunnerConfig;

/// The parsed flow target plus the routing policy derived from the config.
///
/// Built once per `Engine::start`; workers share it read-only.
#[derive(Debug, Clone)]
pub struct TargetBase {
    url: Url,
    host: String,
    port: u16,
    target_ip: Option<IpAddr>,
    override_step_url_host: bool,
}

/// Output of the URL builder for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPlan {
    /// The URL that appears in the request line; its authority is always the
    /// logical host, never the dial address.
    pub request_url: Url,
    /// Explicit Host header to set; present exactly when the connection is
    /// being redirected to the DNS override.
    pub host_header: Option<String>,
    /// Whether this request's connection is directed at the override IP.
    pub dial_override: bool,
}

impl TargetBase {
    /// Parses and validates the configured target.
    ///
    /// # Errors
    ///
    /// Returns an error when `flow_target_url` is not an absolute URL with a
    /// host or the DNS override is not an IP literal.
    pub fn from_config(config: &RunnerConfig) -> Result<Self, ValidationError> {
        let url = Url::parse(&config.flow_target_url).map_err(|err| {
            ValidationError::InvalidTargetUrl {
                url: config.flow_target_url.clone(),
                source: err,
            }
        })?;
        let host = url
            .host_str()
            .ok_or_else(|| ValidationError::TargetUrlMissingHost {
                url: config.flow_target_url.clone(),
            })?
            .to_owned();
        let port = url.port_or_known_default().unwrap_or(80);
        let target_ip = config.dns_override()?;

        Ok(Self {
            url,
            host,
            port,
            target_ip,
            override_step_url_host: config.override_step_url_host,
        })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// The socket address to pin the target hostname to, when the DNS
    /// override is configured. The port is carried for logging; connections
    /// use the port of the request URL.
    #[must_use]
    pub fn dial_addr(&self) -> Option<SocketAddr> {
        self.target_ip.map(|ip| SocketAddr::new(ip, self.port))
    }

    /// `host` or `host:port` when the port is not the scheme default.
    fn logical_host_header(&self) -> String {
        if self.url.port().is_none() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Builds the request URL, Host header, and dial decision for one step.
    ///
    /// With `override_step_url_host` the target URL exclusively supplies the
    /// scheme and authority and the step contributes only path, query, and
    /// fragment. Without it, absolute step URLs are used as-is (the DNS
    /// override still applies when the step host matches the target host)
    /// and relative step URLs are resolved against the target.
    ///
    /// # Errors
    ///
    /// Returns an error when an absolute step URL cannot be parsed.
    pub fn plan_step_url(&self, step_url: &str) -> Result<UrlPlan, HttpError> {
        let trimmed = step_url.trim();
        let parsed_absolute = match Url::parse(trimmed) {
            Ok(parsed) if parsed.host_str().is_some() => Some(parsed),
            Ok(_) => None,
            Err(url::ParseError::RelativeUrlWithoutBase | url::ParseError::EmptyHost) => None,
            Err(err) => {
                return Err(HttpError::InvalidStepUrl {
                    url: trimmed.to_owned(),
                    source: err,
                });
            }
        };

        if self.override_step_url_host {
            let plan = match parsed_absolute {
                Some(parsed) => self.rebase(
                    parsed.path(),
                    parsed.query(),
                    parsed.fragment(),
                    "override-on, absolute step URL",
                ),
                None => {
                    let (path, query, fragment) = split_relative(trimmed);
                    self.rebase(path, query, fragment, "override-on, relative step URL")
                }
            };
            return Ok(plan);
        }

        match parsed_absolute {
            Some(parsed) => {
                let step_host_matches = parsed.host_str() == Some(self.host.as_str());
                if self.target_ip.is_some() && step_host_matches {
                    debug!(
                        "URL plan: override-off, absolute step URL on target host; dialing override IP for {}",
                        parsed
                    );
                    Ok(UrlPlan {
                        request_url: parsed,
                        host_header: Some(self.logical_host_header()),
                        dial_override: true,
                    })
                } else {
                    debug!("URL plan: override-off, absolute step URL used as-is: {}", parsed);
                    Ok(UrlPlan {
                        request_url: parsed,
                        host_header: None,
                        dial_override: false,
                    })
                }
            }
            None => {
                let (path, query, fragment) = split_relative(trimmed);
                Ok(self.rebase(path, query, fragment, "override-off, relative step URL"))
            }
        }
    }

    /// Scheme and authority from the target; path/query/fragment from the
    /// step. An empty path becomes `/`; a missing leading slash is added.
    fn rebase(
        &self,
        path: &str,
        query: Option<&str>,
        fragment: Option<&str>,
        branch: &str,
    ) -> UrlPlan {
        let mut request_url = self.url.clone();
        if path.is_empty() {
            request_url.set_path("/");
        } else if path.starts_with('/') {
            request_url.set_path(path);
        } else {
            request_url.set_path(&format!("/{}", path));
        }
        request_url.set_query(query);
        request_url.set_fragment(fragment);

        let dial_override = self.target_ip.is_some();
        let host_header = dial_override.then(|| self.logical_host_header());
        debug!(
            "URL plan: {} -> {} (dial override: {})",
            branch, request_url, dial_override
        );
        UrlPlan {
            request_url,
            host_header,
            dial_override,
        }
    }
}

/// Splits a relative step URL into path, query, and fragment parts.
fn split_relative(step_url: &str) -> (&str, Option<&str>, Option<&str>) {
    let (before_fragment, fragment) = match step_url.split_once('#') {
        Some((before, fragment)) => (before, Some(fragment)),
        None => (step_url, None),
    };
    let (path, query) = match before_fragment.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (before_fragment, None),
    };
    (path, query, fragment)
}
