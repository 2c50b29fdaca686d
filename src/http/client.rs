use std::time::Duration;

use reqwest::Client;
use tracing::debug;

use crate::error::{AppError, AppResult, HttpError};

use super::url::TargetBase;

/// Hard deadline for a single request attempt.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds the HTTP client owned by one simulated user.
///
/// The DNS override is applied here, once per client: every connection to
/// the target hostname dials the override address while the request URL and
/// TLS server name keep the logical host. Cookies are not stored, keeping
/// iterations of the same user independent.
///
/// # Errors
///
/// Returns an error when the underlying client cannot be constructed.
pub fn build_user_client(base: &TargetBase) -> AppResult<Client> {
    let mut builder = Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT);

    if let Some(addr) = base.dial_addr() {
        debug!("DNS override configured: {} -> {}", base.host(), addr);
        builder = builder.resolve(base.host(), addr);
    }

    builder
        .build()
        .map_err(|err| AppError::http(HttpError::BuildClientFailed { source: err }))
}
