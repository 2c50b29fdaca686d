use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid step URL '{url}': {source}")]
    InvalidStepUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Failed to build HTTP client: {source}")]
    BuildClientFailed {
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to build request: {source}")]
    BuildRequestFailed {
        #[source]
        source: reqwest::Error,
    },
    #[error("Failed to serialize request body: {source}")]
    SerializeBodyFailed {
        #[source]
        source: serde_json::Error,
    },
}
