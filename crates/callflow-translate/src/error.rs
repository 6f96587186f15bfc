use thiserror::Error;

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("http error from {provider}: {source}")]
    Http {
        provider: String,
        source: reqwest::Error,
    },

    #[error("{provider} returned status {status}: {body}")]
    Status {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("{provider} returned no translation")]
    EmptyResponse { provider: String },

    #[error("{provider} timed out after {timeout_ms}ms")]
    Timeout { provider: String, timeout_ms: u64 },

    #[error("invalid translation configuration: {0}")]
    Config(String),
}
