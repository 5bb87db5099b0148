//! LLM error types.

use thiserror::Error;

/// Errors from provider clients and the client factory.
#[derive(Debug, Error)]
pub enum LlmError {
    /// HTTP request failed.
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    /// Provider returned a stream payload that could not be decoded.
    #[error("malformed stream payload: {0}")]
    Decode(String),

    /// The factory does not know this provider name.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// No API token supplied for the provider.
    #[error("missing credentials for provider {0}")]
    MissingCredentials(String),
}
