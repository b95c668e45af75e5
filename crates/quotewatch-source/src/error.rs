use thiserror::Error;

/// Errors returned by the quote source client.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Network, TLS or timeout failure from the underlying HTTP client.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The source answered with a non-2xx status.
    #[error("unexpected HTTP status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    /// The body was empty or a bare JSON `null`.
    #[error("empty quote envelope from {url}")]
    MissingEnvelope { url: String },

    /// The body could not be deserialized into a quote envelope.
    #[error("JSON deserialization error for {context}: {source}")]
    Deserialize {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid source base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}
