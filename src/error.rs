use std::sync::Arc;

use thiserror::Error;

/// Result type used across the SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the SDK.
///
/// Most of them never reach the public client surface: they cross internal seams (storage
/// backends, device info, remote config, native plugins) and get logged there.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The configured host is not a valid URL.
    #[error("invalid host configuration")]
    InvalidHost(#[source] url::ParseError),

    /// The server rejected the API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// Persisted state or a server response could not be (de)serialized.
    #[error("serialization error")]
    Serialization(#[source] Arc<serde_json::Error>),

    /// A call into the native platform plugin failed.
    #[error("native plugin call failed: {0}")]
    NativePlugin(String),

    /// The requested information is not available on this host.
    #[error("{0} is not available on this platform")]
    Unavailable(&'static str),

    /// A session id that the native layer cannot accept.
    #[error("invalid session id {0:?}, expected a non-empty UUID")]
    InvalidSessionId(String),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serialization(Arc::new(value))
    }
}
