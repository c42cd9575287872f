//! Error taxonomy for the audio core.
//! Device, transport, protocol, timeout and cache failures are the five classes
//! the core converts at its boundaries; the rest are ambient (config, io, serde).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Input/output hardware unavailable, or a read/write on it failed.
    #[error("audio device error: {0}")]
    Device(String),

    /// Channel connect/send/receive failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Remote service answered with a non-zero error code.
    #[error("protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Filesystem failure while storing or relocating a cache artifact.
    #[error("cache error: {0}")]
    Cache(String),

    #[error("synthesis error: {0}")]
    Synthesis(String),

    #[error("dialogue error: {0}")]
    Dialogue(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Stable failure-class label, used in logs and to pick a canned prompt.
    pub fn class(&self) -> &'static str {
        match self {
            Error::Device(_) => "device",
            Error::Transport(_) | Error::WebSocket(_) | Error::Http(_) => "transport",
            Error::Protocol { .. } => "protocol",
            Error::Timeout(_) => "timeout",
            Error::Cache(_) | Error::Io(_) => "cache",
            Error::Synthesis(_) => "synthesis",
            Error::Dialogue(_) => "dialogue",
            Error::Config(_) | Error::Yaml(_) => "config",
            Error::Json(_) => "protocol",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display_and_class() {
        let err = Error::Protocol {
            code: 10700,
            message: "engine error".into(),
        };
        assert_eq!(err.to_string(), "protocol error 10700: engine error");
        assert_eq!(err.class(), "protocol");
    }

    #[test]
    fn test_io_error_maps_to_cache_class() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert_eq!(err.class(), "cache");
    }
}
