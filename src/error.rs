use thiserror::Error;

/// Failures talking to the telemetry source
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Network timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(u16),

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout
        } else if let Some(status) = e.status() {
            SourceError::Http(status.as_u16())
        } else if e.is_decode() {
            SourceError::Parse(e.to_string())
        } else {
            SourceError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(e: serde_json::Error) -> Self {
        SourceError::Parse(e.to_string())
    }
}

/// Series bookkeeping errors (unknown sensor / missing slot mapping)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("No series for slot {slot} (have {slots})")]
    UnknownSlot { slot: usize, slots: usize },
}

/// Failures reported by a media decoder while driving it
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Decoder not attached")]
    NotAttached,

    #[error("Decoder failed: {0}")]
    Decoder(String),

    #[error("Invalid stream URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Bad playlist: {0}")]
    Playlist(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Malformed config: {0}")]
    Malformed(#[from] serde_json::Error),
}
