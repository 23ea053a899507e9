//! Unified error type for headway-bot.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("MBTA API error (status={status}): {message}")]
    MbtaApi { status: u16, message: String },

    #[error("Upstream fetch timed out after {0}s")]
    Timeout(u64),

    #[error("No prediction data available: {0}")]
    NoData(String),

    #[error("Action delivery failed: {0}")]
    Delivery(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// HTTP status to surface for this error on the read endpoints.
    ///
    /// Upstream statuses pass through; everything else is a bad gateway.
    pub fn upstream_status(&self) -> u16 {
        match self {
            Error::MbtaApi { status, .. } => *status,
            _ => 502,
        }
    }
}
