// src/core/error.rs

use std::time::Duration;
use thiserror::Error;

/// Failure of a single probe.
///
/// Agents never let these escape a bus handler: each one ends up as a stats
/// increment, a log line, or a note on the affected page.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("DNS lookup failed: {0}")]
    Dns(#[from] hickory_resolver::error::ResolveError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("renderer error: {0}")]
    Render(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("image decode failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("no page registered for {0}")]
    MissingPage(String),

    #[error("invalid URL {0}")]
    InvalidUrl(String),
}

impl From<chromiumoxide::error::CdpError> for ProbeError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        ProbeError::Render(e.to_string())
    }
}

pub type ProbeResult<T> = Result<T, ProbeError>;
