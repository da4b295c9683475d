// src/core/agents/mod.rs

//! The discovery pipeline. Each agent subscribes to one topic, runs its probe
//! inside the handler future while holding a limiter slot, and publishes the
//! next topic before the slot is released.

pub mod browser;
pub mod capture;
pub mod fingerprinter;
pub mod hostname_resolver;
pub mod image_diff;
pub mod port_scanner;
pub mod screenshotter;
pub mod title_extractor;
pub mod url_publisher;
pub mod url_requester;

use crate::cli::Options;
use crate::core::session::Session;
use color_eyre::eyre::{Result, WrapErr};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue};
use std::sync::Arc;
use tracing::info;

/// A pipeline stage bound to a session.
pub trait Agent {
    /// Stable id used in log lines.
    const ID: &'static str;

    /// Subscribes the agent to its topics.
    fn register(session: &Arc<Session>) -> Result<()>;
}

/// Registers every agent of the pipeline on the session's bus.
pub fn register_all(session: &Arc<Session>) -> Result<()> {
    port_scanner::PortScanner::register(session)?;
    url_publisher::UrlPublisher::register(session)?;
    url_requester::UrlRequester::register(session)?;
    hostname_resolver::HostnameResolver::register(session)?;
    title_extractor::TitleExtractor::register(session)?;
    screenshotter::Screenshotter::register(session)?;
    fingerprinter::Fingerprinter::register(session)?;
    info!("Registered pipeline agents.");
    Ok(())
}

// --- Request Disguise ---

static USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.2478.67",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 OPR/110.0.0.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4.1 Safari/605.1.15",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:115.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (Windows NT 6.1; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/109.0.0.0 Safari/537.36",
];

pub fn random_user_agent() -> &'static str {
    USER_AGENTS[rand::rng().random_range(0..USER_AGENTS.len())]
}

pub fn random_ipv4() -> String {
    let mut rng = rand::rng();
    let octets: [u8; 4] = std::array::from_fn(|_| rng.random_range(0..255));
    format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3])
}

/// Headers sent with every probe request: a random browser User-Agent and
/// spoofed forwarding headers.
pub fn disguise_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut put = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };
    put("user-agent", random_user_agent().to_string());
    put("x-forwarded-for", random_ipv4());
    put("via", format!("1.1 {}", random_ipv4()));
    put("forwarded", format!("for={};proto=http;by={}", random_ipv4(), random_ipv4()));
    headers
}

/// HTTP client used by the requesting agents. Certificate errors are ignored
/// and peer certificates are kept for inspection.
pub fn http_client(options: &Options) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(options.http_timeout)
        .danger_accept_invalid_certs(true)
        .tls_info(true);
    if let Some(proxy) = &options.proxy {
        let proxy = reqwest::Proxy::all(proxy).wrap_err_with(|| format!("invalid proxy {proxy}"))?;
        builder = builder.proxy(proxy);
    }
    builder.build().wrap_err("failed to build HTTP client")
}

/// `"200 OK"`-style status line.
pub fn status_line(status: reqwest::StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}
