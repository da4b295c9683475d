// src/core/targets.rs

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::io::BufRead;
use tracing::debug;

/// Hosts and URLs embedded in free text: an optional `scheme://`, a domain
/// name, IPv4 address or bracketed IPv6 address, an optional port and path.
static RE_TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:[a-z][a-z0-9+.\-]*://)?(?:(?:[a-z0-9](?:[a-z0-9\-]{0,61}[a-z0-9])?\.)+[a-z][a-z0-9\-]{1,62}|(?:\d{1,3}\.){3}\d{1,3}|\[[0-9a-f:.]+\]|localhost)(?::\d{1,5})?(?:/[^\s<>\x22'`]*)?",
    )
    .expect("target pattern is valid")
});

/// A classified input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Bare host to port-scan.
    Host(String),
    /// URL with a supported scheme to request directly.
    Url(String),
}

/// Pulls every host/URL out of `input`, keeping first-seen order and dropping repeats.
pub fn extract_targets(input: impl BufRead) -> std::io::Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for line in input.lines() {
        let line = line?;
        for found in RE_TARGET.find_iter(&line) {
            let target = found.as_str().trim_end_matches(['.', ',', ';', ')']);
            if seen.insert(target.to_string()) {
                targets.push(target.to_string());
            }
        }
    }
    Ok(targets)
}

/// Decides whether a target is a bare host or a URL.
///
/// Anything with a `scheme://` prefix is a URL and is kept only for `http`
/// and `https`. A scheme-less target is reduced to its host part.
pub fn classify_target(raw: &str) -> Option<Target> {
    if let Some((scheme, _)) = raw.split_once("://") {
        if scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https") {
            return match url::Url::parse(raw) {
                Ok(parsed) if parsed.host_str().is_some() => Some(Target::Url(raw.to_string())),
                _ => {
                    debug!(target = raw, "Dropping malformed URL.");
                    None
                }
            };
        }
        debug!(target = raw, scheme, "Dropping URL with unsupported scheme.");
        return None;
    }

    let authority = raw.split('/').next().unwrap_or_default();
    let host = match authority.strip_prefix('[') {
        Some(v6) => v6.split(']').next().unwrap_or_default(),
        None => authority.split(':').next().unwrap_or_default(),
    };
    if host.is_empty() {
        return None;
    }
    Some(Target::Host(host.to_ascii_lowercase()))
}
