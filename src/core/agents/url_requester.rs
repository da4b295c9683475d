// src/core/agents/url_requester.rs

use super::{Agent, disguise_headers, http_client, status_line};
use crate::core::error::{ProbeError, ProbeResult};
use crate::core::events::{Url, UrlResponsive};
use crate::core::models::Page;
use crate::core::session::Session;
use chrono::{DateTime, Utc};
use color_eyre::eyre::Result;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use x509_parser::prelude::*;

/// `Url` → one GET request; on any HTTP response the page is recorded and
/// `UrlResponsive` is published.
pub struct UrlRequester {
    session: Arc<Session>,
    client: reqwest::Client,
}

impl Agent for UrlRequester {
    const ID: &'static str = "agent:url_requester";

    fn register(session: &Arc<Session>) -> Result<()> {
        let agent = Arc::new(Self {
            session: session.clone(),
            client: http_client(&session.options)?,
        });
        session.bus.subscribe(move |event: Url| {
            let agent = agent.clone();
            async move { agent.on_url(event.url).await }
        });
        Ok(())
    }
}

impl UrlRequester {
    async fn on_url(&self, url: String) {
        debug!(agent = Self::ID, %url, "Received new URL.");
        let _slot = self.session.limiter.acquire().await;

        let response = match self.client.get(&url).headers(disguise_headers()).send().await {
            Ok(response) => response,
            Err(e) => {
                self.session.stats.increment_request_failed();
                debug!(agent = Self::ID, %url, error = %e, "Request failed.");
                return;
            }
        };

        let status = response.status();
        self.session.stats.increment_request_successful();
        self.session.stats.record_response_code(status.as_u16());
        let status = status_line(status);
        info!(%url, %status, "Received response.");

        let page = match self.session.add_page(&url) {
            Ok(page) => page,
            Err(e) => {
                error!(agent = Self::ID, %url, error = %e, "Failed to create page.");
                return;
            }
        };

        let certificate = response
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .map(<[u8]>::to_vec);
        if let Some(der) = certificate {
            match certificate_note(&der) {
                Ok(note) => page.add_note(&note, "tls"),
                Err(e) => debug!(agent = Self::ID, %url, error = %e, "Could not parse peer certificate."),
            }
        }

        record_response(&page, &status, response.headers());
        self.write_headers(&page);

        if self.session.options.save_body {
            match response.bytes().await {
                Ok(body) => self.write_body(&page, &body),
                Err(e) => error!(agent = Self::ID, %url, error = %e, "Failed to read response body."),
            }
        }

        self.session.bus.publish(UrlResponsive { url });
    }

    fn write_headers(&self, page: &Page) {
        let Ok(base) = Session::base_filename(page.url()) else {
            return;
        };
        let relative = format!("headers/{base}.txt");
        let contents = {
            let record = page.lock();
            let mut contents = format!("{}\n", record.status);
            for header in &record.headers {
                contents.push_str(&format!("{}: {}\n", header.name, header.value));
            }
            contents
        };
        match self.session.write_file(&relative, contents) {
            Ok(()) => page.lock().headers_path = relative,
            Err(e) => {
                error!(agent = Self::ID, url = page.url(), path = %relative, error = %e, "Failed to write response headers.")
            }
        }
    }

    fn write_body(&self, page: &Page, body: &[u8]) {
        let Ok(base) = Session::base_filename(page.url()) else {
            return;
        };
        let relative = format!("html/{base}.html");
        match self.session.write_file(&relative, body) {
            Ok(()) => page.lock().body_path = relative,
            Err(e) => {
                error!(agent = Self::ID, url = page.url(), path = %relative, error = %e, "Failed to write response body.")
            }
        }
    }
}

/// Stores the status line and every header, multiple values joined by a space.
/// A page fetched again keeps only the latest response's headers.
fn record_response(page: &Page, status: &str, headers: &HeaderMap) {
    let mut record = page.lock();
    record.status = status.to_string();
    record.headers.clear();
    for name in headers.keys() {
        let value = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        record.add_header(name.as_str(), &value);
    }
}

/// One-line summary of a DER certificate: subject, issuer and validity end.
pub fn certificate_note(der: &[u8]) -> ProbeResult<String> {
    let (_, x509) = parse_x509_certificate(der)
        .map_err(|e| ProbeError::Tls(format!("X.509 parse error: {e}")))?;
    let not_after = asn1_time_to_chrono_utc(&x509.validity().not_after);
    let expired = not_after < Utc::now();
    if expired {
        warn!(subject = %x509.subject(), %not_after, "Peer certificate has expired.");
    }
    Ok(format!(
        "Certificate subject: {} | issuer: {} | expires: {}{}",
        x509.subject(),
        x509.issuer(),
        not_after.format("%Y-%m-%d"),
        if expired { " (expired)" } else { "" }
    ))
}

fn asn1_time_to_chrono_utc(time: &ASN1Time) -> DateTime<Utc> {
    DateTime::from_timestamp(time.timestamp(), 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Options;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves `response` verbatim to every connection.
    async fn serve(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut seen = Vec::new();
                    while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => seen.extend_from_slice(&buf[..n]),
                        }
                    }
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        port
    }

    fn session_in(dir: &std::path::Path, save_body: bool) -> Arc<Session> {
        Arc::new(
            Session::new(Options {
                out_dir: dir.to_path_buf(),
                threads: 2,
                http_timeout: Duration::from_secs(2),
                save_body,
                ..Default::default()
            })
            .unwrap(),
        )
    }

    fn collect_responsive(session: &Arc<Session>) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.bus.subscribe(move |event: UrlResponsive| {
            let sink = sink.clone();
            async move { sink.lock().push(event.url) }
        });
        seen
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_not_found_still_creates_page() {
        let port = serve(
            "HTTP/1.1 404 Not Found\r\nServer: nginx/1.25.3\r\nContent-Type: text/html\r\nContent-Length: 46\r\nConnection: close\r\n\r\n<html><title>Missing</title><p>nope</p></html>",
        )
        .await;
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path(), true);
        UrlRequester::register(&session).unwrap();
        let responsive = collect_responsive(&session);

        let url = format!("http://127.0.0.1:{port}/");
        session.bus.publish(Url { url: url.clone() });
        session.bus.wait_idle().await;

        let stats = session.stats.snapshot();
        assert_eq!(stats.response_code_4xx, 1);
        assert_eq!(stats.request_successful, 1);
        assert_eq!(stats.request_failed, 0);
        assert_eq!(*responsive.lock(), vec![url.clone()]);

        let record = session.get_page(&url).unwrap().snapshot();
        assert_eq!(record.status, "404 Not Found");
        assert!(record.headers.iter().any(|h| h.name == "server" && h.decreases_security));

        let headers = std::fs::read_to_string(session.file_path(&record.headers_path)).unwrap();
        assert!(headers.starts_with("404 Not Found\n"));
        assert!(headers.contains("server: nginx/1.25.3\n"));
        let body = session.read_file(&record.body_path).unwrap();
        assert!(body.starts_with(b"<html><title>Missing</title>"));
        session.bus.clear();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_body_not_saved_when_disabled() {
        let port = serve("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path(), false);
        UrlRequester::register(&session).unwrap();

        let url = format!("http://127.0.0.1:{port}/");
        session.bus.publish(Url { url: url.clone() });
        session.bus.wait_idle().await;

        let record = session.get_page(&url).unwrap().snapshot();
        assert_eq!(session.stats.snapshot().response_code_2xx, 1);
        assert!(record.body_path.is_empty());
        assert!(!record.headers_path.is_empty());
        session.bus.clear();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connection_failure_counts_and_publishes_nothing() {
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path(), true);
        UrlRequester::register(&session).unwrap();
        let responsive = collect_responsive(&session);

        session.bus.publish(Url { url: format!("http://127.0.0.1:{closed}/") });
        session.bus.wait_idle().await;

        assert_eq!(session.stats.snapshot().request_failed, 1);
        assert_eq!(session.page_count(), 0);
        assert!(responsive.lock().is_empty());
        session.bus.clear();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_writes_leave_paths_empty() {
        let port = serve("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path(), true);
        std::fs::remove_dir_all(session.file_path("headers")).unwrap();
        std::fs::remove_dir_all(session.file_path("html")).unwrap();
        UrlRequester::register(&session).unwrap();
        let responsive = collect_responsive(&session);

        let url = format!("http://127.0.0.1:{port}/");
        session.bus.publish(Url { url: url.clone() });
        session.bus.wait_idle().await;

        let record = session.get_page(&url).unwrap().snapshot();
        assert_eq!(record.status, "200 OK");
        assert!(record.headers_path.is_empty());
        assert!(record.body_path.is_empty());
        assert_eq!(*responsive.lock(), vec![url]);
        session.bus.clear();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_repeated_request_replaces_headers() {
        let port = serve("HTTP/1.1 200 OK\r\nServer: nginx\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;
        let dir = tempfile::tempdir().unwrap();
        let session = session_in(dir.path(), false);
        UrlRequester::register(&session).unwrap();

        let url = format!("http://127.0.0.1:{port}/");
        session.bus.publish(Url { url: url.clone() });
        session.bus.wait_idle().await;
        let first = session.get_page(&url).unwrap().snapshot().headers;
        session.bus.publish(Url { url: url.clone() });
        session.bus.wait_idle().await;

        let record = session.get_page(&url).unwrap().snapshot();
        assert_eq!(session.stats.snapshot().request_successful, 2);
        assert_eq!(record.headers.len(), first.len());
        assert_eq!(record.headers.iter().filter(|h| h.name == "server").count(), 1);
        session.bus.clear();
    }

    #[test]
    fn test_certificate_note_rejects_garbage() {
        assert!(certificate_note(b"not a certificate").is_err());
    }
}
