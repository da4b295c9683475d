// src/core/agents/url_publisher.rs

use super::Agent;
use crate::core::error::{ProbeError, ProbeResult};
use crate::core::events::{TcpPort, Url};
use crate::core::session::Session;
use color_eyre::eyre::Result;
use native_tls::TlsConnector;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::spawn_blocking;
use tracing::{debug, error};

/// `TcpPort` → `Url`, choosing `https` when the port completes a TLS handshake.
pub struct UrlPublisher {
    session: Arc<Session>,
}

impl Agent for UrlPublisher {
    const ID: &'static str = "agent:url_publisher";

    fn register(session: &Arc<Session>) -> Result<()> {
        let agent = Arc::new(Self {
            session: session.clone(),
        });
        session.bus.subscribe(move |event: TcpPort| {
            let agent = agent.clone();
            async move { agent.on_tcp_port(event.port, event.host).await }
        });
        Ok(())
    }
}

impl UrlPublisher {
    async fn on_tcp_port(&self, port: u16, host: String) {
        debug!(agent = Self::ID, %host, port, "Received new open port.");
        let _slot = self.session.limiter.acquire().await;
        let scheme = if is_tls(&host, port, self.session.options.http_timeout).await {
            "https"
        } else {
            "http"
        };
        let url = host_and_port_to_url(&host, port, scheme);
        self.session.bus.publish(Url { url });
    }
}

/// Whether `host:port` speaks TLS. 80 and 443 are decided by convention;
/// anything that fails to connect or handshake counts as plaintext.
pub async fn is_tls(host: &str, port: u16, timeout: Duration) -> bool {
    match port {
        80 => return false,
        443 => return true,
        _ => {}
    }
    let host = host.to_string();
    spawn_blocking(move || tls_handshake(&host, port, timeout))
        .await
        .unwrap_or_else(|e| {
            error!(panic = %e, "Blocking TLS probe task panicked!");
            Err(ProbeError::Tls(e.to_string()))
        })
        .inspect_err(|e| debug!(port, error = %e, "TLS handshake failed, assuming plaintext."))
        .is_ok()
}

fn tls_handshake(host: &str, port: u16, timeout: Duration) -> ProbeResult<()> {
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| ProbeError::Tls(e.to_string()))?;

    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ProbeError::Tls(format!("{host} did not resolve")))?;
    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    connector
        .connect(host, stream)
        .map(|_| ())
        .map_err(|e| ProbeError::Tls(e.to_string()))
}

/// `scheme://host[:port]/`, leaving out the scheme's default port.
pub fn host_and_port_to_url(host: &str, port: u16, scheme: &str) -> String {
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    match (scheme, port) {
        ("http", 80) | ("https", 443) => format!("{scheme}://{host}/"),
        _ => format!("{scheme}://{host}:{port}/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Options;
    use crate::core::agents::port_scanner::PortScanner;
    use crate::core::events::Host;
    use parking_lot::Mutex;
    use tokio::net::TcpListener;

    #[test]
    fn test_host_and_port_to_url() {
        assert_eq!(host_and_port_to_url("10.0.0.5", 80, "http"), "http://10.0.0.5/");
        assert_eq!(host_and_port_to_url("example.com", 443, "https"), "https://example.com/");
        assert_eq!(host_and_port_to_url("example.com", 8443, "https"), "https://example.com:8443/");
        assert_eq!(host_and_port_to_url("example.com", 443, "http"), "http://example.com:443/");
        assert_eq!(host_and_port_to_url("::1", 8080, "http"), "http://[::1]:8080/");
    }

    #[tokio::test]
    async fn test_conventional_ports_skip_handshake() {
        let timeout = Duration::from_millis(10);
        assert!(!is_tls("192.0.2.1", 80, timeout).await);
        assert!(is_tls("192.0.2.1", 443, timeout).await);
    }

    #[tokio::test]
    async fn test_plaintext_listener_is_not_tls() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });
        assert!(!is_tls("127.0.0.1", port, Duration::from_millis(500)).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_open_and_closed_port_yield_single_http_url() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };

        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(
            Session::new(Options {
                out_dir: dir.path().to_path_buf(),
                threads: 2,
                ports: vec![open, closed],
                scan_timeout: Duration::from_millis(500),
                http_timeout: Duration::from_millis(500),
                ..Default::default()
            })
            .unwrap(),
        );
        PortScanner::register(&session).unwrap();
        UrlPublisher::register(&session).unwrap();

        let urls = Arc::new(Mutex::new(Vec::new()));
        {
            let urls = urls.clone();
            session.bus.subscribe(move |event: Url| {
                let urls = urls.clone();
                async move { urls.lock().push(event.url) }
            });
        }

        session.bus.publish(Host { host: "127.0.0.1".into() });
        session.bus.wait_idle().await;
        session.limiter.wait_for_idle().await;

        let urls = urls.lock().clone();
        assert_eq!(urls, vec![format!("http://127.0.0.1:{open}/")]);
        assert!(urls.iter().all(|u| !u.starts_with("https")));
        let stats = session.stats.snapshot();
        assert_eq!((stats.port_open, stats.port_closed), (1, 1));
        session.bus.clear();
    }
}
