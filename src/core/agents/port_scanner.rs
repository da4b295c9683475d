// src/core/agents/port_scanner.rs

use super::Agent;
use crate::core::error::{ProbeError, ProbeResult};
use crate::core::events::{Host, TcpPort};
use crate::core::session::Session;
use color_eyre::eyre::Result;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// `Host` → one `TcpPort` per open port in the configured list.
pub struct PortScanner {
    session: Arc<Session>,
}

impl Agent for PortScanner {
    const ID: &'static str = "agent:port_scanner";

    fn register(session: &Arc<Session>) -> Result<()> {
        let agent = Arc::new(Self {
            session: session.clone(),
        });
        session.bus.subscribe(move |event: Host| {
            let agent = agent.clone();
            async move { agent.on_host(event.host).await }
        });
        Ok(())
    }
}

impl PortScanner {
    async fn on_host(&self, host: String) {
        debug!(agent = Self::ID, %host, "Received new host.");
        let scans = self.session.ports().iter().map(|&port| {
            let host = host.clone();
            async move {
                let _slot = self.session.limiter.acquire().await;
                match scan_port(&host, port, self.session.options.scan_timeout).await {
                    Ok(()) => {
                        self.session.stats.increment_port_open();
                        debug!(agent = Self::ID, %host, port, "Port open.");
                        self.session.bus.publish(TcpPort { port, host });
                    }
                    Err(e) => {
                        self.session.stats.increment_port_closed();
                        debug!(agent = Self::ID, %host, port, error = %e, "Port closed.");
                    }
                }
            }
        });
        join_all(scans).await;
    }
}

/// Plain TCP connect bounded by `timeout`.
pub async fn scan_port(host: &str, port: u16, timeout: Duration) -> ProbeResult<()> {
    let target = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_scan_port_open_and_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let timeout = Duration::from_millis(500);
        assert!(scan_port("127.0.0.1", open, timeout).await.is_ok());
        assert!(scan_port("127.0.0.1", closed, timeout).await.is_err());
    }
}
