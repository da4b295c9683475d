// src/core/agents/hostname_resolver.rs

use super::Agent;
use crate::core::error::ProbeResult;
use crate::core::events::UrlResponsive;
use crate::core::session::Session;
use color_eyre::eyre::Result;
use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// `UrlResponsive` → addresses of the page's host.
pub struct HostnameResolver {
    session: Arc<Session>,
    resolver: TokioAsyncResolver,
}

impl Agent for HostnameResolver {
    const ID: &'static str = "agent:hostname_resolver";

    fn register(session: &Arc<Session>) -> Result<()> {
        let agent = Arc::new(Self {
            session: session.clone(),
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
        });
        session.bus.subscribe(move |event: UrlResponsive| {
            let agent = agent.clone();
            async move { agent.on_url_responsive(event.url).await }
        });
        Ok(())
    }
}

impl HostnameResolver {
    async fn on_url_responsive(&self, url: String) {
        debug!(agent = Self::ID, %url, "Received new responsive URL.");
        let page = match self.session.require_page(&url) {
            Ok(page) => page,
            Err(e) => {
                error!(agent = Self::ID, %url, error = %e, "Unable to find page.");
                return;
            }
        };

        if page.is_ip_host() {
            page.lock().addrs = vec![page.hostname().to_string()];
            return;
        }

        let _slot = self.session.limiter.acquire().await;
        match resolve(&self.resolver, page.hostname()).await {
            Ok(addrs) => {
                debug!(agent = Self::ID, host = page.hostname(), count = addrs.len(), "Resolved hostname.");
                page.lock().addrs = addrs.iter().map(IpAddr::to_string).collect();
            }
            Err(e) => warn!(agent = Self::ID, host = page.hostname(), error = %e, "Unable to resolve hostname."),
        }
    }
}

/// All A and AAAA addresses of `hostname`.
pub async fn resolve(resolver: &TokioAsyncResolver, hostname: &str) -> ProbeResult<Vec<IpAddr>> {
    let lookup = resolver.lookup_ip(hostname).await?;
    Ok(lookup.iter().collect())
}
