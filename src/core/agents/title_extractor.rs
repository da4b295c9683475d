// src/core/agents/title_extractor.rs

use super::Agent;
use crate::core::events::UrlResponsive;
use crate::core::session::Session;
use color_eyre::eyre::Result;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use std::sync::Arc;
use tracing::{debug, error};

static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());

/// `UrlResponsive` → page title from the saved body.
pub struct TitleExtractor {
    session: Arc<Session>,
}

impl Agent for TitleExtractor {
    const ID: &'static str = "agent:title_extractor";

    fn register(session: &Arc<Session>) -> Result<()> {
        let agent = Arc::new(Self {
            session: session.clone(),
        });
        session.bus.subscribe(move |event: UrlResponsive| {
            let agent = agent.clone();
            async move { agent.on_url_responsive(event.url).await }
        });
        Ok(())
    }
}

impl TitleExtractor {
    async fn on_url_responsive(&self, url: String) {
        debug!(agent = Self::ID, %url, "Received new responsive URL.");
        let page = match self.session.require_page(&url) {
            Ok(page) => page,
            Err(e) => {
                error!(agent = Self::ID, %url, error = %e, "Unable to find page.");
                return;
            }
        };

        let body_path = page.lock().body_path.clone();
        if body_path.is_empty() {
            return;
        }

        let _slot = self.session.limiter.acquire().await;
        let body = match tokio::fs::read(self.session.file_path(&body_path)).await {
            Ok(body) => body,
            Err(e) => {
                error!(agent = Self::ID, %url, path = %body_path, error = %e, "Unable to read HTML body.");
                return;
            }
        };
        if let Some(title) = extract_title(&String::from_utf8_lossy(&body)) {
            debug!(agent = Self::ID, %url, %title, "Extracted title.");
            page.lock().page_title = title;
        }
    }
}

/// Text of the first `<title>` in document order whose trimmed text is not empty.
pub fn extract_title(body: &str) -> Option<String> {
    Html::parse_document(body)
        .select(&TITLE)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .find(|title| !title.is_empty())
}
