// src/core/agents/screenshotter.rs

use super::Agent;
use super::browser::ChromeRenderer;
use super::capture::{Outcome, Renderer, Sink, capture};
use super::image_diff::{dhash, distance};
use crate::core::error::ProbeResult;
use crate::core::events::{SessionEnd, UrlResponsive};
use crate::core::models::Page;
use crate::core::session::Session;
use color_eyre::eyre::Result;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// `UrlResponsive` → `screenshots/<base>.png`, compared against a reference
/// run when one is configured. `SessionEnd` shuts the browser down.
pub struct Screenshotter {
    session: Arc<Session>,
    renderer: Arc<dyn Renderer>,
    chrome: Option<Arc<ChromeRenderer>>,
}

impl Agent for Screenshotter {
    const ID: &'static str = "agent:screenshotter";

    fn register(session: &Arc<Session>) -> Result<()> {
        let chrome = Arc::new(ChromeRenderer::new(&session.options)?);
        debug!(agent = Self::ID, profile = %chrome.profile_path().display(), "Created temporary browser profile.");
        Self::with_renderer(session, chrome.clone(), Some(chrome));
        Ok(())
    }
}

impl Screenshotter {
    fn with_renderer(session: &Arc<Session>, renderer: Arc<dyn Renderer>, chrome: Option<Arc<ChromeRenderer>>) {
        let agent = Arc::new(Self {
            session: session.clone(),
            renderer,
            chrome,
        });
        {
            let agent = agent.clone();
            session.bus.subscribe(move |event: UrlResponsive| {
                let agent = agent.clone();
                async move { agent.on_url_responsive(event.url).await }
            });
        }
        session.bus.subscribe(move |_: SessionEnd| {
            let agent = agent.clone();
            async move { agent.on_session_end().await }
        });
    }

    async fn on_url_responsive(&self, url: String) {
        debug!(agent = Self::ID, %url, "Received new responsive URL.");
        let page = match self.session.require_page(&url) {
            Ok(page) => page,
            Err(e) => {
                error!(agent = Self::ID, %url, error = %e, "Unable to find page.");
                return;
            }
        };
        let base = match Session::base_filename(&url) {
            Ok(base) => base,
            Err(e) => {
                error!(agent = Self::ID, %url, error = %e, "Unable to derive file name.");
                return;
            }
        };

        let _slot = self.session.limiter.acquire().await;
        let relative = format!("screenshots/{base}.png");
        let sink: Sink = {
            let session = self.session.clone();
            let relative = relative.clone();
            Arc::new(move |png: &[u8]| -> ProbeResult<()> { Ok(session.write_file(&relative, png)?) })
        };

        let options = &self.session.options;
        let outcome = capture(
            self.renderer.as_ref(),
            &url,
            options.screenshot_delay,
            options.screenshot_timeout,
            sink,
        )
        .await;

        match outcome {
            Outcome::Success => {
                self.session.stats.increment_screenshot_successful();
                {
                    let mut record = page.lock();
                    record.screenshot_path = relative.clone();
                    record.has_screenshot = true;
                }
                info!(%url, "Screenshot captured.");
                self.compare_with_reference(&page, &base, &relative);
            }
            Outcome::Failure(reason) => {
                self.session.stats.increment_screenshot_failed();
                warn!(agent = Self::ID, %url, %reason, "Screenshot failed.");
            }
        }
    }

    fn compare_with_reference(&self, page: &Page, base: &str, relative: &str) {
        let Some(compare_dir) = &self.session.options.compare_dir else {
            return;
        };
        let reference = compare_dir.join(format!("{base}.png"));
        if !reference.is_file() {
            return;
        }
        let hashes = dhash(&self.session.file_path(relative)).and_then(|new| Ok((new, dhash(&reference)?)));
        match hashes {
            Ok((new, old)) => {
                let difference = distance(new, old);
                let mut record = page.lock();
                record.screenshot_difference = difference;
                record.different = difference > self.session.options.diff_threshold;
                debug!(agent = Self::ID, url = page.url(), difference, "Compared with reference screenshot.");
            }
            Err(e) => warn!(agent = Self::ID, url = page.url(), error = %e, "Unable to compare screenshots."),
        }
    }

    async fn on_session_end(&self) {
        if let Some(chrome) = &self.chrome {
            debug!(agent = Self::ID, "Shutting down browser.");
            chrome.shutdown().await;
        }
    }
}
