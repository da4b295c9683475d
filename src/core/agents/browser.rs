// src/core/agents/browser.rs

use super::capture::{RenderTab, Renderer};
use super::random_user_agent;
use crate::cli::Options;
use crate::core::error::{ProbeError, ProbeResult};
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, CaptureScreenshotParams};
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, BrowserConfig, Page};
use color_eyre::eyre::{Result, WrapErr};
use futures::StreamExt;
use futures::future::{BoxFuture, FutureExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// One shared headless Chrome, launched on first use, with a throwaway profile.
pub struct ChromeRenderer {
    resolution: (u32, u32),
    executable: Option<PathBuf>,
    proxy: Option<String>,
    profile: parking_lot::Mutex<Option<TempDir>>,
    profile_path: PathBuf,
    browser: RwLock<Option<Browser>>,
    handler: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ChromeRenderer {
    /// Creates the temporary profile directory. Failing to do so is fatal.
    pub fn new(options: &Options) -> Result<Self> {
        let profile = tempfile::Builder::new()
            .prefix("vanguard-recon-chrome-")
            .tempdir()
            .wrap_err("can't create temporary browser profile directory")?;
        Ok(Self {
            resolution: options.resolution,
            executable: options.browser_path.clone(),
            proxy: options.proxy.clone(),
            profile_path: profile.path().to_path_buf(),
            profile: parking_lot::Mutex::new(Some(profile)),
            browser: RwLock::new(None),
            handler: parking_lot::Mutex::new(None),
        })
    }

    pub fn profile_path(&self) -> &std::path::Path {
        &self.profile_path
    }

    fn config(&self) -> ProbeResult<BrowserConfig> {
        let (width, height) = self.resolution;
        let mut builder = BrowserConfig::builder()
            .window_size(width, height)
            .viewport(Viewport {
                width,
                height,
                ..Default::default()
            })
            .user_data_dir(&self.profile_path)
            .arg(format!("--user-agent={}", random_user_agent()))
            .arg("--ignore-certificate-errors")
            .arg("--disable-crash-reporter")
            .arg("--disable-notifications")
            .arg("--hide-scrollbars")
            .arg("--mute-audio")
            .arg("--no-first-run")
            .arg("--no-sandbox");
        if let Some(proxy) = &self.proxy {
            builder = builder.arg(format!("--proxy-server={proxy}"));
        }
        if let Some(executable) = &self.executable {
            builder = builder.chrome_executable(executable);
        }
        builder.build().map_err(ProbeError::Render)
    }

    async fn launch(&self) -> ProbeResult<()> {
        let mut slot = self.browser.write().await;
        if slot.is_some() {
            return Ok(());
        }
        let (browser, mut handler) = Browser::launch(self.config()?).await?;
        let task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    trace!(error = %e, "Browser handler error.");
                }
            }
            debug!("Browser handler finished.");
        });
        *self.handler.lock() = Some(task);
        *slot = Some(browser);
        info!(profile = %self.profile_path.display(), "Launched headless browser.");
        Ok(())
    }

    async fn new_page(&self) -> ProbeResult<Page> {
        loop {
            if let Some(browser) = self.browser.read().await.as_ref() {
                return Ok(browser.new_page("about:blank").await?);
            }
            self.launch().await?;
        }
    }

    /// Closes the browser and removes the profile directory.
    pub async fn shutdown(&self) {
        if let Some(mut browser) = self.browser.write().await.take() {
            if let Err(e) = browser.close().await {
                warn!(error = %e, "Failed to close browser.");
            }
            if let Err(e) = browser.wait().await {
                warn!(error = %e, "Failed waiting for browser exit.");
            }
        }
        let handler = self.handler.lock().take();
        if let Some(handler) = handler {
            handler.abort();
        }
        if let Some(profile) = self.profile.lock().take() {
            if let Err(e) = profile.close() {
                warn!(error = %e, "Failed to remove temporary browser profile.");
            }
        }
    }
}

impl Renderer for ChromeRenderer {
    fn open_tab(&self) -> BoxFuture<'_, ProbeResult<Arc<dyn RenderTab>>> {
        async move {
            let page = self.new_page().await?;
            Ok(Arc::new(ChromeTab { page }) as Arc<dyn RenderTab>)
        }
        .boxed()
    }
}

struct ChromeTab {
    page: Page,
}

impl ChromeTab {
    async fn png(&self) -> ProbeResult<Vec<u8>> {
        let params = CaptureScreenshotParams {
            format: Some(CaptureScreenshotFormat::Png),
            ..Default::default()
        };
        Ok(self.page.screenshot(params).await?)
    }
}

impl RenderTab for ChromeTab {
    fn navigate_and_capture(&self, url: &str, delay: Duration) -> BoxFuture<'_, ProbeResult<Vec<u8>>> {
        let url = url.to_string();
        async move {
            self.page.goto(url.as_str()).await?;
            tokio::time::sleep(delay).await;
            self.png().await
        }
        .boxed()
    }

    fn capture_current(&self) -> BoxFuture<'_, ProbeResult<Vec<u8>>> {
        self.png().boxed()
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        let page = self.page.clone();
        async move {
            if let Err(e) = page.close().await {
                debug!(error = %e, "Failed to close tab.");
            }
        }
        .boxed()
    }
}
