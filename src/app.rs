// src/app.rs

use crate::cli::Options;
use crate::core::agents;
use crate::core::events::{Host, SessionEnd, SessionStart, Url};
use crate::core::report::ReportRenderer;
use crate::core::session::{Session, SessionSnapshot};
use crate::core::similarity::{cluster_pages, page_structure};
use crate::core::targets::{Target, classify_target, extract_targets};
use color_eyre::eyre::{Result, WrapErr, bail};
use std::io::{IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub const SESSION_FILE: &str = "vanguard_session.json";
pub const REPORT_FILE: &str = "vanguard_report.html";
pub const URLS_FILE: &str = "vanguard_urls.txt";

/// Drives one run: seeds the bus, waits for the pipeline to drain, then
/// clusters pages and writes the session and report.
pub struct App {
    session: Arc<Session>,
    renderer: ReportRenderer,
}

impl App {
    pub fn new(options: Options) -> Result<Self> {
        let renderer = ReportRenderer::from_path(options.template_path.as_deref())?;
        let session = Arc::new(Session::new(options)?);
        Ok(Self { session, renderer })
    }

    #[cfg(test)]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn run(&self) -> Result<()> {
        if let Some(path) = self.session.options.session_path.clone() {
            return self.render_saved_session(&path);
        }

        agents::register_all(&self.session)?;
        let targets = read_stdin_targets().await?;
        self.process(targets).await;
        Ok(())
    }

    /// Re-renders a report from a saved snapshot without probing anything.
    pub fn render_saved_session(&self, path: &Path) -> Result<()> {
        let snapshot = SessionSnapshot::load(path)?;
        let restored = self.session.restore(snapshot);
        let html = self.renderer.render(&restored.snapshot())?;
        restored
            .write_file(REPORT_FILE, html)
            .wrap_err("writing HTML report")?;
        info!(path = %restored.file_path(REPORT_FILE).display(), "Wrote HTML report.");
        Ok(())
    }

    /// Runs the registered pipeline over `targets` and writes every output.
    pub async fn process(&self, targets: Vec<String>) {
        let session = &self.session;
        info!(
            targets = targets.len(),
            threads = session.limiter.capacity(),
            ports = ?session.ports(),
            out = %session.root().display(),
            "Starting pipeline."
        );

        session.start();
        session.bus.publish(SessionStart);
        for raw in &targets {
            match classify_target(raw) {
                Some(Target::Host(host)) => session.bus.publish(Host { host }),
                Some(Target::Url(url)) => session.bus.publish(Url { url }),
                None => debug!(target = %raw, "Skipping unusable target."),
            }
        }

        self.wait_quiescent().await;
        session.bus.publish(SessionEnd);
        self.wait_quiescent().await;

        self.compute_page_structures();
        self.cluster();
        session.end();

        match session.save_to_file(SESSION_FILE) {
            Ok(()) => info!(path = %session.file_path(SESSION_FILE).display(), "Wrote session file."),
            Err(e) => error!(error = %e, "Failed to write session file."),
        }
        match self.write_report() {
            Ok(()) => info!(path = %session.file_path(REPORT_FILE).display(), "Wrote HTML report."),
            Err(e) => error!(error = %e, "Failed to write HTML report."),
        }

        self.log_summary();
        session.bus.clear();
    }

    /// Waits until no handler is running and no limiter slot is held. Both
    /// checks repeat until they agree in one pass.
    async fn wait_quiescent(&self) {
        let session = &self.session;
        loop {
            session.bus.wait_idle().await;
            session.limiter.wait_for_idle().await;
            if session.bus.in_flight() == 0 && session.limiter.occupied() == 0 {
                return;
            }
        }
    }

    /// Fills in structural signatures for pages with a saved body and lists
    /// those pages in the URL file.
    fn compute_page_structures(&self) {
        let session = &self.session;
        let mut urls = String::new();
        for page in session.pages() {
            let body_path = page.lock().body_path.clone();
            if body_path.is_empty() {
                continue;
            }
            match session.read_file(&body_path) {
                Ok(body) => page.lock().page_structure = page_structure(&body),
                Err(e) => warn!(url = page.url(), error = %e, "Unable to read body for page structure."),
            }
            urls.push_str(page.url());
            urls.push('\n');
        }
        if urls.is_empty() {
            return;
        }
        if let Err(e) = append(&session.file_path(URLS_FILE), &urls) {
            error!(error = %e, "Failed to write URL list.");
        }
    }

    fn cluster(&self) {
        let signatures: Vec<(String, Vec<String>)> = self
            .session
            .pages()
            .into_iter()
            .filter_map(|page| {
                let record = page.lock();
                (!record.body_path.is_empty()).then(|| (record.url.clone(), record.page_structure.clone()))
            })
            .collect();
        let clusters = cluster_pages(&signatures);
        info!(pages = signatures.len(), clusters = clusters.len(), "Clustered pages by structure.");
        self.session.set_clusters(clusters);
    }

    fn write_report(&self) -> Result<()> {
        let html = self.renderer.render(&self.session.snapshot())?;
        self.session.write_file(REPORT_FILE, html)?;
        Ok(())
    }

    fn log_summary(&self) {
        let stats = self.session.stats.snapshot();
        info!(
            started = %stats.started_at.format("%Y-%m-%d %H:%M:%S"),
            finished = ?stats.finished_at.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
            seconds = stats.duration().num_seconds(),
            "Run complete."
        );
        info!(
            successful = stats.request_successful,
            failed = stats.request_failed,
            code_2xx = stats.response_code_2xx,
            code_3xx = stats.response_code_3xx,
            code_4xx = stats.response_code_4xx,
            code_5xx = stats.response_code_5xx,
            "Requests."
        );
        info!(
            successful = stats.screenshot_successful,
            failed = stats.screenshot_failed,
            "Screenshots."
        );
    }
}

fn append(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(contents.as_bytes())
}

/// Targets piped in on stdin. A terminal or an input without targets is an error.
async fn read_stdin_targets() -> Result<Vec<String>> {
    if std::io::stdin().is_terminal() {
        bail!("no targets on stdin. Feed me: cat hosts.txt | vanguard-recon");
    }
    let targets = tokio::task::spawn_blocking(|| extract_targets(std::io::stdin().lock()))
        .await
        .wrap_err("stdin reader panicked")?
        .wrap_err("reading targets from stdin")?;
    if targets.is_empty() {
        bail!("no targets found in input");
    }
    Ok(targets)
}
