// src/cli.rs

use crate::core::ports::{MEDIUM_PORT_LIST, parse_port_list};
use clap::{ArgAction, Parser};
use color_eyre::eyre::{Result, bail, eyre};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "vanguard-recon")]
#[command(about = "Discovers web endpoints on a list of hosts, screenshots them and clusters similar pages")]
#[command(version)]
pub struct Args {
    /// Directory to write the run's report folder into
    #[arg(long = "out", default_value = ".", env = "VANGUARD_RECON_OUT_PATH")]
    pub out_dir: PathBuf,

    /// Number of concurrent probes (0 = number of logical CPUs)
    #[arg(long, default_value_t = 0)]
    pub threads: usize,

    /// Ports to scan on hosts. Aliases: small, medium, large, xlarge
    #[arg(long, default_value = "medium")]
    pub ports: String,

    /// Timeout in milliseconds for port scans
    #[arg(long, default_value_t = 600)]
    pub scan_timeout: u64,

    /// Timeout in milliseconds for HTTP requests
    #[arg(long, default_value_t = 3000)]
    pub http_timeout: u64,

    /// Timeout in milliseconds for screenshots
    #[arg(long, default_value_t = 6000)]
    pub screenshot_timeout: u64,

    /// Delay in milliseconds between page load and capture
    #[arg(long, default_value_t = 1000)]
    pub screenshot_delay: u64,

    /// Screenshot resolution as width,height
    #[arg(long, default_value = "1440,900")]
    pub resolution: String,

    /// Path to the Chrome/Chromium executable (searched for when omitted)
    #[arg(long = "browser")]
    pub browser_path: Option<PathBuf>,

    /// Proxy to use for HTTP requests
    #[arg(long)]
    pub proxy: Option<String>,

    /// Save response bodies to files
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub save_body: bool,

    /// Directory of screenshots from an earlier run to compare against
    #[arg(long = "compare")]
    pub compare_dir: Option<PathBuf>,

    /// Hash distance above which a screenshot counts as changed
    #[arg(long, default_value_t = 0)]
    pub diff_threshold: u32,

    /// Load a session file and render its report without probing
    #[arg(long = "session")]
    pub session_path: Option<PathBuf>,

    /// Path to an HTML template to use for the report
    #[arg(long = "template")]
    pub template_path: Option<PathBuf>,

    /// Print debugging information
    #[arg(long)]
    pub debug: bool,

    /// Suppress all output except for errors
    #[arg(long)]
    pub silent: bool,
}

/// Validated run configuration.
#[derive(Debug, Clone)]
pub struct Options {
    pub out_dir: PathBuf,
    pub threads: usize,
    pub ports: Vec<u16>,
    pub scan_timeout: Duration,
    pub http_timeout: Duration,
    pub screenshot_timeout: Duration,
    pub screenshot_delay: Duration,
    pub resolution: (u32, u32),
    pub browser_path: Option<PathBuf>,
    pub proxy: Option<String>,
    pub save_body: bool,
    pub compare_dir: Option<PathBuf>,
    pub diff_threshold: u32,
    pub session_path: Option<PathBuf>,
    pub template_path: Option<PathBuf>,
    pub debug: bool,
    pub silent: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("."),
            threads: default_threads(),
            ports: MEDIUM_PORT_LIST.to_vec(),
            scan_timeout: Duration::from_millis(600),
            http_timeout: Duration::from_millis(3000),
            screenshot_timeout: Duration::from_millis(6000),
            screenshot_delay: Duration::from_millis(1000),
            resolution: (1440, 900),
            browser_path: None,
            proxy: None,
            save_body: true,
            compare_dir: None,
            diff_threshold: 0,
            session_path: None,
            template_path: None,
            debug: false,
            silent: false,
        }
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(1, usize::from)
}

fn require_exists(path: &Path, what: &str) -> Result<()> {
    if !path.exists() {
        bail!("{what} {} does not exist", path.display());
    }
    Ok(())
}

/// Parses `width,height`.
pub fn parse_resolution(raw: &str) -> Result<(u32, u32)> {
    let (w, h) = raw
        .split_once(',')
        .ok_or_else(|| eyre!("invalid resolution {raw:?}, expected width,height"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<u32>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| eyre!("invalid resolution {raw:?}"))
    };
    Ok((parse(w)?, parse(h)?))
}

impl Args {
    pub fn into_options(self) -> Result<Options> {
        if !self.out_dir.exists() {
            bail!("output destination {} does not exist", self.out_dir.display());
        }
        if !self.out_dir.is_dir() {
            bail!("output destination must be a directory: {}", self.out_dir.display());
        }
        if let Some(browser) = &self.browser_path {
            require_exists(browser, "chrome path")?;
        }
        if let Some(session) = &self.session_path {
            require_exists(session, "session path")?;
        }
        if let Some(template) = &self.template_path {
            require_exists(template, "template path")?;
        }
        if let Some(compare) = &self.compare_dir {
            if !compare.is_dir() {
                bail!("comparison directory {} does not exist", compare.display());
            }
        }
        let ports = parse_port_list(&self.ports).map_err(|e| eyre!("invalid port list: {e}"))?;

        Ok(Options {
            out_dir: self.out_dir.components().collect(),
            threads: if self.threads == 0 { default_threads() } else { self.threads },
            ports,
            scan_timeout: Duration::from_millis(self.scan_timeout),
            http_timeout: Duration::from_millis(self.http_timeout),
            screenshot_timeout: Duration::from_millis(self.screenshot_timeout),
            screenshot_delay: Duration::from_millis(self.screenshot_delay),
            resolution: parse_resolution(&self.resolution)?,
            browser_path: self.browser_path,
            proxy: self.proxy.filter(|p| !p.is_empty()),
            save_body: self.save_body,
            compare_dir: self.compare_dir,
            diff_threshold: self.diff_threshold,
            session_path: self.session_path,
            template_path: self.template_path,
            debug: self.debug,
            silent: self.silent,
        })
    }
}
