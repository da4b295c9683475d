// src/main.rs

use clap::Parser;
use color_eyre::eyre::Result;
use tracing::{debug, info};

mod app;
mod cli;
mod core;
mod logging;

use app::App;
use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let options = Args::parse().into_options()?;
    let log_path = logging::initialize_logging(options.debug, options.silent)?;
    debug!(log = %log_path.display(), "Logging initialized.");
    info!(version = env!("CARGO_PKG_VERSION"), "vanguard-recon starting.");

    let app = App::new(options)?;
    app.run().await
}
