//! Kiln - an incremental asset pipeline for static sites.

mod build;
mod cli;
mod config;
mod logger;
mod pipeline;
mod reload;
mod serve;
mod site_data;
mod watch;

use anyhow::Result;
use build::build_site;
use clap::Parser;
use cli::Cli;
use config::{Mode, SiteConfig};
use serve::serve_site;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SiteConfig::load(&cli)?;
    config.validate()?;
    log!("kiln"; "{} build of {}", config.mode.name(), config.source_root().display());

    match config.mode {
        Mode::Production => build_site(&config).map(|_| ()),
        Mode::Development => serve_site(&config),
    }
}
