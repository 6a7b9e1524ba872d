//! Command-line interface definitions.
//!
//! One entry point, one mode flag.

use crate::config::Mode;
use clap::Parser;
use std::path::PathBuf;

/// Kiln incremental asset pipeline CLI
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Production runs one clean build; development watches, serves and live reloads
    #[arg(short, long, value_enum, default_value_t = Mode::Production)]
    pub mode: Mode,

    /// Project root directory
    #[arg(short, long)]
    pub root: Option<PathBuf>,

    /// Config file name, relative to root (default: kiln.toml)
    #[arg(short = 'C', long, default_value = "kiln.toml")]
    pub config: PathBuf,
}
