//! Site configuration management for `kiln.toml`.
//!
//! The config file is optional: every field has a default matching the
//! conventional layout (`src/` in, `dist/` out).
//!
//! # Sections
//!
//! | Section      | Purpose                                             |
//! |--------------|-----------------------------------------------------|
//! | `[source]`   | Source tree layout                                  |
//! | `[build]`    | Output layout, stylesheet options, processor commands |
//! | `[serve]`    | Development server (port, reload port, watch)       |
//!
//! # Example
//!
//! ```toml
//! [source]
//! root = "src"
//!
//! [build]
//! output = "dist"
//!
//! [build.commands]
//! styles = ["sass", "--stdin"]
//!
//! [serve]
//! port = 5277
//! ```

mod build;
pub mod defaults;
mod error;
mod serve;
mod source;

pub use build::{BuildConfig, CommandsConfig, StylesheetOptions};
pub use error::ConfigError;
pub use serve::ServeConfig;
pub use source::SourceConfig;

use crate::cli::Cli;
use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use kiln_core::Stage;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Build mode, selected on the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Clean one-shot build
    #[default]
    Production,
    /// Seed the output, then watch, rebuild and live reload
    Development,
}

impl Mode {
    pub const fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Development => "development",
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration structure representing kiln.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    /// Absolute path to the config file (set after loading)
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Selected build mode (set from CLI)
    #[serde(skip)]
    pub mode: Mode,

    /// Source tree layout
    #[serde(default)]
    pub source: SourceConfig,

    /// Build settings
    #[serde(default)]
    pub build: BuildConfig,

    /// Development server settings
    #[serde(default)]
    pub serve: ServeConfig,
}

impl SiteConfig {
    /// Parse configuration from TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: SiteConfig = toml::from_str(content).map_err(ConfigError::from)?;
        Ok(config)
    }

    /// Load configuration from file path
    pub fn from_path(path: &Path) -> Result<Self> {
        let content =
            fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;
        Self::from_str(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Load the config named on the command line, falling back to defaults
    /// when the file does not exist.
    pub fn load(cli: &Cli) -> Result<Self> {
        let root = cli
            .root
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| PathBuf::from("./"));
        let config_path = root.join(&cli.config);

        let mut config = if config_path.exists() {
            Self::from_path(&config_path)?
        } else {
            Self::default()
        };
        config.mode = cli.mode;
        config.config_path = normalize_path(&config_path);
        config.update_path_with_root(&root);
        Ok(config)
    }

    /// Make every configured directory absolute.
    pub fn update_path_with_root(&mut self, root: &Path) {
        let root = normalize_path(root);
        self.source.root = normalize_path(&root.join(expand_tilde(&self.source.root)));
        self.build.output = normalize_path(&root.join(expand_tilde(&self.build.output)));
    }

    pub fn source_root(&self) -> &Path {
        &self.source.root
    }

    pub fn output_root(&self) -> &Path {
        &self.build.output
    }

    /// Absolute directory a stage reads from.
    pub fn source_dir(&self, stage: Stage) -> PathBuf {
        self.source.root.join(self.source.dir(stage))
    }

    /// Validate configuration. Every failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        let source = self.source_root();
        if !source.is_dir() {
            bail!(ConfigError::MissingSource(source.to_path_buf()));
        }

        let output = self.output_root();
        if source.starts_with(output) {
            bail!(ConfigError::Validation(format!(
                "[build.output] `{}` contains the source root; cleaning it would delete sources",
                output.display()
            )));
        }

        if self.source.template_ext.is_empty() || self.source.template_ext.contains('/') {
            bail!(ConfigError::Validation(
                "[source.template_ext] must be a bare extension like `njk`".into()
            ));
        }

        for (field, command) in self.build.commands.iter() {
            Self::check_command_installed(field, command)?;
        }

        Ok(())
    }

    /// Check if a command is installed and available
    fn check_command_installed(field: &str, command: &[String]) -> Result<()> {
        let Some(cmd) = command.first() else {
            bail!(ConfigError::Validation(format!(
                "{field} must have at least one element"
            )));
        };

        which::which(cmd)
            .with_context(|| format!("`{cmd}` not found. Please install it first."))?;

        Ok(())
    }
}

/// Expand a leading `~` to the home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).into_owned()),
        None => path.to_path_buf(),
    }
}

/// Normalize a path to absolute, using canonicalize if the path exists
pub fn normalize_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        // For non-existent paths, manually make them absolute
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
