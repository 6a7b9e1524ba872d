//! `[build]` section configuration.
//!
//! Contains the output layout, stylesheet options and external processor
//! commands.

use super::defaults;
use educe::Educe;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// `[build]` section in kiln.toml - build pipeline configuration.
///
/// # Example
/// ```toml
/// [build]
/// output = "dist"
/// minify_html = false
///
/// [build.stylesheet]
/// vendor_prefixing = true
/// minify = true
/// group_media_queries = true
///
/// [build.commands]
/// styles = ["sass", "--stdin", "--load-path={dir}"]
/// scripts = ["esbuild", "--minify"]
/// ```
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Output root, relative to the project root.
    #[serde(default = "defaults::build::output")]
    #[educe(Default = defaults::build::output())]
    pub output: PathBuf,

    /// Stylesheet output directory, relative to the output root.
    #[serde(default = "defaults::build::stylesheets")]
    #[educe(Default = defaults::build::stylesheets())]
    pub stylesheets: PathBuf,

    /// Script output directory, relative to the output root.
    #[serde(default = "defaults::build::scripts")]
    #[educe(Default = defaults::build::scripts())]
    pub scripts: PathBuf,

    /// Image output directory, relative to the output root.
    #[serde(default = "defaults::build::images")]
    #[educe(Default = defaults::build::images())]
    pub images: PathBuf,

    /// Minify rendered pages.
    #[serde(default = "defaults::r#false")]
    #[educe(Default = false)]
    pub minify_html: bool,

    /// Write a `.map` file next to every stylesheet and script in development mode.
    #[serde(default = "defaults::r#true")]
    #[educe(Default = true)]
    pub source_maps: bool,

    /// Options handed to the stylesheet processor.
    #[serde(default)]
    pub stylesheet: StylesheetOptions,

    /// External processor commands, per stage.
    #[serde(default)]
    pub commands: CommandsConfig,
}

/// `[build.stylesheet]` - options the stylesheet processor recognizes.
#[derive(Debug, Clone, Copy, Educe, Serialize, Deserialize, PartialEq, Eq)]
#[educe(Default)]
#[serde(default, deny_unknown_fields)]
pub struct StylesheetOptions {
    #[serde(default = "defaults::r#true")]
    #[educe(Default = true)]
    pub vendor_prefixing: bool,

    #[serde(default = "defaults::r#true")]
    #[educe(Default = true)]
    pub minify: bool,

    #[serde(default = "defaults::r#true")]
    #[educe(Default = true)]
    pub group_media_queries: bool,
}

/// `[build.commands]` - external processors.
///
/// Each command receives the file content on stdin and must print the
/// processed content on stdout. `{path}` and `{dir}` in arguments expand to
/// the source file and its directory. Stages without a command use the
/// built-in processor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandsConfig {
    pub html: Option<Vec<String>>,
    pub styles: Option<Vec<String>>,
    pub scripts: Option<Vec<String>>,
    pub images: Option<Vec<String>>,
}

impl CommandsConfig {
    /// Configured commands with their config key, for validation.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &[String])> {
        [
            ("[build.commands.html]", &self.html),
            ("[build.commands.styles]", &self.styles),
            ("[build.commands.scripts]", &self.scripts),
            ("[build.commands.images]", &self.images),
        ]
        .into_iter()
        .filter_map(|(key, cmd)| cmd.as_deref().map(|cmd| (key, cmd)))
    }
}
