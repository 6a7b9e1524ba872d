//! `[source]` section configuration.
//!
//! Describes the fixed layout of the source tree. Every path except `root`
//! is relative to `root`.

use super::defaults;
use educe::Educe;
use kiln_core::{GlobError, PatternSet, Stage, glob::to_slash};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// `[source]` section in kiln.toml - source tree layout.
///
/// # Example
/// ```toml
/// [source]
/// root = "src"
/// data = "data/site.json"
/// views = "views"
/// stylesheets = "assets/css"
/// ```
#[derive(Debug, Clone, Educe, Serialize, Deserialize)]
#[educe(Default)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    /// Source root, relative to the project root.
    #[serde(default = "defaults::source::root")]
    #[educe(Default = defaults::source::root())]
    pub root: PathBuf,

    /// The single site data JSON file.
    #[serde(default = "defaults::source::data")]
    #[educe(Default = defaults::source::data())]
    pub data: PathBuf,

    /// Template partials and layouts.
    #[serde(default = "defaults::source::views")]
    #[educe(Default = defaults::source::views())]
    pub views: PathBuf,

    /// Extension of page templates and partials.
    #[serde(default = "defaults::source::template_ext")]
    #[educe(Default = defaults::source::template_ext())]
    pub template_ext: String,

    #[serde(default = "defaults::source::stylesheets")]
    #[educe(Default = defaults::source::stylesheets())]
    pub stylesheets: PathBuf,

    #[serde(default = "defaults::source::scripts")]
    #[educe(Default = defaults::source::scripts())]
    pub scripts: PathBuf,

    #[serde(default = "defaults::source::images")]
    #[educe(Default = defaults::source::images())]
    pub images: PathBuf,

    /// Files copied verbatim to the output root.
    #[serde(rename = "static", default = "defaults::source::statics")]
    #[educe(Default = defaults::source::statics())]
    pub statics: PathBuf,
}

impl SourceConfig {
    /// Directory a stage reads from, relative to the source root.
    ///
    /// Pages and underscore partials live anywhere under the root.
    pub fn dir(&self, stage: Stage) -> &Path {
        match stage {
            Stage::Data => self.data.parent().unwrap_or(Path::new("")),
            Stage::Views | Stage::Html => Path::new(""),
            Stage::Styles => &self.stylesheets,
            Stage::Scripts => &self.scripts,
            Stage::Images => &self.images,
            Stage::Static => &self.statics,
        }
    }

    /// Every file the stage reads, including ones that produce no output.
    pub fn sources(&self, stage: Stage) -> Result<PatternSet, GlobError> {
        let ext = &self.template_ext;
        match stage {
            Stage::Data => PatternSet::new([to_slash(&self.data)]),
            Stage::Views => PatternSet::new([
                under(&self.views, &format!("**/*.{ext}")),
                format!("**/_*.{ext}"),
            ]),
            Stage::Html => PatternSet::new([format!("**/*.{ext}")])?
                .exclude(&under(&self.views, "**"))?
                .exclude("**/_*"),
            Stage::Styles => {
                PatternSet::new([under(&self.stylesheets, "**/*.{scss,sass,css}")])
            }
            Stage::Scripts => PatternSet::new([under(&self.scripts, "**/*.{js,mjs}")]),
            Stage::Images => PatternSet::new([under(&self.images, "**")]),
            Stage::Static => PatternSet::new([under(&self.statics, "**")]),
        }
    }

    /// The subset of sources that produce an output of their own.
    ///
    /// Underscore-prefixed stylesheets are import-only partials.
    pub fn entries(&self, stage: Stage) -> Result<PatternSet, GlobError> {
        match stage {
            Stage::Styles => self.sources(stage)?.exclude("**/_*"),
            _ => self.sources(stage),
        }
    }
}

/// Join a glob suffix onto a relative directory.
fn under(dir: &Path, suffix: &str) -> String {
    let dir = to_slash(dir);
    if dir.is_empty() {
        suffix.to_owned()
    } else {
        format!("{dir}/{suffix}")
    }
}
