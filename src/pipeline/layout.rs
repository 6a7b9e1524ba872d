//! Where a stage writes its outputs.
//!
//! | Stage   | Source                      | Output                           |
//! |---------|-----------------------------|----------------------------------|
//! | data    | `data/site.json`            | memory (site data)               |
//! | views   | `views/**`, `**/_*.njk`     | memory                           |
//! | html    | `<rel>.njk`                 | `<out>/<rel>.html`               |
//! | css     | `assets/css/<rel>.scss`     | `<out>/assets/css/<rel>.min.css` |
//! | js      | `assets/js/<rel>.js`        | `<out>/assets/js/<rel>.min.js`   |
//! | images  | `assets/images/<rel>`       | `<out>/assets/images/<rel>`      |
//! | static  | `static/<rel>`              | `<out>/<rel>`                    |

use crate::config::SiteConfig;
use kiln_core::Stage;
use std::path::{Path, PathBuf};

/// How an output file name derives from its source name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rename {
    Keep,
    /// Replace the extension: `about.njk` → `about.html`.
    Extension(&'static str),
    /// Replace the extension with a compound one: `app.scss` → `app.min.css`.
    Suffix(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Results stay in the stage report.
    Memory,
    /// Mirror `source_dir` into `output_dir`.
    Dir {
        source_dir: PathBuf,
        output_dir: PathBuf,
        rename: Rename,
    },
}

impl Destination {
    pub fn for_stage(stage: Stage, config: &SiteConfig) -> Self {
        let out = config.output_root();
        let (output_dir, rename) = match stage {
            Stage::Data | Stage::Views => return Self::Memory,
            Stage::Html => (out.to_path_buf(), Rename::Extension("html")),
            Stage::Styles => (out.join(&config.build.stylesheets), Rename::Suffix("min.css")),
            Stage::Scripts => (out.join(&config.build.scripts), Rename::Suffix("min.js")),
            Stage::Images => (out.join(&config.build.images), Rename::Keep),
            Stage::Static => (out.to_path_buf(), Rename::Keep),
        };
        Self::Dir {
            source_dir: config.source_dir(stage),
            output_dir,
            rename,
        }
    }

    /// Output path of `source`, or `None` for in-memory stages and sources
    /// outside the stage directory.
    pub fn output_path(&self, source: &Path) -> Option<PathBuf> {
        let Self::Dir {
            source_dir,
            output_dir,
            rename,
        } = self
        else {
            return None;
        };
        let rel = source.strip_prefix(source_dir).ok()?;
        let target = output_dir.join(rel);

        Some(match rename {
            Rename::Keep => target,
            Rename::Extension(ext) => target.with_extension(ext),
            Rename::Suffix(suffix) => {
                let stem = target.file_stem()?.to_string_lossy();
                target.with_file_name(format!("{stem}.{suffix}"))
            }
        })
    }

    /// Whether outputs of this destination get a source map in development.
    pub fn maps_sources(&self) -> bool {
        matches!(
            self,
            Self::Dir {
                rename: Rename::Suffix(_),
                ..
            }
        )
    }
}

/// `app.min.css` → `app.min.css.map`.
pub fn map_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".map");
    PathBuf::from(name)
}
