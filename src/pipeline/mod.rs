//! Stage execution: selection, processing, output writing.
//!
//! - **runner**: [`StageRunner`] drives one stage through its cache and resolver
//! - **processor**: the [`Processor`] contract plus built-in and command processors
//! - **template**: built-in page renderer for the html stage
//! - **stylesheet**: import scanner and built-in stylesheet bundler
//! - **layout**: source → output path mapping
//!
//! # Stage Run
//!
//! ```text
//! collect sources ──► resolver.refresh ──► select (changes ∪ affected)
//!                                                 │
//!        cache.should_process ◄───────────────────┘
//!                 │ miss
//!                 ▼
//!        processor.process ──► write output ──► cache.record
//!                 │ error
//!                 ▼
//!          StageWarning (previous output kept)
//! ```

mod layout;
mod processor;
mod runner;
mod stylesheet;
mod template;

pub use layout::{Destination, Rename, map_path};
pub use processor::{
    Command, Input, JsonData, Passthrough, Processed, Processor, SiteDataFile, StageContext,
    for_stage,
};
pub use runner::StageRunner;
pub use stylesheet::{SassImports, StylesheetBundle};
pub use template::Template;

use kiln_core::{GraphError, Stage};
use std::{
    fmt,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// A file written to the output tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct OutputFile {
    /// Source file it was produced from.
    pub source: PathBuf,
    /// Absolute output path.
    pub path: PathBuf,
}

impl OutputFile {
    /// Whether a browser can hot-swap this file without reloading the page.
    pub fn is_stylesheet(&self) -> bool {
        is_ext(&self.path, "css") || self.is_source_map_of("css")
    }

    fn is_source_map_of(&self, ext: &str) -> bool {
        is_ext(&self.path, "map") && is_ext(&self.path.with_extension(""), ext)
    }
}

fn is_ext(path: &Path, ext: &str) -> bool {
    path.extension().is_some_and(|e| e == ext)
}

/// Editor swap files, OS metadata and our own temp files.
pub fn is_ignored(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return true;
    };
    name == ".DS_Store"
        || name.starts_with(".#")
        || name.ends_with('~')
        || [".swp", ".swx", ".tmp", TEMP_SUFFIX]
            .iter()
            .any(|ext| name.ends_with(ext))
}

/// Suffix of files written before their atomic rename.
const TEMP_SUFFIX: &str = ".kiln-tmp";

/// Content produced by a stage that writes nothing to disk.
#[derive(Debug, Clone)]
pub struct MemoryOutput {
    pub source: PathBuf,
    pub content: Vec<u8>,
}

/// A per-file failure. The stage keeps going.
#[derive(Debug, Clone)]
pub struct StageWarning {
    pub path: PathBuf,
    pub message: String,
}

impl fmt::Display for StageWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

/// Result of one stage run.
#[derive(Debug)]
pub struct StageReport {
    pub stage: Stage,
    /// Outputs written in this run (source maps included).
    pub written: Vec<OutputFile>,
    /// Outputs deleted because their source disappeared.
    pub removed: Vec<OutputFile>,
    /// Results of in-memory stages.
    pub processed: Vec<MemoryOutput>,
    /// Candidates the cache reported as unchanged.
    pub skipped: usize,
    pub warnings: Vec<StageWarning>,
}

impl StageReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            written: Vec::new(),
            removed: Vec::new(),
            processed: Vec::new(),
            skipped: 0,
            warnings: Vec::new(),
        }
    }

    /// Number of files actually processed, successfully or not.
    pub fn touched(&self) -> usize {
        self.processed.len() + self.written_sources() + self.warnings.len()
    }

    fn written_sources(&self) -> usize {
        let mut sources: Vec<_> = self.written.iter().map(|o| &o.source).collect();
        sources.dedup();
        sources.len()
    }
}

/// Errors that end a stage run. Per-file problems are [`StageWarning`]s.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("[{stage}] source root `{}` is missing", path.display())]
    MissingRoot { stage: Stage, path: PathBuf },

    #[error("[{stage}] cannot read `{}`", path.display())]
    Unreadable {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("[{stage}] cannot create output directory `{}`", path.display())]
    Output {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[{stage}] cannot write site data snapshot `{}`", path.display())]
    SiteData {
        stage: Stage,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[{stage}] {source}")]
    Graph {
        stage: Stage,
        #[source]
        source: GraphError,
    },
}
