//! Stage processors.
//!
//! A processor is a pure function from one file's content to its output. It
//! never looks at other files of the stage; cross-file relations belong to
//! the stage's resolver.

use super::{StylesheetBundle, Template};
use crate::config::{Mode, SiteConfig, StylesheetOptions};
use anyhow::{Context, Result, bail};
use kiln_core::Stage;
use serde_json::Value;
use std::{
    env, fs,
    io::{self, Write},
    path::{Path, PathBuf},
    process::{self, Stdio},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    thread,
};

/// One source file handed to a processor.
#[derive(Debug, Clone, Copy)]
pub struct Input<'a> {
    pub path: &'a Path,
    pub content: &'a [u8],
}

impl Input<'_> {
    pub fn text(&self) -> Result<&str> {
        std::str::from_utf8(self.content)
            .with_context(|| format!("`{}` is not valid UTF-8", self.path.display()))
    }
}

/// Everything a processor may know beyond the file itself.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub stage: Stage,
    pub mode: Mode,
    pub source_root: PathBuf,
    /// Site data snapshot, taken once per pass. Only the html stage gets one.
    pub site_data: Option<Arc<Value>>,
    /// The same snapshot on disk, for processors that ask for it.
    pub site_data_file: Option<PathBuf>,
    pub stylesheet: StylesheetOptions,
}

impl StageContext {
    pub fn new(stage: Stage, config: &SiteConfig) -> Self {
        Self {
            stage,
            mode: config.mode,
            source_root: config.source_root().to_path_buf(),
            site_data: None,
            site_data_file: None,
            stylesheet: config.build.stylesheet,
        }
    }

    /// Options exported to external commands.
    fn env(&self) -> Vec<(&'static str, String)> {
        let flag = |on: bool| String::from(if on { "1" } else { "0" });
        let mut vars = vec![
            ("KILN_MODE", self.mode.name().to_owned()),
            ("KILN_STAGE", self.stage.name().to_owned()),
            ("KILN_SOURCE_ROOT", self.source_root.display().to_string()),
            ("KILN_MINIFY", flag(self.stylesheet.minify)),
            ("KILN_VENDOR_PREFIXING", flag(self.stylesheet.vendor_prefixing)),
            ("KILN_GROUP_MEDIA_QUERIES", flag(self.stylesheet.group_media_queries)),
        ];
        if let Some(file) = &self.site_data_file {
            vars.push(("KILN_SITE_DATA", file.display().to_string()));
        }
        vars
    }
}

/// One pass's site data snapshot written to a temp file.
///
/// Removed when dropped, i.e. when the pass is over.
#[derive(Debug)]
pub struct SiteDataFile {
    path: PathBuf,
}

impl SiteDataFile {
    pub fn write(data: &Value) -> io::Result<Self> {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let name = format!(
            "kiln-site-data-{}-{}.json",
            process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        );
        let path = env::temp_dir().join(name);
        fs::write(&path, serde_json::to_vec(data)?)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SiteDataFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Output of one processed file.
#[derive(Debug, Clone, Default)]
pub struct Processed {
    pub content: Vec<u8>,
    pub source_map: Option<String>,
}

impl Processed {
    pub fn new(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: content.into(),
            source_map: None,
        }
    }
}

/// Transforms one file. Errors are per-file failures.
pub trait Processor: Send + Sync {
    fn process(&self, input: &Input<'_>, ctx: &StageContext) -> Result<Processed>;

    /// Whether the site data snapshot must be on disk
    /// ([`StageContext::site_data_file`]) while this processor runs.
    fn reads_site_data_file(&self) -> bool {
        false
    }
}

/// Validates the site data document.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonData;

impl Processor for JsonData {
    fn process(&self, input: &Input<'_>, _ctx: &StageContext) -> Result<Processed> {
        serde_json::from_slice::<Value>(input.content).context("invalid site data")?;
        Ok(Processed::new(input.content))
    }
}

/// Copies content unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Processor for Passthrough {
    fn process(&self, input: &Input<'_>, _ctx: &StageContext) -> Result<Processed> {
        Ok(Processed::new(input.content))
    }
}

/// Pipes content through an external program: stdin in, stdout out.
///
/// `{path}` and `{dir}` in arguments expand to the source file and its
/// directory. The program runs in the source root. In the html stage
/// `KILN_SITE_DATA` names a JSON file holding the pass's site data.
#[derive(Debug, Clone)]
pub struct Command {
    argv: Vec<String>,
}

impl Command {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    fn expand(&self, path: &Path) -> Vec<String> {
        let file = path.display().to_string();
        let dir = path.parent().unwrap_or(Path::new("")).display().to_string();
        self.argv
            .iter()
            .map(|arg| arg.replace("{path}", &file).replace("{dir}", &dir))
            .collect()
    }
}

impl Processor for Command {
    fn reads_site_data_file(&self) -> bool {
        true
    }

    fn process(&self, input: &Input<'_>, ctx: &StageContext) -> Result<Processed> {
        let argv = self.expand(input.path);
        let (name, args) = argv.split_first().context("Empty command")?;

        let mut child = process::Command::new(name)
            .args(args)
            .current_dir(&ctx.source_root)
            .envs(ctx.env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn `{name}`"))?;

        let mut stdin = child.stdin.take().context("Failed to acquire stdin")?;
        // Stdin is fed from a second thread while stdout drains here.
        let output = thread::scope(|s| {
            s.spawn(move || {
                // A child may exit without reading everything; its status decides.
                let _ = stdin.write_all(input.content);
            });
            child.wait_with_output()
        })
        .with_context(|| format!("Failed to execute `{name}`"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Command `{name}` failed with exit code: {:?}\n{}",
                output.status.code(),
                stderr.trim_end()
            );
        }

        Ok(Processed::new(output.stdout))
    }
}

/// The processor configured for `stage`.
pub fn for_stage(stage: Stage, config: &SiteConfig) -> Box<dyn Processor> {
    let commands = &config.build.commands;
    let command = match stage {
        Stage::Html => commands.html.as_ref(),
        Stage::Styles => commands.styles.as_ref(),
        Stage::Scripts => commands.scripts.as_ref(),
        Stage::Images => commands.images.as_ref(),
        Stage::Data | Stage::Views | Stage::Static => None,
    };
    if let Some(argv) = command {
        return Box::new(Command::new(argv.clone()));
    }

    match stage {
        Stage::Data => Box::new(JsonData),
        Stage::Html => Box::new(Template::new(
            config.source_root().join(&config.source.views),
            config.source.template_ext.as_str(),
            config.build.minify_html,
        )),
        Stage::Styles => Box::new(StylesheetBundle::new(config.source_dir(Stage::Styles))),
        Stage::Views | Stage::Scripts | Stage::Images | Stage::Static => Box::new(Passthrough),
    }
}
