//! Runs one stage: select, process, write, record, notify.

use super::{
    Destination, Input, MemoryOutput, OutputFile, Processed, Processor, Rename, SassImports,
    SiteDataFile, StageContext, StageError, StageReport, StageWarning, TEMP_SUFFIX, for_stage, is_ignored,
    map_path,
};
use crate::{config::SiteConfig, log, reload::Notifier};
use anyhow::Result;
use kiln_core::{
    CacheStore, Changes, Fingerprint, Generation, Identity, ImportResolver, Isolated, PatternSet,
    Resolver, Stage, glob::to_slash,
};
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use walkdir::WalkDir;

/// A source read for selection, reused for processing.
struct Loaded {
    fingerprint: Fingerprint,
    /// `None` when the identity does not need the content.
    content: Option<Vec<u8>>,
}

enum Outcome {
    Skipped,
    Written(Vec<OutputFile>),
    Memory(MemoryOutput),
    Failed(StageWarning),
}

/// Drives a single stage.
///
/// Owns the stage's cache and resolver; nothing else writes to them except
/// the orchestrator invalidating whole scopes between phases.
pub struct StageRunner {
    stage: Stage,
    ctx: StageContext,
    source_dir: PathBuf,
    sources: PatternSet,
    entries: PatternSet,
    destination: Destination,
    identity: Identity,
    source_maps: bool,
    processor: Box<dyn Processor>,
    resolver: Box<dyn Resolver>,
    cache: CacheStore,
}

impl StageRunner {
    pub fn new(stage: Stage, config: &SiteConfig) -> Result<Self> {
        let resolver: Box<dyn Resolver> = match stage {
            Stage::Styles => Box::new(ImportResolver::new(SassImports::new(
                config.source_dir(Stage::Styles),
            ))),
            _ => Box::new(Isolated),
        };
        let identity = match stage {
            Stage::Images => Identity::Modified,
            _ => Identity::Content,
        };

        Ok(Self {
            stage,
            ctx: StageContext::new(stage, config),
            source_dir: config.source_dir(stage),
            sources: config.source.sources(stage)?,
            entries: config.source.entries(stage)?,
            destination: Destination::for_stage(stage, config),
            identity,
            source_maps: config.mode.is_development() && config.build.source_maps,
            processor: for_stage(stage, config),
            resolver,
            cache: CacheStore::new(),
        })
    }

    pub fn with_processor(mut self, processor: Box<dyn Processor>) -> Self {
        self.processor = processor;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Rebuild the dependency graph, failing on cycles.
    pub fn validate(&mut self) -> Result<(), StageError> {
        let sources = self.collect_sources()?;
        self.refresh(&sources)
    }

    /// Every source of the stage, sorted.
    pub fn collect_sources(&self) -> Result<Vec<PathBuf>, StageError> {
        if !self.source_dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.source_dir).follow_links(true) {
            let entry = entry.map_err(|source| StageError::Unreadable {
                stage: self.stage,
                path: source
                    .path()
                    .map_or_else(|| self.source_dir.clone(), Path::to_path_buf),
                source,
            })?;
            if !entry.file_type().is_file() || is_ignored(entry.path()) {
                continue;
            }
            if self.relative(entry.path()).is_some_and(|rel| self.sources.matches(rel)) {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Run the stage over `changes`.
    ///
    /// `site_data` is the snapshot the whole pass renders against.
    pub fn run(
        &mut self,
        changes: &Changes,
        site_data: Option<Arc<Value>>,
        notifier: &dyn Notifier,
    ) -> Result<StageReport, StageError> {
        let stage = self.stage;
        if !self.ctx.source_root.is_dir() {
            return Err(StageError::MissingRoot {
                stage,
                path: self.ctx.source_root.clone(),
            });
        }
        let mut report = StageReport::new(stage);

        // Dependents under the previous graph, so removed imports still count.
        let previous: FxHashMap<&Path, FxHashSet<PathBuf>> = match changes {
            Changes::All => FxHashMap::default(),
            Changes::Files(files) => files
                .iter()
                .map(|file| (file.as_path(), self.resolver.affected(file)))
                .collect(),
        };

        let sources = self.collect_sources()?;
        self.refresh(&sources)?;

        let this = &*self;
        let known: FxHashSet<&Path> = sources.iter().map(PathBuf::as_path).collect();
        let changed: Vec<&Path> = match changes {
            Changes::All => sources.iter().map(PathBuf::as_path).collect(),
            Changes::Files(files) => {
                let mut present = Vec::with_capacity(files.len());
                for file in files {
                    if known.contains(file.as_path()) {
                        present.push(file.as_path());
                    } else if !file.exists() {
                        this.remove_outputs(file, &mut report);
                        this.invalidate_dependents(file, previous.get(file.as_path()));
                    }
                }
                present
            }
        };

        let (affected, loaded) = this.select(&changed, &previous);
        let generation = this.cache.generation(stage.scope());

        let candidates: Vec<&Path> = match changes {
            Changes::All => sources
                .iter()
                .map(PathBuf::as_path)
                .filter(|path| this.is_entry(path))
                .collect(),
            Changes::Files(_) => sources
                .iter()
                .map(PathBuf::as_path)
                .filter(|path| affected.contains(*path) && this.is_entry(path))
                .collect(),
        };

        // Lives until every candidate is processed.
        let data_file = match &site_data {
            Some(data) if !candidates.is_empty() && this.processor.reads_site_data_file() => {
                Some(SiteDataFile::write(data).map_err(|source| StageError::SiteData {
                    stage,
                    path: std::env::temp_dir(),
                    source,
                })?)
            }
            _ => None,
        };
        let ctx = StageContext {
            site_data,
            site_data_file: data_file.as_ref().map(|file| file.path().to_path_buf()),
            ..this.ctx.clone()
        };
        let outcomes = candidates
            .par_iter()
            .map(|path| this.process_one(path, loaded.get(path), &ctx, generation))
            .collect::<Result<Vec<_>, _>>()?;

        for outcome in outcomes {
            match outcome {
                Outcome::Skipped => report.skipped += 1,
                Outcome::Written(files) => report.written.extend(files),
                Outcome::Memory(output) => report.processed.push(output),
                Outcome::Failed(warning) => report.warnings.push(warning),
            }
        }

        let mut updates = report.written.clone();
        updates.extend(report.removed.iter().cloned());
        if let Err(err) = notifier.push_update(&updates) {
            log!("reload"; "{err:#}");
        }

        Ok(report)
    }

    // ========================================================================
    // Selection
    // ========================================================================

    /// Fingerprint changed files. Each one that really changed brings its
    /// dependents along and gets their cache entries dropped.
    ///
    /// Import-only sources have no output, so they are recorded right away.
    fn select<'a>(
        &self,
        changed: &[&'a Path],
        previous: &FxHashMap<&Path, FxHashSet<PathBuf>>,
    ) -> (FxHashSet<PathBuf>, FxHashMap<&'a Path, Loaded>) {
        let scope = self.stage.scope();
        let mut affected = FxHashSet::default();
        let mut loaded = FxHashMap::default();

        for &path in changed {
            // Unreadable files are reported when processed.
            let Ok(source) = self.load(path) else {
                affected.insert(path.to_path_buf());
                continue;
            };
            if self.cache.should_process(scope, path, &source.fingerprint) {
                let dependents = self.invalidate_dependents(path, previous.get(path));
                affected.extend(dependents);
                affected.insert(path.to_path_buf());
                if !self.is_entry(path) {
                    let generation = self.cache.generation(scope);
                    self.cache.record(scope, path, source.fingerprint, generation);
                }
            }
            loaded.insert(path, source);
        }

        (affected, loaded)
    }

    /// Drop the cache entries of everything depending on `path`.
    fn invalidate_dependents(
        &self,
        path: &Path,
        previous: Option<&FxHashSet<PathBuf>>,
    ) -> FxHashSet<PathBuf> {
        let mut dependents = self.resolver.affected(path);
        dependents.extend(previous.into_iter().flatten().cloned());
        dependents.remove(path);
        for dependent in &dependents {
            self.cache.invalidate(self.stage.scope(), dependent);
        }
        dependents
    }

    fn refresh(&mut self, sources: &[PathBuf]) -> Result<(), StageError> {
        self.resolver
            .refresh(sources)
            .map_err(|source| StageError::Graph {
                stage: self.stage,
                source,
            })
    }

    fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.ctx.source_root).ok()
    }

    /// Whether `path` produces an output of its own.
    pub fn is_entry(&self, path: &Path) -> bool {
        self.relative(path).is_some_and(|rel| self.entries.matches(rel))
    }

    fn load(&self, path: &Path) -> io::Result<Loaded> {
        if self.identity.reads_content() {
            let content = fs::read(path)?;
            Ok(Loaded {
                fingerprint: self.identity.fingerprint(path, &content)?,
                content: Some(content),
            })
        } else {
            Ok(Loaded {
                fingerprint: self.identity.fingerprint(path, &[])?,
                content: None,
            })
        }
    }

    // ========================================================================
    // Processing
    // ========================================================================

    fn process_one(
        &self,
        path: &Path,
        preloaded: Option<&Loaded>,
        ctx: &StageContext,
        generation: Generation,
    ) -> Result<Outcome, StageError> {
        let scope = self.stage.scope();
        let failed = |message: String| {
            Ok(Outcome::Failed(StageWarning {
                path: path.to_path_buf(),
                message,
            }))
        };

        let fresh;
        let source = match preloaded {
            Some(source) => source,
            None => match self.load(path) {
                Ok(source) => {
                    fresh = source;
                    &fresh
                }
                Err(err) => return failed(format!("cannot read: {err}")),
            },
        };
        if !self.cache.should_process(scope, path, &source.fingerprint) {
            return Ok(Outcome::Skipped);
        }

        let read;
        let content = match &source.content {
            Some(content) => content.as_slice(),
            None => match fs::read(path) {
                Ok(content) => {
                    read = content;
                    read.as_slice()
                }
                Err(err) => return failed(format!("cannot read: {err}")),
            },
        };

        let processed = match self.processor.process(&Input { path, content }, ctx) {
            Ok(processed) => processed,
            Err(err) => return failed(format!("{err:#}")),
        };

        let outcome = match &self.destination {
            Destination::Memory => Outcome::Memory(MemoryOutput {
                source: path.to_path_buf(),
                content: processed.content,
            }),
            Destination::Dir { .. } => match self.destination.output_path(path) {
                Some(output) => self.write(path, output, processed)?,
                None => return failed("outside of the stage directory".into()),
            },
        };

        if !matches!(outcome, Outcome::Failed(_)) {
            self.cache
                .record(scope, path, source.fingerprint, generation);
        }
        Ok(outcome)
    }

    /// Write an output and, in development, its source map.
    fn write(&self, source: &Path, output: PathBuf, processed: Processed) -> Result<Outcome, StageError> {
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent).map_err(|err| StageError::Output {
                stage: self.stage,
                path: parent.to_path_buf(),
                source: err,
            })?;
        }
        let failed = |path: &Path, err: io::Error| {
            Ok(Outcome::Failed(StageWarning {
                path: source.to_path_buf(),
                message: format!("cannot write `{}`: {err}", path.display()),
            }))
        };

        let mut content = processed.content;
        let mut written = Vec::with_capacity(2);

        if self.source_maps && self.destination.maps_sources() {
            let map = map_path(&output);
            let json = processed
                .source_map
                .unwrap_or_else(|| self.identity_map(source, &output));
            content.extend_from_slice(self.map_comment(&map).as_bytes());
            if let Err(err) = write_atomic(&map, json.as_bytes()) {
                return failed(&map, err);
            }
            written.push(OutputFile {
                source: source.to_path_buf(),
                path: map,
            });
        }

        if let Err(err) = write_atomic(&output, &content) {
            return failed(&output, err);
        }
        written.insert(
            0,
            OutputFile {
                source: source.to_path_buf(),
                path: output,
            },
        );
        Ok(Outcome::Written(written))
    }

    /// Source map naming the source when the processor produced none.
    fn identity_map(&self, source: &Path, output: &Path) -> String {
        let file = output.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let rel = self.relative(source).map(to_slash).unwrap_or_default();
        serde_json::json!({
            "version": 3,
            "file": file,
            "sources": [format!("/{rel}")],
            "names": [],
            "mappings": "",
        })
        .to_string()
    }

    fn map_comment(&self, map: &Path) -> String {
        let name = map.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        match self.destination {
            Destination::Dir {
                rename: Rename::Suffix(suffix),
                ..
            } if suffix.ends_with("css") => format!("\n/*# sourceMappingURL={name} */\n"),
            _ => format!("\n//# sourceMappingURL={name}\n"),
        }
    }

    /// Delete the outputs of a source that no longer exists.
    fn remove_outputs(&self, source: &Path, report: &mut StageReport) {
        self.cache.invalidate(self.stage.scope(), source);
        if !self.is_entry(source) {
            return;
        }
        let Some(output) = self.destination.output_path(source) else {
            return;
        };

        let map = map_path(&output);
        for path in [output, map] {
            if !path.is_file() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => report.removed.push(OutputFile {
                    source: source.to_path_buf(),
                    path,
                }),
                Err(err) => report.warnings.push(StageWarning {
                    path: source.to_path_buf(),
                    message: format!("cannot remove `{}`: {err}", path.display()),
                }),
            }
        }
    }
}

/// Write through a sibling temp file so readers never see a partial output.
fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(TEMP_SUFFIX);
    let temp = PathBuf::from(temp);

    fs::write(&temp, content)?;
    fs::rename(&temp, path).inspect_err(|_| {
        let _ = fs::remove_file(&temp);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Mode, reload::NullNotifier};
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Site {
        _dir: tempfile::TempDir,
        config: SiteConfig,
    }

    impl Site {
        fn new(mode: Mode) -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir(dir.path().join("src")).unwrap();
            let mut config = SiteConfig::default();
            config.mode = mode;
            config.update_path_with_root(dir.path());
            Self { _dir: dir, config }
        }

        fn src(&self, rel: &str) -> PathBuf {
            self.config.source_root().join(rel)
        }

        fn out(&self, rel: &str) -> PathBuf {
            self.config.output_root().join(rel)
        }

        fn write(&self, rel: &str, content: &str) -> PathBuf {
            let path = self.src(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            path
        }

        fn runner(&self, stage: Stage) -> StageRunner {
            StageRunner::new(stage, &self.config).unwrap()
        }
    }

    /// Counts calls; fails on content containing `FAIL`.
    #[derive(Clone, Default)]
    struct Counting(Arc<AtomicUsize>);

    impl Counting {
        fn calls(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl Processor for Counting {
        fn process(&self, input: &Input<'_>, _ctx: &StageContext) -> Result<Processed> {
            self.0.fetch_add(1, Ordering::SeqCst);
            let text = input.text()?;
            if text.contains("FAIL") {
                bail!("refusing {}", input.path.display());
            }
            Ok(Processed::new(text.to_uppercase()))
        }
    }

    fn run(runner: &mut StageRunner, changes: &Changes) -> StageReport {
        runner.run(changes, None, &NullNotifier).unwrap()
    }

    #[test]
    fn test_second_run_is_a_no_op() {
        let site = Site::new(Mode::Production);
        site.write("assets/js/app.js", "let a;");
        site.write("assets/js/lib/util.js", "let b;");
        let counting = Counting::default();
        let mut runner = site
            .runner(Stage::Scripts)
            .with_processor(Box::new(counting.clone()));

        let first = run(&mut runner, &Changes::All);
        assert_eq!(first.written.len(), 2);
        assert_eq!(
            fs::read_to_string(site.out("assets/js/lib/util.min.js")).unwrap(),
            "LET B;"
        );

        let second = run(&mut runner, &Changes::All);
        assert!(second.written.is_empty());
        assert_eq!(second.skipped, 2);
        assert_eq!(counting.calls(), 2);
    }

    #[test]
    fn test_only_changed_file_is_reprocessed() {
        let site = Site::new(Mode::Production);
        let a = site.write("assets/js/a.js", "a");
        site.write("assets/js/b.js", "b");
        let counting = Counting::default();
        let mut runner = site
            .runner(Stage::Scripts)
            .with_processor(Box::new(counting.clone()));
        run(&mut runner, &Changes::All);

        fs::write(&a, "a2").unwrap();
        let report = run(&mut runner, &Changes::All);

        assert_eq!(counting.calls(), 3);
        assert_eq!(report.written.len(), 1);
        assert_eq!(report.written[0].source, a);
    }

    #[test]
    fn test_failure_keeps_previous_output_and_retries() {
        let site = Site::new(Mode::Production);
        let path = site.write("assets/js/app.js", "good");
        let counting = Counting::default();
        let mut runner = site
            .runner(Stage::Scripts)
            .with_processor(Box::new(counting.clone()));
        run(&mut runner, &Changes::All);

        fs::write(&path, "FAIL").unwrap();
        let report = run(&mut runner, &Changes::file(&path));
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(fs::read_to_string(site.out("assets/js/app.min.js")).unwrap(), "GOOD");

        // Not recorded: the same content is attempted again.
        let again = run(&mut runner, &Changes::All);
        assert_eq!(again.warnings.len(), 1);
        assert_eq!(counting.calls(), 3);
    }

    #[test]
    fn test_partial_change_rebuilds_only_importers() {
        let site = Site::new(Mode::Production);
        let partial = site.write("assets/css/_shared.scss", ".x { color: red; }");
        site.write("assets/css/a.scss", "@use 'shared';\n.a {}");
        site.write("assets/css/b.scss", ".b {}");
        let mut runner = site.runner(Stage::Styles);

        let first = run(&mut runner, &Changes::All);
        assert_eq!(first.written.len(), 2);
        assert!(!site.out("assets/css/_shared.min.css").exists());

        fs::write(&partial, ".x { color: blue; }").unwrap();
        let report = run(&mut runner, &Changes::file(&partial));

        let sources: Vec<_> = report.written.iter().map(|o| o.source.clone()).collect();
        assert_eq!(sources, [site.src("assets/css/a.scss")]);
        let css = fs::read_to_string(site.out("assets/css/a.min.css")).unwrap();
        assert!(css.contains("blue"));
    }

    #[test]
    fn test_partial_change_is_seen_by_full_runs() {
        let site = Site::new(Mode::Production);
        let partial = site.write("assets/css/_shared.scss", ".x{color:red}");
        site.write("assets/css/a.scss", "@import \"shared\";");
        let mut runner = site.runner(Stage::Styles);
        run(&mut runner, &Changes::All);

        fs::write(&partial, ".x{color:blue}").unwrap();
        let report = run(&mut runner, &Changes::All);

        assert_eq!(report.written.len(), 1);
        let css = fs::read_to_string(site.out("assets/css/a.min.css")).unwrap();
        assert!(css.contains("blue"));
    }

    #[test]
    fn test_import_cycle_is_fatal() {
        let site = Site::new(Mode::Production);
        site.write("assets/css/_a.scss", "@use 'b';");
        site.write("assets/css/_b.scss", "@use 'a';");
        let mut runner = site.runner(Stage::Styles);

        assert!(matches!(runner.validate(), Err(StageError::Graph { .. })));
        assert!(matches!(
            runner.run(&Changes::All, None, &NullNotifier),
            Err(StageError::Graph { .. })
        ));
    }

    #[test]
    fn test_deleted_source_removes_output() {
        let site = Site::new(Mode::Production);
        let path = site.write("static/robots.txt", "User-agent: *");
        let mut runner = site.runner(Stage::Static);
        run(&mut runner, &Changes::All);
        assert!(site.out("robots.txt").is_file());

        fs::remove_file(&path).unwrap();
        let report = run(&mut runner, &Changes::file(&path));

        assert_eq!(report.removed.len(), 1);
        assert!(!site.out("robots.txt").exists());
    }

    #[test]
    fn test_development_writes_source_maps() {
        let site = Site::new(Mode::Development);
        site.write("assets/js/app.js", "let a;");
        let mut runner = site.runner(Stage::Scripts);

        let report = run(&mut runner, &Changes::All);

        assert_eq!(report.written.len(), 2);
        let js = fs::read_to_string(site.out("assets/js/app.min.js")).unwrap();
        assert!(js.ends_with("//# sourceMappingURL=app.min.js.map\n"));
        let map: Value =
            serde_json::from_slice(&fs::read(site.out("assets/js/app.min.js.map")).unwrap())
                .unwrap();
        assert_eq!(map["sources"][0], "/assets/js/app.js");
    }

    #[test]
    fn test_memory_stage_writes_nothing() {
        let site = Site::new(Mode::Production);
        site.write("data/site.json", r#"{"title":"x"}"#);
        let mut runner = site.runner(Stage::Data);

        let report = run(&mut runner, &Changes::All);

        assert!(report.written.is_empty());
        assert_eq!(report.processed.len(), 1);
        assert!(!site.config.output_root().exists());
    }

    #[test]
    fn test_invalidation_during_run_is_not_overwritten() {
        let site = Site::new(Mode::Production);
        let page = site.write("index.njk", "hi");
        let mut runner = site.runner(Stage::Html);

        let stale = runner.cache().generation("html");
        runner.cache().invalidate_scope("html");
        let fp = Fingerprint::of_content(b"hi");
        assert!(!runner.cache().record("html", &page, fp, stale));

        let report = run(&mut runner, &Changes::All);
        assert_eq!(report.written.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_page_command_sees_site_data() {
        let mut site = Site::new(Mode::Production);
        site.config.build.commands.html = Some(vec![
            "sh".into(),
            "-c".into(),
            "cat \"$KILN_SITE_DATA\"".into(),
        ]);
        site.write("index.njk", "{{ title }}");
        let mut runner = site.runner(Stage::Html);
        let data = Arc::new(serde_json::json!({"title": "Hello"}));

        let report = runner.run(&Changes::All, Some(data), &NullNotifier).unwrap();

        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(
            fs::read_to_string(site.out("index.html")).unwrap(),
            r#"{"title":"Hello"}"#
        );
    }

    #[test]
    fn test_temp_files_are_ignored() {
        let site = Site::new(Mode::Production);
        site.write("static/a.txt", "a");
        site.write("static/.a.txt.swp", "swap");
        let runner = site.runner(Stage::Static);

        assert_eq!(runner.collect_sources().unwrap(), [site.src("static/a.txt")]);
    }
}
