//! Build orchestration.
//!
//! The orchestrator owns one [`StageRunner`] per stage, the [`SiteData`]
//! document and the [`WatchMap`]. Every build, full or incremental, is a
//! [`BuildPlan`] executed phase by phase:
//!
//! ```text
//! phase 0   data ─────► parse, swap SiteData ─► invalidate html scope
//! phase 1   views ────► any partial processed ─► invalidate html scope
//! phase 2   html  (one SiteData snapshot for the whole pass)
//! phase 3   css │ js │ images │ static   (concurrent)
//! ```
//!
//! Stages of one phase run concurrently; phases never overlap. A fatal
//! [`StageError`](crate::pipeline::StageError) ends the build, per-file
//! failures are collected as warnings.

use crate::{
    config::SiteConfig,
    log,
    pipeline::{StageReport, StageRunner, StageWarning},
    reload::{NullNotifier, Notifier},
    site_data::SiteData,
};
use anyhow::{Context, Result};
use kiln_core::{BuildPlan, Changes, Stage, WatchMap};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

/// One-shot production build: validate, clean, build everything.
pub fn build_site(config: &SiteConfig) -> Result<BuildSummary> {
    let mut orchestrator = Orchestrator::new(config, Arc::new(NullNotifier))?;
    orchestrator.validate()?;
    clean_output(config.output_root())?;

    log!("build"; "building {}", config.source_root().display());
    let summary = orchestrator.execute(&BuildPlan::full())?;
    summary.log_result();
    Ok(summary)
}

/// Remove the output directory and everything in it.
pub fn clean_output(output: &Path) -> Result<()> {
    if output.exists() {
        fs::remove_dir_all(output)
            .with_context(|| format!("Failed to clear output directory: {}", output.display()))?;
    }
    Ok(())
}

/// Watch routing: which stages a changed source file triggers.
pub fn watch_map(config: &SiteConfig) -> Result<WatchMap> {
    let source = &config.source;
    let routes: [(Stage, &[Stage]); 7] = [
        (Stage::Data, &[Stage::Data, Stage::Html]),
        (Stage::Views, &[Stage::Views, Stage::Html]),
        (Stage::Html, &[Stage::Html]),
        (Stage::Styles, &[Stage::Styles]),
        (Stage::Scripts, &[Stage::Scripts]),
        (Stage::Images, &[Stage::Images]),
        (Stage::Static, &[Stage::Static]),
    ];

    let mut map = WatchMap::new();
    for (stage, tasks) in routes {
        map = map.route(source.sources(stage)?, tasks);
    }
    Ok(map)
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    source_root: PathBuf,
    runners: Vec<StageRunner>,
    site_data: SiteData,
    watch_map: WatchMap,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    pub fn new(config: &SiteConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let runners = Stage::ALL
            .into_iter()
            .map(|stage| StageRunner::new(stage, config))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            source_root: config.source_root().to_path_buf(),
            runners,
            site_data: SiteData::new(),
            watch_map: watch_map(config)?,
            notifier,
        })
    }

    /// Startup checks that need the source tree: import graphs must be acyclic.
    pub fn validate(&mut self) -> Result<()> {
        for runner in &mut self.runners {
            runner.validate()?;
        }
        Ok(())
    }

    pub fn site_data(&self) -> &SiteData {
        &self.site_data
    }

    pub fn runner(&self, stage: Stage) -> Option<&StageRunner> {
        self.runners.iter().find(|runner| runner.stage() == stage)
    }

    /// Coalesce changed paths into one plan.
    pub fn plan<'p, I>(&self, paths: I) -> BuildPlan
    where
        I: IntoIterator<Item = &'p Path>,
    {
        self.watch_map.plan(&self.source_root, paths)
    }

    /// Development startup: data and pages, plus assets when asked.
    pub fn seed(&mut self, with_assets: bool) -> Result<BuildSummary> {
        let mut plan = BuildPlan::of(&[Stage::Data, Stage::Html]);
        if with_assets {
            plan.extend(BuildPlan::of(&[
                Stage::Styles,
                Stage::Scripts,
                Stage::Images,
                Stage::Static,
            ]));
        }
        self.execute(&plan)
    }

    /// Run `plan` phase by phase.
    pub fn execute(&mut self, plan: &BuildPlan) -> Result<BuildSummary> {
        let mut summary = BuildSummary::default();

        for phase in plan.phases() {
            let snapshot = self.site_data.snapshot();
            let notifier = &*self.notifier;

            let jobs: Vec<(&mut StageRunner, &Changes)> = self
                .runners
                .iter_mut()
                .filter_map(|runner| {
                    phase
                        .iter()
                        .find(|(stage, _)| *stage == runner.stage())
                        .map(|&(_, changes)| (runner, changes))
                })
                .collect();

            let results: Vec<_> = jobs
                .into_par_iter()
                .map(|(runner, changes)| {
                    let site_data = (runner.stage() == Stage::Html).then(|| Arc::clone(&snapshot));
                    runner.run(changes, site_data, notifier)
                })
                .collect();

            for result in results {
                let mut report = result?;
                let changes = plan.get(report.stage);
                self.after_stage(&mut report, changes);
                self.report_collisions(&mut report);
                log_report(&report);
                summary.reports.push(report);
            }
        }

        Ok(summary)
    }

    /// Publish what upstream stages produced before downstream phases run.
    fn after_stage(&self, report: &mut StageReport, changes: Option<&Changes>) {
        match report.stage {
            Stage::Data => {
                let mut reloaded = false;
                for output in &report.processed {
                    match self.site_data.replace_from_slice(&output.content) {
                        Ok(()) => reloaded = true,
                        Err(err) => report.warnings.push(StageWarning {
                            path: output.source.clone(),
                            message: format!("invalid site data: {err}"),
                        }),
                    }
                }
                if reloaded {
                    log!("data"; "site data reloaded");
                    self.invalidate_pages();
                }
            }
            Stage::Views => {
                if !report.processed.is_empty() || changes.is_some_and(removes_files) {
                    self.invalidate_pages();
                }
            }
            _ => {}
        }
    }

    /// Pages and static files share the output root. A file claimed by both
    /// is written by whichever stage ran last; say so. A removed output that
    /// the other stage still claims is rebuilt on that stage's next run.
    fn report_collisions(&self, report: &mut StageReport) {
        let other = match report.stage {
            Stage::Html => Stage::Static,
            Stage::Static => Stage::Html,
            _ => return,
        };
        if report.written.is_empty() && report.removed.is_empty() {
            return;
        }
        let Some(runner) = self.runner(other) else {
            return;
        };
        let Ok(sources) = runner.collect_sources() else {
            return;
        };

        let claimed: FxHashMap<PathBuf, PathBuf> = sources
            .into_iter()
            .filter(|source| runner.is_entry(source))
            .filter_map(|source| {
                let output = runner.destination().output_path(&source)?;
                Some((output, source))
            })
            .collect();

        let mut collisions = Vec::new();
        for output in &report.written {
            if let Some(owner) = claimed.get(&output.path) {
                collisions.push(StageWarning {
                    path: output.source.clone(),
                    message: format!(
                        "`{}` is also produced by {} source `{}`",
                        output.path.display(),
                        other.name(),
                        owner.display()
                    ),
                });
            }
        }
        for output in &report.removed {
            if let Some(owner) = claimed.get(&output.path) {
                runner.cache().invalidate(other.scope(), owner);
                collisions.push(StageWarning {
                    path: output.source.clone(),
                    message: format!(
                        "removed `{}`, which is also produced by {} source `{}`",
                        output.path.display(),
                        other.name(),
                        owner.display()
                    ),
                });
            }
        }
        report.warnings.extend(collisions);
    }

    /// Every page depends on the site data and every partial.
    fn invalidate_pages(&self) {
        if let Some(html) = self.runner(Stage::Html) {
            html.cache().invalidate_scope(Stage::Html.scope());
        }
    }
}

fn removes_files(changes: &Changes) -> bool {
    match changes {
        Changes::All => false,
        Changes::Files(files) => files.iter().any(|file| !file.exists()),
    }
}

// ============================================================================
// Summary
// ============================================================================

/// Reports of every stage run by one build.
#[derive(Debug, Default)]
pub struct BuildSummary {
    pub reports: Vec<StageReport>,
}

impl BuildSummary {
    pub fn report(&self, stage: Stage) -> Option<&StageReport> {
        self.reports.iter().find(|report| report.stage == stage)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &StageWarning> {
        self.reports.iter().flat_map(|report| &report.warnings)
    }

    /// Number of output files written, source maps included.
    pub fn written(&self) -> usize {
        self.reports.iter().map(|report| report.written.len()).sum()
    }

    pub fn log_result(&self) {
        match self.warnings().count() {
            0 => log!("build"; "done, {} files written", self.written()),
            n => log!("warn"; "done with {n} warning(s), {} files written", self.written()),
        }
    }
}

fn log_report(report: &StageReport) {
    for warning in &report.warnings {
        log!("warn"; "{warning}");
    }

    let stage = report.stage.name();
    if !report.processed.is_empty() {
        log!(stage; "{} loaded", report.processed.len());
    }
    if !report.written.is_empty() || !report.removed.is_empty() {
        log!(stage; "{} processed, {} written, {} removed, {} unchanged",
            report.touched(), report.written.len(), report.removed.len(), report.skipped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Mode, pipeline::OutputFile};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<PathBuf>>);

    impl Recording {
        fn take(&self) -> Vec<PathBuf> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    impl Notifier for Recording {
        fn push_update(&self, outputs: &[OutputFile]) -> Result<()> {
            self.0.lock().extend(outputs.iter().map(|o| o.path.clone()));
            Ok(())
        }
    }

    struct Site {
        _dir: tempfile::TempDir,
        config: SiteConfig,
    }

    impl Site {
        /// A small site: data, a layout partial, two pages, a stylesheet
        /// with a partial, a script and a static file.
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir(dir.path().join("src")).unwrap();
            let mut config = SiteConfig::default();
            config.mode = Mode::Production;
            config.update_path_with_root(dir.path());

            let site = Self { _dir: dir, config };
            site.write("data/site.json", r#"{"site":{"title":"First"}}"#);
            site.write("views/header.njk", "<h1>{{ site.title }}</h1>");
            site.write("index.njk", "{% include \"header.njk\" %}<p>home</p>");
            site.write("about.njk", "{% include \"header.njk\" %}<p>about</p>");
            site.write("assets/css/_colors.scss", ".c { color: red; }");
            site.write("assets/css/main.scss", "@use 'colors';\nbody { margin: 0; }");
            site.write("assets/css/print.scss", "body { color: black; }");
            site.write("assets/js/app.js", "console.log(1);");
            site.write("static/robots.txt", "User-agent: *");
            site
        }

        fn write(&self, rel: &str, content: &str) -> PathBuf {
            let path = self.config.source_root().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            path
        }

        fn out(&self, rel: &str) -> PathBuf {
            self.config.output_root().join(rel)
        }

        fn read(&self, rel: &str) -> String {
            fs::read_to_string(self.out(rel)).unwrap()
        }

        fn orchestrator(&self) -> (Orchestrator, Arc<Recording>) {
            let recording = Arc::new(Recording::default());
            let orchestrator = Orchestrator::new(&self.config, recording.clone()).unwrap();
            (orchestrator, recording)
        }
    }

    fn changed(orchestrator: &mut Orchestrator, path: &Path) -> BuildSummary {
        let plan = orchestrator.plan([path]);
        orchestrator.execute(&plan).unwrap()
    }

    fn written_sources(summary: &BuildSummary, stage: Stage) -> Vec<PathBuf> {
        summary
            .report(stage)
            .map(|r| r.written.iter().map(|o| o.source.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_full_build_layout() {
        let site = Site::new();
        let (mut orchestrator, _) = site.orchestrator();

        let summary = orchestrator.execute(&BuildPlan::full()).unwrap();

        assert_eq!(summary.warnings().count(), 0);
        assert_eq!(site.read("index.html"), "<h1>First</h1><p>home</p>");
        assert!(site.out("about.html").is_file());
        assert!(site.out("assets/css/main.min.css").is_file());
        assert!(site.out("assets/css/print.min.css").is_file());
        assert!(!site.out("assets/css/_colors.min.css").exists());
        assert!(site.out("assets/js/app.min.js").is_file());
        assert!(site.out("robots.txt").is_file());
        assert!(!site.out("views").exists());
    }

    #[test]
    fn test_second_build_writes_nothing() {
        let site = Site::new();
        let (mut orchestrator, _) = site.orchestrator();
        orchestrator.execute(&BuildPlan::full()).unwrap();

        let again = orchestrator.execute(&BuildPlan::full()).unwrap();

        assert_eq!(again.written(), 0);
        assert!(again.reports.iter().all(|r| r.warnings.is_empty()));
    }

    #[test]
    fn test_data_change_rerenders_every_page_only() {
        let site = Site::new();
        let (mut orchestrator, recording) = site.orchestrator();
        orchestrator.execute(&BuildPlan::full()).unwrap();
        recording.take();

        let data = site.write("data/site.json", r#"{"site":{"title":"Second"}}"#);
        let summary = changed(&mut orchestrator, &data);

        assert_eq!(orchestrator.site_data().snapshot()["site"]["title"], "Second");
        assert_eq!(written_sources(&summary, Stage::Html).len(), 2);
        assert!(summary.report(Stage::Styles).is_none());
        assert_eq!(site.read("about.html"), "<h1>Second</h1><p>about</p>");

        let notified = recording.take();
        assert_eq!(notified.len(), 2);
        assert!(notified.iter().all(|p| p.extension().is_some_and(|e| e == "html")));
    }

    #[test]
    fn test_malformed_data_keeps_previous_value() {
        let site = Site::new();
        let (mut orchestrator, _) = site.orchestrator();
        orchestrator.execute(&BuildPlan::full()).unwrap();

        let data = site.write("data/site.json", "{ broken");
        let summary = changed(&mut orchestrator, &data);

        assert_eq!(summary.warnings().count(), 1);
        assert_eq!(orchestrator.site_data().snapshot()["site"]["title"], "First");
        assert!(written_sources(&summary, Stage::Html).is_empty());
        assert_eq!(site.read("index.html"), "<h1>First</h1><p>home</p>");
    }

    #[test]
    fn test_partial_change_rerenders_every_page() {
        let site = Site::new();
        let (mut orchestrator, _) = site.orchestrator();
        orchestrator.execute(&BuildPlan::full()).unwrap();

        let header = site.write("views/header.njk", "<h2>{{ site.title }}</h2>");
        let summary = changed(&mut orchestrator, &header);

        assert_eq!(written_sources(&summary, Stage::Html).len(), 2);
        assert_eq!(site.read("index.html"), "<h2>First</h2><p>home</p>");
    }

    #[test]
    fn test_underscore_partial_outside_views() {
        let site = Site::new();
        site.write("_footer.njk", "<footer>1</footer>");
        site.write("index.njk", "{% include \"_footer.njk\" %}");
        let (mut orchestrator, _) = site.orchestrator();
        orchestrator.execute(&BuildPlan::full()).unwrap();
        assert!(!site.out("_footer.html").exists());

        let footer = site.write("_footer.njk", "<footer>2</footer>");
        let summary = changed(&mut orchestrator, &footer);

        assert_eq!(written_sources(&summary, Stage::Html).len(), 2);
        assert_eq!(site.read("index.html"), "<footer>2</footer>");
    }

    #[test]
    fn test_nested_partial_change_rerenders_pages() {
        let site = Site::new();
        site.write("partials/_nav.njk", "<nav>v1</nav>");
        site.write("index.njk", "{% include \"partials/_nav.njk\" %}<p>home</p>");
        let (mut orchestrator, _) = site.orchestrator();
        orchestrator.execute(&BuildPlan::full()).unwrap();

        let nav = site.write("partials/_nav.njk", "<nav>v2</nav>");
        let summary = changed(&mut orchestrator, &nav);

        assert!(summary.report(Stage::Html).is_some());
        assert_eq!(site.read("index.html"), "<nav>v2</nav><p>home</p>");
    }

    #[test]
    fn test_including_a_page_is_a_warning() {
        let site = Site::new();
        site.write("partials/nav.njk", "<nav>v1</nav>");
        let index = site.write("index.njk", "{% include \"partials/nav.njk\" %}<p>home</p>");
        let (mut orchestrator, _) = site.orchestrator();

        let summary = orchestrator.execute(&BuildPlan::full()).unwrap();

        let warnings: Vec<_> = summary.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].path, index);
        assert!(warnings[0].message.contains("not a partial"));
        assert!(!site.out("index.html").exists());
        assert!(site.out("partials/nav.html").is_file());
    }

    #[test]
    fn test_deleted_partial_rerenders_pages() {
        let site = Site::new();
        let (mut orchestrator, _) = site.orchestrator();
        orchestrator.execute(&BuildPlan::full()).unwrap();

        let header = site.config.source_root().join("views/header.njk");
        fs::remove_file(&header).unwrap();
        let summary = changed(&mut orchestrator, &header);

        // Both pages now fail to include it; their last output stays.
        assert_eq!(summary.report(Stage::Html).unwrap().warnings.len(), 2);
        assert!(site.out("index.html").is_file());
    }

    #[test]
    fn test_page_change_touches_only_that_page() {
        let site = Site::new();
        let (mut orchestrator, _) = site.orchestrator();
        orchestrator.execute(&BuildPlan::full()).unwrap();

        let about = site.write("about.njk", "<p>changed</p>");
        let summary = changed(&mut orchestrator, &about);

        assert_eq!(written_sources(&summary, Stage::Html), [about]);
        assert!(summary.report(Stage::Data).is_none());
    }

    #[test]
    fn test_stylesheet_partial_rebuilds_importers_only() {
        let site = Site::new();
        let (mut orchestrator, recording) = site.orchestrator();
        orchestrator.execute(&BuildPlan::full()).unwrap();
        recording.take();

        let colors = site.write("assets/css/_colors.scss", ".c { color: blue; }");
        let summary = changed(&mut orchestrator, &colors);

        let main = site.config.source_root().join("assets/css/main.scss");
        assert_eq!(written_sources(&summary, Stage::Styles), [main]);
        assert!(summary.report(Stage::Html).is_none());
        assert!(site.read("assets/css/main.min.css").contains("blue"));
        assert_eq!(recording.take(), [site.out("assets/css/main.min.css")]);
    }

    #[test]
    fn test_shared_partial_rebuilds_every_importer() {
        let site = Site::new();
        site.write("assets/css/extra.scss", "@import \"colors\";\n.extra { top: 0; }");
        let (mut orchestrator, _) = site.orchestrator();
        orchestrator.execute(&BuildPlan::full()).unwrap();
        let print = site.out("assets/css/print.min.css");
        let stamp = |path: &PathBuf| fs::metadata(path).unwrap().modified().unwrap();
        let print_before = (site.read("assets/css/print.min.css"), stamp(&print));

        let colors = site.write("assets/css/_colors.scss", ".c { color: blue; }");
        let summary = changed(&mut orchestrator, &colors);

        let root = site.config.source_root();
        assert_eq!(
            written_sources(&summary, Stage::Styles),
            [root.join("assets/css/extra.scss"), root.join("assets/css/main.scss")]
        );
        assert!(site.read("assets/css/extra.min.css").contains("blue"));
        assert!(site.read("assets/css/main.min.css").contains("blue"));
        assert_eq!(print_before, (site.read("assets/css/print.min.css"), stamp(&print)));
    }

    #[test]
    fn test_page_and_static_file_collision_is_reported() {
        let site = Site::new();
        site.write("static/index.html", "<p>static</p>");
        let (mut orchestrator, _) = site.orchestrator();

        let summary = orchestrator.execute(&BuildPlan::full()).unwrap();

        let collisions: Vec<_> = summary
            .warnings()
            .filter(|w| w.message.contains("is also produced by"))
            .collect();
        assert_eq!(collisions.len(), 2);
        assert_eq!(summary.report(Stage::Html).unwrap().warnings.len(), 1);
        assert_eq!(summary.report(Stage::Static).unwrap().warnings.len(), 1);
        assert_eq!(site.read("index.html"), "<p>static</p>");

        let copy = site.config.source_root().join("static/index.html");
        fs::remove_file(&copy).unwrap();
        let summary = changed(&mut orchestrator, &copy);
        assert!(summary.warnings().any(|w| w.message.contains("which is also produced by html")));
        assert!(!site.out("index.html").exists());

        orchestrator.execute(&BuildPlan::of(&[Stage::Html])).unwrap();
        assert_eq!(site.read("index.html"), "<h1>First</h1><p>home</p>");
    }

    #[test]
    fn test_malformed_template_keeps_last_good_output() {
        let site = Site::new();
        let (mut orchestrator, _) = site.orchestrator();
        orchestrator.execute(&BuildPlan::full()).unwrap();

        let index = site.write("index.njk", "<p>{{ site.title </p>");
        let summary = changed(&mut orchestrator, &index);

        let warnings: Vec<_> = summary.warnings().collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].path, index);
        assert_eq!(site.read("index.html"), "<h1>First</h1><p>home</p>");

        site.write("index.njk", "<p>{{ site.title }}</p>");
        let fixed = changed(&mut orchestrator, &index);
        assert_eq!(fixed.warnings().count(), 0);
        assert_eq!(site.read("index.html"), "<p>First</p>");
    }

    #[test]
    fn test_seed_skips_assets_by_default() {
        let site = Site::new();
        let (mut orchestrator, _) = site.orchestrator();

        let summary = orchestrator.seed(false).unwrap();

        assert!(summary.report(Stage::Data).is_some());
        assert!(site.out("index.html").is_file());
        assert!(!site.out("assets/css/main.min.css").exists());

        orchestrator.seed(true).unwrap();
        assert!(site.out("assets/css/main.min.css").is_file());
    }

    #[test]
    fn test_production_build_cleans_stale_output() {
        let site = Site::new();
        fs::create_dir_all(site.out("old")).unwrap();
        fs::write(site.out("old/stale.html"), "stale").unwrap();

        let summary = build_site(&site.config).unwrap();

        assert!(!site.out("old").exists());
        assert!(site.out("index.html").is_file());
        assert!(summary.written() > 0);
    }

    #[test]
    fn test_import_cycle_fails_validation() {
        let site = Site::new();
        site.write("assets/css/_colors.scss", "@use 'main';");

        assert!(build_site(&site.config).is_err());
        assert!(!site.out("index.html").exists());
    }

    #[test]
    fn test_watch_map_routes() {
        let site = Site::new();
        let (orchestrator, _) = site.orchestrator();
        let root = site.config.source_root();

        let plan = orchestrator.plan([root.join("views/header.njk").as_path()]);
        assert!(plan.contains(Stage::Views));
        assert_eq!(plan.get(Stage::Html), Some(&Changes::All));

        let plan = orchestrator.plan([root.join("assets/images/logo.png").as_path()]);
        assert_eq!(plan.stages().collect::<Vec<_>>(), [Stage::Images]);

        assert!(orchestrator.plan([Path::new("/elsewhere/file.txt")]).is_empty());
    }
}
