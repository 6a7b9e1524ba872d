//! File system watcher for development mode.
//!
//! Watches the source root and turns batches of changes into build plans.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌────────────────────┐    ┌──────────────┐
//! │ notify   │───▶│ Debouncer │───▶│ WatchMap::plan     │───▶│ Orchestrator │
//! │ events   │    │ (300ms)   │    │ (coalesced paths)  │    │ ::execute    │
//! └──────────┘    └───────────┘    └────────────────────┘    └──────────────┘
//! ```
//!
//! Events arriving while a build runs wait in the channel and are coalesced
//! into the next batch. Build failures are logged; the loop keeps going
//! until [`Watch::stop`].

use crate::{
    build::{BuildSummary, Orchestrator},
    config::SiteConfig,
    log,
    logger::timestamp,
    pipeline::is_ignored,
};
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rustc_hash::FxHashSet;
use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

// =============================================================================
// Constants
// =============================================================================

const DEBOUNCE_MS: u64 = 300;

/// Upper bound on how long shutdown waits for the loop to notice.
const SHUTDOWN_POLL_MS: u64 = 200;

// =============================================================================
// Debounce State
// =============================================================================

/// Batches rapid file events until the tree is quiet.
struct Debouncer {
    pending: FxHashSet<PathBuf>,
    last_event: Option<Instant>,
}

impl Debouncer {
    fn new() -> Self {
        Self {
            pending: FxHashSet::default(),
            last_event: None,
        }
    }

    fn add(&mut self, paths: impl IntoIterator<Item = PathBuf>, output: &Path) {
        for path in paths {
            if !is_ignored(&path) && !path.starts_with(output) {
                self.pending.insert(path);
            }
        }
        self.last_event = Some(Instant::now());
    }

    fn ready(&self) -> bool {
        !self.pending.is_empty()
            && self
                .last_event
                .is_some_and(|t| t.elapsed() >= Duration::from_millis(DEBOUNCE_MS))
    }

    /// Pending paths, sorted so plans and logs are stable.
    fn take(&mut self) -> Vec<PathBuf> {
        self.last_event = None;
        let mut paths: Vec<_> = self.pending.drain().collect();
        paths.sort();
        paths
    }

    fn timeout(&self) -> Duration {
        if self.pending.is_empty() {
            Duration::from_millis(SHUTDOWN_POLL_MS)
        } else {
            Duration::from_millis(DEBOUNCE_MS.min(SHUTDOWN_POLL_MS))
        }
    }
}

const fn is_relevant(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
    )
}

// =============================================================================
// Event Handler
// =============================================================================

/// `/proj/src/assets/css/a.scss` → `assets/css/a.scss`
fn rel_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}

/// Build whatever `paths` affect. Returns `None` when nothing was routed or
/// the build failed.
fn rebuild(orchestrator: &mut Orchestrator, root: &Path, paths: &[PathBuf]) -> Option<BuildSummary> {
    let plan = orchestrator.plan(paths.iter().map(PathBuf::as_path));
    if plan.is_empty() {
        return None;
    }

    let names: Vec<_> = paths.iter().map(|p| rel_path(p, root)).collect();
    log!("watch"; "{} {} changed", timestamp(), names.join(", "));

    match orchestrator.execute(&plan) {
        Ok(summary) => {
            let warnings = summary.warnings().count();
            if warnings > 0 {
                log!("watch"; "{} rebuilt with {warnings} warning(s)", timestamp());
            }
            Some(summary)
        }
        Err(err) => {
            log!("error"; "{err:#}");
            None
        }
    }
}

fn event_loop(
    mut orchestrator: Orchestrator,
    rx: &Receiver<notify::Result<Event>>,
    root: &Path,
    output: &Path,
    shutdown: &AtomicBool,
) {
    let mut debouncer = Debouncer::new();

    while !shutdown.load(Ordering::SeqCst) {
        match rx.recv_timeout(debouncer.timeout()) {
            Ok(Ok(event)) if is_relevant(&event) => debouncer.add(event.paths, output),
            Ok(Err(e)) => log!("watch"; "error: {e}"),
            Err(RecvTimeoutError::Timeout) if debouncer.ready() => {
                rebuild(&mut orchestrator, root, &debouncer.take());
            }
            Err(RecvTimeoutError::Disconnected) => break,
            _ => {}
        }
    }
}

// =============================================================================
// Public API
// =============================================================================

/// A running watch loop. Dropping it without [`Watch::stop`] detaches the loop.
pub struct Watch {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Watch {
    /// Watch the source root and rebuild through `orchestrator`.
    pub fn start(orchestrator: Orchestrator, config: &SiteConfig) -> Result<Self> {
        let root = config.source_root().to_path_buf();
        let output = config.output_root().to_path_buf();

        let (tx, rx) = mpsc::channel();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(tx).context("Failed to create file watcher")?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;
        log!("watch"; "watching {}", root.display());

        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new()
            .name("kiln-watch".into())
            .spawn({
                let shutdown = Arc::clone(&shutdown);
                move || {
                    event_loop(orchestrator, &rx, &root, &output, &shutdown);
                    // Stops event delivery before the receiver goes away.
                    drop(watcher);
                }
            })
            .context("Failed to spawn watch thread")?;

        Ok(Self { shutdown, handle })
    }

    /// Stop the loop and wait for an in-flight build to finish.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if self.handle.join().is_err() {
            log!("watch"; "watch thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Mode, reload::NullNotifier};
    use kiln_core::Stage;
    use std::fs;

    fn site() -> (tempfile::TempDir, SiteConfig) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/assets/css")).unwrap();
        fs::write(dir.path().join("src/index.njk"), "home").unwrap();
        fs::write(dir.path().join("src/assets/css/a.scss"), "a {}").unwrap();
        let mut config = SiteConfig::default();
        config.mode = Mode::Development;
        config.update_path_with_root(dir.path());
        (dir, config)
    }

    #[test]
    fn test_debouncer_filters_and_waits() {
        let mut debouncer = Debouncer::new();
        let output = Path::new("/site/dist");
        debouncer.add(
            [
                PathBuf::from("/site/src/b.njk"),
                PathBuf::from("/site/src/.b.njk.swp"),
                PathBuf::from("/site/dist/b.html"),
                PathBuf::from("/site/src/a.njk"),
                PathBuf::from("/site/src/a.njk"),
            ],
            output,
        );

        assert!(!debouncer.ready());
        debouncer.last_event = Some(Instant::now() - Duration::from_millis(DEBOUNCE_MS));
        assert!(debouncer.ready());
        assert_eq!(
            debouncer.take(),
            [PathBuf::from("/site/src/a.njk"), PathBuf::from("/site/src/b.njk")]
        );
        assert!(!debouncer.ready());
    }

    #[test]
    fn test_rebuild_routes_changed_files() {
        let (_dir, config) = site();
        let mut orchestrator = Orchestrator::new(&config, Arc::new(NullNotifier)).unwrap();
        orchestrator.seed(true).unwrap();

        let css = config.source_root().join("assets/css/a.scss");
        fs::write(&css, "a { color: red; }").unwrap();
        let summary = rebuild(&mut orchestrator, config.source_root(), &[css]).unwrap();

        let stages: Vec<_> = summary.reports.iter().map(|r| r.stage).collect();
        assert_eq!(stages, [Stage::Styles]);
    }

    #[test]
    fn test_unrouted_changes_do_nothing() {
        let (_dir, config) = site();
        let mut orchestrator = Orchestrator::new(&config, Arc::new(NullNotifier)).unwrap();
        let stray = config.source_root().join("notes.txt");

        assert!(rebuild(&mut orchestrator, config.source_root(), &[stray]).is_none());
    }

    #[test]
    fn test_start_and_stop() {
        let (_dir, config) = site();
        let orchestrator = Orchestrator::new(&config, Arc::new(NullNotifier)).unwrap();

        let watch = Watch::start(orchestrator, &config).unwrap();
        watch.stop();
    }
}
