//! Watch routing and build plans.
//!
//! A [`WatchMap`] is the static table that routes a changed file to the
//! ordered stages that must run again. A batch of changed files becomes a
//! [`BuildPlan`]: one [`Changes`] per stage, executed phase by phase.
//!
//! # Routing rule
//!
//! The first stage of a matched sequence receives the changed file itself.
//! Later stages of the sequence were triggered by an upstream result, so they
//! run over all their sources and rely on their cache to skip work.
//!
//! ```text
//! data/site.json  ──► [Data, Html]    Data: {data/site.json}   Html: All
//! assets/css/_x   ──► [Styles]        Styles: {assets/css/_x}
//! ```

use crate::{glob::PatternSet, stage::Stage};
use smallvec::SmallVec;
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

/// What a stage run should consider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Changes {
    /// Every source of the stage.
    All,
    /// Only these files and whatever depends on them.
    Files(BTreeSet<PathBuf>),
}

impl Changes {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::Files(BTreeSet::from([path.into()]))
    }

    /// Union with `other`. `All` absorbs any file set.
    pub fn merge(&mut self, other: Self) {
        match (&mut *self, other) {
            (Self::All, _) => {}
            (this, Self::All) => *this = Self::All,
            (Self::Files(mine), Self::Files(theirs)) => mine.extend(theirs),
        }
    }

    pub const fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

/// Ordered stage runs derived from a batch of changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildPlan {
    steps: BTreeMap<Stage, Changes>,
}

impl BuildPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stage over all sources.
    pub fn full() -> Self {
        Self::of(&Stage::ALL)
    }

    /// The given stages over all sources.
    pub fn of(stages: &[Stage]) -> Self {
        let mut plan = Self::new();
        for &stage in stages {
            plan.add(stage, Changes::All);
        }
        plan
    }

    pub fn add(&mut self, stage: Stage, changes: Changes) {
        match self.steps.get_mut(&stage) {
            Some(existing) => existing.merge(changes),
            None => {
                self.steps.insert(stage, changes);
            }
        }
    }

    /// Merge another plan into this one.
    pub fn extend(&mut self, other: Self) {
        for (stage, changes) in other.steps {
            self.add(stage, changes);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.steps.contains_key(&stage)
    }

    pub fn get(&self, stage: Stage) -> Option<&Changes> {
        self.steps.get(&stage)
    }

    /// Stages in build order.
    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.steps.keys().copied()
    }

    /// Steps grouped by phase, phases in ascending order.
    pub fn phases(&self) -> Vec<Vec<(Stage, &Changes)>> {
        let mut phases: Vec<Vec<(Stage, &Changes)>> = Vec::new();
        let mut current = None;
        for (&stage, changes) in &self.steps {
            if current != Some(stage.phase()) {
                current = Some(stage.phase());
                phases.push(Vec::new());
            }
            if let Some(group) = phases.last_mut() {
                group.push((stage, changes));
            }
        }
        phases
    }
}

/// One row of the watch table.
#[derive(Debug, Clone)]
pub struct WatchRule {
    patterns: PatternSet,
    tasks: SmallVec<[Stage; 3]>,
}

impl WatchRule {
    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    pub fn tasks(&self) -> &[Stage] {
        &self.tasks
    }
}

/// Static routing table from source patterns to stage sequences.
///
/// Built once at startup and never modified during a watch session.
#[derive(Debug, Clone, Default)]
pub struct WatchMap {
    rules: Vec<WatchRule>,
}

impl WatchMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route. `tasks` must be listed in build order.
    pub fn route(mut self, patterns: PatternSet, tasks: &[Stage]) -> Self {
        debug_assert!(
            tasks.windows(2).all(|w| w[0] < w[1]),
            "watch route tasks must be in build order"
        );
        self.rules.push(WatchRule {
            patterns,
            tasks: SmallVec::from_slice(tasks),
        });
        self
    }

    pub fn rules(&self) -> &[WatchRule] {
        &self.rules
    }

    /// Every task sequence routed for a root-relative path.
    pub fn lookup<'a>(&'a self, rel: &'a Path) -> impl Iterator<Item = &'a [Stage]> + 'a {
        self.rules
            .iter()
            .filter(move |rule| rule.patterns.matches(rel))
            .map(WatchRule::tasks)
    }

    /// Coalesce a batch of changed paths into one plan.
    ///
    /// Paths outside `root` or matching no route are ignored.
    pub fn plan<'p, I>(&self, root: &Path, paths: I) -> BuildPlan
    where
        I: IntoIterator<Item = &'p Path>,
    {
        let mut plan = BuildPlan::new();
        for path in paths {
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            for tasks in self.lookup(rel) {
                if let Some((first, rest)) = tasks.split_first() {
                    plan.add(*first, Changes::file(path));
                    for &stage in rest {
                        plan.add(stage, Changes::All);
                    }
                }
            }
        }
        plan
    }
}
