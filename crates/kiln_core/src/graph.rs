//! Dependency tracking between source files of one stage.
//!
//! # Architecture
//!
//! ```text
//! ImportScanner ──► edges ──► DependencyGraph ──► affected(changed)
//!  (per file)                  imports / imported_by     │
//!                                                         ▼
//!                                         changed file + every transitive
//!                                         importer of it
//! ```
//!
//! Edges point from an importer to what it reads. The graph must be acyclic
//! within a stage; [`DependencyGraph::check_acyclic`] reports the offending
//! files instead of letting a closure walk forever.

use rustc_hash::{FxHashMap, FxHashSet};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Dependency graph errors. Always a configuration problem.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("dependency cycle: {}", Cycle(.cycle))]
    Cycle { cycle: Vec<PathBuf> },
}

/// Display helper: `a -> b -> a`.
struct Cycle<'a>(&'a [PathBuf]);

impl fmt::Display for Cycle<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, path) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{}", path.display())?;
        }
        if let Some(first) = self.0.first() {
            write!(f, " -> {}", first.display())?;
        }
        Ok(())
    }
}

/// Directed importer → imported edges, with the reverse index.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    imports: FxHashMap<PathBuf, FxHashSet<PathBuf>>,
    imported_by: FxHashMap<PathBuf, FxHashSet<PathBuf>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_edge(&mut self, importer: &Path, imported: &Path) {
        self.imports
            .entry(importer.to_path_buf())
            .or_default()
            .insert(imported.to_path_buf());
        self.imported_by
            .entry(imported.to_path_buf())
            .or_default()
            .insert(importer.to_path_buf());
    }

    /// Replace all outgoing edges of `importer`.
    pub fn set_imports<I>(&mut self, importer: &Path, imports: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        if let Some(old) = self.imports.remove(importer) {
            for imported in old {
                if let Some(dependents) = self.imported_by.get_mut(&imported) {
                    dependents.remove(importer);
                    if dependents.is_empty() {
                        self.imported_by.remove(&imported);
                    }
                }
            }
        }
        for imported in imports {
            self.add_edge(importer, &imported);
        }
    }

    pub fn clear(&mut self) {
        self.imports.clear();
        self.imported_by.clear();
    }

    /// Files `importer` reads directly.
    pub fn imports_of(&self, importer: &Path) -> impl Iterator<Item = &PathBuf> {
        self.imports.get(importer).into_iter().flatten()
    }

    /// Files that read `imported` directly.
    pub fn dependents(&self, imported: &Path) -> impl Iterator<Item = &PathBuf> {
        self.imported_by.get(imported).into_iter().flatten()
    }

    /// `changed` plus every file that imports it, directly or transitively.
    ///
    /// Terminates on cyclic graphs as well; cycles are reported separately.
    pub fn affected(&self, changed: &Path) -> FxHashSet<PathBuf> {
        let mut seen = FxHashSet::default();
        let mut stack = vec![changed.to_path_buf()];

        while let Some(path) = stack.pop() {
            if !seen.insert(path.clone()) {
                continue;
            }
            stack.extend(self.dependents(&path).filter(|p| !seen.contains(*p)).cloned());
        }

        seen
    }

    /// Find one import cycle, if any.
    ///
    /// Nodes are visited in sorted order so the reported cycle is stable.
    pub fn find_cycle(&self) -> Option<Vec<PathBuf>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a DependencyGraph,
            node: &'a PathBuf,
            marks: &mut FxHashMap<&'a PathBuf, Mark>,
            path: &mut Vec<&'a PathBuf>,
        ) -> Option<Vec<PathBuf>> {
            match marks.get(node) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|p| *p == node).unwrap_or(0);
                    return Some(path[start..].iter().map(|p| (*p).clone()).collect());
                }
                None => {}
            }

            marks.insert(node, Mark::Visiting);
            path.push(node);

            let mut next: Vec<_> = graph.imports_of(node).collect();
            next.sort();
            for child in next {
                if let Some(cycle) = visit(graph, child, marks, path) {
                    return Some(cycle);
                }
            }

            path.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut roots: Vec<_> = self.imports.keys().collect();
        roots.sort();

        let mut marks = FxHashMap::default();
        let mut path = Vec::new();
        roots
            .into_iter()
            .find_map(|root| visit(self, root, &mut marks, &mut path))
    }

    pub fn check_acyclic(&self) -> Result<(), GraphError> {
        match self.find_cycle() {
            Some(cycle) => Err(GraphError::Cycle { cycle }),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Resolvers
// ============================================================================

/// Computes which files of a stage a change affects.
pub trait Resolver: Send + Sync {
    /// Rebuild edges from the stage's current sources.
    fn refresh(&mut self, sources: &[PathBuf]) -> Result<(), GraphError>;

    /// `changed` plus every source whose output depends on it.
    fn affected(&self, changed: &Path) -> FxHashSet<PathBuf>;
}

/// Every file stands alone: a change affects only the file itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct Isolated;

impl Resolver for Isolated {
    fn refresh(&mut self, _sources: &[PathBuf]) -> Result<(), GraphError> {
        Ok(())
    }

    fn affected(&self, changed: &Path) -> FxHashSet<PathBuf> {
        FxHashSet::from_iter([changed.to_path_buf()])
    }
}

/// Extracts the resolved import targets of one source file.
///
/// Implementations only recognise import statements; they never parse the
/// rest of the language.
pub trait ImportScanner: Send + Sync {
    fn scan(&self, path: &Path, content: &str) -> Vec<PathBuf>;
}

/// Resolver backed by an import scanner, rebuilt from scratch on refresh.
#[derive(Debug, Default)]
pub struct ImportResolver<S> {
    scanner: S,
    graph: DependencyGraph,
}

impl<S: ImportScanner> ImportResolver<S> {
    pub fn new(scanner: S) -> Self {
        Self {
            scanner,
            graph: DependencyGraph::new(),
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }
}

impl<S: ImportScanner> Resolver for ImportResolver<S> {
    fn refresh(&mut self, sources: &[PathBuf]) -> Result<(), GraphError> {
        self.graph.clear();
        for path in sources {
            // Unreadable files get no edges; processing reports them.
            let Ok(content) = fs::read_to_string(path) else {
                continue;
            };
            let imports = self.scanner.scan(path, &content);
            self.graph.set_imports(path, imports);
        }
        self.graph.check_acyclic()
    }

    fn affected(&self, changed: &Path) -> FxHashSet<PathBuf> {
        self.graph.affected(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PathBuf {
        PathBuf::from(s)
    }

    fn sorted(set: FxHashSet<PathBuf>) -> Vec<PathBuf> {
        let mut v: Vec<_> = set.into_iter().collect();
        v.sort();
        v
    }

    #[test]
    fn test_file_without_dependents_affects_itself() {
        let graph = DependencyGraph::new();
        assert_eq!(sorted(graph.affected(&p("c.scss"))), vec![p("c.scss")]);
    }

    #[test]
    fn test_transitive_closure() {
        let mut graph = DependencyGraph::new();
        // a -> _mixins -> _vars, b -> _vars, c standalone
        graph.add_edge(&p("a.scss"), &p("_mixins.scss"));
        graph.add_edge(&p("_mixins.scss"), &p("_vars.scss"));
        graph.add_edge(&p("b.scss"), &p("_vars.scss"));
        graph.add_edge(&p("c.scss"), &p("_other.scss"));

        assert_eq!(
            sorted(graph.affected(&p("_vars.scss"))),
            vec![p("_mixins.scss"), p("_vars.scss"), p("a.scss"), p("b.scss")]
        );
        assert_eq!(
            sorted(graph.affected(&p("_mixins.scss"))),
            vec![p("_mixins.scss"), p("a.scss")]
        );
    }

    #[test]
    fn test_set_imports_replaces_edges() {
        let mut graph = DependencyGraph::new();
        graph.set_imports(&p("a.scss"), [p("_x.scss")]);
        graph.set_imports(&p("a.scss"), [p("_y.scss")]);

        assert_eq!(graph.dependents(&p("_x.scss")).count(), 0);
        assert_eq!(
            graph.dependents(&p("_y.scss")).collect::<Vec<_>>(),
            vec![&p("a.scss")]
        );
    }

    #[test]
    fn test_cycle_detected() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(&p("a.scss"), &p("_b.scss"));
        graph.add_edge(&p("_b.scss"), &p("_c.scss"));
        graph.add_edge(&p("_c.scss"), &p("a.scss"));

        let err = graph.check_acyclic().unwrap_err();
        let GraphError::Cycle { cycle } = &err;
        assert_eq!(cycle.len(), 3);
        assert!(err.to_string().contains("dependency cycle"));

        // Closure still terminates.
        assert_eq!(graph.affected(&p("a.scss")).len(), 3);
    }

    #[test]
    fn test_self_import_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(&p("a.scss"), &p("a.scss"));
        assert!(graph.find_cycle().is_some());
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(&p("a"), &p("b"));
        graph.add_edge(&p("a"), &p("c"));
        graph.add_edge(&p("b"), &p("d"));
        graph.add_edge(&p("c"), &p("d"));
        assert!(graph.check_acyclic().is_ok());
    }

    struct LineScanner;

    impl ImportScanner for LineScanner {
        fn scan(&self, path: &Path, content: &str) -> Vec<PathBuf> {
            let dir = path.parent().unwrap_or(Path::new(""));
            content
                .lines()
                .filter_map(|l| l.strip_prefix("import "))
                .map(|name| dir.join(name.trim()))
                .collect()
        }
    }

    #[test]
    fn test_import_resolver_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let shared = dir.path().join("shared");
        fs::write(&a, "import shared\n").unwrap();
        fs::write(&b, "import shared\n").unwrap();
        fs::write(&shared, "").unwrap();

        let mut resolver = ImportResolver::new(LineScanner);
        resolver
            .refresh(&[a.clone(), b.clone(), shared.clone()])
            .unwrap();

        let affected = resolver.affected(&shared);
        assert!(affected.contains(&a));
        assert!(affected.contains(&b));
        assert!(affected.contains(&shared));

        // Edges are rebuilt from scratch.
        fs::write(&b, "").unwrap();
        resolver.refresh(&[a.clone(), b.clone(), shared.clone()]).unwrap();
        assert!(!resolver.affected(&shared).contains(&b));
    }

    #[test]
    fn test_import_resolver_reports_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "import b\n").unwrap();
        fs::write(&b, "import a\n").unwrap();

        let mut resolver = ImportResolver::new(LineScanner);
        assert!(matches!(
            resolver.refresh(&[a, b]),
            Err(GraphError::Cycle { .. })
        ));
    }
}
