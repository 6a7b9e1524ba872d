//! Core infrastructure for incremental asset pipelines.
//!
//! This crate holds the parts of the build that have invariants of their own
//! and no opinion about file formats:
//!
//! - [`glob`]: source patterns, compiled once
//! - [`cache`]: per-stage memoization with scoped invalidation
//! - [`graph`]: import edges, transitive closure, cycle detection
//! - [`plan`]: watch routing table and coalesced build plans
//! - [`stage`]: stage vocabulary and phase ordering
//!
//! # Flow
//!
//! ```text
//! changed paths ──► WatchMap::plan ──► BuildPlan ──► per stage:
//!                                                     Resolver::affected
//!                                                     CacheStore::should_process
//!                                                     (process, write)
//!                                                     CacheStore::record
//! ```

pub mod cache;
pub mod glob;
pub mod graph;
pub mod plan;
pub mod stage;

pub use cache::{CacheStore, Fingerprint, Generation, Identity};
pub use glob::{Glob, GlobError, PatternSet};
pub use graph::{DependencyGraph, GraphError, ImportResolver, ImportScanner, Isolated, Resolver};
pub use plan::{BuildPlan, Changes, WatchMap};
pub use stage::Stage;
