//! Stylesheet imports and the built-in bundler.
//!
//! [`SassImports`] only recognises `@import`, `@use` and `@forward`
//! statements with quoted targets. Targets resolve the way Sass resolves
//! partials, first next to the importing file, then from the stylesheet root:
//!
//! ```text
//! @use "base/colors"  →  base/colors.scss
//!                        base/_colors.scss
//!                        base/colors.sass, base/_colors.sass, base/colors.css
//!                        base/colors/_index.scss, base/colors/index.scss
//! ```
//!
//! Targets that resolve to nothing (`sass:math`, `url(...)`, remote files)
//! produce no edge and are left for the real compiler.
//!
//! The built-in bundler honours `[build.stylesheet] minify` only.
//! `vendor_prefixing` and `group_media_queries` need a real compiler: they
//! are exported to a configured `[build.commands] styles` program as
//! `KILN_VENDOR_PREFIXING` and `KILN_GROUP_MEDIA_QUERIES`.

use super::{Input, Processed, Processor, StageContext};
use anyhow::{Context, Result};
use kiln_core::ImportScanner;
use regex::Regex;
use rustc_hash::FxHashSet;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

static RE_STATEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"@(import|use|forward)[ \t]+((?:["'][^"'\n]+["'][ \t]*,?[ \t]*)+)[^;\n]*;?"#)
        .unwrap()
});

static RE_QUOTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"["']([^"'\n]+)["']"#).unwrap());

static RE_BLOCK_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*[^!].*?\*/").unwrap());

static RE_LINE_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*//[^\n]*$").unwrap());

static RE_WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[ \t\r\n]+").unwrap());

static RE_PUNCTUATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" ?([{};,>]) ?").unwrap());

/// Partial-aware resolver for stylesheet import targets.
#[derive(Debug, Clone)]
pub struct SassImports {
    root: PathBuf,
}

impl SassImports {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve `target` as imported from `importer`.
    pub fn resolve(&self, importer: &Path, target: &str) -> Option<PathBuf> {
        if target.contains(':') || target.starts_with("//") {
            return None;
        }
        let bases = importer.parent().into_iter().chain([self.root.as_path()]);
        bases
            .flat_map(|base| candidates(&base.join(target)))
            .find(|candidate| candidate.is_file())
    }

    /// Targets of every import statement in `content`, in source order.
    fn targets(content: &str) -> impl Iterator<Item = &str> {
        RE_STATEMENT.captures_iter(content).flat_map(|caps| {
            let list = caps.get(2).map_or("", |m| m.as_str());
            RE_QUOTED
                .captures_iter(list)
                .filter_map(|q| q.get(1).map(|m| m.as_str()))
                .collect::<Vec<_>>()
        })
    }
}

impl ImportScanner for SassImports {
    fn scan(&self, path: &Path, content: &str) -> Vec<PathBuf> {
        Self::targets(content)
            .filter_map(|target| self.resolve(path, target))
            .collect()
    }
}

/// Files `path` may refer to, in lookup order.
fn candidates(path: &Path) -> Vec<PathBuf> {
    if path.extension().is_some_and(|e| e == "scss" || e == "sass" || e == "css") {
        return vec![path.to_path_buf(), partial(path, "")];
    }

    let mut out = Vec::with_capacity(7);
    for ext in ["scss", "sass", "css"] {
        out.push(path.with_extension(ext));
        out.push(partial(path, ext));
    }
    out.push(path.join("_index.scss"));
    out.push(path.join("index.scss"));
    out
}

/// `dir/name` → `dir/_name.ext`.
fn partial(path: &Path, ext: &str) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    let partial = path.with_file_name(format!("_{name}"));
    if ext.is_empty() {
        partial
    } else {
        partial.with_extension(ext)
    }
}

// ============================================================================
// Bundler
// ============================================================================

/// Inlines resolved imports into one stylesheet.
///
/// Each file is inlined at most once per entry, matching `@use` semantics.
/// With `minify` set, comments are stripped, whitespace collapsed and
/// declarations tightened to `prop:value`; `/*! ... */` comments survive.
#[derive(Debug, Clone)]
pub struct StylesheetBundle {
    imports: SassImports,
}

impl StylesheetBundle {
    pub fn new(root: PathBuf) -> Self {
        Self {
            imports: SassImports::new(root),
        }
    }

    fn bundle(&self, path: &Path, content: &str, seen: &mut FxHashSet<PathBuf>) -> Result<String> {
        let mut out = String::with_capacity(content.len());
        let mut last = 0;

        for caps in RE_STATEMENT.captures_iter(content) {
            let (Some(all), Some(keyword), Some(list)) = (caps.get(0), caps.get(1), caps.get(2))
            else {
                continue;
            };
            out.push_str(&content[last..all.start()]);
            last = all.end();

            for quoted in RE_QUOTED.captures_iter(list.as_str()) {
                let Some(target) = quoted.get(1).map(|m| m.as_str()) else {
                    continue;
                };
                match self.imports.resolve(path, target) {
                    Some(file) => {
                        if !seen.insert(file.clone()) {
                            continue;
                        }
                        let source = fs::read_to_string(&file)
                            .with_context(|| format!("failed to read `{}`", file.display()))?;
                        out.push_str(&self.bundle(&file, &source, seen)?);
                        out.push('\n');
                    }
                    None => {
                        out.push_str(&format!("@{} \"{target}\";", keyword.as_str()));
                    }
                }
            }
        }

        out.push_str(&content[last..]);
        Ok(out)
    }
}

impl Processor for StylesheetBundle {
    fn process(&self, input: &Input<'_>, ctx: &StageContext) -> Result<Processed> {
        let mut seen = FxHashSet::from_iter([input.path.to_path_buf()]);
        let css = self.bundle(input.path, input.text()?, &mut seen)?;

        if ctx.stylesheet.minify {
            Ok(Processed::new(minify(&css)))
        } else {
            Ok(Processed::new(css))
        }
    }
}

fn minify(css: &str) -> String {
    let css = RE_BLOCK_COMMENT.replace_all(css, "");
    let css = RE_LINE_COMMENT.replace_all(&css, "");
    let css = RE_WHITESPACE.replace_all(&css, " ");
    let css = RE_PUNCTUATION.replace_all(&css, "$1");
    tighten_declarations(css.trim())
}

/// `color : red;` → `color:red;`. Segments closed by `{` are selectors or
/// at-rule preludes and keep their colons as written.
fn tighten_declarations(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut rest = css;
    while let Some(end) = rest.find(|c| matches!(c, '{' | '}' | ';')) {
        let (segment, tail) = rest.split_at(end);
        let delimiter = &tail[..1];
        match segment.split_once(':') {
            Some((property, value)) if delimiter != "{" => {
                out.push_str(property.trim_end());
                out.push(':');
                out.push_str(value.trim_start());
            }
            _ => out.push_str(segment),
        }
        out.push_str(delimiter);
        rest = &tail[1..];
    }
    out.push_str(rest);
    out
}
