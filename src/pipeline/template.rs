//! Built-in page renderer.
//!
//! Understands three tags and nothing else:
//!
//! | Tag                      | Effect                                   |
//! |--------------------------|------------------------------------------|
//! | `{{ site.title }}`       | dotted lookup in the site data snapshot  |
//! | `{% include "nav.njk" %}`| render a partial                         |
//! | `{# note #}`             | comment, dropped                         |
//!
//! Missing values render as an empty string. Anything richer belongs to an
//! external command configured under `[build.commands] html`.
//!
//! Only partials can be included: template files under the views directory,
//! or `_`-prefixed template files anywhere under the source root. Those are
//! exactly the files whose change re-renders every page; including a page
//! is an error.

use super::{Input, Processed, Processor, StageContext};
use anyhow::{Context, Result, bail};
use serde_json::Value;
use std::{
    fs,
    path::{Component, Path, PathBuf},
};

/// Nesting limit for `{% include %}`, reached only by recursive partials.
const MAX_INCLUDE_DEPTH: usize = 16;

const OPENERS: [(&str, &str); 3] = [("{{", "}}"), ("{%", "%}"), ("{#", "#}")];

#[derive(Debug, Clone)]
pub struct Template {
    views: PathBuf,
    ext: String,
    minify: bool,
}

impl Template {
    pub fn new(views: PathBuf, ext: impl Into<String>, minify: bool) -> Self {
        Self {
            views,
            ext: ext.into(),
            minify,
        }
    }

    /// Render `source`, read from `path`, against `data`.
    pub fn render(&self, source: &str, path: &Path, data: &Value, root: &Path) -> Result<String> {
        self.render_at(source, path, data, root, 0)
    }

    fn render_at(
        &self,
        source: &str,
        path: &Path,
        data: &Value,
        root: &Path,
        depth: usize,
    ) -> Result<String> {
        let mut out = String::with_capacity(source.len());
        let mut rest = source;

        while let Some((start, open, close)) = next_tag(rest) {
            out.push_str(&rest[..start]);
            let body_start = start + open.len();
            let Some(len) = rest[body_start..].find(close) else {
                let offset = source.len() - rest.len() + start;
                bail!(
                    "{}:{}: unclosed `{open}`",
                    path.display(),
                    line_of(source, offset)
                );
            };
            let body = rest[body_start..body_start + len].trim();

            match open {
                "{{" => out.push_str(&lookup(data, body).with_context(|| {
                    let offset = source.len() - rest.len() + start;
                    format!("{}:{}", path.display(), line_of(source, offset))
                })?),
                "{%" => out.push_str(&self.tag(body, path, data, root, depth)?),
                _ => {}
            }
            rest = &rest[body_start + len + close.len()..];
        }

        out.push_str(rest);
        Ok(out)
    }

    fn tag(&self, body: &str, path: &Path, data: &Value, root: &Path, depth: usize) -> Result<String> {
        let Some(name) = body.strip_prefix("include").and_then(|arg| unquote(arg.trim())) else {
            bail!("{}: unsupported tag `{{% {body} %}}`", path.display());
        };
        if depth >= MAX_INCLUDE_DEPTH {
            bail!(
                "{}: include depth exceeds {MAX_INCLUDE_DEPTH}, is `{name}` including itself?",
                path.display()
            );
        }

        let partial = self.partial(name, path, root)?;
        let source = fs::read_to_string(&partial)
            .with_context(|| format!("failed to read `{}`", partial.display()))?;

        self.render_at(&source, &partial, data, root, depth + 1)
    }
}

impl Template {
    /// Resolve an include target: the views directory first, then the
    /// source root for `_` partials.
    fn partial(&self, name: &str, path: &Path, root: &Path) -> Result<PathBuf> {
        let rel = Path::new(name);
        let relative = rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !relative || !rel.extension().is_some_and(|e| e == self.ext.as_str()) {
            bail!(
                "{}: include `{name}` must be a relative `.{}` file",
                path.display(),
                self.ext
            );
        }

        let in_views = self.views.join(rel);
        if in_views.is_file() {
            return Ok(in_views);
        }
        let in_root = root.join(rel);
        if !in_root.is_file() {
            bail!("{}: include `{name}` not found", path.display());
        }
        let underscored = rel
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('_'));
        if !underscored && !in_root.starts_with(&self.views) {
            bail!(
                "{}: include `{name}` is a page, not a partial; move it to the views directory or prefix it with `_`",
                path.display()
            );
        }
        Ok(in_root)
    }
}

impl Processor for Template {
    fn process(&self, input: &Input<'_>, ctx: &StageContext) -> Result<Processed> {
        let empty = Value::Null;
        let data = ctx.site_data.as_deref().unwrap_or(&empty);
        let html = self.render(input.text()?, input.path, data, &ctx.source_root)?;

        if self.minify {
            Ok(Processed::new(minify(html.as_bytes())))
        } else {
            Ok(Processed::new(html))
        }
    }
}

/// Earliest tag opener in `s`, with its closer.
fn next_tag(s: &str) -> Option<(usize, &'static str, &'static str)> {
    OPENERS
        .iter()
        .filter_map(|&(open, close)| s.find(open).map(|at| (at, open, close)))
        .min_by_key(|&(at, ..)| at)
}

fn line_of(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

fn unquote(s: &str) -> Option<&str> {
    ['"', '\'']
        .into_iter()
        .find_map(|q| s.strip_prefix(q).and_then(|s| s.strip_suffix(q)))
        .filter(|name| !name.is_empty())
}

/// Resolve a dotted path like `posts.0.title`.
fn lookup(data: &Value, expr: &str) -> Result<String> {
    let valid = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.');
    if expr.is_empty() || !expr.chars().all(valid) {
        bail!("unsupported expression `{{{{ {expr} }}}}`");
    }

    let value = expr.split('.').try_fold(data, |value, key| match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    });

    Ok(match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    })
}

fn minify(html: &[u8]) -> Vec<u8> {
    let mut cfg = minify_html::Cfg::new();
    cfg.keep_closing_tags = true;
    cfg.keep_html_and_head_opening_tags = true;
    cfg.keep_comments = false;
    cfg.minify_css = true;
    cfg.minify_js = true;
    minify_html::minify(html, &cfg)
}
