//! Glob patterns for routing source files to stages.
//!
//! Patterns are matched against paths relative to the source root, always
//! written with `/` separators regardless of platform.
//!
//! | Syntax    | Meaning                                  |
//! |-----------|------------------------------------------|
//! | `*`       | any run of characters except `/`         |
//! | `?`       | a single character except `/`            |
//! | `**/`     | zero or more whole directories           |
//! | `**`      | (trailing) everything below this point   |
//! | `{a,b}`   | alternation, not nested                  |
//! | `[a-z]`   | character class, `[!x]` negates          |
//!
//! Patterns compile to an anchored [`Regex`] once, at startup.

use regex::Regex;
use std::path::{Component, Path};
use thiserror::Error;

/// Glob compilation errors.
#[derive(Debug, Error)]
pub enum GlobError {
    #[error("invalid glob `{pattern}`: {reason}")]
    Invalid {
        pattern: String,
        reason: &'static str,
    },

    #[error("glob `{pattern}` compiled to an invalid expression")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

impl GlobError {
    fn invalid(pattern: &str, reason: &'static str) -> Self {
        Self::Invalid {
            pattern: pattern.to_owned(),
            reason,
        }
    }
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, GlobError> {
        let source = translate(pattern)?;
        let regex = Regex::new(&source).map_err(|source| GlobError::Regex {
            pattern: pattern.to_owned(),
            source,
        })?;
        Ok(Self {
            pattern: pattern.to_owned(),
            regex,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Match a root-relative path.
    pub fn matches(&self, rel: &Path) -> bool {
        self.regex.is_match(&to_slash(rel))
    }

    /// Match a root-relative path already in `/` form.
    pub fn matches_str(&self, rel: &str) -> bool {
        self.regex.is_match(rel)
    }
}

/// Include patterns minus exclude patterns.
///
/// A path matches when any include pattern matches and no exclude pattern does.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    include: Vec<Glob>,
    exclude: Vec<Glob>,
}

impl PatternSet {
    pub fn new<I, S>(include: I) -> Result<Self, GlobError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let include = include
            .into_iter()
            .map(|p| Glob::new(p.as_ref()))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            include,
            exclude: Vec::new(),
        })
    }

    /// Add an exclude pattern.
    pub fn exclude(mut self, pattern: &str) -> Result<Self, GlobError> {
        self.exclude.push(Glob::new(pattern)?);
        Ok(self)
    }

    pub fn matches(&self, rel: &Path) -> bool {
        self.matches_str(&to_slash(rel))
    }

    pub fn matches_str(&self, rel: &str) -> bool {
        self.include.iter().any(|g| g.matches_str(rel))
            && !self.exclude.iter().any(|g| g.matches_str(rel))
    }

    /// Include patterns, for display.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.include.iter().map(Glob::as_str)
    }
}

/// Render a relative path with `/` separators.
///
/// Only normal components are kept; `.` and prefixes are dropped.
pub fn to_slash(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if let Component::Normal(part) = component {
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(&part.to_string_lossy());
        }
    }
    out
}

/// Translate a glob into an anchored regular expression.
fn translate(pattern: &str) -> Result<String, GlobError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    let mut in_group = false;
    let mut i = 0;

    out.push('^');
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if i > 0 && chars[i - 1] != '/' {
                    return Err(GlobError::invalid(pattern, "`**` must be a whole path segment"));
                }
                match chars.get(i + 2) {
                    Some('/') => {
                        out.push_str("(?:[^/]*/)*");
                        i += 3;
                    }
                    None => {
                        out.push_str(".*");
                        i += 2;
                    }
                    Some(_) => {
                        return Err(GlobError::invalid(pattern, "`**` must be a whole path segment"));
                    }
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            '{' if in_group => {
                return Err(GlobError::invalid(pattern, "nested `{` is not supported"));
            }
            '{' => {
                in_group = true;
                out.push_str("(?:");
            }
            ',' if in_group => out.push('|'),
            '}' if in_group => {
                in_group = false;
                out.push(')');
            }
            '[' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|&c| c == ']')
                    .ok_or_else(|| GlobError::invalid(pattern, "unclosed `[`"))?;
                let body = &chars[i + 1..i + 1 + close];
                let (negated, body) = match body.split_first() {
                    Some(('!', rest)) => (true, rest),
                    _ => (false, body),
                };
                if body.is_empty() {
                    return Err(GlobError::invalid(pattern, "empty character class"));
                }
                out.push('[');
                if negated {
                    out.push('^');
                }
                for &ch in body {
                    if matches!(ch, '\\' | '[' | ']' | '^' | '&' | '~') {
                        out.push('\\');
                    }
                    out.push(ch);
                }
                out.push(']');
                i += close + 2;
                continue;
            }
            _ => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
        i += 1;
    }

    if in_group {
        return Err(GlobError::invalid(pattern, "unclosed `{`"));
    }
    out.push('$');
    Ok(out)
}
