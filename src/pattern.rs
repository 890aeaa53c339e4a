//! Gitignore-style path patterns, compiled for the two policy sinks.
//!
//! The profile sink turns a pattern into an anchored regex in the host
//! profile dialect. The mount sink expands a pattern into the set of
//! currently existing absolute paths. Patterns that neither sink can express
//! are rejected at parse time rather than silently dropped.

use std::path::PathBuf;

use crate::error::{Result, SandboxError};
use crate::utils::path::canonicalize_existing;
use crate::utils::{contains_glob_chars, expand_home};

/// A parsed path pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct PathGlob {
    raw: String,
    body: String,
    negated: bool,
    dir_only: bool,
    anchored: bool,
}

impl PathGlob {
    /// Parse a gitignore-style pattern.
    ///
    /// Supported syntax: `**`, `*`, `?`, `[abc]`/`[!abc]` classes, leading
    /// `/` anchoring, trailing `/` for directories, leading `!` negation.
    pub fn parse(pattern: &str) -> Result<Self> {
        let raw = pattern.to_string();
        let reject = |reason: &str| -> SandboxError {
            SandboxError::InvalidPathPattern {
                pattern: raw.clone(),
                reason: reason.to_string(),
            }
        };

        let mut body = pattern.trim().to_string();
        if body.is_empty() {
            return Err(reject("pattern is empty"));
        }

        let negated = if let Some(rest) = body.strip_prefix('!') {
            body = rest.to_string();
            true
        } else {
            false
        };

        let dir_only = if body.len() > 1 && body.ends_with('/') {
            body.pop();
            true
        } else {
            false
        };

        body = expand_home(&body);
        let anchored = body.starts_with('/');

        if body.is_empty() {
            return Err(reject("pattern is empty after stripping markers"));
        }

        validate_globstars(&body).map_err(|r| reject(&r))?;
        validate_classes(&body).map_err(|r| reject(&r))?;

        if body.split('/').any(|seg| seg == "..") {
            return Err(reject("'..' components escape the policy root"));
        }

        Ok(Self {
            raw,
            body,
            negated,
            dir_only,
            anchored,
        })
    }

    /// The original pattern text.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Negated patterns produce deny-overrides in the emitted policy.
    pub fn is_negated(&self) -> bool {
        self.negated
    }

    /// True when the pattern contains no glob metacharacters.
    pub fn is_literal(&self) -> bool {
        !contains_glob_chars(&self.body)
    }

    /// The literal path, when [`is_literal`](Self::is_literal) holds.
    pub fn literal_path(&self) -> Option<PathBuf> {
        self.is_literal().then(|| PathBuf::from(&self.body))
    }

    /// Compile to an anchored profile regex.
    ///
    /// `**` crosses separators, `*` and `?` stay within one segment, an
    /// unanchored pattern may match at any depth, and a trailing `/`
    /// extends the match over the directory's subtree.
    pub fn to_profile_regex(&self) -> String {
        let mut result = String::with_capacity(self.body.len() * 2);
        result.push('^');
        if !self.anchored {
            result.push_str("(.*/)?");
        }

        let chars: Vec<char> = self.body.chars().collect();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            match c {
                '.' | '^' | '$' | '+' | '|' | '\\' | '(' | ')' | '{' | '}' => {
                    result.push('\\');
                    result.push(c);
                }
                '[' => {
                    result.push('[');
                    i += 1;
                    if i < chars.len() && chars[i] == '!' {
                        result.push('^');
                        i += 1;
                    }
                    while i < chars.len() && chars[i] != ']' {
                        if matches!(chars[i], '\\') {
                            result.push('\\');
                        }
                        result.push(chars[i]);
                        i += 1;
                    }
                    result.push(']');
                }
                '*' => {
                    if i + 1 < chars.len() && chars[i + 1] == '*' {
                        if i + 2 < chars.len() && chars[i + 2] == '/' {
                            result.push_str("(.*/)?");
                            i += 2;
                        } else {
                            result.push_str(".*");
                            i += 1;
                        }
                    } else {
                        result.push_str("[^/]*");
                    }
                }
                '?' => result.push_str("[^/]"),
                _ => result.push(c),
            }
            i += 1;
        }

        if self.dir_only {
            result.push_str("(/.*)?");
        }
        result.push('$');
        result
    }

    /// Expand to the currently existing matching paths, canonicalized.
    ///
    /// Non-existing matches are skipped: they cannot be bound, and failing
    /// on them would make config authoring brittle. Matches that resolve
    /// outside the filesystem root are dropped.
    pub fn expand_existing(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();

        if self.is_literal() {
            if let Some(resolved) = canonicalize_existing(std::path::Path::new(&self.body)) {
                if !self.dir_only || resolved.is_dir() {
                    out.push(resolved);
                }
            }
            return out;
        }

        let Ok(paths) = glob::glob(&self.body) else {
            return out;
        };

        for entry in paths.flatten() {
            let Some(resolved) = canonicalize_existing(&entry) else {
                continue;
            };
            if self.dir_only && !resolved.is_dir() {
                continue;
            }
            if !out.contains(&resolved) {
                out.push(resolved);
            }
        }

        out
    }
}

/// `**` is only meaningful as a full path segment.
fn validate_globstars(body: &str) -> std::result::Result<(), String> {
    let bytes = body.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
            let before_ok = i == 0 || bytes[i - 1] == b'/';
            let after = i + 2;
            let after_ok = after == bytes.len() || bytes[after] == b'/';
            if !before_ok || !after_ok {
                return Err("'**' must span a whole path segment".to_string());
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    Ok(())
}

fn validate_classes(body: &str) -> std::result::Result<(), String> {
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '[' {
            let mut closed = false;
            for cc in chars.by_ref() {
                if cc == ']' {
                    closed = true;
                    break;
                }
            }
            if !closed {
                return Err("unterminated character class".to_string());
            }
        }
    }
    Ok(())
}
