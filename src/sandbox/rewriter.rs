//! Whole-symbol source rewriting and escape audit.

use std::path::Path;

use aho_corasick::{AhoCorasick, MatchKind};
use regex::Regex;

use crate::sandbox::error::{Result, SandboxError};

/// Path prefix every sandboxed `set_current_dir` call must carry.
const SANDBOXED_SET_CURRENT_DIR: &str = "toolsmith_sdk::env::";

/// One symbol substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteRule {
    pub source: String,
    pub target: String,
}

impl RewriteRule {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Built-in substitution table.
pub fn default_rules() -> Vec<RewriteRule> {
    vec![
        RewriteRule::new("std::fs", "toolsmith_sdk::fs"),
        RewriteRule::new("std::process", "toolsmith_sdk::process"),
        RewriteRule::new(
            "std::env::set_current_dir",
            "toolsmith_sdk::env::set_current_dir",
        ),
        RewriteRule::new("std::os::unix::fs::symlink", "toolsmith_sdk::fs::symlink"),
    ]
}

struct EscapePattern {
    regex: Regex,
    description: &'static str,
}

/// Rewrites tool source onto the sandboxed facade.
pub struct SandboxRewriter {
    rules: Vec<RewriteRule>,
    matcher: AhoCorasick,
    escapes: Vec<EscapePattern>,
    grouped_std: Regex,
    guarded_names: Regex,
}

impl std::fmt::Debug for SandboxRewriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRewriter")
            .field("rules", &self.rules)
            .finish_non_exhaustive()
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| SandboxError::Matcher {
        reason: e.to_string(),
    })
}

impl SandboxRewriter {
    pub fn new(rules: Vec<RewriteRule>) -> Result<Self> {
        let matcher = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostLongest)
            .build(rules.iter().map(|r| r.source.as_str()))
            .map_err(|e| SandboxError::Matcher {
                reason: e.to_string(),
            })?;

        let escapes = vec![
            EscapePattern {
                regex: compile(r"\bextern\s+crate\s+std\b")?,
                description: "`extern crate std` bypasses the sandbox",
            },
            EscapePattern {
                regex: compile(r"\bstd\s+as\s")?,
                description: "aliasing `std` bypasses the sandbox",
            },
            EscapePattern {
                regex: compile(r"\bstd\s*::\s*(?:env\s*::\s*)?\*")?,
                description: "glob imports from `std` bypass the sandbox",
            },
            EscapePattern {
                regex: compile(r"\bstd\s*::\s*(?:fs|process|os)\b")?,
                description: "unsandboxed `std` module",
            },
        ];

        Ok(Self {
            rules,
            matcher,
            escapes,
            grouped_std: compile(r"\bstd\s*::\s*(?:env\s*::\s*)?\{")?,
            guarded_names: compile(r"\b(?:fs|process|os|self|set_current_dir)\b")?,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(default_rules())
    }

    /// Load rules from a text file with one `source target` pair per line.
    /// Blank lines and `#` comments are skipped.
    pub fn from_rules_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::new(parse_rules(path, &content)?)
    }

    pub fn rules(&self) -> &[RewriteRule] {
        &self.rules
    }

    /// Replace every whole-symbol occurrence of a rule's source.
    pub fn rewrite(&self, source: &str) -> String {
        let mut out = String::with_capacity(source.len() + 64);
        let mut last = 0;
        for mat in self.matcher.find_iter(source) {
            if !is_whole_symbol(source, mat.start(), mat.end()) {
                continue;
            }
            out.push_str(&source[last..mat.start()]);
            out.push_str(&self.rules[mat.pattern().as_usize()].target);
            last = mat.end();
        }
        out.push_str(&source[last..]);
        out
    }

    /// Reject rewritten source that can still reach unsandboxed operations.
    pub fn audit(&self, source: &str) -> Result<()> {
        for pattern in &self.escapes {
            if let Some(m) = pattern.regex.find(source) {
                return Err(SandboxError::Escape {
                    reason: format!("{} (`{}`)", pattern.description, m.as_str().trim()),
                });
            }
        }

        for m in self.grouped_std.find_iter(source) {
            let body = braced_body(&source[m.end() - 1..]);
            if let Some(name) = self.guarded_names.find(body) {
                return Err(SandboxError::Escape {
                    reason: format!(
                        "grouped import from `std` brings in `{}`",
                        name.as_str()
                    ),
                });
            }
        }

        for (start, _) in source.match_indices("set_current_dir") {
            if !source[..start].ends_with(SANDBOXED_SET_CURRENT_DIR) {
                return Err(SandboxError::Escape {
                    reason: "`set_current_dir` must be called through the sandbox".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Rewrite then audit.
    pub fn apply(&self, source: &str) -> Result<String> {
        let rewritten = self.rewrite(source);
        self.audit(&rewritten)?;
        Ok(rewritten)
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn is_whole_symbol(source: &str, start: usize, end: usize) -> bool {
    let before_ok = source[..start]
        .chars()
        .next_back()
        .is_none_or(|c| !is_ident_char(c));
    let after_ok = source[end..]
        .chars()
        .next()
        .is_none_or(|c| !is_ident_char(c));
    before_ok && after_ok
}

/// Contents between the leading `{` and its matching `}`.
fn braced_body(s: &str) -> &str {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &s[1..i];
                }
            }
            _ => {}
        }
    }
    s.get(1..).unwrap_or("")
}

fn parse_rules(path: &Path, content: &str) -> Result<Vec<RewriteRule>> {
    let mut rules = Vec::new();
    for (index, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(source), Some(target), None) => rules.push(RewriteRule::new(source, target)),
            _ => {
                return Err(SandboxError::InvalidRule {
                    path: path.to_path_buf(),
                    line: index + 1,
                    content: line.to_string(),
                });
            }
        }
    }
    Ok(rules)
}
