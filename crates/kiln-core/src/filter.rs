//! Branch filters shared by workflow triggers and individual jobs.

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Allow/deny list of branch patterns.
///
/// Patterns are exact names, globs (`feature/*`, `release/**`, `*-wip`) or
/// regular expressions wrapped in slashes (`/^release-\d+$/`). A branch is
/// accepted unless it matches `ignore`; when `only` is non-empty the branch
/// must also match one of its patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BranchFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub only: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<String>,
}

impl BranchFilter {
    pub fn only(patterns: &[&str]) -> Self {
        Self {
            only: patterns.iter().map(|p| p.to_string()).collect(),
            ignore: vec![],
        }
    }

    pub fn ignore(patterns: &[&str]) -> Self {
        Self {
            only: vec![],
            ignore: patterns.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.only.is_empty() && self.ignore.is_empty()
    }

    /// Check whether a branch passes this filter.
    pub fn matches(&self, branch: &str) -> bool {
        if self.ignore.iter().any(|p| pattern_matches(p, branch)) {
            return false;
        }
        if self.only.is_empty() {
            return true;
        }
        self.only.iter().any(|p| pattern_matches(p, branch))
    }

    /// Validate regex patterns so bad filters surface at load time.
    pub fn validate(&self) -> Result<(), String> {
        for pattern in self.only.iter().chain(self.ignore.iter()) {
            if let Some(expr) = regex_body(pattern) {
                Regex::new(expr).map_err(|e| format!("invalid branch regex {pattern}: {e}"))?;
            }
        }
        Ok(())
    }
}

fn regex_body(pattern: &str) -> Option<&str> {
    if pattern.len() >= 2 && pattern.starts_with('/') && pattern.ends_with('/') {
        Some(&pattern[1..pattern.len() - 1])
    } else {
        None
    }
}

/// Match a single branch pattern.
pub fn pattern_matches(pattern: &str, text: &str) -> bool {
    if let Some(expr) = regex_body(pattern) {
        return Regex::new(expr).map(|re| re.is_match(text)).unwrap_or(false);
    }
    glob_match(pattern, text)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlobToken {
    Char(char),
    /// `*`: any run of characters within one path segment.
    Star,
    /// `**`: any run of characters, `/` included.
    AnyDepth,
}

fn glob_tokens(pattern: &str) -> Vec<GlobToken> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '*' {
            tokens.push(GlobToken::Char(c));
        } else if chars.next_if_eq(&'*').is_some() {
            while chars.next_if_eq(&'*').is_some() {}
            tokens.push(GlobToken::AnyDepth);
        } else {
            tokens.push(GlobToken::Star);
        }
    }
    tokens
}

/// A bare `*` or `**` accepts every branch.
fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    let text: Vec<char> = text.chars().collect();
    // reachable[j]: the tokens seen so far match text[..j]
    let mut reachable = vec![false; text.len() + 1];
    reachable[0] = true;
    for token in glob_tokens(pattern) {
        let mut next = vec![false; text.len() + 1];
        match token {
            GlobToken::Char(c) => {
                for j in 0..text.len() {
                    next[j + 1] = reachable[j] && text[j] == c;
                }
            }
            GlobToken::Star | GlobToken::AnyDepth => {
                for j in 0..=text.len() {
                    next[j] = reachable[j]
                        || (j > 0 && next[j - 1] && (token == GlobToken::AnyDepth || text[j - 1] != '/'));
                }
            }
        }
        if !next.contains(&true) {
            return false;
        }
        reachable = next;
    }
    reachable[text.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_match_exact() {
        let filter = BranchFilter::only(&["main"]);
        assert!(filter.matches("main"));
        assert!(!filter.matches("develop"));
    }

    #[test]
    fn test_branch_match_glob() {
        assert!(BranchFilter::only(&["feature/*"]).matches("feature/foo"));
        assert!(!BranchFilter::only(&["feature/*"]).matches("feature/foo/bar"));
        assert!(BranchFilter::only(&["release/**"]).matches("release/v1/hotfix"));
        assert!(BranchFilter::only(&["*-wip"]).matches("parser-wip"));
    }

    #[test]
    fn test_branch_match_several_stars() {
        assert!(pattern_matches("*release*", "pre-release-2"));
        assert!(pattern_matches("*release*", "release"));
        assert!(!pattern_matches("*release*", "main"));
        assert!(pattern_matches("feat-*-*", "feat-parser-v2"));
        assert!(!pattern_matches("feat-*-*", "feat-parser"));
        assert!(!pattern_matches("feat-*-*", "feat-a/b-c"));
        assert!(pattern_matches("team/**/hotfix-*", "team/a/b/hotfix-12"));
        assert!(!pattern_matches("team/**/hotfix-*", "team/a/b/feature-12"));
    }

    #[test]
    fn test_branch_match_regex() {
        let filter = BranchFilter::only(&["/^release-\\d+$/"]);
        assert!(filter.matches("release-12"));
        assert!(!filter.matches("release-x"));
    }

    #[test]
    fn test_empty_filter_accepts_everything() {
        assert!(BranchFilter::default().matches("any-branch"));
    }

    #[test]
    fn test_ignore_wins_over_only() {
        let filter = BranchFilter {
            only: vec!["*".to_string()],
            ignore: vec!["gh-pages".to_string()],
        };
        assert!(filter.matches("master"));
        assert!(!filter.matches("gh-pages"));
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        assert!(BranchFilter::only(&["/(unclosed/"]).validate().is_err());
        assert!(BranchFilter::ignore(&["gh-pages"]).validate().is_ok());
    }
}
