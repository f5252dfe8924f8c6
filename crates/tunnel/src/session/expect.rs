//! Patterns for [`TunnelSession::expect`](super::TunnelSession::expect).

use std::fmt;

use regex::Regex;

/// One thing to wait for in a raw session's buffer.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Literal substring.
    Text(String),
    /// Regular expression, tested against the whole buffer.
    Regex(Regex),
}

impl Pattern {
    pub fn is_match(&self, haystack: &str) -> bool {
        match self {
            Pattern::Text(needle) => haystack.contains(needle.as_str()),
            Pattern::Regex(re) => re.is_match(haystack),
        }
    }
}

impl From<&str> for Pattern {
    fn from(text: &str) -> Self {
        Pattern::Text(text.to_string())
    }
}

impl From<String> for Pattern {
    fn from(text: String) -> Self {
        Pattern::Text(text)
    }
}

impl From<Regex> for Pattern {
    fn from(re: Regex) -> Self {
        Pattern::Regex(re)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Text(text) => write!(f, "{:?}", text),
            Pattern::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// Anything usable as the pattern argument of `expect`: one pattern or a list.
pub trait IntoPatterns {
    fn into_patterns(self) -> Vec<Pattern>;
}

impl IntoPatterns for Pattern {
    fn into_patterns(self) -> Vec<Pattern> {
        vec![self]
    }
}

impl IntoPatterns for &str {
    fn into_patterns(self) -> Vec<Pattern> {
        vec![self.into()]
    }
}

impl IntoPatterns for String {
    fn into_patterns(self) -> Vec<Pattern> {
        vec![self.into()]
    }
}

impl IntoPatterns for Regex {
    fn into_patterns(self) -> Vec<Pattern> {
        vec![self.into()]
    }
}

impl IntoPatterns for Vec<Pattern> {
    fn into_patterns(self) -> Vec<Pattern> {
        self
    }
}

impl<const N: usize> IntoPatterns for [Pattern; N] {
    fn into_patterns(self) -> Vec<Pattern> {
        self.into_iter().collect()
    }
}

/// Result of a successful `expect`.
#[derive(Debug, Clone)]
pub struct ExpectMatch {
    /// Index of the matching pattern in the list passed to `expect`.
    pub index: usize,
    pub pattern: Pattern,
    /// The buffer contents drained by the match.
    pub buffer: Vec<u8>,
}

impl ExpectMatch {
    /// Drained buffer as text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}

/// Default rejection message: `timeout for <patterns>`.
pub(crate) fn default_message(patterns: &[Pattern]) -> String {
    let listed: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
    format!("timeout for {}", listed.join(", "))
}

/// Returns the index of the first pattern that matches `buffer`.
pub(crate) fn first_match(patterns: &[Pattern], buffer: &[u8]) -> Option<usize> {
    let haystack = String::from_utf8_lossy(buffer);
    patterns.iter().position(|p| p.is_match(&haystack))
}
