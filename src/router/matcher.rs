//! Route matching logic.
//!
//! # Responsibilities
//! - Match host (exact or `*.suffix`, case-insensitive)
//! - Match path prefix (case-sensitive)
//! - Match HTTP method
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

use axum::http::Method;

use crate::context::RequestReader;

/// Trait for matching requests against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    fn matches(&self, req: &RequestReader) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostPattern {
    Exact(String),
    /// `*.example.com` stored as `.example.com`.
    Suffix(String),
}

/// Matches the request host against any of a set of patterns.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    patterns: Vec<HostPattern>,
}

impl HostMatcher {
    /// Hosts are normalized to lowercase; a port suffix is ignored.
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = hosts
            .into_iter()
            .map(|h| h.as_ref().trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .map(|h| match h.strip_prefix('*') {
                Some(suffix) if suffix.starts_with('.') => HostPattern::Suffix(suffix.to_string()),
                _ => HostPattern::Exact(h),
            })
            .collect();
        Self { patterns }
    }

    /// 2 for any exact host, 1 for wildcards only, 0 for match-all.
    pub fn specificity(&self) -> u8 {
        if self.patterns.iter().any(|p| matches!(p, HostPattern::Exact(_))) {
            2
        } else if self.patterns.is_empty() {
            0
        } else {
            1
        }
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, req: &RequestReader) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let host = req.host_name().to_ascii_lowercase();
        self.patterns.iter().any(|p| match p {
            HostPattern::Exact(h) => *h == host,
            HostPattern::Suffix(s) => host.len() > s.len() && host.ends_with(s.as_str()),
        })
    }
}

/// Matches the request path prefix.
#[derive(Debug, Clone)]
pub struct PathPrefixMatcher {
    prefix: String,
}

impl PathPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.prefix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefix.is_empty()
    }
}

impl Matcher for PathPrefixMatcher {
    fn matches(&self, req: &RequestReader) -> bool {
        req.path().starts_with(&self.prefix)
    }
}

/// Matches any of a set of methods.
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    methods: Vec<Method>,
}

impl MethodMatcher {
    pub fn new(methods: Vec<Method>) -> Self {
        Self { methods }
    }
}

impl Matcher for MethodMatcher {
    fn matches(&self, req: &RequestReader) -> bool {
        self.methods.is_empty() || self.methods.contains(req.method())
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, req: &RequestReader) -> bool {
        self.matchers.iter().all(|m| m.matches(req))
    }
}
