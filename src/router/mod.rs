//! Route identity: map URL patterns and HTTP methods to per-route values.
//!
//! [`RouteTable`] associates a value (for the idempotency layer, a
//! [`RouteOptions`](crate::idempotency::RouteOptions)) with a method + path
//! pattern, and resolves an incoming request to the value of the first matching
//! entry. Three pattern styles are supported:
//!
//! | Pattern              | Example match              |
//! |----------------------|----------------------------|
//! | `/users`             | `/users`                   |
//! | `/users/:id`         | `/users/42`                |
//! | `/files/*`           | `/files/docs/readme.txt`   |
//!
//! Only route identity matters here, so `:name` segments match any single
//! segment and nothing is captured.
//!
//! Trailing slashes are normalized on both patterns and incoming paths, so `/users/` and
//! `/users` are treated as equivalent.

use crate::Method;

// A single path segment, either a literal string or a placeholder (`:name`).
#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Parameter,
}

// Compiled representation of a route pattern string.
#[derive(Debug, Clone)]
enum Pattern {
    // Matches one exact path string, e.g. `/users`.
    Exact(String),
    // Matches a fixed number of segments where some may be placeholders, e.g. `/users/:id`.
    Parameterized { segments: Vec<Segment> },
    // Matches any path that starts with the given prefix, e.g. `/files/*`.
    Wildcard(String),
}

fn trim_trailing_slash(path: &str) -> &str {
    if path != "/" && path.ends_with('/') {
        &path[..path.len() - 1]
    } else {
        path
    }
}

impl Pattern {
    /// Parse a route pattern string into a `Pattern`.
    ///
    /// The pattern is classified as follows (checked in order):
    ///
    /// 1. Ends with `/*` → [`Pattern::Wildcard`]: matches any path sharing the prefix.
    /// 2. Contains `:` → [`Pattern::Parameterized`]: one or more placeholders.
    /// 3. Otherwise → [`Pattern::Exact`]: literal path match.
    fn parse(pattern: &str) -> Self {
        let pattern = trim_trailing_slash(pattern);

        if let Some(prefix) = pattern.strip_suffix("/*") {
            return Pattern::Wildcard(prefix.to_string());
        }

        if pattern.contains(':') {
            let segments = pattern
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.strip_prefix(':') {
                    Some(_) => Segment::Parameter,
                    None => Segment::Static(s.to_string()),
                })
                .collect();

            return Pattern::Parameterized { segments };
        }

        Pattern::Exact(pattern.to_string())
    }

    // Whether `path` falls under this pattern.
    fn matches(&self, path: &str) -> bool {
        let path = trim_trailing_slash(path);

        match self {
            Pattern::Exact(p) => p == path,
            Pattern::Parameterized { segments } => {
                let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
                segments.len() == path_segments.len()
                    && segments.iter().zip(path_segments).all(|(seg, path_seg)| match seg {
                        Segment::Static(s) => s == path_seg,
                        Segment::Parameter => true,
                    })
            }
            Pattern::Wildcard(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

// A single registered entry binding a method + pattern to a value.
struct Entry<T> {
    method: Method,
    pattern: Pattern,
    value: T,
}

/// Ordered table of `method + pattern → value` bindings.
///
/// Entries are evaluated in registration order; the first entry whose method and
/// pattern both match wins.
///
/// # Examples
///
/// ```
/// use rttp_idempotency::{Method, router::RouteTable};
///
/// let mut table = RouteTable::new();
/// table.insert(Method::Post, "/orders/:id/refunds", "refunds");
///
/// assert_eq!(table.resolve(&Method::Post, "/orders/42/refunds"), Some(&"refunds"));
/// assert!(table.resolve(&Method::Put, "/orders/42/refunds").is_none());
/// ```
pub struct RouteTable<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Default for RouteTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RouteTable<T> {
    /// Create a new, empty table.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Bind `value` to requests with `method` whose path matches `pattern`.
    pub fn insert(&mut self, method: Method, pattern: &str, value: T) {
        self.entries.push(Entry {
            method,
            pattern: Pattern::parse(pattern),
            value,
        });
    }

    /// Return the value of the first entry matching `method` and `path`.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<&T> {
        self.entries
            .iter()
            .find(|entry| &entry.method == method && entry.pattern.matches(path))
            .map(|entry| &entry.value)
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Return `true` if no entries have been registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
