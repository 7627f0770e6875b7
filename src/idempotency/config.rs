//! Deployment and per-route configuration.
//!
//! [`IdempotencyConfig`] is loaded once per deployment, usually from the
//! environment, and [`RouteOptions`] are declared next to each protected route.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::StatusCode;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Header carrying the caller's token.
pub const DEFAULT_HEADER: &str = "Idempotency-Key";

/// How long a cached outcome is replayable.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// How long one attempt may hold exclusivity before its lock self-expires.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// Largest TTL accepted from the environment. Larger values are clamped.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Upper bound on a single store round trip.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// STORE POLICY
// ============================================================================

/// What to do when the store cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorePolicy {
    /// Run the handler without deduplication.
    #[default]
    FailOpen,
    /// Reject the request before the handler runs.
    FailClosed,
}

impl FromStr for StorePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "fail-open" | "open" => Ok(Self::FailOpen),
            "fail-closed" | "closed" => Ok(Self::FailClosed),
            other => Err(format!("unknown store policy `{other}`")),
        }
    }
}

// ============================================================================
// WAIT POLICY
// ============================================================================

/// Bounded exponential backoff used while a peer holds the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

impl WaitPolicy {
    /// The sleep before each poll: doubling from `initial_delay`, capped at
    /// `max_delay`, `max_attempts` items long.
    ///
    /// ```
    /// use std::time::Duration;
    /// use rttp_idempotency::idempotency::WaitPolicy;
    ///
    /// let delays: Vec<_> = WaitPolicy::default().delays().collect();
    /// let ms: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
    /// assert_eq!(ms, vec![100, 200, 400, 500, 500]);
    /// ```
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let max = self.max_delay;
        std::iter::successors(Some(self.initial_delay.min(max)), move |d| {
            Some(d.saturating_mul(2).min(max))
        })
        .take(self.max_attempts as usize)
    }
}

// ============================================================================
// DEPLOYMENT CONFIGURATION
// ============================================================================

/// Deployment-wide settings of the idempotency layer.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Name of the token header. Matched case-insensitively.
    pub header_name: String,

    /// Replay window for routes without a TTL override.
    pub default_ttl: Duration,

    /// Bound on how long one attempt may hold exclusivity.
    pub lock_ttl: Duration,

    pub wait: WaitPolicy,

    /// Force a token on every protected route regardless of its options.
    pub require_token: bool,

    /// Whether mutating requests to routes with no declared options are
    /// protected with default options. When false they bypass entirely.
    pub protect_undeclared_routes: bool,

    pub store_policy: StorePolicy,

    /// Upper bound on a single store round trip.
    pub store_timeout: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            header_name: DEFAULT_HEADER.to_owned(),
            default_ttl: DEFAULT_TTL,
            lock_ttl: DEFAULT_LOCK_TTL,
            wait: WaitPolicy::default(),
            require_token: false,
            protect_undeclared_routes: true,
            store_policy: StorePolicy::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }
}

impl IdempotencyConfig {
    /// Load from the process environment.
    ///
    /// Environment variables:
    /// - `IDEMPOTENCY_HEADER`: token header name (default: `Idempotency-Key`)
    /// - `IDEMPOTENCY_TTL_SEC`: replay window in seconds (default: 86400)
    /// - `IDEMPOTENCY_LOCK_TTL_SEC`: lock TTL in seconds (default: 60)
    /// - `IDEMPOTENCY_WAIT_ATTEMPTS`: polls while a peer holds the lock (default: 5)
    /// - `IDEMPOTENCY_REQUIRED`: "true" forces a token on every protected route (default: false)
    /// - `IDEMPOTENCY_PROTECT_UNDECLARED`: "false" lets undeclared routes bypass (default: true)
    /// - `IDEMPOTENCY_STORE_POLICY`: `fail-open` or `fail-closed` (default: fail-open)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable source. Unparseable values are logged
    /// and replaced by their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let header_name = lookup("IDEMPOTENCY_HEADER")
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.header_name);

        let default_ttl = parse_ttl(&lookup, "IDEMPOTENCY_TTL_SEC").unwrap_or(defaults.default_ttl);

        let lock_ttl = parse_ttl(&lookup, "IDEMPOTENCY_LOCK_TTL_SEC").unwrap_or(defaults.lock_ttl);

        let wait = WaitPolicy {
            max_attempts: parse_var(&lookup, "IDEMPOTENCY_WAIT_ATTEMPTS")
                .unwrap_or(defaults.wait.max_attempts),
            ..defaults.wait
        };

        let require_token = parse_flag(&lookup, "IDEMPOTENCY_REQUIRED").unwrap_or(defaults.require_token);

        let protect_undeclared_routes = parse_flag(&lookup, "IDEMPOTENCY_PROTECT_UNDECLARED")
            .unwrap_or(defaults.protect_undeclared_routes);

        let store_policy =
            parse_var(&lookup, "IDEMPOTENCY_STORE_POLICY").unwrap_or(defaults.store_policy);

        Self {
            header_name,
            default_ttl,
            lock_ttl,
            wait,
            require_token,
            protect_undeclared_routes,
            store_policy,
            store_timeout: defaults.store_timeout,
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(var = name, value = %raw, error = %e, "ignoring invalid idempotency setting");
            None
        }
    }
}

fn parse_ttl(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<Duration> {
    let ttl = parse_var::<u64>(lookup, name)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)?;
    if ttl > MAX_TTL {
        warn!(var = name, max_secs = MAX_TTL.as_secs(), "clamping idempotency TTL");
        return Some(MAX_TTL);
    }
    Some(ttl)
}

fn parse_flag(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    let raw = lookup(name)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => {
            warn!(var = name, value = %raw, "ignoring invalid idempotency flag");
            None
        }
    }
}

// ============================================================================
// ROUTE OPTIONS
// ============================================================================

/// Idempotency behaviour declared for one route.
///
/// ```
/// use std::time::Duration;
/// use rttp_idempotency::StatusCode;
/// use rttp_idempotency::idempotency::RouteOptions;
///
/// let opts = RouteOptions::new().required().ttl(Duration::from_secs(3600));
/// assert!(opts.is_required());
/// assert!(!opts.is_cacheable(StatusCode::UnprocessableEntity));
/// assert!(opts.cache_errors().is_cacheable(StatusCode::UnprocessableEntity));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteOptions {
    required: bool,
    ttl: Option<Duration>,
    cache_errors: bool,
}

impl RouteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject requests to this route that carry no token.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Override the deployment's replay window.
    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Cache 4xx and 5xx outcomes too. Anything below 400 is always cached.
    #[must_use]
    pub fn cache_errors(mut self) -> Self {
        self.cache_errors = true;
        self
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn ttl_override(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn caches_errors(&self) -> bool {
        self.cache_errors
    }

    /// Whether a response with `status` is recorded for replay.
    pub fn is_cacheable(&self, status: StatusCode) -> bool {
        !status.is_error() || self.cache_errors
    }
}
