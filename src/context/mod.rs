//! Per-request context: the value threaded through the middleware chain.
//!
//! A [`Context`] is moved from one middleware to the next by argument. Upstream
//! stages that learn something about the request (who the caller is, a parsed
//! body) produce a new `Context` through the consuming `with_*` builders rather
//! than attaching state to a shared object.

use std::fmt;

use crate::Request;

/// The authenticated caller, as established by an upstream auth stage.
///
/// Only its identifiers are read here; authorization happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub tenant_id: Option<String>,
}

impl Principal {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: None,
        }
    }

    #[must_use]
    pub fn in_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tenant_id {
            Some(tenant) => write!(f, "{tenant}:{}", self.user_id),
            None => f.write_str(&self.user_id),
        }
    }
}

/// Per-request context: the request plus what upstream stages established about it.
pub struct Context {
    request: Request,
    principal: Option<Principal>,
    parsed_body: Option<serde_json::Value>,
}

impl Context {
    /// Create a new context from a request
    pub fn new(request: Request) -> Self {
        Self {
            request,
            principal: None,
            parsed_body: None,
        }
    }

    /// Returns this context with the authenticated caller set.
    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Returns this context carrying a structured body decoded by an upstream
    /// stage. Used for fingerprinting when the raw bytes are no longer present.
    #[must_use]
    pub fn with_parsed_body(mut self, body: serde_json::Value) -> Self {
        self.parsed_body = Some(body);
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn parsed_body(&self) -> Option<&serde_json::Value> {
        self.parsed_body.as_ref()
    }
}
