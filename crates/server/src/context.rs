//! Per-request identity passed explicitly through every operation.

use crate::error::{ApiError, ApiResult};
use cabinet_core::UserId;
use uuid::Uuid;

/// Maximum length of a caller-supplied trace ID.
const MAX_TRACE_ID_LEN: usize = 128;

/// Trace ID correlating the log lines of one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceId(String);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a caller-provided trace ID, keeping only printable ASCII.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic())
            .collect();

        if sanitized.is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who is calling. Authentication happens upstream; this only carries its result.
#[derive(Clone, Debug)]
pub struct RequestContext {
    /// Authenticated user, or `None` for anonymous callers.
    pub actor: Option<UserId>,
    pub trace_id: TraceId,
}

impl RequestContext {
    pub fn user(actor: UserId) -> Self {
        Self {
            actor: Some(actor),
            trace_id: TraceId::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            actor: None,
            trace_id: TraceId::new(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// The authenticated actor, or unauthorized.
    pub fn require_actor(&self) -> ApiResult<UserId> {
        self.actor
            .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
    }
}
