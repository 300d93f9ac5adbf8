// Reporting port
//
// Tagging, context enrichment and capture are observability only: nothing
// the engine does depends on them, and a failing sink must never alter
// control flow, so every method is infallible by signature.

use serde_json::Value;

/// Sink for debugging tags, contexts and captured failures
///
/// Implementations can:
/// - Forward to an error-reporting service
/// - Route to the process log
/// - Record calls in memory for tests
pub trait Reporter: Send + Sync {
    /// Attach a short indexed tag to the current scope.
    fn set_tag(&self, key: &str, value: &str);

    /// Attach a structured context blob to the current scope.
    fn set_context(&self, key: &str, value: Value);

    /// Capture one failure.
    fn capture(&self, message: &str);
}

/// Reporter that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl NoopReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Reporter for NoopReporter {
    fn set_tag(&self, _key: &str, _value: &str) {}

    fn set_context(&self, _key: &str, _value: Value) {}

    fn capture(&self, _message: &str) {}
}

/// Reporter that routes everything to the process log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl TracingReporter {
    pub fn new() -> Self {
        Self
    }
}

impl Reporter for TracingReporter {
    fn set_tag(&self, key: &str, value: &str) {
        tracing::debug!(key, value, "scope tag");
    }

    fn set_context(&self, key: &str, value: Value) {
        tracing::debug!(key, %value, "scope context");
    }

    fn capture(&self, message: &str) {
        tracing::warn!(message, "captured failure");
    }
}
