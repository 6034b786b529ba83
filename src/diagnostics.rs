//! Error, warning and exception accounting for a single run.
//!
//! Every stage records into one `Diagnostics` value that `main` inspects at
//! the end. Each recording call also emits the matching tracing event.
use serde::Serialize;

/// Counters and retained messages for one invocation.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Diagnostics {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub exceptions: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error. Always returns `false` so callers can
    /// `return diag.error(..)` from a bool-returning stage.
    pub fn error(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        tracing::error!("{message}");
        self.errors.push(message);
        false
    }

    /// Record a warning. Always returns `true`.
    pub fn warning(&mut self, message: impl Into<String>) -> bool {
        let message = message.into();
        tracing::warn!("{message}");
        self.warnings.push(message);
        true
    }

    /// Record an unexpected failure that crossed a stage boundary.
    ///
    /// The full cause chain is logged at debug level only.
    pub fn exception(&mut self, context: &str, err: &anyhow::Error) -> bool {
        let message = format!("{context}: {err}");
        tracing::error!("{message}");
        tracing::debug!("{context}: {err:?}");
        self.exceptions.push(message);
        false
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    pub fn exception_count(&self) -> usize {
        self.exceptions.len()
    }

    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty() || !self.exceptions.is_empty()
    }

    /// One-line totals used by the final run summary.
    pub fn summary(&self) -> String {
        format!(
            "{} errors, {} warnings, {} exceptions",
            self.error_count(),
            self.warning_count(),
            self.exception_count()
        )
    }
}
