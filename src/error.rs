//! Crate error types for the query server.
//!
//! Errors are split by domain, following §7 of the design: invalid
//! input, unknown documents, transient vs. fatal engine failures, a
//! materialization-not-ready error, and cancellation. `FatalEngine` is
//! detected by pattern-matching the embedded engine's own error message,
//! since DuckDB does not expose a typed "invalidated" error.

use serde::Serialize;

/// The fatal-engine message pattern (§4.1, §7). Matched case-insensitively.
const FATAL_PATTERN: &str = "database has been invalidated";

/// The friendly sentence substituted for the fatal pattern (§7).
const FATAL_FRIENDLY_MESSAGE: &str = "The GDX file could not be read. It may have been modified \
or deleted externally. The viewer will attempt to recover automatically.";

/// Maximum length of a sanitized error message, after which it is
/// truncated with an ellipsis (§7).
const MAX_SANITIZED_LEN: usize = 500;

/// The main error type for the query server.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// Missing required param, unknown method, or remote source
    /// requested while disabled.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// `documentId` not open.
    #[error("document not open: {0}")]
    NotFound(String),

    /// An engine error not matching the fatal pattern.
    #[error("engine error: {0}")]
    TransientEngine(String),

    /// An engine error matching the fatal pattern; the embedded engine
    /// is unrecoverable and must be torn down and reinitialized.
    #[error("fatal engine error: {0}")]
    FatalEngine(String),

    /// `getFilterOptions` called before `materializationComplete`.
    #[error("symbol not materialized: {0}")]
    NotMaterialized(String),

    /// A background task observed its cancellation flag.
    #[error("cancelled")]
    Cancelled,

    /// I/O failure resolving or fetching a source.
    #[error("source error: {0}")]
    Source(#[from] std::io::Error),
}

impl QueryError {
    /// Classify a raw engine error message as fatal or transient (§4.1).
    #[must_use]
    pub fn classify_engine_error(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.to_ascii_lowercase().contains(FATAL_PATTERN) {
            Self::FatalEngine(message)
        } else {
            Self::TransientEngine(message)
        }
    }

    /// Whether this error should trigger the single-retry recovery path
    /// in the dispatcher (§4.6).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalEngine(_))
    }

    /// Convert this error into the `error` field of a response frame,
    /// sanitizing the message per §7.
    #[must_use]
    pub fn to_response_error(&self) -> ResponseError {
        ResponseError {
            code: self.kind_code().to_owned(),
            message: sanitize(&self.to_string()),
        }
    }

    fn kind_code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "InvalidInput",
            Self::NotFound(_) => "NotFound",
            Self::TransientEngine(_) => "TransientEngine",
            Self::FatalEngine(_) => "FatalEngine",
            Self::NotMaterialized(_) => "NotMaterialized",
            Self::Cancelled => "Cancelled",
            Self::Source(_) => "InvalidInput",
        }
    }
}

/// The `error` payload of a response frame (§4.7, §7).
#[derive(Debug, Clone, Serialize)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
}

/// Sanitize an error string before it reaches a client (§7):
/// - replace the fatal pattern with the friendly sentence
/// - strip anything from `Stack Trace:` onward
/// - remove native-frame lines (`^\d+\s+(native::|0x)`)
/// - truncate to 500 characters with an ellipsis
#[must_use]
pub fn sanitize(message: &str) -> String {
    if message.to_ascii_lowercase().contains(FATAL_PATTERN) {
        return FATAL_FRIENDLY_MESSAGE.to_owned();
    }

    let without_stack_trace = match message.find("Stack Trace:") {
        Some(idx) => &message[..idx],
        None => message,
    };

    let cleaned: String = without_stack_trace
        .lines()
        .filter(|line| !is_native_frame(line))
        .collect::<Vec<_>>()
        .join("\n");

    truncate(cleaned.trim_end())
}

fn is_native_frame(line: &str) -> bool {
    let trimmed = line.trim_start();
    let Some(rest) = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .filter(|&idx| idx > 0)
        .map(|idx| &trimmed[idx..])
    else {
        return false;
    };
    let rest = rest.trim_start();
    rest.starts_with("native::") || rest.starts_with("0x")
}

fn truncate(message: &str) -> String {
    if message.chars().count() <= MAX_SANITIZED_LEN {
        message.to_owned()
    } else {
        let truncated: String = message.chars().take(MAX_SANITIZED_LEN).collect();
        format!("{truncated}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fatal_case_insensitively() {
        let err = QueryError::classify_engine_error("Database Has Been Invalidated: boom");
        assert!(err.is_fatal());
    }

    #[test]
    fn classifies_other_errors_as_transient() {
        let err = QueryError::classify_engine_error("syntax error near SELECT");
        assert!(!err.is_fatal());
    }

    #[test]
    fn sanitize_replaces_fatal_pattern() {
        let msg = sanitize("IO Error: database has been invalidated because of a previous error");
        assert_eq!(msg, FATAL_FRIENDLY_MESSAGE);
    }

    #[test]
    fn sanitize_strips_stack_trace() {
        let msg = sanitize("boom\nStack Trace:\n  at foo.rs:1\n  at bar.rs:2");
        assert_eq!(msg, "boom");
    }

    #[test]
    fn sanitize_strips_native_frames() {
        let msg = sanitize("boom\n3 native::frame_one\n0x7fff1234 something\nend");
        assert_eq!(msg, "boom\nend");
    }

    #[test]
    fn sanitize_truncates_long_messages() {
        let long = "x".repeat(600);
        let msg = sanitize(&long);
        assert_eq!(msg.chars().count(), MAX_SANITIZED_LEN + 3);
        assert!(msg.ends_with("..."));
    }

    #[test]
    fn response_error_carries_sanitized_message_and_code() {
        let err = QueryError::NotFound("doc1".to_owned());
        let resp = err.to_response_error();
        assert_eq!(resp.code, "NotFound");
        assert!(resp.message.contains("doc1"));
    }
}
