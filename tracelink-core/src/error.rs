//! Error types for trace collection
//!
//! Errors in this crate stay local. The trace lifecycle never lets a single
//! misbehaving producer abort a collection, so most of these variants are
//! logged at the point they occur and only surface as return values on the
//! synchronous configuration API and inside the plugin trace builder.
//!
//! # Error Codes
//!
//! Each variant has a stable error code (e.g., `PROFILER_BUSY`) for logging
//! and for callers that switch on specific failures.
//!
//! # Example
//!
//! ```rust
//! use tracelink_core::error::{ErrorCategory, TraceError};
//!
//! fn report(err: &TraceError) {
//!     match err.category() {
//!         ErrorCategory::Busy => println!("a trace is already running"),
//!         ErrorCategory::Boundary => println!("plugin passed bad data"),
//!         _ => println!("{}: {}", err.error_code(), err),
//!     }
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for trace operations
pub type Result<T> = std::result::Result<T, TraceError>;

/// Error category for grouping related errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Another trace owns the profiler
    Busy,
    /// Configuration rejected
    Validation,
    /// A plugin entry point reported failure
    Plugin,
    /// Malformed data crossed the plugin boundary
    Boundary,
    /// I/O or serialization
    External,
    /// Bug in this crate
    Internal,
}

/// Errors that can occur while configuring or collecting a trace
#[derive(Error, Debug)]
pub enum TraceError {
    // ═══════════════════════════════════════════════════════════════════════
    // Lifecycle errors
    // ═══════════════════════════════════════════════════════════════════════

    /// `configure` was called while a trace was being collected
    #[error("Profiler busy: a trace is in state '{state}'. Stop or cancel it before configuring a new one.")]
    ProfilerBusy { state: String },

    /// Configuration values are out of range
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Plugin boundary errors
    // ═══════════════════════════════════════════════════════════════════════

    /// A plugin entry point returned a non-zero code
    #[error("Plugin '{plugin}' failed in {entry_point}: returned {code}")]
    PluginCallFailed {
        plugin: String,
        entry_point: &'static str,
        code: i32,
    },

    /// A versioned struct declared a size smaller than the fields that must be read
    #[error("Incompatible {struct_name}: declared size {declared} is smaller than required {required}")]
    IncompatibleStruct {
        struct_name: &'static str,
        declared: usize,
        required: usize,
    },

    /// A required pointer argument was null
    #[error("Null pointer passed for '{argument}'")]
    NullPointer { argument: &'static str },

    /// A "last event" operation ran before any event was added
    #[error("No event has been added yet; '{operation}' needs a last event")]
    NoLastEvent { operation: &'static str },

    // ═══════════════════════════════════════════════════════════════════════
    // Infrastructure errors
    // ═══════════════════════════════════════════════════════════════════════

    /// JSON serialization or deserialization failed
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// I/O operation failed
    #[error("IO error: {message}")]
    IoError { message: String },

    /// Internal error that shouldn't happen
    #[error("Internal error: {reason}. This is a bug; please report it.")]
    InternalError { reason: String },
}

impl TraceError {
    /// Returns true if retrying later might succeed
    ///
    /// A busy profiler frees up once the running trace finishes. Everything
    /// else needs different input.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TraceError::ProfilerBusy { .. })
    }

    /// Returns the error category for grouping
    pub fn category(&self) -> ErrorCategory {
        match self {
            TraceError::ProfilerBusy { .. } => ErrorCategory::Busy,

            TraceError::InvalidConfig { .. } => ErrorCategory::Validation,

            TraceError::PluginCallFailed { .. } => ErrorCategory::Plugin,

            TraceError::IncompatibleStruct { .. }
            | TraceError::NullPointer { .. }
            | TraceError::NoLastEvent { .. } => ErrorCategory::Boundary,

            TraceError::JsonError(_) | TraceError::IoError { .. } => ErrorCategory::External,

            TraceError::InternalError { .. } => ErrorCategory::Internal,
        }
    }

    /// Returns the stable error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            TraceError::ProfilerBusy { .. } => "PROFILER_BUSY",
            TraceError::InvalidConfig { .. } => "INVALID_CONFIG",
            TraceError::PluginCallFailed { .. } => "PLUGIN_CALL_FAILED",
            TraceError::IncompatibleStruct { .. } => "INCOMPATIBLE_STRUCT",
            TraceError::NullPointer { .. } => "NULL_POINTER",
            TraceError::NoLastEvent { .. } => "NO_LAST_EVENT",
            TraceError::JsonError(_) => "JSON_ERROR",
            TraceError::IoError { .. } => "IO_ERROR",
            TraceError::InternalError { .. } => "INTERNAL_ERROR",
        }
    }
}

impl From<std::io::Error> for TraceError {
    fn from(err: std::io::Error) -> Self {
        TraceError::IoError {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_recoverable() {
        assert!(TraceError::ProfilerBusy {
            state: "collect_trace".to_string()
        }
        .is_recoverable());
        assert!(!TraceError::NullPointer { argument: "event" }.is_recoverable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            TraceError::IncompatibleStruct {
                struct_name: "ProfileEvent",
                declared: 8,
                required: 48,
            }
            .error_code(),
            "INCOMPATIBLE_STRUCT"
        );
        assert_eq!(
            TraceError::NoLastEvent {
                operation: "set_last_event_name"
            }
            .error_code(),
            "NO_LAST_EVENT"
        );
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            TraceError::PluginCallFailed {
                plugin: "MockPlugin".to_string(),
                entry_point: "profiler_start",
                code: -1,
            }
            .category(),
            ErrorCategory::Plugin
        );
        assert_eq!(
            TraceError::NullPointer { argument: "name" }.category(),
            ErrorCategory::Boundary
        );
        let io: TraceError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(io.category(), ErrorCategory::External);
    }

    #[test]
    fn test_error_messages_are_helpful() {
        let msg = TraceError::IncompatibleStruct {
            struct_name: "ProfileEvent",
            declared: 8,
            required: 48,
        }
        .to_string();
        assert!(msg.contains("ProfileEvent"));
        assert!(msg.contains("48"));
    }
}
