//! Error types for the event-processing pipeline
//!
//! Configuration errors are fatal at startup; evaluation and conversion
//! errors happen per event and are governed by the configured failure
//! handling mode; `QueueClosed` is an internal lifecycle signal.

use crate::event::SourcePosition;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Invalid configuration detected at startup
    Configuration,
    /// Predicate expression failed or returned a non-boolean
    Evaluation,
    /// A field converter failed to rewrite a field
    Conversion,
    /// Queue used after shutdown
    Lifecycle,
}

/// Pipeline-specific errors
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Invalid configuration. Always fatal at startup; never governed by
    /// the failure handling mode.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Predicate evaluation failed for the event at the given position.
    #[error("Evaluation error at {position}: {reason}")]
    Evaluation {
        position: SourcePosition,
        reason: String,
    },

    /// A field converter failed to rewrite a field of the event at the
    /// given position.
    #[error("Conversion error for field '{field}' at {position}: {reason}")]
    Conversion {
        field: String,
        position: SourcePosition,
        reason: String,
    },

    /// Enqueue or drain attempted after shutdown. Not user-facing; an
    /// internal lifecycle signal.
    #[error("Queue closed")]
    QueueClosed,
}

impl PipelineError {
    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an evaluation error.
    pub fn evaluation(position: SourcePosition, reason: impl Into<String>) -> Self {
        Self::Evaluation {
            position,
            reason: reason.into(),
        }
    }

    /// Create a conversion error.
    pub fn conversion(
        field: impl Into<String>,
        position: SourcePosition,
        reason: impl Into<String>,
    ) -> Self {
        Self::Conversion {
            field: field.into(),
            position,
            reason: reason.into(),
        }
    }

    /// Whether the configured failure handling mode applies to this error.
    ///
    /// Only per-event runtime errors are policy-governed; configuration
    /// errors and lifecycle signals always propagate.
    pub fn is_policy_governed(&self) -> bool {
        matches!(self, Self::Evaluation { .. } | Self::Conversion { .. })
    }

    /// The position of the affected event, for per-event errors.
    pub fn position(&self) -> Option<SourcePosition> {
        match self {
            Self::Evaluation { position, .. } => Some(*position),
            Self::Conversion { position, .. } => Some(*position),
            _ => None,
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Evaluation { .. } => ErrorCategory::Evaluation,
            Self::Conversion { .. } => ErrorCategory::Conversion,
            Self::QueueClosed => ErrorCategory::Lifecycle,
        }
    }

    /// Get a metric-safe error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "config_error",
            Self::Evaluation { .. } => "evaluation_error",
            Self::Conversion { .. } => "conversion_error",
            Self::QueueClosed => "queue_closed",
        }
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
