use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::run::{RunState, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    MalformedResponse,
    SchemaViolation,
    PublishFailed,
    StagingIoFailure,
    OutOfOrder,
}

impl ErrorKind {
    /// Whether a stage failing with this kind may be re-attempted without an
    /// upstream fix.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::SourceUnavailable | Self::PublishFailed | Self::StagingIoFailure
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceUnavailable => "source_unavailable",
            Self::MalformedResponse => "malformed_response",
            Self::SchemaViolation => "schema_violation",
            Self::PublishFailed => "publish_failed",
            Self::StagingIoFailure => "staging_io_failure",
            Self::OutOfOrder => "out_of_order",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::SourceUnavailable,
            Self::MalformedResponse,
            Self::SchemaViolation,
            Self::PublishFailed,
            Self::StagingIoFailure,
            Self::OutOfOrder,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StageError {
    #[error("source unavailable: {detail}")]
    SourceUnavailable { detail: String },

    #[error("malformed source response: {detail}")]
    MalformedResponse { detail: String },

    #[error("schema violation in record {record}: field `{field}` {reason}")]
    SchemaViolation {
        record: String,
        field: String,
        reason: String,
    },

    #[error("publish to {key} failed: {cause}")]
    PublishFailed { key: String, cause: String },

    /// The key already holds different content. Reported as `PublishFailed`
    /// but never retried: every attempt would meet the same object.
    #[error("publish to {key} failed: conflicting content: {cause}")]
    PublishConflict { key: String, cause: String },

    #[error("staging io failure at {}: {source}", path.display())]
    StagingIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stage {stage} cannot begin while run is {state}")]
    OutOfOrder { stage: Stage, state: String },
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SourceUnavailable { .. } => ErrorKind::SourceUnavailable,
            Self::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            Self::SchemaViolation { .. } => ErrorKind::SchemaViolation,
            Self::PublishFailed { .. } | Self::PublishConflict { .. } => ErrorKind::PublishFailed,
            Self::StagingIo { .. } => ErrorKind::StagingIoFailure,
            Self::OutOfOrder { .. } => ErrorKind::OutOfOrder,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::PublishConflict { .. }) && self.kind().is_retryable()
    }

    pub fn source_unavailable(detail: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            detail: detail.into(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::MalformedResponse {
            detail: detail.into(),
        }
    }

    pub fn schema(
        record: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::SchemaViolation {
            record: record.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn publish(key: impl Into<String>, cause: &anyhow::Error) -> Self {
        Self::PublishFailed {
            key: key.into(),
            cause: format!("{cause:#}"),
        }
    }

    pub fn conflict(key: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::PublishConflict {
            key: key.into(),
            cause: cause.into(),
        }
    }

    pub fn staging(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StagingIo {
            path: path.into(),
            source,
        }
    }

    pub fn out_of_order(stage: Stage, state: &RunState) -> Self {
        Self::OutOfOrder {
            stage,
            state: state.label().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_follow_the_taxonomy() {
        assert!(ErrorKind::SourceUnavailable.is_retryable());
        assert!(ErrorKind::PublishFailed.is_retryable());
        assert!(ErrorKind::StagingIoFailure.is_retryable());
        assert!(!ErrorKind::MalformedResponse.is_retryable());
        assert!(!ErrorKind::SchemaViolation.is_retryable());
        assert!(!ErrorKind::OutOfOrder.is_retryable());
    }

    #[test]
    fn content_conflicts_are_publish_failures_that_are_not_retried() {
        let conflict = StageError::conflict("raw_data/p/x.json", "existing md5 a differs from b");
        assert_eq!(conflict.kind(), ErrorKind::PublishFailed);
        assert!(!conflict.is_retryable());
        assert!(conflict.to_string().contains("conflicting content"));

        let transient = StageError::publish("raw_data/p/x.json", &anyhow::anyhow!("HTTP 503"));
        assert!(transient.is_retryable());
    }

    #[test]
    fn kind_labels_parse_back() {
        for kind in [ErrorKind::SchemaViolation, ErrorKind::StagingIoFailure] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("nope"), None);
    }

    #[test]
    fn schema_violation_names_record_and_field() {
        let err = StageError::schema("bitcoin", "current_price", "is missing");
        assert_eq!(err.kind(), ErrorKind::SchemaViolation);
        assert_eq!(
            err.to_string(),
            "schema violation in record bitcoin: field `current_price` is missing"
        );
    }
}
