use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ErrorKind, StageError};

const RUN_ID_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Logical run identifier: the scheduled trigger time in compact UTC form
/// (`20240705T121000`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    pub fn from_logical_time(logical_time: DateTime<Utc>) -> Self {
        Self(logical_time.format(RUN_ID_FORMAT).to_string())
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let naive = NaiveDateTime::parse_from_str(s.trim(), RUN_ID_FORMAT)
            .map_err(|e| anyhow::anyhow!("invalid run id {s:?} (expected YYYYMMDDTHHMMSS): {e}"))?;
        let id = Self::from_logical_time(naive.and_utc());
        anyhow::ensure!(
            id.0 == s.trim(),
            "invalid run id {s:?} (expected YYYYMMDDTHHMMSS)"
        );
        Ok(id)
    }

    pub fn logical_time(&self) -> DateTime<Utc> {
        // The inner string is only ever produced by `from_logical_time`.
        NaiveDateTime::parse_from_str(&self.0, RUN_ID_FORMAT)
            .map(|n| n.and_utc())
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RunId {
    type Error = anyhow::Error;

    fn try_from(s: String) -> anyhow::Result<Self> {
        Self::parse(&s)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

/// Identity of one pipeline run, shared read-only by every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub pipeline: String,
    pub run_id: RunId,
    pub logical_time: DateTime<Utc>,
}

impl RunContext {
    pub fn new(pipeline: impl Into<String>, logical_time: DateTime<Utc>) -> Self {
        Self {
            pipeline: pipeline.into(),
            run_id: RunId::from_logical_time(logical_time),
            logical_time,
        }
    }

    pub fn from_run_id(pipeline: impl Into<String>, run_id: RunId) -> Self {
        let logical_time = run_id.logical_time();
        Self {
            pipeline: pipeline.into(),
            run_id,
            logical_time,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    EnsureContainer,
    PublishRaw,
    Transform,
    PublishTransformed,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Fetch,
        Stage::EnsureContainer,
        Stage::PublishRaw,
        Stage::Transform,
        Stage::PublishTransformed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::EnsureContainer => "ensure_container",
            Self::PublishRaw => "publish_raw",
            Self::Transform => "transform",
            Self::PublishTransformed => "publish_transformed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    fn begins_in(self) -> RunState {
        match self {
            Self::Fetch => RunState::Scheduled,
            Self::EnsureContainer => RunState::Fetching,
            Self::PublishRaw => RunState::BucketReady,
            Self::Transform => RunState::RawPublished,
            Self::PublishTransformed => RunState::Transforming,
        }
    }

    fn running_state(self) -> RunState {
        match self {
            Self::Fetch | Self::EnsureContainer => RunState::Fetching,
            Self::PublishRaw => RunState::BucketReady,
            Self::Transform | Self::PublishTransformed => RunState::Transforming,
        }
    }

    fn finished_state(self) -> RunState {
        match self {
            Self::Fetch => RunState::Fetching,
            Self::EnsureContainer => RunState::BucketReady,
            Self::PublishRaw => RunState::RawPublished,
            Self::Transform => RunState::Transforming,
            Self::PublishTransformed => RunState::TransformPublished,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a single run.
///
/// `Fetching` spans the fetch and the container check, `Transforming` spans
/// the transform and the transformed upload. `Failed` is absorbing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Scheduled,
    Fetching,
    BucketReady,
    RawPublished,
    Transforming,
    TransformPublished,
    Complete,
    Failed {
        stage: Stage,
        kind: ErrorKind,
        cause: String,
    },
}

impl RunState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Fetching => "fetching",
            Self::BucketReady => "bucket_ready",
            Self::RawPublished => "raw_published",
            Self::Transforming => "transforming",
            Self::TransformPublished => "transform_published",
            Self::Complete => "complete",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed { .. })
    }

    /// Moves into the state a stage runs in. Rejects stages begun out of order.
    pub fn begin(&self, stage: Stage) -> Result<RunState, StageError> {
        if *self != stage.begins_in() {
            return Err(StageError::out_of_order(stage, self));
        }
        Ok(stage.running_state())
    }

    pub fn finish(&self, stage: Stage) -> Result<RunState, StageError> {
        if *self != stage.running_state() {
            return Err(StageError::out_of_order(stage, self));
        }
        Ok(stage.finished_state())
    }

    pub fn complete(&self) -> Result<RunState, StageError> {
        match self {
            Self::TransformPublished => Ok(Self::Complete),
            other => Err(StageError::out_of_order(Stage::PublishTransformed, other)),
        }
    }

    pub fn fail(stage: Stage, err: &StageError) -> RunState {
        Self::Failed {
            stage,
            kind: err.kind(),
            cause: err.to_string(),
        }
    }

    /// Rebuilds a state from its stored columns.
    pub fn from_parts(
        label: &str,
        stage: Option<&str>,
        kind: Option<&str>,
        cause: Option<&str>,
    ) -> Option<RunState> {
        let state = match label {
            "scheduled" => Self::Scheduled,
            "fetching" => Self::Fetching,
            "bucket_ready" => Self::BucketReady,
            "raw_published" => Self::RawPublished,
            "transforming" => Self::Transforming,
            "transform_published" => Self::TransformPublished,
            "complete" => Self::Complete,
            "failed" => Self::Failed {
                stage: Stage::parse(stage?)?,
                kind: ErrorKind::parse(kind?)?,
                cause: cause.unwrap_or_default().to_string(),
            },
            _ => return None,
        };
        Some(state)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { stage, kind, .. } => write!(f, "failed({stage}, {kind})"),
            other => f.write_str(other.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_id_uses_compact_utc_form() {
        let t = Utc.with_ymd_and_hms(2024, 7, 5, 12, 10, 0).unwrap();
        let id = RunId::from_logical_time(t);
        assert_eq!(id.as_str(), "20240705T121000");
        assert_eq!(id.logical_time(), t);
        assert_eq!(RunId::parse("20240705T121000").unwrap(), id);
    }

    #[test]
    fn run_id_rejects_other_shapes() {
        assert!(RunId::parse("2024-07-05T12:10:00Z").is_err());
        assert!(RunId::parse("20240705").is_err());
        assert!(RunId::parse("../20240705T121000").is_err());
    }

    #[test]
    fn walks_the_full_state_machine_in_order() {
        let mut state = RunState::Scheduled;
        for stage in Stage::ALL {
            state = state.begin(stage).unwrap();
            state = state.finish(stage).unwrap();
        }
        assert_eq!(state, RunState::TransformPublished);
        assert_eq!(state.complete().unwrap(), RunState::Complete);
    }

    #[test]
    fn rejects_transform_before_raw_is_published() {
        let err = RunState::BucketReady.begin(Stage::Transform).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfOrder);
        assert!(RunState::Scheduled.begin(Stage::PublishRaw).is_err());
        assert!(RunState::Scheduled.complete().is_err());
    }

    #[test]
    fn failed_state_round_trips_through_columns() {
        let err = StageError::schema("bitcoin", "current_price", "is missing");
        let failed = RunState::fail(Stage::Transform, &err);
        let RunState::Failed { kind, cause, .. } = &failed else {
            panic!("expected failed state");
        };
        let rebuilt = RunState::from_parts(
            failed.label(),
            Some("transform"),
            Some(kind.as_str()),
            Some(cause),
        );
        assert_eq!(rebuilt, Some(failed.clone()));
        assert!(failed.is_terminal());
        assert!(failed.begin(Stage::Fetch).is_err());
    }

    #[test]
    fn serializes_state_with_tag() {
        let v = serde_json::to_value(RunState::RawPublished).unwrap();
        assert_eq!(v, serde_json::json!({"state": "raw_published"}));
    }
}
