// =============================================================================
// error.rs — EVERYTHING THAT CAN GO WRONG, NEATLY LABELLED
// =============================================================================
//
// One error type per pipeline stage, plus the wrapper the collector hands back
// to the scheduler. The scheduler never sees a bare stage error: it always
// gets a CollectorError that says WHICH variant broke and WHERE.
//
// Nothing in here retries anything. The next tick is the retry.
// =============================================================================

use std::fmt;
use std::path::PathBuf;

use crate::models::WeatherVariant;

/// The snapshot download failed. `status` is set when the server answered
/// with a non-2xx code; transport and disk failures leave it empty.
#[derive(Debug, thiserror::Error)]
#[error("fetch failed{}: {reason}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
pub struct FetchError {
    pub status: Option<u16>,
    pub reason: String,
}

impl FetchError {
    pub fn status(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: reason.into(),
        }
    }
}

/// The local snapshot could not be read or is not valid CSV.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("failed to read snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed CSV in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// The event date is not six ASCII digits forming a real calendar date.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid event date {0:?}: expected YYMMDD")]
pub struct InvalidDateFormat(pub String);

/// A parsed row carried a value that could not be typed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("line {line}: column {column} has non-numeric value {value:?}")]
pub struct TransformError {
    pub line: u64,
    pub column: String,
    pub value: String,
}

/// The broker refused the batch or could not be reached.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("broker rejected batch of {count} messages: {reason}")]
    Rejected { count: usize, reason: String },

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Fatal startup problems. These end the process before the first tick.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error(transparent)]
    EventDate(#[from] InvalidDateFormat),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("cron expression {0:?} has no upcoming occurrence")]
    Exhausted(String),
}

/// The lifecycle stage a collector run was in when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Stage {
    Fetching,
    Parsing,
    Transforming,
    Publishing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Fetching => write!(f, "fetching"),
            Stage::Parsing => write!(f, "parsing"),
            Stage::Transforming => write!(f, "transforming"),
            Stage::Publishing => write!(f, "publishing"),
        }
    }
}

/// Coarse error classification carried by a failed `TickResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ErrorKind {
    Fetch,
    Parse,
    InvalidDateFormat,
    Transform,
    Publish,
}

/// The stage error underneath a `CollectorError`.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    InvalidDate(#[from] InvalidDateFormat),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// A collector run that stopped early.
#[derive(Debug, thiserror::Error)]
#[error("{variant} collector failed while {stage}: {source}")]
pub struct CollectorError {
    pub variant: WeatherVariant,
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl CollectorError {
    pub fn new(variant: WeatherVariant, stage: Stage, source: impl Into<StageError>) -> Self {
        Self {
            variant,
            stage,
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.source {
            StageError::Fetch(_) => ErrorKind::Fetch,
            StageError::Parse(_) => ErrorKind::Parse,
            StageError::InvalidDate(_) => ErrorKind::InvalidDateFormat,
            StageError::Transform(_) => ErrorKind::Transform,
            StageError::Publish(_) => ErrorKind::Publish,
        }
    }
}
