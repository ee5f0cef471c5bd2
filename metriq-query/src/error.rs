use std::error::Error;
use std::fmt::Write;
use std::time::Duration;

use crate::dispatch::RegionState;
use crate::executor::QueryType;

/// A boxed error as returned by client implementations.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// The reason a [`QueryBuilderError`] was raised.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum QueryBuilderErrorKind {
    /// Two flattened queries resolved to the same identifier.
    #[error("query id {0} is not unique")]
    DuplicateId(String),
    /// The query has neither statistics nor an expression.
    #[error("query has neither statistics nor an expression")]
    MissingStatistics,
    /// The period of a non-expression query is zero.
    #[error("period must be greater than zero")]
    InvalidPeriod,
    /// A high resolution query spans more datapoints than the remote API retains.
    #[error("too long query period")]
    PeriodTooLong,
}

/// An input error attributable to exactly one request query.
///
/// These errors never abort an execution. They are reported as the result of the offending ref
/// id while all other queries are executed normally.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("error parsing query {ref_id}, {kind}")]
pub struct QueryBuilderError {
    /// The ref id of the request query that caused the error.
    pub ref_id: String,
    /// What went wrong.
    pub kind: QueryBuilderErrorKind,
}

impl QueryBuilderError {
    /// Creates a new error for the given ref id.
    pub fn new(ref_id: impl Into<String>, kind: QueryBuilderErrorKind) -> Self {
        Self {
            ref_id: ref_id.into(),
            kind,
        }
    }
}

/// An error returned by a [`ClientFactory`](crate::ClientFactory) or a
/// [`MetricsClient`](crate::MetricsClient).
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// No credentials could be resolved for the region.
    #[error("no credentials available for region {0}")]
    Credentials(String),
    /// The remote API rejected the request.
    #[error("request rejected with {code}: {message}")]
    Rejected {
        /// The error code reported by the remote API.
        code: String,
        /// The error message reported by the remote API.
        message: String,
    },
    /// The remote API throttled the request.
    #[error("request throttled by the remote api")]
    Throttled,
    /// The request did not complete within the configured timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Any other error raised by the client implementation.
    #[error(transparent)]
    Other(#[from] BoxError),
}

/// The terminal failure of a single region task.
#[derive(Debug, thiserror::Error)]
pub enum RegionErrorKind {
    /// The client for the region could not be acquired.
    #[error("failed to acquire client")]
    Setup(#[source] ClientError),
    /// A batch request was rejected by the remote API.
    #[error("failed to send batch {batch} of {total}")]
    Request {
        /// One-based index of the failing batch.
        batch: usize,
        /// Number of batches built for the region.
        total: usize,
        /// The error returned by the client.
        #[source]
        source: ClientError,
    },
    /// The region task panicked and was recovered at the task boundary.
    #[error("region task panicked while {state}: {message}")]
    Panicked {
        /// The last state the task reached before panicking.
        state: RegionState,
        /// The panic payload, if it was a string.
        message: String,
    },
}

/// A failure of the task dispatching all batches of one region.
#[derive(Debug, thiserror::Error)]
#[error("failed to query region {region}")]
pub struct RegionError {
    /// The region whose task failed.
    pub region: String,
    /// The reason for the failure.
    #[source]
    pub kind: RegionErrorKind,
}

impl RegionError {
    /// Returns `true` if the region failed before sending any request.
    pub fn is_setup(&self) -> bool {
        matches!(self.kind, RegionErrorKind::Setup(_))
    }
}

/// The top-level error of a query execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    /// The time range does not start before it ends.
    #[error("invalid time range: start time must be before end time")]
    InvalidTimeRange,
    /// Only time series queries are executed by this crate.
    #[error("unsupported query type {0}")]
    UnsupportedQueryType(QueryType),
    /// A region failed in a way that aborts the entire execution.
    #[error(transparent)]
    Region(#[from] RegionError),
    /// Every region failed to acquire a client.
    #[error("no region could be queried")]
    NoViableRegion(#[source] RegionError),
    /// The execution was cancelled by the caller.
    #[error("query execution was cancelled")]
    Cancelled,
}

/// Formats an error and all of its sources into a single line.
///
/// This is the message attached to the results of ref ids that failed.
pub(crate) fn error_message(error: &dyn Error) -> String {
    let mut message = error.to_string();

    let mut source = error.source();
    while let Some(cause) = source {
        write!(&mut message, ": {cause}").ok();
        source = cause.source();
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_builder_error_display() {
        let error = QueryBuilderError::new(
            "B",
            QueryBuilderErrorKind::DuplicateId("queryA".to_owned()),
        );
        assert_eq!(
            error.to_string(),
            "error parsing query B, query id queryA is not unique"
        );
    }

    #[test]
    fn test_error_message_chain() {
        let error = RegionError {
            region: "eu-west-1".to_owned(),
            kind: RegionErrorKind::Request {
                batch: 2,
                total: 3,
                source: ClientError::Throttled,
            },
        };

        assert_eq!(
            error_message(&error),
            "failed to query region eu-west-1: failed to send batch 2 of 3: request throttled by the remote api"
        );
    }
}
