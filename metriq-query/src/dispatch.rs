//! Concurrent dispatch of batches to their regions.
//!
//! The [`RegionDispatcher`] runs exactly one task per distinct region. Each task acquires its own
//! client, sends its batches strictly in builder order and folds the pages into raw responses.
//! Tasks share no state. The supervisor collects their outcomes as they complete.
//!
//! # Failures
//!
//! A panic inside a region task is captured at the task boundary and reported as an error for the
//! region's ref ids. Failing to acquire a client is isolated to the region as well. Whether a
//! rejected request aborts the entire execution is governed by [`RegionFailurePolicy`].

use std::any::Any;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchBuilder, BatchLimits};
use crate::client::{BatchRequest, BatchResponse, ClientFactory, MetricsClient};
use crate::error::{error_message, ClientError, ExecuteError, RegionError, RegionErrorKind};
use crate::executor::TimeRange;
use crate::query::FlattenedQuery;
use crate::response::parse_responses;
use crate::transform::{regroup, QueryResult, RawResponse};

/// What happens to the execution when a region's request is rejected.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionFailurePolicy {
    /// Cancel all other regions and fail the execution with the region's error.
    #[default]
    Abort,
    /// Report the error for the region's ref ids and keep the results of other regions.
    Isolate,
}

impl RegionFailurePolicy {
    /// Returns the string representation of this policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Isolate => "isolate",
        }
    }
}

impl fmt::Display for RegionFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown [`RegionFailurePolicy`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unknown region failure policy `{0}`, expected `abort` or `isolate`")]
pub struct ParsePolicyError(String);

impl FromStr for RegionFailurePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "isolate" => Ok(Self::Isolate),
            _ => Err(ParsePolicyError(s.to_owned())),
        }
    }
}

/// Runtime parameters of the [`RegionDispatcher`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DispatchConfig {
    /// Policy applied to rejected requests.
    pub region_failure: RegionFailurePolicy,
    /// Upper bound for a single page request. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}

/// Progress of a region task, reported when the task panics.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RegionState {
    /// The task has not acquired a client yet.
    Created,
    /// The client is acquired and batches are being built.
    ClientAcquired,
    /// A batch request is in flight.
    Sending {
        /// One-based index of the batch.
        batch: usize,
        /// Number of batches of the region.
        total: usize,
    },
    /// All pages arrived and are being parsed.
    Parsing,
    /// The task completed.
    Done,
}

impl fmt::Display for RegionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "acquiring client"),
            Self::ClientAcquired => write!(f, "building batches"),
            Self::Sending { batch, total } => write!(f, "sending batch {batch} of {total}"),
            Self::Parsing => write!(f, "parsing responses"),
            Self::Done => write!(f, "finishing"),
        }
    }
}

/// The work of one region.
struct RegionTask {
    region: String,
    queries: Vec<FlattenedQuery>,
    factory: Arc<dyn ClientFactory>,
    builder: BatchBuilder,
    time_range: TimeRange,
    request_timeout: Option<Duration>,
    state: RegionState,
}

impl RegionTask {
    async fn run(&mut self) -> Result<Vec<RawResponse>, RegionErrorKind> {
        let client = self
            .factory
            .client(&self.region)
            .await
            .map_err(RegionErrorKind::Setup)?;
        self.state = RegionState::ClientAcquired;

        let batches = self.builder.build(&self.queries);
        let total = batches.len();
        metriq_log::debug!(region = %self.region, batches = total, "dispatching region");

        let mut pages = Vec::new();
        for (index, batch) in batches.into_iter().enumerate() {
            let number = index + 1;
            self.state = RegionState::Sending {
                batch: number,
                total,
            };

            let mut request = BatchRequest {
                start: self.time_range.start,
                end: self.time_range.end,
                entries: batch.into_entries(),
                next_token: None,
            };

            // Pages of one batch are fetched sequentially until no continuation token is returned.
            loop {
                let response = self
                    .send(client.as_ref(), &request)
                    .await
                    .map_err(|source| RegionErrorKind::Request {
                        batch: number,
                        total,
                        source,
                    })?;

                let next_token = response.next_token.clone().filter(|t| !t.is_empty());
                pages.push(response);

                match next_token {
                    Some(token) => request.next_token = Some(token),
                    None => break,
                }
            }
        }

        self.state = RegionState::Parsing;
        let responses = parse_responses(&pages, &self.queries);
        self.state = RegionState::Done;

        Ok(responses)
    }

    async fn send(
        &self,
        client: &dyn MetricsClient,
        request: &BatchRequest,
    ) -> Result<BatchResponse, ClientError> {
        let Some(timeout) = self.request_timeout else {
            return client.fetch_batch(request).await;
        };

        tokio::time::timeout(timeout, client.fetch_batch(request))
            .await
            .map_err(|_| ClientError::Timeout(timeout))?
    }
}

/// The completed work of one region as seen by the supervisor.
struct RegionOutcome {
    region: String,
    ref_ids: Vec<String>,
    result: Result<Vec<RawResponse>, RegionErrorKind>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    match payload.downcast_ref::<&str>() {
        Some(s) => (*s).to_owned(),
        None => match payload.downcast_ref::<String>() {
            Some(s) => s.clone(),
            None => "Box<Any>".to_owned(),
        },
    }
}

/// Runs a region task and converts a panic into a regular error.
async fn run_region(mut task: RegionTask) -> RegionOutcome {
    let caught = AssertUnwindSafe(task.run()).catch_unwind().await;
    let result = match caught {
        Ok(result) => result,
        Err(payload) => Err(RegionErrorKind::Panicked {
            state: task.state,
            message: panic_message(&*payload),
        }),
    };

    RegionOutcome {
        ref_ids: task.queries.iter().map(|q| q.ref_id.clone()).unique().collect(),
        region: task.region,
        result,
    }
}

/// Sends flattened queries to their regions and merges the results.
pub struct RegionDispatcher {
    factory: Arc<dyn ClientFactory>,
    builder: BatchBuilder,
    config: DispatchConfig,
}

impl RegionDispatcher {
    /// Creates a dispatcher acquiring clients from the given factory.
    pub fn new(factory: Arc<dyn ClientFactory>, limits: BatchLimits, config: DispatchConfig) -> Self {
        Self {
            factory,
            builder: BatchBuilder::new(limits),
            config,
        }
    }

    /// Executes all queries and returns one result per ref id.
    ///
    /// Ref ids of regions that failed without aborting the execution carry an error message
    /// instead of series. Dropping the returned future, or cancelling `cancel`, drops all
    /// in-flight requests.
    pub async fn dispatch(
        &self,
        time_range: &TimeRange,
        queries: IndexMap<String, FlattenedQuery>,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, QueryResult>, ExecuteError> {
        let mut by_region = IndexMap::<String, Vec<FlattenedQuery>>::new();
        for query in queries.into_values() {
            by_region.entry(query.region.clone()).or_default().push(query);
        }

        let region_count = by_region.len();
        let mut pending: FuturesUnordered<_> = by_region
            .into_iter()
            .map(|(region, queries)| {
                run_region(RegionTask {
                    region,
                    queries,
                    factory: Arc::clone(&self.factory),
                    builder: self.builder,
                    time_range: *time_range,
                    request_timeout: self.config.request_timeout,
                    state: RegionState::Created,
                })
            })
            .collect();

        let mut responses = Vec::new();
        let mut errors = BTreeMap::<String, String>::new();
        let mut setup_failures = Vec::new();

        loop {
            let outcome = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    metriq_log::debug!("query execution cancelled");
                    return Err(ExecuteError::Cancelled);
                }
                outcome = pending.next() => match outcome {
                    Some(outcome) => outcome,
                    None => break,
                },
            };

            let RegionOutcome {
                region,
                ref_ids,
                result,
            } = outcome;

            let kind = match result {
                Ok(region_responses) => {
                    responses.extend(region_responses);
                    continue;
                }
                Err(kind) => kind,
            };

            let error = RegionError { region, kind };
            let abort = matches!(error.kind, RegionErrorKind::Request { .. })
                && self.config.region_failure == RegionFailurePolicy::Abort;

            if abort {
                metriq_log::error!(
                    error = &error as &dyn Error,
                    "aborting query execution"
                );
                // Dropping `pending` cancels the requests of all other regions.
                return Err(error.into());
            }

            metriq_log::warn!(error = &error as &dyn Error, "region failed");
            let message = error_message(&error);
            for ref_id in ref_ids {
                errors.insert(ref_id, message.clone());
            }

            if error.is_setup() {
                setup_failures.push(error);
            }
        }

        if region_count > 0 && setup_failures.len() == region_count {
            if let Some(error) = setup_failures.into_iter().next() {
                return Err(ExecuteError::NoViableRegion(error));
            }
        }

        let mut results = regroup(responses);
        for (ref_id, message) in errors {
            results.insert(ref_id.clone(), QueryResult::from_error(ref_id, message));
        }

        Ok(results)
    }
}
